//! Reply shape checks shared by the tag index and the facade.

use bytes::Bytes;

use tagkv_common::Reply;

use crate::error::{ClientError, ClientResult};

fn unexpected(reply: Reply) -> ClientError {
    match reply {
        Reply::Error(message) => ClientError::Server(message),
        other => ClientError::UnexpectedResponse(format!("{other:?}")),
    }
}

pub(crate) fn into_integer(reply: Reply) -> ClientResult<i64> {
    match reply {
        Reply::Integer(value) => Ok(value),
        other => Err(unexpected(other)),
    }
}

/// Bulk payload, or `None` for a null reply.
pub(crate) fn into_bulk(reply: Reply) -> ClientResult<Option<Bytes>> {
    match reply {
        Reply::Bulk(value) => Ok(Some(value)),
        Reply::Nil => Ok(None),
        other => Err(unexpected(other)),
    }
}

/// Array items; a null array reads as empty.
pub(crate) fn into_array(reply: Reply) -> ClientResult<Vec<Reply>> {
    match reply {
        Reply::Array(items) => Ok(items),
        Reply::Nil => Ok(Vec::new()),
        other => Err(unexpected(other)),
    }
}

/// `true` for a status reply, `false` for a null (rejected conditional write).
pub(crate) fn into_ok(reply: Reply) -> ClientResult<bool> {
    match reply {
        Reply::Status(_) => Ok(true),
        Reply::Nil => Ok(false),
        other => Err(unexpected(other)),
    }
}

/// Fails on the first per-command error inside an executed transaction.
pub(crate) fn ensure_no_errors(replies: &[Reply]) -> ClientResult<()> {
    match replies.iter().find(|reply| matches!(reply, Reply::Error(_))) {
        Some(Reply::Error(message)) => Err(ClientError::Server(message.clone())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_replies_become_server_errors() {
        let err = into_integer(Reply::Error("WRONGTYPE x".to_string())).unwrap_err();
        assert!(matches!(err, ClientError::Server(message) if message == "WRONGTYPE x"));

        let err = into_bulk(Reply::Integer(1)).unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedResponse(_)));
    }

    #[test]
    fn null_reads_as_absent() {
        assert_eq!(into_bulk(Reply::Nil).unwrap(), None);
        assert!(into_array(Reply::Nil).unwrap().is_empty());
        assert!(!into_ok(Reply::Nil).unwrap());
        assert!(into_ok(Reply::Status("OK".to_string())).unwrap());
    }

    #[test]
    fn finds_errors_inside_transaction_results() {
        assert!(ensure_no_errors(&[Reply::Integer(1), Reply::Status("OK".to_string())]).is_ok());
        assert!(ensure_no_errors(&[Reply::Integer(1), Reply::Error("ERR".to_string())]).is_err());
    }
}
