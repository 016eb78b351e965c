//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and incrementally parse server replies out
//! of a growing read buffer, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `decode_reply` returns `Ok(None)` until a whole
//!    reply is buffered, and consumes nothing in that case.
//! 2. **Buffer Reuse**: Callers provide the output buffer for encoding.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Buf, Bytes, BytesMut};

use tagkv_common::{Command, Reply, When};

use crate::error::{ClientError, ClientResult};

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[Bytes], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Builds the argument vector for a command.
pub fn command_args(command: &Command) -> Vec<Bytes> {
    let mut args = vec![Bytes::from_static(command.name().as_bytes())];
    match command {
        Command::Ping => {}
        Command::Get { key } | Command::Ttl { key } | Command::SMembers { key } => {
            args.push(key.clone());
        }
        Command::MGet { keys } | Command::Del { keys } | Command::Exists { keys } => {
            args.extend(keys.iter().cloned());
        }
        Command::Set {
            key,
            value,
            ttl,
            when,
        } => {
            args.push(key.clone());
            args.push(value.clone());
            if let Some(ttl) = ttl {
                args.push(Bytes::from_static(b"PX"));
                args.push(millis(ttl.as_millis()));
            }
            match when {
                When::Always => {}
                When::Exists => args.push(Bytes::from_static(b"XX")),
                When::NotExists => args.push(Bytes::from_static(b"NX")),
            }
        }
        Command::Expire { key, ttl } => {
            args.push(key.clone());
            args.push(millis(ttl.as_millis()));
        }
        Command::SAdd { key, members } => {
            args.push(key.clone());
            args.extend(members.iter().cloned());
        }
        Command::HGet { key, field } | Command::HExists { key, field } => {
            args.push(key.clone());
            args.push(field.clone());
        }
        Command::HMGet { key, fields } | Command::HDel { key, fields } => {
            args.push(key.clone());
            args.extend(fields.iter().cloned());
        }
        Command::HSet { key, field, value } | Command::HSetNx { key, field, value } => {
            args.push(key.clone());
            args.push(field.clone());
            args.push(value.clone());
        }
    }
    args
}

/// Builds a bare command such as `MULTI` or `WATCH k1 k2`.
pub fn raw_args(name: &'static str, keys: impl IntoIterator<Item = Bytes>) -> Vec<Bytes> {
    let mut args = vec![Bytes::from_static(name.as_bytes())];
    args.extend(keys);
    args
}

// Sub-millisecond TTLs round up so they still expire.
fn millis(value: u128) -> Bytes {
    Bytes::from(value.max(1).to_string())
}

/// Parses one reply from the front of `buf`, consuming it on success.
pub fn decode_reply(buf: &mut BytesMut) -> ClientResult<Option<Reply>> {
    match parse_value(&buf[..], 0)? {
        Some((reply, consumed)) => {
            buf.advance(consumed);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

fn parse_value(data: &[u8], pos: usize) -> ClientResult<Option<(Reply, usize)>> {
    let (line, next) = match read_line(data, pos)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ClientError::Protocol("empty reply line".to_string()));
    }

    match line[0] {
        b'+' => Ok(Some((Reply::Status(text(&line[1..])), next))),
        b'-' => Ok(Some((Reply::Error(text(&line[1..])), next))),
        b':' => Ok(Some((Reply::Integer(parse_i64(&line[1..])?), next))),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            if len < 0 {
                return Ok(Some((Reply::Nil, next)));
            }
            let end = next + len as usize;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(ClientError::Protocol("bulk string missing CRLF".to_string()));
            }
            let payload = Bytes::copy_from_slice(&data[next..end]);
            Ok(Some((Reply::Bulk(payload), end + 2)))
        }
        b'*' => {
            let len = parse_i64(&line[1..])?;
            if len < 0 {
                // Null array, e.g. EXEC aborted by WATCH.
                return Ok(Some((Reply::Nil, next)));
            }
            let len = len as usize;
            let mut items = Vec::with_capacity(len.min(1024));
            let mut cursor = next;
            for _ in 0..len {
                match parse_value(data, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(items), cursor)))
        }
        other => Err(ClientError::Protocol(format!(
            "unexpected reply prefix {:?}",
            other as char
        ))),
    }
}

/// Returns the line starting at `pos` without its CRLF, and the offset after it.
fn read_line(data: &[u8], pos: usize) -> ClientResult<Option<(&[u8], usize)>> {
    let offset = match data[pos..].iter().position(|&b| b == b'\n') {
        Some(offset) => offset,
        None => return Ok(None),
    };
    let newline = pos + offset;
    if newline == pos || data[newline - 1] != b'\r' {
        return Err(ClientError::Protocol("line not terminated by CRLF".to_string()));
    }
    Ok(Some((&data[pos..newline - 1], newline + 1)))
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol("empty integer".to_string()));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol("invalid integer".to_string()));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
