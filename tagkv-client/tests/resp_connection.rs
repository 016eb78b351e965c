use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;

use tagkv_client::{
    ClientError, Command, Condition, EndpointConfig, RawConnection, Reply, RespConnection,
    SignalKind, Transaction, When,
};

enum Action {
    Reply(&'static [u8]),
    ReplyAndClose(&'static [u8]),
    Ignore,
}

type Handler = fn(usize, &[String]) -> Action;

/// Scripted RESP server. Records every command as (connection index, args).
async fn spawn_server(handler: Handler) -> (String, Arc<Mutex<Vec<(usize, Vec<String>)>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);

    tokio::spawn(async move {
        let mut conn_idx = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let log = Arc::clone(&log);
            let idx = conn_idx;
            conn_idx += 1;
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                while let Some(args) = read_command(&mut reader).await {
                    log.lock().push((idx, args.clone()));
                    match handler(idx, &args) {
                        Action::Reply(bytes) => {
                            if write_half.write_all(bytes).await.is_err() {
                                return;
                            }
                        }
                        Action::ReplyAndClose(bytes) => {
                            let _ = write_half.write_all(bytes).await;
                            return;
                        }
                        Action::Ignore => {}
                    }
                }
            });
        }
    });

    (addr, seen)
}

async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await.ok()?;
        data.truncate(len);
        args.push(String::from_utf8(data).ok()?);
    }
    Some(args)
}

fn endpoint(addr: &str) -> EndpointConfig {
    EndpointConfig {
        response_timeout_ms: Some(1_000),
        ..EndpointConfig::new(addr)
    }
}

fn commands(seen: &Mutex<Vec<(usize, Vec<String>)>>) -> Vec<String> {
    seen.lock().iter().map(|(_, args)| args.join(" ")).collect()
}

fn key(value: &'static str) -> Bytes {
    Bytes::from_static(value.as_bytes())
}

#[tokio::test]
async fn pipelined_requests_match_replies_in_order() {
    // Holds both requests before answering either.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let first = read_command(&mut reader).await.expect("first");
        let second = read_command(&mut reader).await.expect("second");
        let mut out = Vec::new();
        for args in [first, second] {
            let value = format!("v-{}", args[1]);
            out.extend_from_slice(format!("${}\r\n{}\r\n", value.len(), value).as_bytes());
        }
        write_half.write_all(&out).await.expect("write");
        let _ = read_command(&mut reader).await;
    });

    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    let (a, b) = tokio::join!(
        conn.execute(0, Command::Get { key: key("a") }),
        conn.execute(0, Command::Get { key: key("b") }),
    );
    assert_eq!(a.unwrap(), Reply::Bulk(key("v-a")));
    assert_eq!(b.unwrap(), Reply::Bulk(key("v-b")));
    assert_eq!(conn.outstanding_requests(), 0);
}

#[tokio::test]
async fn guarded_transaction_runs_when_condition_holds() {
    let (addr, seen) = spawn_server(|_, args| match args[0].as_str() {
        "WATCH" | "MULTI" => Action::Reply(b"+OK\r\n"),
        "EXISTS" => Action::Reply(b":0\r\n"),
        "SADD" | "SET" => Action::Reply(b"+QUEUED\r\n"),
        "EXEC" => Action::Reply(b"*2\r\n:1\r\n+OK\r\n"),
        _ => Action::Reply(b"-ERR unexpected\r\n"),
    })
    .await;

    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    let transaction = Transaction::new()
        .guard(Condition::for_key(key("k1"), When::NotExists))
        .then(Command::SAdd {
            key: key("tag:A"),
            members: vec![key("k1")],
        })
        .then(Command::Set {
            key: key("k1"),
            value: key("v"),
            ttl: None,
            when: When::Always,
        });

    let replies = conn.transaction(0, transaction).await.expect("transaction");
    assert_eq!(
        replies,
        Some(vec![Reply::Integer(1), Reply::Status("OK".to_string())])
    );
    assert_eq!(
        commands(&seen),
        vec!["WATCH k1", "EXISTS k1", "MULTI", "SADD tag:A k1", "SET k1 v", "EXEC"]
    );
}

#[tokio::test]
async fn failed_condition_unwatches_without_writing() {
    let (addr, seen) = spawn_server(|_, args| match args[0].as_str() {
        "WATCH" | "UNWATCH" => Action::Reply(b"+OK\r\n"),
        "HEXISTS" => Action::Reply(b":1\r\n"),
        _ => Action::Reply(b"-ERR unexpected\r\n"),
    })
    .await;

    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    let transaction = Transaction::new()
        .guard(Condition::for_hash_field(key("h"), key("f"), When::NotExists))
        .then(Command::HSet {
            key: key("h"),
            field: key("f"),
            value: key("v"),
        });

    assert_eq!(conn.transaction(0, transaction).await.expect("transaction"), None);
    assert_eq!(commands(&seen), vec!["WATCH h", "HEXISTS h f", "UNWATCH"]);
}

#[tokio::test]
async fn aborted_exec_reads_as_rejected() {
    let (addr, _) = spawn_server(|_, args| match args[0].as_str() {
        "WATCH" | "MULTI" => Action::Reply(b"+OK\r\n"),
        "EXISTS" => Action::Reply(b":1\r\n"),
        "SET" => Action::Reply(b"+QUEUED\r\n"),
        "EXEC" => Action::Reply(b"*-1\r\n"),
        _ => Action::Reply(b"-ERR unexpected\r\n"),
    })
    .await;

    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    let transaction = Transaction::new()
        .guard(Condition::for_key(key("k"), When::Exists))
        .then(Command::Set {
            key: key("k"),
            value: key("v"),
            ttl: None,
            when: When::Always,
        });
    assert_eq!(conn.transaction(0, transaction).await.expect("transaction"), None);
}

fn unguarded_set(name: &'static str) -> Transaction {
    Transaction::new().then(Command::Set {
        key: key(name),
        value: key("v"),
        ttl: None,
        when: When::Always,
    })
}

#[tokio::test]
async fn guard_error_releases_watch_for_next_caller() {
    let (addr, seen) = spawn_server(|_, args| match args[0].as_str() {
        "WATCH" | "UNWATCH" | "MULTI" => Action::Reply(b"+OK\r\n"),
        "EXISTS" => Action::Reply(b"-ERR boom\r\n"),
        "SET" => Action::Reply(b"+QUEUED\r\n"),
        "EXEC" => Action::Reply(b"*1\r\n+OK\r\n"),
        _ => Action::Reply(b"-ERR unexpected\r\n"),
    })
    .await;

    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    let guarded = Transaction::new()
        .guard(Condition::for_key(key("k1"), When::NotExists))
        .then(Command::Set {
            key: key("k1"),
            value: key("v"),
            ttl: None,
            when: When::Always,
        });
    let err = conn.transaction(0, guarded).await.unwrap_err();
    assert!(matches!(err, ClientError::Server(message) if message == "ERR boom"));

    let replies = conn
        .transaction(0, unguarded_set("k2"))
        .await
        .expect("transaction");
    assert_eq!(replies, Some(vec![Reply::Status("OK".to_string())]));
    assert_eq!(
        commands(&seen),
        vec!["WATCH k1", "EXISTS k1", "UNWATCH", "MULTI", "SET k2 v", "EXEC"]
    );
}

#[tokio::test]
async fn guard_timeout_resets_link_before_next_transaction() {
    let (addr, seen) = spawn_server(|idx, args| match args[0].as_str() {
        "EXISTS" if idx == 0 => Action::Ignore,
        "EXISTS" => Action::Reply(b":0\r\n"),
        "WATCH" | "UNWATCH" | "MULTI" => Action::Reply(b"+OK\r\n"),
        "SET" => Action::Reply(b"+QUEUED\r\n"),
        "EXEC" => Action::Reply(b"*1\r\n+OK\r\n"),
        _ => Action::Reply(b"-ERR unexpected\r\n"),
    })
    .await;

    let config = EndpointConfig {
        response_timeout_ms: Some(100),
        ..EndpointConfig::new(addr.as_str())
    };
    let conn = RespConnection::connect(config).await.expect("connect");
    let guarded = Transaction::new()
        .guard(Condition::for_key(key("k1"), When::NotExists))
        .then(Command::Set {
            key: key("k1"),
            value: key("v"),
            ttl: None,
            when: When::Always,
        });
    let err = conn.transaction(0, guarded).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    assert!(!conn.is_connected());

    let replies = conn
        .transaction(0, unguarded_set("k2"))
        .await
        .expect("transaction");
    assert_eq!(replies, Some(vec![Reply::Status("OK".to_string())]));
    assert!(conn.is_connected());

    let log: Vec<(usize, String)> = seen
        .lock()
        .iter()
        .map(|(idx, args)| (*idx, args.join(" ")))
        .collect();
    assert_eq!(
        log,
        vec![
            (0, "WATCH k1".to_string()),
            (0, "EXISTS k1".to_string()),
            (1, "MULTI".to_string()),
            (1, "SET k2 v".to_string()),
            (1, "EXEC".to_string()),
        ]
    );
}

#[tokio::test]
async fn error_reply_is_returned_and_signalled() {
    let (addr, _) = spawn_server(|_, _| Action::Reply(b"-WRONGTYPE wrong kind\r\n")).await;
    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    let _hook = conn.signals().subscribe(SignalKind::ErrorMessage, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let reply = conn
        .execute(0, Command::HGet { key: key("k"), field: key("f") })
        .await
        .expect("reply");
    assert_eq!(reply, Reply::Error("WRONGTYPE wrong kind".to_string()));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn selects_database_once_per_change() {
    let (addr, seen) = spawn_server(|_, args| match args[0].as_str() {
        "PING" => Action::Reply(b"+PONG\r\n"),
        _ => Action::Reply(b"+OK\r\n"),
    })
    .await;

    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    conn.execute(3, Command::Ping).await.expect("ping");
    conn.execute(3, Command::Ping).await.expect("ping");
    conn.execute(0, Command::Ping).await.expect("ping");

    assert_eq!(
        commands(&seen),
        vec!["SELECT 3", "PING", "PING", "SELECT 0", "PING"]
    );
}

#[tokio::test]
async fn authenticates_after_connect() {
    let (addr, seen) = spawn_server(|_, args| match args[0].as_str() {
        "PING" => Action::Reply(b"+PONG\r\n"),
        _ => Action::Reply(b"+OK\r\n"),
    })
    .await;

    let config = EndpointConfig {
        password: Some("secret".to_string()),
        ..endpoint(&addr)
    };
    let conn = RespConnection::connect(config).await.expect("connect");
    conn.execute(0, Command::Ping).await.expect("ping");
    assert_eq!(commands(&seen), vec!["AUTH secret", "PING"]);
}

#[tokio::test]
async fn rejected_password_fails_connect() {
    let (addr, _) = spawn_server(|_, _| Action::Reply(b"-WRONGPASS invalid password\r\n")).await;
    let config = EndpointConfig {
        password: Some("nope".to_string()),
        ..endpoint(&addr)
    };
    let err = RespConnection::connect(config).await.unwrap_err();
    assert!(matches!(err, ClientError::Server(message) if message.starts_with("WRONGPASS")));
}

#[tokio::test]
async fn reconnects_after_peer_close() {
    let (addr, seen) = spawn_server(|idx, _| {
        if idx == 0 {
            Action::ReplyAndClose(b"+PONG\r\n")
        } else {
            Action::Reply(b"+PONG\r\n")
        }
    })
    .await;

    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    let failed = Arc::new(AtomicUsize::new(0));
    let restored = Arc::new(AtomicUsize::new(0));
    let failed_counter = Arc::clone(&failed);
    let restored_counter = Arc::clone(&restored);
    let _on_failed = conn.signals().subscribe(SignalKind::ConnectionFailed, move |_| {
        failed_counter.fetch_add(1, Ordering::SeqCst);
    });
    let _on_restored = conn.signals().subscribe(SignalKind::ConnectionRestored, move |_| {
        restored_counter.fetch_add(1, Ordering::SeqCst);
    });

    conn.execute(0, Command::Ping).await.expect("first ping");
    for _ in 0..100 {
        if !conn.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!conn.is_connected());
    assert_eq!(failed.load(Ordering::SeqCst), 1);

    conn.execute(0, Command::Ping).await.expect("second ping");
    assert!(conn.is_connected());
    assert_eq!(restored.load(Ordering::SeqCst), 1);
    let connections: Vec<usize> = seen.lock().iter().map(|(idx, _)| *idx).collect();
    assert_eq!(connections, vec![0, 1]);
}

#[tokio::test]
async fn silent_server_times_out() {
    let (addr, _) = spawn_server(|_, _| Action::Ignore).await;
    let config = EndpointConfig {
        response_timeout_ms: Some(100),
        ..EndpointConfig::new(addr.as_str())
    };
    let conn = RespConnection::connect(config).await.expect("connect");
    let err = conn.execute(0, Command::Ping).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(limit) if limit == Duration::from_millis(100)));
}

#[tokio::test]
async fn closed_connection_rejects_requests() {
    let (addr, _) = spawn_server(|_, _| Action::Reply(b"+PONG\r\n")).await;
    let conn = RespConnection::connect(endpoint(&addr)).await.expect("connect");
    conn.close();
    conn.close();
    assert!(!conn.is_connected());
    assert!(matches!(
        conn.execute(0, Command::Ping).await,
        Err(ClientError::Disconnected(_))
    ));
}

#[tokio::test]
async fn unreachable_endpoint_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    assert!(RespConnection::connect(endpoint(&addr)).await.is_err());
}
