use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use tagkv_common::{Command, Condition, Reply, Transaction, When};
use tagkv_engine::{KVEngine, MemoryEngine};

fn tagged_add(key: &str, value: &str, tags: &[&str]) -> Transaction {
    let key = Bytes::copy_from_slice(key.as_bytes());
    let mut tx = Transaction::new().guard(Condition::for_key(key.clone(), When::NotExists));
    for tag in tags {
        tx = tx.then(Command::SAdd {
            key: Bytes::from(format!("tag:{tag}")),
            members: vec![key.clone()],
        });
    }
    tx.then(Command::Set {
        key,
        value: Bytes::copy_from_slice(value.as_bytes()),
        ttl: None,
        when: When::Always,
    })
}

#[test]
fn racing_guarded_adds_apply_once() {
    let engine = Arc::new(MemoryEngine::with_shard_count(8));
    let mut handles = Vec::new();
    for idx in 0..16 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let value = format!("v{idx}");
            engine
                .transaction(&tagged_add("k1", &value, &["a", "b"]))
                .expect("transaction")
                .is_some()
        }));
    }

    let applied = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .filter(|applied| *applied)
        .count();
    assert_eq!(applied, 1);

    for tag in ["tag:a", "tag:b"] {
        let members = engine
            .execute(&Command::SMembers {
                key: Bytes::from_static(tag.as_bytes()),
            })
            .expect("smembers");
        assert_eq!(members, Reply::Array(vec![Reply::Bulk(Bytes::from_static(b"k1"))]));
    }
}

#[test]
fn opposing_lock_orders_do_not_deadlock() {
    let engine = Arc::new(MemoryEngine::with_shard_count(4));
    let mut handles = Vec::new();
    for idx in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for round in 0..200 {
                let key = format!("k{idx}-{round}");
                let tags: &[&str] = if idx % 2 == 0 { &["x", "y", "z"] } else { &["z", "y", "x"] };
                engine
                    .transaction(&tagged_add(&key, "v", tags))
                    .expect("transaction");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("join");
    }

    let members = engine
        .execute(&Command::SMembers {
            key: Bytes::from_static(b"tag:x"),
        })
        .expect("smembers");
    match members {
        Reply::Array(items) => assert_eq!(items.len(), 8 * 200),
        other => panic!("unexpected reply {other:?}"),
    }
}
