use cinderkv::*;
use std::sync::Arc;
use tempfile::TempDir;

fn temp_aof(dir: &TempDir) -> Aof {
    Aof::open(dir.path().join("data.aof"))
}

#[test]
fn replay_reproduces_live_state_in_file_order() {
    let dir = TempDir::new().unwrap();
    let aof = temp_aof(&dir);

    for line in [
        "SET a 1",
        "SET b 2",
        "SET b 3",
        "DELETE a",
        "SET timed v EX 100",
    ] {
        aof.append(&Command::decode(line).unwrap());
    }

    let store = Store::new();
    assert_eq!(aof.replay(&store).unwrap(), 5);
    assert_eq!(store.get("a"), None);
    assert_eq!(store.get("b"), Some("3".to_string()));
    assert_eq!(store.get("timed"), Some("v".to_string()));
    assert_eq!(store.size(), 2);
}

#[test]
fn replay_of_a_missing_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    let aof = temp_aof(&dir);
    let store = Store::new();
    assert_eq!(aof.replay(&store).unwrap(), 0);
    assert_eq!(store.size(), 0);
}

#[test]
fn replay_skips_lines_that_do_not_decode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.aof");
    // garbage, a bad TTL, and a truncated trailing line (crash mid-append)
    std::fs::write(
        &path,
        "SET a 1\nnot a command\nSET b 2 EX nope\n\nSET c 3\nSET tail",
    )
    .unwrap();

    let store = Store::new();
    let aof = Aof::open(&path);
    assert_eq!(aof.replay(&store).unwrap(), 2);
    assert_eq!(store.get("a"), Some("1".to_string()));
    assert_eq!(store.get("b"), None);
    assert_eq!(store.get("c"), Some("3".to_string()));
}

#[test]
fn compact_rewrites_the_log_to_the_live_set() {
    let dir = TempDir::new().unwrap();
    let aof = temp_aof(&dir);
    let store = Store::new();

    // a history with an overwrite, a delete, and an already-expired key
    for line in ["SET a 0", "SET a 1", "SET b 2", "DELETE b", "SET t x EX 0"] {
        let cmd = Command::decode(line).unwrap();
        store.apply(&cmd);
        aof.append(&cmd);
    }
    store.set("timed", "y", Some(100));
    aof.append(&Command::decode("SET timed y EX 100").unwrap());

    aof.compact(&store).unwrap();

    let contents = std::fs::read_to_string(aof.path()).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2, "only live keys survive: {:?}", lines);
    assert!(lines.iter().all(|l| l.starts_with("SET ")));

    let rebuilt = Store::new();
    assert_eq!(aof.replay(&rebuilt).unwrap(), 2);
    assert_eq!(rebuilt.get("a"), Some("1".to_string()));
    assert_eq!(rebuilt.get("b"), None);
    assert_eq!(rebuilt.get("t"), None);
    assert_eq!(rebuilt.get("timed"), Some("y".to_string()));

    // the remaining TTL was recomputed, not copied verbatim
    let timed = lines.iter().find(|l| l.contains("timed")).unwrap();
    match Command::decode(timed).unwrap() {
        Command::Set { ttl: Some(t), .. } => assert!(t >= 99 && t <= 100, "ttl {}", t),
        other => panic!("expected timed SET, got {:?}", other),
    }
}

#[test]
fn appends_after_compaction_land_in_the_new_file() {
    let dir = TempDir::new().unwrap();
    let aof = temp_aof(&dir);
    let store = Store::new();

    store.set("a", "1", None);
    aof.append(&Command::decode("SET a 1").unwrap());
    aof.compact(&store).unwrap();
    aof.append(&Command::decode("SET later 9").unwrap());

    let rebuilt = Store::new();
    assert_eq!(aof.replay(&rebuilt).unwrap(), 2);
    assert_eq!(rebuilt.get("a"), Some("1".to_string()));
    assert_eq!(rebuilt.get("later"), Some("9".to_string()));
}

#[test]
fn engine_logs_mutations_but_not_noop_deletes() {
    let dir = TempDir::new().unwrap();
    let aof = Arc::new(temp_aof(&dir));
    let store = Arc::new(Store::new());
    let engine = Engine::new(store.clone(), Some(aof.clone()), None);

    engine.dispatch(parse_request("SET a 1").unwrap());
    engine.dispatch(parse_request("DELETE a").unwrap());
    // absent key: answered NOT_FOUND and kept out of the log
    engine.dispatch(parse_request("DELETE missing").unwrap());
    // rejected writes stay out of the log too
    let tight = Engine::new(Arc::new(Store::with_limits(1, 1)), Some(aof.clone()), None);
    tight.dispatch(parse_request("SET toolong v").unwrap());

    let contents = std::fs::read_to_string(aof.path()).unwrap();
    assert_eq!(contents, "SET a 1\nDELETE a\n");

    let rebuilt = Store::new();
    aof.replay(&rebuilt).unwrap();
    assert_eq!(rebuilt.size(), 0);
}
