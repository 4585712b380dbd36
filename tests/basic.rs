use cinderkv::*;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> Engine {
    Engine::new(Arc::new(Store::new()), None, None)
}

fn run(engine: &Engine, line: &str) -> String {
    engine
        .dispatch(parse_request(line).expect("request should parse"))
        .to_string()
}

#[test]
fn set_get_delete_cycle() {
    let e = engine();
    assert_eq!(run(&e, "SET a b"), "OK");
    assert_eq!(run(&e, "GET a"), "b");
    assert_eq!(run(&e, "DELETE a"), "OK");
    assert_eq!(run(&e, "DELETE a"), "NOT_FOUND");
    assert_eq!(run(&e, "GET a"), "NULL");
}

#[test]
fn ttl_expires_without_a_sweeper() {
    let e = engine();
    assert_eq!(run(&e, "SET user:1 alice EX 1"), "OK");
    assert_eq!(run(&e, "GET user:1"), "alice");
    std::thread::sleep(Duration::from_millis(1200));
    // no sweep task is running; lazy expiry alone must hide it
    assert_eq!(run(&e, "GET user:1"), "NULL");
}

#[test]
fn quoted_values_keep_their_spaces() {
    let e = engine();
    assert_eq!(run(&e, r#"SET greeting "hello there world""#), "OK");
    assert_eq!(run(&e, "GET greeting"), "hello there world");
    // unquoted multi-token values collapse to single spaces
    assert_eq!(run(&e, "SET msg a   b"), "OK");
    assert_eq!(run(&e, "GET msg"), "a b");
}

#[test]
fn oversized_writes_get_an_error_and_no_state() {
    let store = Arc::new(Store::with_limits(8, 16));
    let e = Engine::new(store.clone(), None, None);
    assert_eq!(
        run(&e, "SET a-key-way-past-the-limit v"),
        "ERROR: key or value too large"
    );
    assert_eq!(
        run(&e, "SET k a-value-way-past-the-limit"),
        "ERROR: key or value too large"
    );
    assert_eq!(store.size(), 0);
    assert_eq!(run(&e, "SET k v"), "OK");
}

#[test]
fn bad_requests_format_as_error_lines() {
    for (line, message) in [
        ("FROB x", "ERROR: unknown command: FROB"),
        ("SET k", "ERROR: SET requires a key and a value"),
        ("GET", "ERROR: GET requires a key"),
        ("DELETE", "ERROR: DELETE requires a key"),
        ("SET k v EX soon", "ERROR: invalid TTL: soon"),
    ] {
        let err = parse_request(line).expect_err(line);
        assert_eq!(Response::Error(err.to_string()).to_string(), message);
    }
}
