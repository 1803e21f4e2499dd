// Copyright 2020 Joyent, Inc.

mod common;

use serde_json::{json, Value};

use storm_multilang::{Command, Config, Control, Error, SpoutConn};

use common::{test_logger, text_input, text_values, SharedBuf};

fn handshake() -> Value {
    json!({
        "conf": {},
        "context": {"task->component": {"4": "numbers"}, "taskid": 4},
        "pidDir": ""
    })
}

fn spout(config: &Config, messages: &[Value]) -> (SpoutConn, SharedBuf) {
    let out = SharedBuf::new();
    let log = test_logger();
    let conn = SpoutConn::from_config(
        config,
        text_input(messages),
        out.clone(),
        Some(&log),
    );
    (conn, out)
}

fn quiet() -> Config {
    Config {
        need_task_ids: false,
        ..Config::default()
    }
}

fn assert_not_ready<T: std::fmt::Debug>(result: Result<T, Error>) {
    match result {
        Err(Error::NotReady) => (),
        other => panic!("expected NotReady, got {:?}", other),
    }
}

#[test]
fn spout_turns() {
    let messages = [
        handshake(),
        json!({"command": "next"}),
        json!({"command": "ack", "id": "1"}),
    ];
    let (mut conn, out) = spout(&quiet(), &messages);
    conn.connect().unwrap();

    assert!(!conn.is_ready_to_send());
    assert_not_ready(conn.emit("1", "", &[&1]));
    assert_not_ready(conn.emit_direct("1", "", 5, &[&1]));

    let control = conn.read_control().unwrap().unwrap();
    assert_eq!(control, Control::next());
    assert!(conn.is_ready_to_send());
    assert_eq!(conn.emit("1", "", &[&1]).unwrap(), None);
    conn.emit_direct("", "odd", 5, &[&3]).unwrap();
    conn.send_sync().unwrap();

    assert!(!conn.is_ready_to_send());
    assert_not_ready(conn.emit("2", "", &[&2]));

    let control = conn.read_control().unwrap().unwrap();
    assert_eq!(control.command, Command::Ack);
    assert_eq!(control.id.as_deref(), Some("1"));
    conn.send_sync().unwrap();

    assert!(conn.read_control().unwrap().is_none());

    let values = text_values(&out.contents());
    assert_eq!(
        &values[1..],
        &[
            json!({"command": "emit", "id": "1", "need_task_ids": false, "tuple": [1]}),
            json!({
                "command": "emit",
                "stream": "odd",
                "task": 5,
                "need_task_ids": false,
                "tuple": [3]
            }),
            json!({"command": "sync"}),
            json!({"command": "sync"}),
        ]
    );
}

#[test]
fn spout_emit_waits_for_task_ids() {
    let messages = [
        handshake(),
        json!({"command": "next"}),
        json!({"command": "ack", "id": "0"}),
        json!([9, 10]),
    ];
    let (mut conn, _out) = spout(&Config::default(), &messages);
    conn.connect().unwrap();

    conn.read_control().unwrap().unwrap();
    assert_eq!(conn.emit("1", "", &[&"x"]).unwrap(), Some(vec![9, 10]));
    conn.send_sync().unwrap();

    let control = conn.read_control().unwrap().unwrap();
    assert_eq!(control, Control::ack("0"));
}

#[test]
fn unknown_command_still_hands_over_the_turn() {
    let messages = [handshake(), json!({"command": "explode"})];
    let (mut conn, _out) = spout(&quiet(), &messages);
    conn.connect().unwrap();

    let err = conn.read_control().unwrap_err();
    assert!(!err.is_fatal());
    assert!(conn.is_ready_to_send());
    conn.send_sync().unwrap();
}

#[test]
fn missing_task_ids_is_fatal() {
    let messages = [handshake(), json!({"command": "next"})];
    let (mut conn, _out) = spout(&Config::default(), &messages);
    conn.connect().unwrap();
    conn.read_control().unwrap().unwrap();

    match conn.emit("1", "", &[&1]) {
        Err(e @ Error::Framing(_)) => assert!(e.is_fatal()),
        other => panic!("expected a framing error, got {:?}", other),
    }
}
