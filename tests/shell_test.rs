// Copyright 2020 Joyent, Inc.

mod common;

use serde_json::{json, Value};

use storm_multilang::shell::{run_bolt, run_spout, Bolt, Spout};
use storm_multilang::{BoltConn, Config, Error, SpoutConn, TupleMetadata};

use common::{test_logger, text_input, text_values, SharedBuf};

fn handshake() -> Value {
    json!({"conf": {}, "context": {"taskid": 2}, "pidDir": ""})
}

fn quiet() -> Config {
    Config {
        need_task_ids: false,
        ..Config::default()
    }
}

#[derive(Default)]
struct SplitSentence {
    prepared: bool,
    cleaned_up: usize,
    executed: Vec<String>,
}

impl Bolt for SplitSentence {
    type Fields = (String,);

    fn prepare(&mut self, conn: &mut BoltConn) -> Result<(), Error> {
        self.prepared = conn.context().is_some();
        Ok(())
    }

    fn execute(
        &mut self,
        conn: &mut BoltConn,
        meta: &TupleMetadata,
        (sentence,): (String,),
    ) -> Result<(), Error> {
        for word in sentence.split_whitespace() {
            conn.emit(&[meta.id.as_str()], "", &[&word])?;
        }
        self.executed.push(meta.id.clone());
        conn.ack(&meta.id)
    }

    fn cleanup(&mut self) {
        self.cleaned_up += 1;
    }
}

#[test]
fn bolt_loop() {
    let messages = [
        handshake(),
        json!({
            "id": "-6955786537413359385",
            "comp": "__system",
            "stream": "__heartbeat",
            "task": -1,
            "tuple": []
        }),
        json!({"id": "t0", "comp": "spout", "stream": "default", "task": 1, "tuple": [5]}),
        json!({"id": "t1", "comp": "spout", "stream": "default", "task": 1, "tuple": ["a cow"]}),
    ];
    let out = SharedBuf::new();
    let log = test_logger();
    let mut conn =
        BoltConn::from_config(&quiet(), text_input(&messages), out.clone(), Some(&log));
    let mut bolt = SplitSentence::default();

    run_bolt(&mut bolt, &mut conn).expect("bolt runs to the end of input");

    assert!(bolt.prepared);
    assert_eq!(bolt.cleaned_up, 1);
    assert_eq!(bolt.executed, vec![String::from("t1")]);

    let values = text_values(&out.contents());
    assert_eq!(
        &values[1..],
        &[
            json!({"command": "sync"}),
            json!({"command": "emit", "anchors": ["t1"], "need_task_ids": false, "tuple": ["a"]}),
            json!({"command": "emit", "anchors": ["t1"], "need_task_ids": false, "tuple": ["cow"]}),
            json!({"command": "ack", "id": "t1"}),
        ]
    );
}

#[test]
fn bolt_loop_stops_on_fatal_errors() {
    let messages = [
        handshake(),
        json!({"id": "t1", "comp": "spout", "stream": "default", "task": 1, "tuple": ["a", "b"]}),
        json!({"id": "t2", "comp": "spout", "stream": "default", "task": 1, "tuple": ["c"]}),
    ];
    let mut conn =
        BoltConn::from_config(&quiet(), text_input(&messages), SharedBuf::new(), None);
    let mut bolt = SplitSentence::default();

    match run_bolt(&mut bolt, &mut conn) {
        Err(Error::SlotCount { expected: 1, found: 2 }) => (),
        other => panic!("expected a slot count error, got {:?}", other),
    }
    assert!(bolt.executed.is_empty());
    assert_eq!(bolt.cleaned_up, 1);
}

#[derive(Default)]
struct Counter {
    next: u64,
    acked: Vec<String>,
    failed: Vec<String>,
    closed: bool,
}

impl Spout for Counter {
    fn next_tuple(&mut self, conn: &mut SpoutConn) -> Result<(), Error> {
        self.next += 1;
        conn.emit(&self.next.to_string(), "", &[&self.next])?;
        Ok(())
    }

    fn ack(&mut self, _conn: &mut SpoutConn, id: &str) -> Result<(), Error> {
        self.acked.push(id.to_string());
        Ok(())
    }

    fn fail(&mut self, conn: &mut SpoutConn, id: &str) -> Result<(), Error> {
        self.failed.push(id.to_string());
        conn.log(&format!("replaying {}", id))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[test]
fn spout_loop() {
    let messages = [
        handshake(),
        json!({"command": "next"}),
        json!({"command": "ack", "id": "1"}),
        json!({"command": "bogus"}),
        json!({"command": "next"}),
        json!({"command": "fail", "id": "2"}),
    ];
    let out = SharedBuf::new();
    let mut conn =
        SpoutConn::from_config(&quiet(), text_input(&messages), out.clone(), None);
    let mut spout = Counter::default();

    run_spout(&mut spout, &mut conn).expect("spout runs to the end of input");

    assert_eq!(spout.acked, vec![String::from("1")]);
    assert_eq!(spout.failed, vec![String::from("2")]);
    assert!(spout.closed);

    let values = text_values(&out.contents());
    assert_eq!(
        &values[1..],
        &[
            json!({"command": "emit", "id": "1", "need_task_ids": false, "tuple": [1]}),
            json!({"command": "sync"}),
            json!({"command": "sync"}),
            json!({"command": "sync"}),
            json!({"command": "emit", "id": "2", "need_task_ids": false, "tuple": [2]}),
            json!({"command": "sync"}),
            json!({"command": "log", "msg": "replaying 2"}),
            json!({"command": "sync"}),
        ]
    );
}
