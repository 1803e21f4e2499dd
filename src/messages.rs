// Copyright 2020 Joyent, Inc.

//! The logical messages exchanged with the engine.
//!
//! Serde attributes describe the text (JSON) rendering; the binary rendering
//! of the same types lives in `binary`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::Deserializer;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const HEARTBEAT_STREAM: &str = "__heartbeat";
pub const HEARTBEAT_TASK: i32 = -1;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(rename = "task->component", default)]
    pub task_components: BTreeMap<String, String>,
    #[serde(rename = "taskid")]
    pub task_id: i32,
}

/// Handshake payload, sent once by the engine when the worker starts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub conf: Map<String, Value>,
    #[serde(rename = "context")]
    pub topology: Topology,
    #[serde(rename = "pidDir", default)]
    pub pid_dir: PathBuf,
}

impl Context {
    /// Task id of this worker.
    pub fn task_id(&self) -> i32 {
        self.topology.task_id
    }

    pub fn component_of(&self, task: i32) -> Option<&str> {
        self.topology
            .task_components
            .get(&task.to_string())
            .map(String::as_str)
    }

    /// Name of the component this worker is an instance of.
    pub fn component(&self) -> Option<&str> {
        self.component_of(self.task_id())
    }

    pub fn conf(&self, key: &str) -> Option<&Value> {
        self.conf.get(key)
    }

    pub fn pid_dir(&self) -> &Path {
        &self.pid_dir
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pid {
    pub pid: u32,
}

impl Pid {
    pub fn current() -> Pid {
        Pid {
            pid: std::process::id(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleMetadata {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "comp")]
    pub component: String,
    pub stream: String,
    #[serde(rename = "task")]
    pub source_task: i32,
}

impl TupleMetadata {
    pub fn new(
        id: &str,
        component: &str,
        stream: &str,
        source_task: i32,
    ) -> TupleMetadata {
        TupleMetadata {
            id: id.to_string(),
            component: component.to_string(),
            stream: stream.to_string(),
            source_task,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.stream == HEARTBEAT_STREAM && self.source_task == HEARTBEAT_TASK
    }
}

/// An incoming tuple with its content slots in wire form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tuple<S> {
    #[serde(flatten)]
    pub meta: TupleMetadata,
    #[serde(rename = "tuple", default = "Vec::new")]
    pub contents: Vec<S>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Next,
    Ack,
    Fail,
    Sync,
    Emit,
    Log,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Next => "next",
            Command::Ack => "ack",
            Command::Fail => "fail",
            Command::Sync => "sync",
            Command::Emit => "emit",
            Command::Log => "log",
        }
    }

    pub fn parse(s: &str) -> Option<Command> {
        match s {
            "next" => Some(Command::Next),
            "ack" => Some(Command::Ack),
            "fail" => Some(Command::Fail),
            "sync" => Some(Command::Sync),
            "emit" => Some(Command::Emit),
            "log" => Some(Command::Log),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spout control message: `next`, or `ack`/`fail` of a message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Control {
    pub fn next() -> Control {
        Control {
            command: Command::Next,
            id: None,
        }
    }

    pub fn ack(id: &str) -> Control {
        Control {
            command: Command::Ack,
            id: Some(id.to_string()),
        }
    }

    pub fn fail(id: &str) -> Control {
        Control {
            command: Command::Fail,
            id: Some(id.to_string()),
        }
    }
}

/// Metadata of an outbound message. Content slots travel alongside it.
///
/// Optional fields left at their defaults are not rendered: the engine
/// treats the presence of a key as meaningful.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    pub command: Command,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub task: i32,
    /// Sent as "need_task_ids", the key the engine's shell bolt reads.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub need_task_ids: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
}

impl Emission {
    pub fn new(command: Command) -> Emission {
        Emission {
            command,
            id: String::new(),
            anchors: Vec::new(),
            stream: String::new(),
            task: 0,
            need_task_ids: true,
            msg: String::new(),
        }
    }

    pub fn ack(id: &str) -> Emission {
        Emission {
            id: id.to_string(),
            ..Emission::new(Command::Ack)
        }
    }

    pub fn fail(id: &str) -> Emission {
        Emission {
            id: id.to_string(),
            ..Emission::new(Command::Fail)
        }
    }

    pub fn sync() -> Emission {
        Emission::new(Command::Sync)
    }

    pub fn log(msg: &str) -> Emission {
        Emission {
            msg: msg.to_string(),
            ..Emission::new(Command::Log)
        }
    }
}

/// The engine's reply to an emit that asked for routing decisions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskIds(pub Vec<i32>);

impl TaskIds {
    pub fn into_inner(self) -> Vec<i32> {
        self.0
    }
}

fn is_zero(x: &i32) -> bool {
    *x == 0
}

fn is_true(b: &bool) -> bool {
    *b
}

fn default_true() -> bool {
    true
}

/// Tuple ids are strings so 64-bit values survive lossy number decoders,
/// but older engines send them as bare numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match <Id as serde::Deserialize>::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Signed(n) => n.to_string(),
        Id::Unsigned(n) => n.to_string(),
    })
}
