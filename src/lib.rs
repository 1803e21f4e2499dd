// Copyright 2020 Joyent, Inc.

//! storm-multilang: worker-side plumbing for Storm's multilang protocol
//!
//! A Storm topology can run bolts and spouts as external processes. The
//! engine starts the worker, speaks to it over the worker's stdin and stdout,
//! and expects the worker to follow a small request/response protocol.
//!
//! Session
//!
//! * The engine sends a handshake carrying the topology configuration, the
//!   worker's task id, a task id to component map and a pid directory.
//!
//! * The worker replies with its process id and creates an empty file named
//!   after that pid inside the pid directory.
//!
//! * Bolts then read tuples and answer with `ack`, `fail`, `emit`, `log` and,
//!   for heartbeat tuples on the `__heartbeat` stream, `sync`.
//!
//! * Spouts read `next`, `ack` and `fail` commands, may emit while it is
//!   their turn, and hand the turn back with `sync`.
//!
//! When a non-direct emit asks for task ids, the engine replies with the list
//! of tasks the tuple was routed to. Tuples or commands may arrive before that
//! reply; they are set aside and returned, in order, by later reads.
//!
//! Wire flavors
//!
//! * jsonObject  Each message is one line of JSON followed by a line holding
//!               `end`. Content slots are JSON values.
//!
//! * jsonEncoded As jsonObject, but each content slot is a string holding the
//!               base64 encoding of the slot's own serialization.
//!
//! * binary      Each frame is a varint length, a one byte message kind and a
//!               message body. See the `binary` module for the body layouts.
//!
//! Worker authors usually implement [`shell::Bolt`] or [`shell::Spout`] and
//! hand it to [`shell::run_bolt`] or [`shell::run_spout`]. [`BoltConn`] and
//! [`SpoutConn`] expose the protocol directly for workers that drive their
//! own loop.

#![allow(missing_docs)]

pub mod binary;
pub mod config;
pub mod conn;
pub mod content;
pub mod error;
#[cfg(target_os = "linux")]
pub mod mapped;
pub mod messages;
pub mod pool;
pub mod protocol;
pub mod shell;
pub mod text;
pub mod varint;

pub use crate::config::{Config, Encoding, PoolKind};
pub use crate::conn::{BoltConn, Session, SpoutConn};
pub use crate::content::{Content, ContentMut};
pub use crate::error::Error;
pub use crate::messages::{Command, Context, Control, TupleMetadata};
