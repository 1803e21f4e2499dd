// Copyright 2020 Joyent, Inc.

use std::io;

use thiserror::Error;

/// Errors surfaced by the multilang codecs and connections.
///
/// End-of-stream is not represented here: reads return `Ok(None)` when the
/// engine closes its side of the pipe.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The byte stream can no longer be split into frames.
    #[error("framing error: {0}")]
    Framing(String),

    /// A frame was delimited correctly but its contents did not match the
    /// expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// The engine's handshake was missing or unreadable.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("tuple carries {found} content slots, caller supplied {expected}")]
    SlotCount { expected: usize, found: usize },

    /// A spout emitted outside of its turn.
    #[error("spout is not ready to send; read a control message first")]
    NotReady,

    #[error("connection has not completed the handshake")]
    NotConnected,

    #[error("connection has already completed the handshake")]
    AlreadyConnected,

    #[error("failed to create pid file {path}: {source}")]
    PidFile { path: String, source: io::Error },
}

impl Error {
    /// Whether the connection must be torn down after this error.
    ///
    /// Only decode errors leave the framing boundary intact; every other
    /// variant is either a broken stream or a defect in the caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Decode(_) => false,
            _ => true,
        }
    }
}

pub(crate) fn decode_error<E: std::fmt::Display>(what: &str, e: E) -> Error {
    Error::Decode(format!("{}: {}", what, e))
}

pub(crate) fn encode_error<E: std::fmt::Display>(what: &str, e: E) -> Error {
    Error::Encode(format!("{}: {}", what, e))
}
