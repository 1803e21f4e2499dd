// Copyright 2020 Joyent, Inc.

//! The codec seam between connections and the wire flavors.

use std::collections::VecDeque;
use std::io::{Read, Write};

use bytes::Bytes;
use slog::Logger;

use crate::binary::{BinaryInput, BinaryOutput};
use crate::config::{Config, Encoding};
use crate::content::{Content, ContentMut};
use crate::error::Error;
use crate::messages::{Context, Control, Emission, Pid, TaskIds, TupleMetadata};
use crate::text::{ContentMode, TextInput, TextOutput};

/// The reading half of a codec.
///
/// Every read returns `Ok(None)` when the engine has closed the stream.
pub trait Input {
    fn read_context(&mut self) -> Result<Option<Context>, Error>;

    fn read_control(&mut self) -> Result<Option<Control>, Error>;

    /// Read a tuple, decoding its content slots into `slots`.
    fn read_tuple(
        &mut self,
        slots: &mut [&mut dyn ContentMut],
    ) -> Result<Option<TupleMetadata>, Error>;

    /// Read the engine's reply to an emit, setting aside any other frames
    /// that arrive first. Those frames are returned, in order, by later
    /// reads.
    fn read_task_ids(&mut self) -> Result<TaskIds, Error>;

    fn close(&mut self) {}
}

/// The writing half of a codec.
pub trait Output {
    fn send_pid(&mut self, pid: Pid) -> Result<(), Error>;

    fn send_emission(
        &mut self,
        emission: &Emission,
        contents: &[&dyn Content],
    ) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;

    fn close(&mut self) {}
}

/// Frames that arrived while a task id reply was expected.
#[derive(Debug, Default)]
pub(crate) struct TupleBuffer {
    frames: VecDeque<Bytes>,
}

impl TupleBuffer {
    pub(crate) fn new() -> TupleBuffer {
        TupleBuffer::default()
    }

    pub(crate) fn push(&mut self, frame: Bytes) {
        self.frames.push_back(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Check an incoming tuple's slot count against the caller's destinations.
///
/// Returns whether the slots should be decoded: heartbeat tuples carry no
/// contents and are passed through whatever the caller supplied.
pub(crate) fn check_slots(
    meta: &TupleMetadata,
    found: usize,
    expected: usize,
) -> Result<bool, Error> {
    if found == 0 && meta.is_heartbeat() {
        return Ok(false);
    }
    if found != expected {
        return Err(Error::SlotCount { expected, found });
    }
    Ok(true)
}

/// Build the codec selected by `config` over a pair of byte streams.
pub fn open<R, W>(
    config: &Config,
    reader: R,
    writer: W,
    log: &Logger,
) -> (Box<dyn Input>, Box<dyn Output>)
where
    R: Read + 'static,
    W: Write + 'static,
{
    match config.encoding {
        Encoding::JsonObject => (
            Box::new(TextInput::new(reader, ContentMode::Object, log)),
            Box::new(TextOutput::new(writer, ContentMode::Object)),
        ),
        Encoding::JsonEncoded => (
            Box::new(TextInput::new(reader, ContentMode::Encoded, log)),
            Box::new(TextOutput::new(writer, ContentMode::Encoded)),
        ),
        Encoding::Binary => (
            Box::new(BinaryInput::new(reader, config.buffer_pool(), log)),
            Box::new(BinaryOutput::new(writer, config.buffer_pool())),
        ),
    }
}
