// Copyright 2020 Joyent, Inc.

//! Text flavor: one line of JSON per message, followed by a line reading
//! `end`.
//!
//! Content slots come in two sub-flavors. In object mode a slot is an
//! arbitrary JSON value embedded in the message. In encoded mode each slot is
//! serialized to JSON on its own and carried as a base64 string, to be
//! decoded into the caller's destination type on arrival.

use std::io::{BufWriter, ErrorKind, Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_derive::Serialize;
use serde_json::Value;
use slog::{debug, warn, Logger};
use tokio_util::codec::{Decoder, Encoder};

use crate::binary::MAX_FRAME_LEN;
use crate::content::{Content, ContentMut};
use crate::error::{decode_error, encode_error, Error};
use crate::messages::{
    Context, Control, Emission, Pid, TaskIds, Tuple, TupleMetadata,
};
use crate::protocol::{check_slots, Input, Output, TupleBuffer};

pub const SENTINEL: &[u8] = b"end";

const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentMode {
    Encoded,
    Object,
}

/// A message line and the sentinel line that followed it.
#[derive(Debug, PartialEq)]
pub struct TextFrame {
    pub message: Bytes,
    pub sentinel: Bytes,
}

fn trim_line(mut line: BytesMut) -> Bytes {
    if line.last() == Some(&b'\n') {
        line.truncate(line.len() - 1);
    }
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line.freeze()
}

/// Longest line accepted from the engine, matching the binary frame limit.
pub const MAX_LINE_LEN: usize = MAX_FRAME_LEN;

/// Splits a byte stream into message/sentinel line pairs.
///
/// Bytes already scanned for a newline are not scanned again when more
/// input arrives.
#[derive(Debug)]
pub struct LineFraming {
    next_index: usize,
    first_newline: Option<usize>,
    max_length: usize,
}

impl LineFraming {
    pub fn new() -> LineFraming {
        LineFraming::with_max_length(MAX_LINE_LEN)
    }

    pub fn with_max_length(max_length: usize) -> LineFraming {
        LineFraming {
            next_index: 0,
            first_newline: None,
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn check_len(&self, len: usize) -> Result<(), Error> {
        if len > self.max_length {
            return Err(Error::Framing(format!(
                "line of {} bytes exceeds the {} byte limit",
                len, self.max_length
            )));
        }
        Ok(())
    }
}

impl Default for LineFraming {
    fn default() -> LineFraming {
        LineFraming::new()
    }
}

impl Decoder for LineFraming {
    type Item = TextFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<TextFrame>, Error> {
        loop {
            let start = self.next_index;
            let newline = match buf[start..].iter().position(|b| *b == b'\n') {
                Some(offset) => start + offset,
                None => {
                    self.next_index = buf.len();
                    let line_start = self.first_newline.map_or(0, |i| i + 1);
                    self.check_len(buf.len() - line_start)?;
                    return Ok(None);
                }
            };
            self.next_index = newline + 1;

            let first = match self.first_newline {
                Some(first) => first,
                None => {
                    self.check_len(newline)?;
                    self.first_newline = Some(newline);
                    continue;
                }
            };
            self.check_len(newline - first - 1)?;
            self.next_index = 0;
            self.first_newline = None;

            let mut message = buf.split_to(newline + 1);
            let sentinel = message.split_off(first + 1);
            return Ok(Some(TextFrame {
                message: trim_line(message),
                sentinel: trim_line(sentinel),
            }));
        }
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<TextFrame>, Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let msg = if buf.contains(&b'\n') {
            "stream ended before the end line; every message, including \
             the last, must be followed by a newline-terminated end line"
        } else {
            "stream ended inside a message line"
        };
        Err(Error::Framing(String::from(msg)))
    }
}

impl<'a> Encoder<&'a [u8]> for LineFraming {
    type Error = Error;

    fn encode(&mut self, line: &'a [u8], buf: &mut BytesMut) -> Result<(), Error> {
        if line.contains(&b'\n') {
            let msg = "message contains a newline";
            return Err(Error::Encode(String::from(msg)));
        }
        if line.len() > self.max_length {
            return Err(Error::Encode(format!(
                "message of {} bytes exceeds the {} byte limit",
                line.len(),
                self.max_length
            )));
        }
        buf.reserve(line.len() + SENTINEL.len() + 2);
        buf.put_slice(line);
        buf.put_u8(b'\n');
        buf.put_slice(SENTINEL);
        buf.put_u8(b'\n');
        Ok(())
    }
}

/// Drives a `Decoder` over a blocking reader.
pub struct FrameReader<R, D> {
    reader: R,
    codec: D,
    buf: BytesMut,
    eof: bool,
}

impl<R: Read, D: Decoder> FrameReader<R, D> {
    pub fn new(reader: R, codec: D) -> FrameReader<R, D> {
        FrameReader {
            reader,
            codec,
            buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<D::Item>, D::Error> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            if self.eof {
                return self.codec.decode_eof(&mut self.buf);
            }
            let mut read_buf = [0; READ_CHUNK];
            match self.reader.read(&mut read_buf) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&read_buf[..n]),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// A task id reply is a bare JSON array; everything else is an object.
fn is_task_ids(message: &[u8]) -> bool {
    message
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map_or(false, |b| *b == b'[')
}

fn parse<T: DeserializeOwned>(what: &str, message: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(message).map_err(|e| decode_error(what, e))
}

pub struct TextInput<R> {
    frames: FrameReader<R, LineFraming>,
    mode: ContentMode,
    pending: TupleBuffer,
    log: Logger,
}

impl<R: Read> TextInput<R> {
    pub fn new(reader: R, mode: ContentMode, log: &Logger) -> TextInput<R> {
        TextInput {
            frames: FrameReader::new(reader, LineFraming::new()),
            mode,
            pending: TupleBuffer::new(),
            log: log.clone(),
        }
    }

    fn read_data(&mut self) -> Result<Option<Bytes>, Error> {
        match self.frames.next_frame()? {
            Some(frame) => {
                if frame.sentinel != SENTINEL {
                    warn!(self.log, "discarding unexpected end line";
                        "line" => %String::from_utf8_lossy(&frame.sentinel));
                }
                Ok(Some(frame.message))
            }
            None => Ok(None),
        }
    }

    fn next_message(&mut self) -> Result<Option<Bytes>, Error> {
        if let Some(message) = self.pending.pop() {
            debug!(self.log, "replaying buffered message";
                "pending" => self.pending.len());
            return Ok(Some(message));
        }
        self.read_data()
    }

    fn decode_slot(
        &self,
        slot: &mut dyn ContentMut,
        content: Value,
    ) -> Result<(), Error> {
        match self.mode {
            ContentMode::Object => slot.set_value(content),
            ContentMode::Encoded => match content {
                Value::String(encoded) => {
                    let bytes = STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(|e| decode_error("encoded content slot", e))?;
                    slot.set_bytes(&bytes)
                }
                other => Err(Error::Decode(format!(
                    "encoded content slot is not a string: {}",
                    other
                ))),
            },
        }
    }
}

impl<R: Read> Input for TextInput<R> {
    fn read_context(&mut self) -> Result<Option<Context>, Error> {
        match self.next_message()? {
            Some(message) => parse("handshake", &message).map(Some),
            None => Ok(None),
        }
    }

    fn read_control(&mut self) -> Result<Option<Control>, Error> {
        match self.next_message()? {
            Some(message) => parse("control message", &message).map(Some),
            None => Ok(None),
        }
    }

    fn read_tuple(
        &mut self,
        slots: &mut [&mut dyn ContentMut],
    ) -> Result<Option<TupleMetadata>, Error> {
        let message = match self.next_message()? {
            Some(message) => message,
            None => return Ok(None),
        };
        let tuple: Tuple<Value> = parse("tuple", &message)?;
        if check_slots(&tuple.meta, tuple.contents.len(), slots.len())? {
            for (slot, content) in slots.iter_mut().zip(tuple.contents) {
                self.decode_slot(&mut **slot, content)?;
            }
        }
        Ok(Some(tuple.meta))
    }

    fn read_task_ids(&mut self) -> Result<TaskIds, Error> {
        loop {
            let message = match self.read_data()? {
                Some(message) => message,
                None => {
                    let msg = "stream ended while awaiting task ids";
                    return Err(Error::Framing(String::from(msg)));
                }
            };
            if is_task_ids(&message) {
                return parse("task ids", &message);
            }
            self.pending.push(message);
            debug!(self.log, "buffered message received ahead of task ids";
                "pending" => self.pending.len());
        }
    }
}

#[derive(Serialize)]
struct ShellMsg<'a> {
    #[serde(flatten)]
    emission: &'a Emission,
    #[serde(rename = "tuple", skip_serializing_if = "Vec::is_empty")]
    contents: Vec<Value>,
}

pub struct TextOutput<W: Write> {
    writer: BufWriter<W>,
    framing: LineFraming,
    mode: ContentMode,
    buf: BytesMut,
}

impl<W: Write> TextOutput<W> {
    pub fn new(writer: W, mode: ContentMode) -> TextOutput<W> {
        TextOutput {
            writer: BufWriter::new(writer),
            framing: LineFraming::new(),
            mode,
            buf: BytesMut::new(),
        }
    }

    /// Write any serializable message as one framed line.
    pub fn send_msg<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<(), Error> {
        let line = serde_json::to_vec(msg).map_err(|e| encode_error("message", e))?;
        self.framing.encode(&line[..], &mut self.buf)?;
        let result = self.writer.write_all(&self.buf);
        self.buf.clear();
        result.map_err(Error::from)
    }

    fn encode_slot(&self, content: &dyn Content) -> Result<Value, Error> {
        match self.mode {
            ContentMode::Object => content.to_value(),
            ContentMode::Encoded => {
                let bytes = content.to_bytes()?;
                Ok(Value::String(STANDARD.encode(bytes)))
            }
        }
    }
}

impl<W: Write> Output for TextOutput<W> {
    fn send_pid(&mut self, pid: Pid) -> Result<(), Error> {
        self.send_msg(&pid)
    }

    fn send_emission(
        &mut self,
        emission: &Emission,
        contents: &[&dyn Content],
    ) -> Result<(), Error> {
        let contents = contents
            .iter()
            .map(|c| self.encode_slot(*c))
            .collect::<Result<Vec<Value>, Error>>()?;
        self.send_msg(&ShellMsg { emission, contents })
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_need_both_lines() {
        let mut framing = LineFraming::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\n"[..]);
        assert_eq!(framing.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"end\n{\"b\"");
        let frame = framing.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.message[..], b"{\"a\":1}");
        assert_eq!(&frame.sentinel[..], b"end");
        assert_eq!(&buf[..], b"{\"b\"");
    }

    #[test]
    fn missing_sentinel_at_eof() {
        let mut framing = LineFraming::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\n"[..]);
        match framing.decode_eof(&mut buf) {
            Err(Error::Framing(_)) => (),
            other => panic!("expected a framing error, got {:?}", other),
        }

        let mut buf = BytesMut::from(&b"{\"a\":1}\nend"[..]);
        assert!(framing.decode_eof(&mut buf).is_err());

        let mut buf = BytesMut::new();
        assert_eq!(framing.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn crlf_lines() {
        let mut framing = LineFraming::new();
        let mut buf = BytesMut::from(&b"[1,2]\r\nend\r\n"[..]);
        let frame = framing.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.message[..], b"[1,2]");
        assert_eq!(&frame.sentinel[..], SENTINEL);
    }

    #[test]
    fn lines_split_across_reads() {
        let mut framing = LineFraming::new();
        let mut buf = BytesMut::new();
        let input = b"{\"command\":\"next\"}\nend\n[3]\nend\n";
        let mut frames = Vec::new();
        for chunk in input.chunks(3) {
            buf.extend_from_slice(chunk);
            while let Some(frame) = framing.decode(&mut buf).unwrap() {
                frames.push(frame.message);
            }
        }
        assert_eq!(frames, vec![
            Bytes::from_static(b"{\"command\":\"next\"}"),
            Bytes::from_static(b"[3]"),
        ]);
        assert!(buf.is_empty());
    }

    #[test]
    fn long_lines_are_refused() {
        let mut framing = LineFraming::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        match framing.decode(&mut buf) {
            Err(Error::Framing(_)) => (),
            other => panic!("expected a framing error, got {:?}", other),
        }

        let mut framing = LineFraming::with_max_length(8);
        let mut buf = BytesMut::from(&b"[1]\nthis is not end\n"[..]);
        assert!(framing.decode(&mut buf).is_err());

        let mut framing = LineFraming::with_max_length(8);
        let mut buf = BytesMut::from(&b"01234567\nend\n"[..]);
        assert!(framing.decode(&mut buf).unwrap().is_some());

        let mut out = BytesMut::new();
        assert!(framing.encode(&b"012345678"[..], &mut out).is_err());
    }

    #[test]
    fn odd_sentinel_is_discarded() {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let input = &b"{\"command\":\"next\"}\nEND\n{\"command\":\"ack\",\"id\":\"4\"}\nend\n"[..];
        let mut text = TextInput::new(input, ContentMode::Object, &log);
        assert_eq!(text.read_control().unwrap(), Some(Control::next()));
        assert_eq!(text.read_control().unwrap(), Some(Control::ack("4")));
        assert_eq!(text.read_control().unwrap(), None);
    }

    #[test]
    fn task_id_shape() {
        assert!(is_task_ids(b"[1,2]"));
        assert!(is_task_ids(b"  []"));
        assert!(!is_task_ids(b"{\"id\":\"1\"}"));
        assert!(!is_task_ids(b""));
    }
}
