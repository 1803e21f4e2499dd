// Copyright 2020 Joyent, Inc.

//! Binary flavor: varint length-prefixed frames carrying a compact schema.
//!
//! Frame layout:
//!
//! ```text
//! LEN (uvarint) | KIND (1 byte) | BODY (LEN - 1 bytes)
//! ```
//!
//! Inside a body, strings and opaque blobs are a uvarint length followed by
//! the bytes, lists are a uvarint count followed by the items, and task ids
//! and pids are 4-byte big-endian integers.

use std::borrow::Cow;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_json::Value;
use slog::{debug, Logger};

use crate::content::{Content, ContentMut};
use crate::error::{decode_error, encode_error, Error};
use crate::messages::{
    Command, Context, Control, Emission, Pid, TaskIds, Topology,
    TupleMetadata,
};
use crate::pool::{Buffer, BufferPool};
use crate::protocol::{check_slots, Input, Output, TupleBuffer};
use crate::varint::{read_uvarint, uvarint_len, write_uvarint};

/// Largest payload accepted from the engine.
pub const MAX_FRAME_LEN: usize = 64 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Kind {
    Context = 1,
    Pid = 2,
    Tuple = 3,
    Control = 4,
    Emission = 5,
    TaskIds = 6,
}

impl Kind {
    /// Kind of an undecoded payload.
    pub fn of(payload: &[u8]) -> Option<Kind> {
        payload.first().and_then(|b| FromPrimitive::from_u8(*b))
    }
}

pub trait Encode {
    const KIND: Kind;

    fn body_len(&self) -> usize;
    fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()>;

    fn payload_len(&self) -> usize {
        1 + self.body_len()
    }
}

pub trait Decode<'a>: Sized {
    const KIND: Kind;

    fn read_body(r: &mut &'a [u8]) -> Result<Self, Error>;
}

/// Decode a complete payload, kind byte included.
pub fn decode<'a, T: Decode<'a>>(payload: &'a [u8]) -> Result<T, Error> {
    match Kind::of(payload) {
        Some(kind) if kind == T::KIND => (),
        Some(kind) => {
            return Err(Error::Decode(format!(
                "expected a {:?} message, received {:?}",
                T::KIND,
                kind
            )))
        }
        None => {
            return Err(Error::Decode(String::from(
                "payload does not start with a known message kind",
            )))
        }
    }
    let mut body = &payload[1..];
    let msg = T::read_body(&mut body)?;
    if !body.is_empty() {
        let msg = format!("{} trailing bytes after {:?}", body.len(), T::KIND);
        return Err(Error::Decode(msg));
    }
    Ok(msg)
}

/// Encode a message as a standalone frame, length prefix included.
pub fn encode_frame<T: Encode>(msg: &T) -> Result<Vec<u8>, Error> {
    let payload_len = msg.payload_len();
    let mut out = Vec::with_capacity(uvarint_len(payload_len as u64) + payload_len);
    write_uvarint(&mut out, payload_len as u64)?;
    out.push(kind_byte(T::KIND));
    msg.write_body(&mut out)?;
    Ok(out)
}

fn kind_byte(kind: Kind) -> u8 {
    ToPrimitive::to_u8(&kind).unwrap_or(0)
}

/// Serialize `msg` into a pooled buffer and write it out in one piece.
pub fn write_frame<W: Write, T: Encode>(
    w: &mut W,
    pool: &mut dyn BufferPool,
    msg: &T,
) -> Result<(), Error> {
    let payload_len = msg.payload_len();
    let total = uvarint_len(payload_len as u64) + payload_len;
    let mut buffer = pool.allocate(total);
    let result = fill_frame(&mut buffer, payload_len, msg)
        .and_then(|_| w.write_all(&buffer).map_err(Error::from));
    pool.dispose(buffer);
    result
}

fn fill_frame<T: Encode>(
    buffer: &mut Buffer,
    payload_len: usize,
    msg: &T,
) -> Result<(), Error> {
    let total = buffer.len();
    let mut cursor: &mut [u8] = &mut buffer[..];
    write_uvarint(&mut cursor, payload_len as u64)
        .and_then(|_| cursor.write_u8(kind_byte(T::KIND)))
        .and_then(|_| msg.write_body(&mut cursor))
        .map_err(|e| encode_error("binary frame", e))?;
    if !cursor.is_empty() {
        let msg = format!(
            "{:?} body is {} bytes shorter than its computed size of {}",
            T::KIND,
            cursor.len(),
            total
        );
        return Err(Error::Encode(msg));
    }
    Ok(())
}

/// Read one frame's payload into a pooled buffer.
///
/// Returns `None` if the stream ends cleanly before a length prefix.
pub fn read_frame<R: Read>(
    r: &mut R,
    pool: &mut dyn BufferPool,
) -> Result<Option<Buffer>, Error> {
    let len = match read_uvarint(r) {
        Ok(Some(len)) if len > MAX_FRAME_LEN as u64 => {
            let msg = format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            );
            return Err(Error::Framing(msg));
        }
        Ok(Some(len)) => len as usize,
        Ok(None) => return Ok(None),
        Err(e) => match e.kind() {
            ErrorKind::UnexpectedEof => {
                let msg = "stream ended inside a length prefix";
                return Err(Error::Framing(String::from(msg)));
            }
            ErrorKind::InvalidData => {
                return Err(Error::Framing(format!("bad length prefix: {}", e)))
            }
            _ => return Err(Error::Io(e)),
        },
    };

    let mut buffer = pool.allocate(len);
    match r.read_exact(&mut buffer) {
        Ok(()) => Ok(Some(buffer)),
        Err(e) => {
            pool.dispose(buffer);
            match e.kind() {
                ErrorKind::UnexpectedEof => {
                    let msg = format!("stream ended inside a {} byte frame", len);
                    Err(Error::Framing(msg))
                }
                _ => Err(Error::Io(e)),
            }
        }
    }
}

fn str_len(s: &str) -> usize {
    blob_len(s.as_bytes())
}

fn blob_len(b: &[u8]) -> usize {
    uvarint_len(b.len() as u64) + b.len()
}

fn write_blob<W: Write>(w: &mut W, b: &[u8]) -> io::Result<()> {
    write_uvarint(w, b.len() as u64)?;
    w.write_all(b)
}

fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_blob(w, s.as_bytes())
}

fn read_len(r: &mut &[u8]) -> Result<usize, Error> {
    match read_uvarint(r) {
        Ok(Some(len)) => Ok(len as usize),
        Ok(None) => Err(Error::Decode(String::from("body ended early"))),
        Err(e) => Err(decode_error("length", e)),
    }
}

fn read_blob<'a>(r: &mut &'a [u8]) -> Result<&'a [u8], Error> {
    let len = read_len(r)?;
    let bytes: &'a [u8] = *r;
    if len > bytes.len() {
        let msg = format!("{} byte field overruns the {} bytes left", len, bytes.len());
        return Err(Error::Decode(msg));
    }
    let (head, tail) = bytes.split_at(len);
    *r = tail;
    Ok(head)
}

fn read_string(r: &mut &[u8]) -> Result<String, Error> {
    let bytes = read_blob(r)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| decode_error("string", e))
}

fn read_i32(r: &mut &[u8]) -> Result<i32, Error> {
    r.read_i32::<BigEndian>()
        .map_err(|e| decode_error("integer", e))
}

fn read_u8(r: &mut &[u8]) -> Result<u8, Error> {
    r.read_u8().map_err(|e| decode_error("byte", e))
}

fn read_command(r: &mut &[u8]) -> Result<Command, Error> {
    let s = read_string(r)?;
    Command::parse(&s)
        .ok_or_else(|| Error::Decode(format!("unknown command \"{}\"", s)))
}

fn conf_text(value: &Value) -> String {
    match serde_json::to_string(value) {
        Ok(text) => text,
        Err(_) => String::from("null"),
    }
}

impl Encode for Context {
    const KIND: Kind = Kind::Context;

    fn body_len(&self) -> usize {
        let conf: usize = self
            .conf
            .iter()
            .map(|(k, v)| str_len(k) + str_len(&conf_text(v)))
            .sum();
        let topology: usize = self
            .topology
            .task_components
            .iter()
            .map(|(task, comp)| str_len(task) + str_len(comp))
            .sum();
        uvarint_len(self.conf.len() as u64)
            + conf
            + uvarint_len(self.topology.task_components.len() as u64)
            + topology
            + 4
            + str_len(&self.pid_dir.to_string_lossy())
    }

    fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_uvarint(w, self.conf.len() as u64)?;
        for (key, value) in &self.conf {
            write_str(w, key)?;
            write_str(w, &conf_text(value))?;
        }
        write_uvarint(w, self.topology.task_components.len() as u64)?;
        for (task, comp) in &self.topology.task_components {
            write_str(w, task)?;
            write_str(w, comp)?;
        }
        w.write_i32::<BigEndian>(self.topology.task_id)?;
        write_str(w, &self.pid_dir.to_string_lossy())
    }
}

impl<'a> Decode<'a> for Context {
    const KIND: Kind = Kind::Context;

    fn read_body(r: &mut &'a [u8]) -> Result<Context, Error> {
        let mut context = Context::default();
        for _ in 0..read_len(r)? {
            let key = read_string(r)?;
            let text = read_string(r)?;
            let value = serde_json::from_str(&text)
                .map_err(|e| decode_error("conf value", e))?;
            context.conf.insert(key, value);
        }
        let mut topology = Topology::default();
        for _ in 0..read_len(r)? {
            let task = read_string(r)?;
            let comp = read_string(r)?;
            topology.task_components.insert(task, comp);
        }
        topology.task_id = read_i32(r)?;
        context.topology = topology;
        context.pid_dir = read_string(r)?.into();
        Ok(context)
    }
}

impl Encode for Pid {
    const KIND: Kind = Kind::Pid;

    fn body_len(&self) -> usize {
        4
    }

    fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.pid)
    }
}

impl<'a> Decode<'a> for Pid {
    const KIND: Kind = Kind::Pid;

    fn read_body(r: &mut &'a [u8]) -> Result<Pid, Error> {
        let pid = r
            .read_u32::<BigEndian>()
            .map_err(|e| decode_error("pid", e))?;
        Ok(Pid { pid })
    }
}

/// A tuple whose content slots borrow from the frame they arrived in.
#[derive(Clone, Debug, PartialEq)]
pub struct TupleFrame<'a> {
    pub meta: TupleMetadata,
    pub contents: Vec<&'a [u8]>,
}

impl<'a> Encode for TupleFrame<'a> {
    const KIND: Kind = Kind::Tuple;

    fn body_len(&self) -> usize {
        str_len(&self.meta.id)
            + str_len(&self.meta.component)
            + str_len(&self.meta.stream)
            + 4
            + uvarint_len(self.contents.len() as u64)
            + self.contents.iter().map(|c| blob_len(c)).sum::<usize>()
    }

    fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_str(w, &self.meta.id)?;
        write_str(w, &self.meta.component)?;
        write_str(w, &self.meta.stream)?;
        w.write_i32::<BigEndian>(self.meta.source_task)?;
        write_uvarint(w, self.contents.len() as u64)?;
        for content in &self.contents {
            write_blob(w, content)?;
        }
        Ok(())
    }
}

impl<'a> Decode<'a> for TupleFrame<'a> {
    const KIND: Kind = Kind::Tuple;

    fn read_body(r: &mut &'a [u8]) -> Result<TupleFrame<'a>, Error> {
        let meta = TupleMetadata {
            id: read_string(r)?,
            component: read_string(r)?,
            stream: read_string(r)?,
            source_task: read_i32(r)?,
        };
        let count = read_len(r)?;
        let mut contents = Vec::with_capacity(count.min(r.len()));
        for _ in 0..count {
            contents.push(read_blob(r)?);
        }
        Ok(TupleFrame { meta, contents })
    }
}

const HAS_ID: u8 = 1 << 0;
const HAS_ANCHORS: u8 = 1 << 1;
const HAS_STREAM: u8 = 1 << 2;
const HAS_TASK: u8 = 1 << 3;
const HAS_NEED_TASK_IDS: u8 = 1 << 4;
const HAS_MSG: u8 = 1 << 5;

impl Encode for Control {
    const KIND: Kind = Kind::Control;

    fn body_len(&self) -> usize {
        str_len(self.command.as_str())
            + 1
            + self.id.as_ref().map(|id| str_len(id)).unwrap_or(0)
    }

    fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_str(w, self.command.as_str())?;
        match &self.id {
            Some(id) => {
                w.write_u8(HAS_ID)?;
                write_str(w, id)
            }
            None => w.write_u8(0),
        }
    }
}

impl<'a> Decode<'a> for Control {
    const KIND: Kind = Kind::Control;

    fn read_body(r: &mut &'a [u8]) -> Result<Control, Error> {
        let command = read_command(r)?;
        let id = if read_u8(r)? & HAS_ID != 0 {
            Some(read_string(r)?)
        } else {
            None
        };
        Ok(Control { command, id })
    }
}

/// An emission with its content slots already rendered as bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct EmissionFrame<'a> {
    pub emission: Cow<'a, Emission>,
    pub contents: Vec<&'a [u8]>,
}

impl<'a> EmissionFrame<'a> {
    fn presence(&self) -> u8 {
        let e = &self.emission;
        let mut flags = 0;
        if !e.id.is_empty() {
            flags |= HAS_ID;
        }
        if !e.anchors.is_empty() {
            flags |= HAS_ANCHORS;
        }
        if !e.stream.is_empty() {
            flags |= HAS_STREAM;
        }
        if e.task != 0 {
            flags |= HAS_TASK;
        }
        if !e.need_task_ids {
            flags |= HAS_NEED_TASK_IDS;
        }
        if !e.msg.is_empty() {
            flags |= HAS_MSG;
        }
        flags
    }
}

impl<'a> Encode for EmissionFrame<'a> {
    const KIND: Kind = Kind::Emission;

    fn body_len(&self) -> usize {
        let e = &self.emission;
        let flags = self.presence();
        let mut len = str_len(e.command.as_str()) + 1;
        if flags & HAS_ID != 0 {
            len += str_len(&e.id);
        }
        if flags & HAS_ANCHORS != 0 {
            len += uvarint_len(e.anchors.len() as u64);
            len += e.anchors.iter().map(|a| str_len(a)).sum::<usize>();
        }
        if flags & HAS_STREAM != 0 {
            len += str_len(&e.stream);
        }
        if flags & HAS_TASK != 0 {
            len += 4;
        }
        if flags & HAS_NEED_TASK_IDS != 0 {
            len += 1;
        }
        if flags & HAS_MSG != 0 {
            len += str_len(&e.msg);
        }
        len + uvarint_len(self.contents.len() as u64)
            + self.contents.iter().map(|c| blob_len(c)).sum::<usize>()
    }

    fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let e = &self.emission;
        let flags = self.presence();
        write_str(w, e.command.as_str())?;
        w.write_u8(flags)?;
        if flags & HAS_ID != 0 {
            write_str(w, &e.id)?;
        }
        if flags & HAS_ANCHORS != 0 {
            write_uvarint(w, e.anchors.len() as u64)?;
            for anchor in &e.anchors {
                write_str(w, anchor)?;
            }
        }
        if flags & HAS_STREAM != 0 {
            write_str(w, &e.stream)?;
        }
        if flags & HAS_TASK != 0 {
            w.write_i32::<BigEndian>(e.task)?;
        }
        if flags & HAS_NEED_TASK_IDS != 0 {
            w.write_u8(e.need_task_ids as u8)?;
        }
        if flags & HAS_MSG != 0 {
            write_str(w, &e.msg)?;
        }
        write_uvarint(w, self.contents.len() as u64)?;
        for content in &self.contents {
            write_blob(w, content)?;
        }
        Ok(())
    }
}

impl<'a> Decode<'a> for EmissionFrame<'a> {
    const KIND: Kind = Kind::Emission;

    fn read_body(r: &mut &'a [u8]) -> Result<EmissionFrame<'a>, Error> {
        let mut e = Emission::new(read_command(r)?);
        let flags = read_u8(r)?;
        if flags & HAS_ID != 0 {
            e.id = read_string(r)?;
        }
        if flags & HAS_ANCHORS != 0 {
            for _ in 0..read_len(r)? {
                e.anchors.push(read_string(r)?);
            }
        }
        if flags & HAS_STREAM != 0 {
            e.stream = read_string(r)?;
        }
        if flags & HAS_TASK != 0 {
            e.task = read_i32(r)?;
        }
        if flags & HAS_NEED_TASK_IDS != 0 {
            e.need_task_ids = read_u8(r)? != 0;
        }
        if flags & HAS_MSG != 0 {
            e.msg = read_string(r)?;
        }
        let count = read_len(r)?;
        let mut contents = Vec::with_capacity(count.min(r.len()));
        for _ in 0..count {
            contents.push(read_blob(r)?);
        }
        Ok(EmissionFrame {
            emission: Cow::Owned(e),
            contents,
        })
    }
}

impl Encode for TaskIds {
    const KIND: Kind = Kind::TaskIds;

    fn body_len(&self) -> usize {
        uvarint_len(self.0.len() as u64) + 4 * self.0.len()
    }

    fn write_body<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_uvarint(w, self.0.len() as u64)?;
        for task in &self.0 {
            w.write_i32::<BigEndian>(*task)?;
        }
        Ok(())
    }
}

impl<'a> Decode<'a> for TaskIds {
    const KIND: Kind = Kind::TaskIds;

    fn read_body(r: &mut &'a [u8]) -> Result<TaskIds, Error> {
        let count = read_len(r)?;
        let mut tasks = Vec::with_capacity(count.min(r.len() / 4));
        for _ in 0..count {
            tasks.push(read_i32(r)?);
        }
        Ok(TaskIds(tasks))
    }
}

enum Frame {
    Pooled(Buffer),
    Buffered(bytes::Bytes),
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        match self {
            Frame::Pooled(buffer) => &buffer[..],
            Frame::Buffered(bytes) => &bytes[..],
        }
    }
}

pub struct BinaryInput<R: Read> {
    reader: BufReader<R>,
    pool: Box<dyn BufferPool>,
    pending: TupleBuffer,
    log: Logger,
}

impl<R: Read> BinaryInput<R> {
    pub fn new(
        reader: R,
        pool: Box<dyn BufferPool>,
        log: &Logger,
    ) -> BinaryInput<R> {
        BinaryInput {
            reader: BufReader::new(reader),
            pool,
            pending: TupleBuffer::new(),
            log: log.clone(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        if let Some(bytes) = self.pending.pop() {
            debug!(self.log, "replaying buffered frame";
                "pending" => self.pending.len());
            return Ok(Some(Frame::Buffered(bytes)));
        }
        let frame = read_frame(&mut self.reader, &mut *self.pool)?;
        Ok(frame.map(Frame::Pooled))
    }

    fn release(&mut self, frame: Frame) {
        if let Frame::Pooled(buffer) = frame {
            self.pool.dispose(buffer);
        }
    }

    /// Decode the next frame with `f`, returning pooled storage afterwards.
    fn with_next<T, F>(&mut self, f: F) -> Result<Option<T>, Error>
    where
        F: FnOnce(&[u8]) -> Result<T, Error>,
    {
        let frame = match self.next_frame()? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let result = f(frame.as_ref());
        self.release(frame);
        result.map(Some)
    }
}

impl<R: Read> Input for BinaryInput<R> {
    fn read_context(&mut self) -> Result<Option<Context>, Error> {
        self.with_next(|payload| decode::<Context>(payload))
    }

    fn read_control(&mut self) -> Result<Option<Control>, Error> {
        self.with_next(|payload| decode::<Control>(payload))
    }

    fn read_tuple(
        &mut self,
        slots: &mut [&mut dyn ContentMut],
    ) -> Result<Option<TupleMetadata>, Error> {
        self.with_next(|payload| {
            let tuple = decode::<TupleFrame>(payload)?;
            if check_slots(&tuple.meta, tuple.contents.len(), slots.len())? {
                for (slot, content) in slots.iter_mut().zip(&tuple.contents) {
                    slot.set_bytes(content)?;
                }
            }
            Ok(tuple.meta)
        })
    }

    fn read_task_ids(&mut self) -> Result<TaskIds, Error> {
        loop {
            let buffer = match read_frame(&mut self.reader, &mut *self.pool)? {
                Some(buffer) => buffer,
                None => {
                    let msg = "stream ended while awaiting task ids";
                    return Err(Error::Framing(String::from(msg)));
                }
            };
            if Kind::of(&buffer) == Some(Kind::TaskIds) {
                let result = decode::<TaskIds>(&buffer);
                self.pool.dispose(buffer);
                return result;
            }
            // The pooled buffer is reused by the next read, so the frame is
            // copied out before it is queued.
            let bytes = bytes::Bytes::copy_from_slice(&buffer);
            self.pool.dispose(buffer);
            self.pending.push(bytes);
            debug!(self.log, "buffered frame received ahead of task ids";
                "pending" => self.pending.len());
        }
    }

    fn close(&mut self) {
        self.pool.close();
    }
}

pub struct BinaryOutput<W: Write> {
    writer: BufWriter<W>,
    pool: Box<dyn BufferPool>,
}

impl<W: Write> BinaryOutput<W> {
    pub fn new(writer: W, pool: Box<dyn BufferPool>) -> BinaryOutput<W> {
        BinaryOutput {
            writer: BufWriter::new(writer),
            pool,
        }
    }
}

impl<W: Write> Output for BinaryOutput<W> {
    fn send_pid(&mut self, pid: Pid) -> Result<(), Error> {
        write_frame(&mut self.writer, &mut *self.pool, &pid)
    }

    fn send_emission(
        &mut self,
        emission: &Emission,
        contents: &[&dyn Content],
    ) -> Result<(), Error> {
        let rendered = contents
            .iter()
            .map(|c| c.to_bytes())
            .collect::<Result<Vec<Vec<u8>>, Error>>()?;
        let frame = EmissionFrame {
            emission: Cow::Borrowed(emission),
            contents: rendered.iter().map(Vec::as_slice).collect(),
        };
        write_frame(&mut self.writer, &mut *self.pool, &frame)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().map_err(Error::from)
    }

    fn close(&mut self) {
        self.pool.close();
    }
}
