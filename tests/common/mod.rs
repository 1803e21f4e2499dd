// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{self, Cursor, Read, Write};
use std::rc::Rc;
use std::sync::Mutex;

use serde_json::Value;
use slog::{o, Drain, Level, LevelFilter, Logger};

use storm_multilang::binary::{encode_frame, read_frame, Encode};
use storm_multilang::pool::HeapAllocator;

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Debug,
        ))
        .fuse(),
        o!("test" => "storm-multilang"),
    )
}

/// A writer whose contents stay readable after it is handed to a connection.
#[derive(Clone, Default)]
pub struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn new() -> SharedBuf {
        SharedBuf::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reader that hands out at most one byte per call.
pub struct Trickle<R> {
    inner: R,
}

impl<R: Read> Trickle<R> {
    pub fn new(inner: R) -> Trickle<R> {
        Trickle { inner }
    }
}

impl<R: Read> Read for Trickle<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(1);
        self.inner.read(&mut buf[..n])
    }
}

/// Frame each JSON message the way the engine does.
pub fn text_input(messages: &[Value]) -> Cursor<Vec<u8>> {
    let mut out = Vec::new();
    for message in messages {
        out.extend_from_slice(message.to_string().as_bytes());
        out.extend_from_slice(b"\nend\n");
    }
    Cursor::new(out)
}

/// Split text output into its message lines, checking every sentinel.
pub fn text_lines(output: &[u8]) -> Vec<String> {
    let text = String::from_utf8(output.to_vec()).expect("output is utf-8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len() % 2, 0, "unpaired line in {:?}", text);
    lines
        .chunks(2)
        .map(|pair| {
            assert_eq!(pair[1], "end");
            pair[0].to_string()
        })
        .collect()
}

pub fn text_values(output: &[u8]) -> Vec<Value> {
    text_lines(output)
        .iter()
        .map(|line| serde_json::from_str(line).expect("output line is json"))
        .collect()
}

/// Concatenate binary frames into one input stream.
pub fn binary_input(frames: &[Vec<u8>]) -> Cursor<Vec<u8>> {
    Cursor::new(frames.concat())
}

pub fn frame<T: Encode>(msg: &T) -> Vec<u8> {
    encode_frame(msg).expect("frame encodes")
}

/// Split binary output into frame payloads, kind byte included.
pub fn binary_payloads(output: &[u8]) -> Vec<Vec<u8>> {
    let mut reader = Cursor::new(output.to_vec());
    let mut pool = HeapAllocator;
    let mut payloads = Vec::new();
    while let Some(buffer) = read_frame(&mut reader, &mut pool).expect("frame") {
        payloads.push(buffer.to_vec());
    }
    payloads
}
