// Copyright 2020 Joyent, Inc.

//! Unsigned LEB128 variable-length integers.

use std::io::{self, ErrorKind, Read, Write};

/// A u64 never needs more than ten 7-bit groups.
pub const MAX_VARINT_LEN: usize = 10;

pub fn uvarint_len(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

pub fn write_uvarint<W: Write>(w: &mut W, mut x: u64) -> io::Result<usize> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut n = 0;
    while x >= 0x80 {
        buf[n] = (x as u8) | 0x80;
        x >>= 7;
        n += 1;
    }
    buf[n] = x as u8;
    n += 1;
    w.write_all(&buf[..n])?;
    Ok(n)
}

/// Read a varint, returning `None` if the reader is exhausted before the
/// first byte. Running out of bytes part way through is `UnexpectedEof`.
pub fn read_uvarint<R: Read>(r: &mut R) -> io::Result<Option<u64>> {
    let mut x: u64 = 0;
    let mut shift = 0;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        loop {
            match r.read(&mut byte) {
                Ok(0) if i == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "stream ended inside a varint",
                    ))
                }
                Ok(_) => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let b = byte[0];
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                break;
            }
            return Ok(Some(x | (u64::from(b) << shift)));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(io::Error::new(ErrorKind::InvalidData, "varint overflows a u64"))
}
