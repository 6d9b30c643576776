//! Length-prefixed frame codec over any `Read`/`Write` stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Largest payload accepted in either direction (16 MiB).
const MAX_FRAME: u32 = 16 * 1024 * 1024;

fn invalid(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

fn check_len(len: usize) -> io::Result<u32> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_FRAME => Ok(len),
        _ => Err(invalid(format!("frame of {len} bytes exceeds 16 MiB limit"))),
    }
}

/// Serializes `msg` and writes it to `w` as one frame.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let payload = postcard::to_allocvec(msg).map_err(invalid)?;
    let len = check_len(payload.len())?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Reads one frame from `r` and deserializes its payload.
///
/// A stream that ends between frames yields `UnexpectedEof`.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut prefix = [0u8; 4];
    r.read_exact(&mut prefix)?;
    let len = check_len(u32::from_be_bytes(prefix) as usize)?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    postcard::from_bytes(&payload).map_err(invalid)
}
