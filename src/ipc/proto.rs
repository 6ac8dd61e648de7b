//! Lock daemon wire protocol (framed).
//!
//! Frame layout: a 32-bit big-endian request id, a 32-bit big-endian
//! argument count, then each argument as a 16-bit big-endian byte length
//! followed by that many bytes of UTF-8. A request's first argument is the
//! command; a response echoes the request id with a command-specific
//! argument list. Responses are correlated by request id, not by order.

use std::io::{self, Read, Write};

use super::IpcError;

pub const CMD_CONTEXT: &str = "CONTEXT";
pub const CMD_ACQUIRE: &str = "ACQUIRE";
pub const CMD_CLOSE: &str = "CLOSE";
pub const CMD_STOP: &str = "STOP";

/// Upper bound on arguments per frame. Large enough for any sane key set;
/// frames beyond it are treated as protocol corruption.
pub const MAX_FRAME_ARGS: u32 = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub request_id: u32,
    pub args: Vec<String>,
}

impl Frame {
    pub fn new(request_id: u32, args: Vec<String>) -> Self {
        Self { request_id, args }
    }
}

/// Reads one frame. Returns `Ok(None)` on clean end-of-stream at a frame
/// boundary; mid-frame EOF is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, IpcError> {
    let mut header = [0u8; 8];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader.read(&mut header[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame header truncated",
            )));
        }
        read += n;
    }

    let request_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let count = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if count > MAX_FRAME_ARGS {
        return Err(IpcError::protocol(format!(
            "argument count {count} exceeds limit {MAX_FRAME_ARGS}"
        )));
    }

    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        let len = u16::from_be_bytes(len) as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        let arg = String::from_utf8(bytes)
            .map_err(|_| IpcError::protocol("frame argument is not valid UTF-8"))?;
        args.push(arg);
    }

    Ok(Some(Frame { request_id, args }))
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write>(
    writer: &mut W,
    request_id: u32,
    args: &[&str],
) -> Result<(), IpcError> {
    if args.len() as u32 > MAX_FRAME_ARGS {
        return Err(IpcError::protocol(format!(
            "argument count {} exceeds limit {MAX_FRAME_ARGS}",
            args.len()
        )));
    }

    let mut buf = Vec::with_capacity(8 + args.iter().map(|a| 2 + a.len()).sum::<usize>());
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(args.len() as u32).to_be_bytes());
    for arg in args {
        let len = u16::try_from(arg.len()).map_err(|_| {
            IpcError::protocol(format!("argument of {} bytes exceeds frame limit", arg.len()))
        })?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(arg.as_bytes());
    }

    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// One length-prefixed UTF-8 string, used by the spawn handshake.
pub fn read_string<R: Read>(reader: &mut R) -> Result<String, IpcError> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    let len = u16::from_be_bytes(len) as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| IpcError::protocol("handshake string is not valid UTF-8"))
}

pub fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), IpcError> {
    let len = u16::try_from(value.len())
        .map_err(|_| IpcError::protocol("handshake string too long"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(value.as_bytes())?;
    writer.flush()?;
    Ok(())
}
