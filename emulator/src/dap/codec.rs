//! DAP wire framing
//!
//! A frame is a block of `Header: value\r\n` lines, a blank line, then
//! exactly `Content-Length` bytes of UTF-8 JSON. Only `Content-Length`
//! matters; other headers are skipped.

use std::io::{BufRead, Read, Write};

use thiserror::Error;

use super::protocol::Message;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing or invalid Content-Length header")]
    MissingContentLength,

    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read one frame. `Ok(None)` means the peer closed the stream at a
/// frame boundary.
pub fn read_message(reader: &mut impl BufRead) -> Result<Option<Message>, CodecError> {
    let mut content_length: Option<usize> = None;
    let mut first = true;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            if first {
                return Ok(None);
            }
            return Err(CodecError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        first = false;

        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim() == "Content-Length" {
                content_length = value.trim().parse().ok();
            }
        }
    }

    let length = content_length
        .filter(|n| *n > 0)
        .ok_or(CodecError::MissingContentLength)?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Write one frame and flush it
pub fn write_message(writer: &mut impl Write, message: &Message) -> Result<(), CodecError> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}
