//! Newline-delimited JSON framing over async byte streams.
//!
//! One message per line, no batching. Writers flush after every frame.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum size of a single inbound line (1MB).
/// Sized for large tool outputs (message dumps, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Serialize `message` as one JSON line, write it, and flush.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON line and deserialize it.
///
/// Returns `Ok(None)` when the stream is at end of input. Blank lines are
/// skipped.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }

        if line.len() > MAX_OUTPUT_SIZE {
            return Err(Error::OutputTooLarge {
                size: line.len(),
                max: MAX_OUTPUT_SIZE,
            });
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = serde_json::from_str(trimmed)
            .map_err(|e| Error::InvalidResponse(format!("malformed JSON line: {e}")))?;
        return Ok(Some(message));
    }
}
