//! Server-sent events decoding.
//!
//! Splits a byte stream on blank lines and yields the `data:` payload of
//! each event. Events without data (keep-alives, comments) are skipped.

use futures::stream::{self, Stream, StreamExt};
use std::fmt::Display;

use crate::model::ModelError;

/// Decode an SSE body into the data payloads of its events.
pub fn data_events<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, ModelError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (Box::pin(bytes), Vec::<u8>::new(), false),
        |(mut bytes, mut buffer, mut finished)| async move {
            loop {
                if let Some(end) = find_event_end(&buffer) {
                    let event: Vec<u8> = buffer.drain(..end + 2).collect();
                    match event_data(&event[..end]) {
                        Some(data) => return Some((Ok(data), (bytes, buffer, finished))),
                        None => continue,
                    }
                }

                if finished {
                    // Trailing event without a terminating blank line.
                    let rest = std::mem::take(&mut buffer);
                    return event_data(&rest).map(|data| (Ok(data), (bytes, buffer, finished)));
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        finished = true;
                        buffer.clear();
                        return Some((
                            Err(ModelError::Network(format!("stream read error: {e}"))),
                            (bytes, buffer, finished),
                        ));
                    }
                    None => finished = true,
                }
            }
        },
    )
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn event_data(event: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(event);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}
