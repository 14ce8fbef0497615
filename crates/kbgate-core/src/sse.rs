use futures::StreamExt;
use serde::Deserialize;

use crate::{ByteStream, CoreError};

pub const DATA_PREFIX: &str = "data:";

#[derive(Debug, Deserialize)]
struct UpstreamEvent {
    #[serde(default)]
    data: String,
}

/// Decodes one upstream line. Returns `None` for anything that is not a
/// `data:` line carrying a JSON object; such lines are heartbeats or noise.
pub fn decode_line(line: &str) -> Option<String> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    serde_json::from_str::<UpstreamEvent>(payload).ok().map(|event| event.data)
}

/// Splits an upstream body into lines and yields decoded fragments in order.
pub struct FragmentReader {
    body: ByteStream,
    buffer: Vec<u8>,
    finished: bool,
}

impl FragmentReader {
    pub fn new(body: ByteStream) -> Self {
        Self { body, buffer: Vec::new(), finished: false }
    }

    pub async fn next_line(&mut self) -> Option<Result<String, CoreError>> {
        loop {
            if let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let line = self.buffer.drain(..=position).collect::<Vec<_>>();
                return Some(Ok(line_to_string(&line)));
            }

            if self.finished {
                if self.buffer.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut self.buffer);
                return Some(Ok(line_to_string(&line)));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(error)) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Some(Err(error));
                }
                None => self.finished = true,
            }
        }
    }

    /// Next decoded fragment, skipping non-data lines. Empty fragments are
    /// passed through; callers decide whether they matter.
    pub async fn next_fragment(&mut self) -> Option<Result<String, CoreError>> {
        while let Some(line) = self.next_line().await {
            match line {
                Ok(line) => {
                    if let Some(fragment) = decode_line(&line) {
                        return Some(Ok(fragment));
                    }
                }
                Err(error) => return Some(Err(error)),
            }
        }
        None
    }
}

fn line_to_string(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
