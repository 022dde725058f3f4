//! Wire framing between the orchestrator and the compositor worker.
//!
//! Requests are newline-terminated JSON envelopes. Responses are
//! length-prefixed binary frames:
//!
//! ```text
//! remotion_buffer:<nonce>:<length>:<status>:<length bytes of payload>
//! ```
//!
//! `status` is `0` for success and `1` for failure, in which case the payload
//! is a JSON [`ErrorPayload`]. Anything the worker prints to stdout outside of
//! a frame is reported as [`DecodeEvent::Chatter`].

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;

use super::error::{CompositorError, CompositorResult};
use super::protocol::{ErrorPayload, RequestEnvelope};

/// Marker that opens every response frame.
pub const FRAME_MAGIC: &[u8] = b"remotion_buffer:";

/// Upper bound on `<nonce>:<length>:<status>:` before a header is rejected.
pub const MAX_HEADER_LEN: usize = 256;

/// Line that asks the worker to finish outstanding work and exit.
pub const SHUTDOWN_LINE: &[u8] = b"EOF\n";

/// Encode a request envelope as one newline-terminated line.
pub fn encode<P: Serialize>(nonce: &str, payload: &P) -> CompositorResult<Vec<u8>> {
    let mut line = serde_json::to_vec(&RequestEnvelope { nonce, payload })
        .map_err(|e| CompositorError::protocol(format!("failed to serialize command: {e}")))?;
    line.push(b'\n');
    Ok(line)
}

/// Encode a response frame. The worker side of the protocol, used by tests
/// and stand-in workers.
pub fn encode_frame(nonce: &str, status: FrameStatus, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_MAGIC.len() + nonce.len() + 16 + payload.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(
        format!("{}:{}:{}:", nonce, payload.len(), status.code()).as_bytes(),
    );
    out.extend_from_slice(payload);
    out
}

/// Outcome flag of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Success,
    Failure,
}

impl FrameStatus {
    fn code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }

    fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"0" => Some(Self::Success),
            b"1" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// One complete response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub nonce: String,
    pub status: FrameStatus,
    pub payload: Bytes,
}

/// Payload of a frame, split by outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Success(Bytes),
    Failure {
        message: String,
        backtrace: Option<String>,
    },
}

impl Frame {
    /// Interpret the payload according to the frame status.
    ///
    /// A failure frame must carry a non-empty diagnostic. A JSON
    /// [`ErrorPayload`] is unpacked; any other text is taken verbatim.
    pub fn into_message(self) -> CompositorResult<DecodedMessage> {
        match self.status {
            FrameStatus::Success => Ok(DecodedMessage::Success(self.payload)),
            FrameStatus::Failure => {
                if self.payload.is_empty() {
                    return Err(CompositorError::protocol(format!(
                        "failure frame for {} carried no diagnostic",
                        self.nonce
                    )));
                }
                match serde_json::from_slice::<ErrorPayload>(&self.payload) {
                    Ok(err) => Ok(DecodedMessage::Failure {
                        message: err.error,
                        backtrace: Some(err.backtrace).filter(|b| !b.is_empty()),
                    }),
                    Err(_) => Ok(DecodedMessage::Failure {
                        message: String::from_utf8_lossy(&self.payload).into_owned(),
                        backtrace: None,
                    }),
                }
            }
        }
    }
}

/// Something pulled off the worker's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    /// A complete response frame.
    Frame(Frame),
    /// Bytes printed outside any frame.
    Chatter(String),
    /// A frame header that could not be parsed. `nonce` is set when the
    /// header got far enough to name its caller.
    Malformed {
        nonce: Option<String>,
        reason: String,
    },
}

/// Incremental decoder over a byte pipe.
///
/// Reads may deliver partial frames or several frames at once; feed every
/// chunk to [`FrameDecoder::extend`] and drain with [`FrameDecoder::next_event`]
/// until it returns `None`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not yet turned into events.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_event(&mut self) -> Option<DecodeEvent> {
        if self.buf.is_empty() {
            return None;
        }

        match find(&self.buf, FRAME_MAGIC) {
            Some(0) => self.decode_frame(),
            Some(start) => Some(self.chatter(start)),
            None => {
                // Hold back a tail that may be the start of a split marker.
                let keep = partial_magic_suffix(&self.buf);
                let emit = self.buf.len() - keep;
                if emit == 0 {
                    None
                } else {
                    Some(self.chatter(emit))
                }
            }
        }
    }

    fn chatter(&mut self, len: usize) -> DecodeEvent {
        let text = self.buf.split_to(len);
        DecodeEvent::Chatter(String::from_utf8_lossy(&text).into_owned())
    }

    fn decode_frame(&mut self) -> Option<DecodeEvent> {
        let header_area = &self.buf[FRAME_MAGIC.len()..];
        let scan = &header_area[..header_area.len().min(MAX_HEADER_LEN)];

        let mut colons = scan
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == b':')
            .map(|(i, _)| i);
        let (first, second, third) = match (colons.next(), colons.next(), colons.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ if header_area.len() >= MAX_HEADER_LEN => {
                return Some(self.reject(None, "frame header exceeds maximum length"));
            }
            _ => return None,
        };

        let nonce = match std::str::from_utf8(&scan[..first]) {
            Ok(n) if !n.is_empty() => n.to_string(),
            _ => return Some(self.reject(None, "frame header has an empty or invalid nonce")),
        };

        let length = match std::str::from_utf8(&scan[first + 1..second])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            Some(length) => length,
            None => return Some(self.reject(Some(nonce), "frame header has an invalid length")),
        };

        let status = match FrameStatus::parse(&scan[second + 1..third]) {
            Some(status) => status,
            None => return Some(self.reject(Some(nonce), "frame header has an unknown status")),
        };

        let header_len = FRAME_MAGIC.len() + third + 1;
        if self.buf.len() < header_len + length {
            return None;
        }

        self.buf.advance(header_len);
        let payload = self.buf.split_to(length).freeze();
        Some(DecodeEvent::Frame(Frame {
            nonce,
            status,
            payload,
        }))
    }

    /// Skip past the marker of a bad header so decoding can resynchronise.
    fn reject(&mut self, nonce: Option<String>, reason: &str) -> DecodeEvent {
        self.buf.advance(FRAME_MAGIC.len());
        DecodeEvent::Malformed {
            nonce,
            reason: reason.to_string(),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of the marker.
fn partial_magic_suffix(buf: &[u8]) -> usize {
    (1..FRAME_MAGIC.len())
        .rev()
        .find(|&n| n <= buf.len() && buf.ends_with(&FRAME_MAGIC[..n]))
        .unwrap_or(0)
}
