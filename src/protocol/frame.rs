//! Frame encoding and decoding for the stream protocol.
//!
//! The wire format uses a marker-prefixed framing protocol:
//! ```text
//! ┌──────┬──────┬──────────────┬─────────────────┐
//! │ 0x94 │ 0xc3 │  size (BE)   │    payload      │
//! │  1   │  1   │   2 bytes    │  size bytes     │
//! └──────┴──────┴──────────────┴─────────────────┘
//! ```
//!
//! The decoder never assumes alignment. It scans for the marker one byte at a
//! time, so any garbage between frames (on serial links this is the device's
//! debug console) is skipped and handed back as [`Decoded::Noise`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// First marker byte.
pub const START1: u8 = 0x94;

/// Second marker byte.
pub const START2: u8 = 0xc3;

/// Default 16-bit frame marker.
pub const DEFAULT_MARKER: u16 = u16::from_be_bytes([START1, START2]);

/// Marker plus 2-byte length.
pub const HEADER_LEN: usize = 4;

/// Maximum frame payload size, shared by every transport.
pub const MAX_PAYLOAD_SIZE: usize = 512;

/// Encodes a payload into a framed message using the default marker.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    encode_with_marker(DEFAULT_MARKER, payload)
}

/// Encodes a payload into a framed message using a custom marker.
pub fn encode_with_marker(marker: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u16(marker);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Output of the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame payload.
    Frame(Bytes),
    /// Bytes skipped while looking for a marker.
    Noise(Bytes),
}

/// Scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SeekingMarker,
    ReadingLength,
    ReadingPayload { len: usize },
}

/// Frame decoder that handles partial data and resynchronizes after corruption.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    marker: [u8; 2],
    corrupted: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a new frame decoder using the default marker.
    #[must_use]
    pub fn new() -> Self {
        Self::with_marker(DEFAULT_MARKER)
    }

    /// Creates a decoder for a custom marker.
    #[must_use]
    pub fn with_marker(marker: u16) -> Self {
        Self {
            buffer: BytesMut::with_capacity(HEADER_LEN + MAX_PAYLOAD_SIZE),
            state: State::SeekingMarker,
            marker: marker.to_be_bytes(),
            corrupted: 0,
        }
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Feeds data and drains everything that can be decoded from it.
    pub fn push(&mut self, data: &[u8]) -> Vec<Decoded> {
        self.feed(data);
        let mut out = Vec::new();
        while let Some(item) = self.decode() {
            out.push(item);
        }
        out
    }

    /// Attempts to decode the next item.
    ///
    /// Returns `None` when more data is needed. Corrupt length fields are
    /// recovered from internally and never reported as errors.
    pub fn decode(&mut self) -> Option<Decoded> {
        loop {
            match self.state {
                State::SeekingMarker => {
                    let skip = self.noise_prefix_len();
                    if skip > 0 {
                        return Some(Decoded::Noise(self.buffer.split_to(skip).freeze()));
                    }
                    if self.buffer.len() < 2 {
                        return None;
                    }
                    self.buffer.advance(2);
                    self.state = State::ReadingLength;
                }
                State::ReadingLength => {
                    if self.buffer.len() < 2 {
                        return None;
                    }
                    let len = usize::from(u16::from_be_bytes([self.buffer[0], self.buffer[1]]));
                    if len > MAX_PAYLOAD_SIZE {
                        // The marker is already gone; rescan from the first length byte.
                        self.corrupted += 1;
                        tracing::debug!(
                            "{}",
                            FrameError::TooLarge {
                                size: len,
                                max: MAX_PAYLOAD_SIZE,
                            }
                        );
                        self.state = State::SeekingMarker;
                        continue;
                    }
                    self.buffer.advance(2);
                    self.state = State::ReadingPayload { len };
                }
                State::ReadingPayload { len } => {
                    if self.buffer.len() < len {
                        return None;
                    }
                    self.state = State::SeekingMarker;
                    return Some(Decoded::Frame(self.buffer.split_to(len).freeze()));
                }
            }
        }
    }

    /// Number of leading bytes that cannot start a marker.
    fn noise_prefix_len(&self) -> usize {
        let [m0, m1] = self.marker;
        let buf = &self.buffer[..];
        let mut i = 0;
        while i < buf.len() {
            if buf[i] == m0 && (i + 1 == buf.len() || buf[i + 1] == m1) {
                break;
            }
            i += 1;
        }
        i
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of frames rejected for an oversized length.
    #[must_use]
    pub const fn corrupted_frames(&self) -> u64 {
        self.corrupted
    }

    /// Returns true while a frame header or payload is partially received.
    #[must_use]
    pub fn in_frame(&self) -> bool {
        self.state != State::SeekingMarker
    }

    /// Clears the internal buffer and restarts scanning.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::SeekingMarker;
    }
}
