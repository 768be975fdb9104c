//! Length-prefixed framing for the local stream transport.
//!
//! Wire format: a 4-byte little-endian length followed by that many bytes of
//! UTF-8 JSON envelope. `FrameDecoder` accumulates bytes from the socket and
//! yields complete frames as they become available, so callers can feed it
//! arbitrarily small reads without losing partial frames across calls.

use std::collections::VecDeque;

/// Length prefix width, in bytes.
const LEN_PREFIX: usize = 4;

/// A framing-level failure, distinct from envelope JSON errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The declared frame length exceeds the configured maximum.
    TooLarge { declared: u32, max: u32 },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge { declared, max } => {
                write!(f, "frame of {declared} bytes exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encodes an envelope's JSON bytes into a length-prefixed frame.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental decoder for the length-prefixed local-transport framing.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: VecDeque<u8>,
    max_frame_bytes: u32,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            buf: VecDeque::new(),
            max_frame_bytes,
        }
    }

    /// Whether a partial frame is currently buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Feeds newly-read bytes, returning every complete frame payload they
    /// produce (there may be more than one if several frames arrived in a
    /// single read). Returns an error and stops feeding as soon as a frame
    /// declares a length over the configured maximum.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.buf.extend(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < LEN_PREFIX {
                break;
            }
            let len_bytes: [u8; 4] = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
            let declared = u32::from_le_bytes(len_bytes);
            if declared > self.max_frame_bytes {
                return Err(FrameError::TooLarge {
                    declared,
                    max: self.max_frame_bytes,
                });
            }
            let total = LEN_PREFIX + declared as usize;
            if self.buf.len() < total {
                break;
            }
            self.buf.drain(..LEN_PREFIX);
            let payload: Vec<u8> = self.buf.drain(..declared as usize).collect();
            frames.push(payload);
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let mut dec = FrameDecoder::new(1024);
        let frame = encode_frame(b"hello");
        let frames = dec.feed(&frame).unwrap();
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert!(!dec.has_partial());
    }

    #[test]
    fn reassembles_a_frame_delivered_byte_at_a_time() {
        let mut dec = FrameDecoder::new(1024);
        let frame = encode_frame(b"partial");
        let mut out = Vec::new();
        for b in &frame {
            out.extend(dec.feed(&[*b]).unwrap());
        }
        assert_eq!(out, vec![b"partial".to_vec()]);
    }

    #[test]
    fn decodes_multiple_frames_from_one_read() {
        let mut dec = FrameDecoder::new(1024);
        let mut combined = encode_frame(b"one");
        combined.extend(encode_frame(b"two"));
        let frames = dec.feed(&combined).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn zero_length_frame_is_legal() {
        let mut dec = FrameDecoder::new(1024);
        let frames = dec.feed(&encode_frame(b"")).unwrap();
        assert_eq!(frames, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut dec = FrameDecoder::new(4);
        let frame = encode_frame(b"too long");
        let err = dec.feed(&frame).unwrap_err();
        assert_eq!(
            err,
            FrameError::TooLarge {
                declared: 8,
                max: 4
            }
        );
    }

    #[test]
    fn exact_max_size_frame_is_accepted() {
        let mut dec = FrameDecoder::new(4);
        let frames = dec.feed(&encode_frame(b"1234")).unwrap();
        assert_eq!(frames, vec![b"1234".to_vec()]);
    }
}
