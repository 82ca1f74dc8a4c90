//! WebSocket frame codec (RFC 6455 §5, the subset the inspector speaks).
//!
//! Outbound frames are single, unfragmented, masked text frames. Inbound
//! frames are decoded strictly left to right from the receive buffer; a frame
//! is only removed once it is fully buffered.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// The two-byte close frame, both echoed and sent on close.
pub const CLOSE_FRAME: [u8; 2] = [0x88, 0x00];

/// Mask key used by [`FixedMask`]: byte `i` is XORed with `1 << (i % 4)`.
pub const FIXED_MASK_KEY: [u8; 4] = [0x01, 0x02, 0x04, 0x08];

/// Largest payload either direction accepts.
pub const MAX_PAYLOAD: u64 = u32::MAX as u64;

const FIN: u8 = 0x80;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Codec error. Every variant is fatal for the transport.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Frame payload of {0} bytes exceeds 4 GiB")]
    TooLarge(u64),
    #[error("Fragmented frames are not supported")]
    Fragmented,
    #[error("Unsupported frame opcode {0:#x}")]
    UnsupportedOpcode(u8),
}

/// A decoded frame, or a frame to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One complete message.
    Text(String),
    /// Close request.
    Close,
}

/// Source of client-to-server mask keys.
pub trait MaskSource: Send {
    /// Key for the next outbound frame.
    fn next_key(&mut self) -> [u8; 4];
}

/// Always yields [`FIXED_MASK_KEY`].
///
/// The inspector does not check mask randomness. This is a deviation from
/// RFC 6455 §10.3 and is kept behind [`MaskSource`] so a stricter peer can be
/// served with a random source.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedMask;

impl MaskSource for FixedMask {
    fn next_key(&mut self) -> [u8; 4] {
        FIXED_MASK_KEY
    }
}

/// XOR `buf` with `key`, cycling every four bytes.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Frame encoder/decoder.
pub struct FrameCodec {
    mask: Box<dyn MaskSource>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec").finish_non_exhaustive()
    }
}

impl FrameCodec {
    /// Codec masking with [`FixedMask`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_mask(FixedMask)
    }

    /// Codec masking with a custom key source.
    #[must_use]
    pub fn with_mask(mask: impl MaskSource + 'static) -> Self {
        Self {
            mask: Box::new(mask),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_text(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = payload.len();
        let len64 = u64::try_from(len).map_err(|_| FrameError::TooLarge(u64::MAX))?;
        if len64 > MAX_PAYLOAD {
            return Err(FrameError::TooLarge(len64));
        }

        dst.reserve(14 + len);
        dst.put_u8(FIN | OP_TEXT);
        if len < usize::from(LEN_16) {
            dst.put_u8(MASK_BIT | len as u8);
        } else if len < 65536 {
            dst.put_u8(MASK_BIT | LEN_16);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(MASK_BIT | LEN_64);
            dst.put_u64(len64);
        }

        let key = self.mask.next_key();
        dst.put_slice(&key);
        let body = dst.len();
        dst.put_slice(payload);
        apply_mask(&mut dst[body..], key);
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Text(text) => self.encode_text(text.as_bytes(), dst),
            Frame::Close => {
                dst.extend_from_slice(&CLOSE_FRAME);
                Ok(())
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }
            if src[..2] == CLOSE_FRAME {
                src.advance(2);
                return Ok(Some(Frame::Close));
            }

            let first = src[0];
            let second = src[1];
            let (payload_len, mut offset) = match second & LEN_BITS {
                LEN_16 => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
                }
                LEN_64 => {
                    if src.len() < 10 {
                        return Ok(None);
                    }
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&src[2..10]);
                    (u64::from_be_bytes(raw), 10)
                }
                short => (u64::from(short), 2),
            };
            if payload_len > MAX_PAYLOAD {
                return Err(FrameError::TooLarge(payload_len));
            }
            let payload_len =
                usize::try_from(payload_len).map_err(|_| FrameError::TooLarge(payload_len))?;

            let key = if second & MASK_BIT == 0 {
                None
            } else {
                if src.len() < offset + 4 {
                    return Ok(None);
                }
                let key = [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]];
                offset += 4;
                Some(key)
            };

            let total = offset + payload_len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(offset);
            let mut payload = src.split_to(payload_len);
            if let Some(key) = key {
                apply_mask(&mut payload, key);
            }

            if first & FIN == 0 {
                return Err(FrameError::Fragmented);
            }
            match first & OPCODE_BITS {
                OP_TEXT | OP_BINARY => {
                    let text = std::str::from_utf8(&payload)?;
                    return Ok(Some(Frame::Text(text.to_owned())));
                }
                OP_CLOSE => return Ok(Some(Frame::Close)),
                OP_PING | OP_PONG => {
                    tracing::debug!(opcode = first & OPCODE_BITS, "ignoring control frame");
                }
                other => return Err(FrameError::UnsupportedOpcode(other)),
            }
        }
    }
}
