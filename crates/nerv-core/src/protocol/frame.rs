//! Length-prefixed wire framing (panic-free).
//!
//! Wire unit: `[u32 big-endian length][length bytes of opaque payload]`.
//!
//! Parsing rules:
//! - Never index past a checked length; read headers through `Buf`.
//! - Never `unwrap()` / `expect()` / `panic!()` in production paths.
//! - Frame content is opaque: this layer only delimits bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NervError, Result};

/// Size of the length header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default ceiling for a single declared frame length (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Prepend the 4-byte big-endian length header to `payload`.
pub fn pack(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len()).map_err(|_| NervError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.put_u32(len);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Stateful reassembler for a byte stream of packed frames.
///
/// Partial headers and partial payloads stay buffered until the next `push`.
#[derive(Debug)]
pub struct Unpacker {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl Default for Unpacker {
    fn default() -> Self {
        Self::new()
    }
}

impl Unpacker {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_bytes,
        }
    }

    /// Feed a chunk; `on_frame` runs once per complete frame, in stream order.
    ///
    /// Returns the number of frames emitted. A declared length above the
    /// ceiling discards everything buffered and returns `FrameTooLarge`: the
    /// stream cannot be resynchronized after that.
    pub fn push<F>(&mut self, chunk: &[u8], mut on_frame: F) -> Result<usize>
    where
        F: FnMut(Bytes),
    {
        self.buf.extend_from_slice(chunk);
        let mut emitted = 0;

        while self.buf.remaining() >= FRAME_HEADER_LEN {
            let mut header = &self.buf[..FRAME_HEADER_LEN];
            let len = header.get_u32() as usize;

            if len > self.max_frame_bytes {
                self.buf.clear();
                return Err(NervError::FrameTooLarge {
                    len,
                    max: self.max_frame_bytes,
                });
            }

            if self.buf.remaining() < FRAME_HEADER_LEN + len {
                break;
            }

            self.buf.advance(FRAME_HEADER_LEN);
            let frame = self.buf.split_to(len).freeze();
            on_frame(frame);
            emitted += 1;
        }

        Ok(emitted)
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame (used when the underlying stream restarts).
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
