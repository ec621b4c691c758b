//! netascii translation (RFC 764 line endings)
//!
//! On the wire a line ends in CR LF and a bare carriage return is sent as
//! CR NUL. Locally lines end in LF.

use bytes::{BufMut, BytesMut};
use ::netascii::{Bytes, Netascii};

/// Translate local bytes to their wire form, appending to `out`
pub fn encode(input: &[u8], out: &mut BytesMut) {
    out.reserve(input.len());
    out.extend(Netascii::from_bytes(input.iter().copied()));
}

/// Wire to local translation.
///
/// A CR at the end of one DATA block pairs with the first byte of the next,
/// so the decoder keeps it pending between calls.
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, input: &[u8], out: &mut BytesMut) {
        if input.is_empty() {
            return;
        }
        let (body, trailing_cr) = match input.split_last() {
            Some((b'\r', rest)) => (rest, true),
            _ => (input, false),
        };
        let held = self.pending_cr.then_some(b'\r');
        self.pending_cr = trailing_cr;

        out.reserve(input.len());
        for byte in Bytes::from_netascii(held.into_iter().chain(body.iter().copied())) {
            // Stray CR; keep it.
            out.put_u8(byte.unwrap_or(b'\r'));
        }
    }

    /// Flush a CR left dangling by the last block
    pub fn finish(&mut self, out: &mut BytesMut) {
        if self.pending_cr {
            self.pending_cr = false;
            out.put_u8(b'\r');
        }
    }
}
