//! Content-Transfer-Encoding support for part bodies.

use actix_web::web::{Bytes, BytesMut};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Incremental base64 decoder.
///
/// Chunk boundaries rarely line up with 4-character base64 groups, so undecoded characters are
/// carried over to the next chunk.
#[derive(Debug, Default)]
pub(crate) struct Base64Decoder {
    carry: BytesMut,
}

impl Base64Decoder {
    /// Decodes as much of `chunk` as possible.
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> Result<Bytes, base64::DecodeError> {
        self.carry
            .extend(chunk.iter().copied().filter(|b| !b.is_ascii_whitespace()));

        let len = self.carry.len() - self.carry.len() % 4;
        let aligned = self.carry.split_to(len);

        STANDARD.decode(&aligned).map(Bytes::from)
    }

    /// Decodes whatever is left once the part body is complete.
    pub(crate) fn finish(self) -> Result<Bytes, base64::DecodeError> {
        if self.carry.is_empty() {
            return Ok(Bytes::new());
        }

        STANDARD.decode(&self.carry).map(Bytes::from)
    }
}
