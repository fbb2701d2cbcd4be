use std::cmp;

use actix_web::{
    error::PayloadError,
    web::{Bytes, BytesMut},
};
use futures_core::stream::{LocalBoxStream, Stream};
use futures_util::StreamExt as _;

use crate::error::UploadError;

/// Payload buffer.
///
/// Pulls from the request body stream on demand and never accepts more than the declared content
/// length; anything the stream yields past that length is discarded.
pub(crate) struct PayloadBuffer {
    stream: LocalBoxStream<'static, Result<Bytes, PayloadError>>,
    pub(crate) buf: BytesMut,
    /// EOF flag. If true, no more payload reads will be attempted.
    pub(crate) eof: bool,
    /// Bytes still allowed to enter the buffer, if a content length was declared.
    remaining: Option<u64>,
}

impl PayloadBuffer {
    /// Constructs new payload buffer.
    pub(crate) fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
    {
        PayloadBuffer {
            stream: Box::pin(stream),
            buf: BytesMut::with_capacity(1_024), // pre-allocate 1KiB
            eof: false,
            remaining: None,
        }
    }

    /// Limits the number of bytes taken from the stream.
    pub(crate) fn set_content_length(&mut self, content_length: Option<u64>) {
        self.remaining = content_length;
        self.eof = content_length == Some(0);
    }

    /// Waits for the next item of the stream and appends it to the buffer.
    ///
    /// Returns `false` once the stream (or the declared length) is exhausted.
    pub(crate) async fn fill(&mut self) -> Result<bool, UploadError> {
        if self.eof {
            return Ok(false);
        }

        match self.stream.next().await {
            Some(Ok(mut data)) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    let len = cmp::min(data.len() as u64, *remaining) as usize;
                    if len < data.len() {
                        log::debug!("discarding {} bytes past content length", data.len() - len);
                        data.truncate(len);
                    }
                    *remaining -= len as u64;
                    if *remaining == 0 {
                        self.eof = true;
                    }
                }
                self.buf.extend_from_slice(&data);
                Ok(true)
            }
            Some(Err(err)) => Err(err.into()),
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    /// Reads until specified ending.
    ///
    /// Returns:
    ///
    /// - `Ok(Some(chunk))` - `needle` is found, with chunk ending after needle
    /// - `Err(Incomplete)` - `needle` is not found and we're at EOF
    /// - `Ok(None)` - `needle` is not found otherwise
    pub(crate) fn read_until(&mut self, needle: &[u8]) -> Result<Option<Bytes>, UploadError> {
        match memchr::memmem::find(&self.buf, needle) {
            // buffer exhausted and EOF without finding needle
            None if self.eof => Err(UploadError::Incomplete),

            // needle not yet found
            None => Ok(None),

            // needle found, split chunk out of buf
            Some(idx) => Ok(Some(self.buf.split_to(idx + needle.len()).freeze())),
        }
    }

    /// Reads bytes until new line delimiter (`\n`, `0x0A`).
    #[inline]
    pub(crate) fn readline(&mut self) -> Result<Option<Bytes>, UploadError> {
        self.read_until(b"\n")
    }

    /// Keeps filling the buffer until `read` yields a value.
    pub(crate) async fn read_with<T>(
        &mut self,
        mut read: impl FnMut(&mut Self) -> Result<Option<T>, UploadError>,
    ) -> Result<T, UploadError> {
        loop {
            if let Some(item) = read(self)? {
                return Ok(item);
            }

            if !self.fill().await? {
                // one last attempt so that readers can see the EOF flag
                return read(self)?.ok_or(UploadError::Incomplete);
            }
        }
    }

    /// Discards everything left in the request body.
    pub(crate) async fn drain(&mut self) -> Result<(), UploadError> {
        self.buf.clear();
        while self.fill().await? {
            self.buf.clear();
        }
        Ok(())
    }
}
