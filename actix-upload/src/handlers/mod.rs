//! Pluggable handlers that receive the data of uploaded files.
//!
//! Handlers are arranged in a [`HandlerChain`](crate::HandlerChain). For every file part of a
//! request the chain calls, in order:
//!
//! 1. [`new_file`](UploadHandler::new_file) on every handler;
//! 2. [`receive_data_chunk`](UploadHandler::receive_data_chunk) for each chunk of the file body,
//!    feeding the output of one handler into the next;
//! 3. [`file_complete`](UploadHandler::file_complete) until some handler produces an
//!    [`UploadedFile`].
//!
//! Once the whole body has been read, [`upload_complete`](UploadHandler::upload_complete) is called
//! on every handler.

use std::collections::HashMap;

use actix_web::{http::header::HeaderMap, web::Bytes};
use encoding_rs::Encoding;

use crate::{error::UploadError, file::UploadedFile, map::ParsedForm};

mod memory;
mod temporary;

pub use self::memory::{MemoryUploadHandler, DEFAULT_MAX_MEMORY_SIZE};
pub use self::temporary::TemporaryFileUploadHandler;

/// Outcome of [`UploadHandler::new_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep this handler, and those after it, active for the file.
    Continue,

    /// Deactivate this handler until the next file starts.
    SkipFile,

    /// Deactivate every handler after this one until the next file starts.
    StopFutureHandlers,

    /// Abort the whole upload.
    StopUpload {
        /// When `false`, the rest of the request body is read and discarded so that the client
        /// can receive a response.
        connection_reset: bool,
    },
}

/// Outcome of [`UploadHandler::receive_data_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkFlow {
    /// Pass data to the next handler.
    ///
    /// The data may differ from what was received. Forwarding an empty chunk still reaches the
    /// next handler.
    Forward(Bytes),

    /// The data was consumed; handlers further down the chain do not see this chunk.
    Consume,

    /// Pass data to the next handler and deactivate this one until the next file starts.
    ///
    /// The data is taken to end where the current raw chunk ends, so a handler that held back
    /// earlier chunks can hand them over together with this one. The next handler receives
    /// `start` as that end offset minus the data length.
    SkipFile(Bytes),

    /// Abort the whole upload.
    StopUpload {
        /// See [`Flow::StopUpload`].
        connection_reset: bool,
    },
}

/// Metadata of a file part, handed to [`UploadHandler::new_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Form field name.
    pub field_name: String,

    /// Sanitized client-side file name.
    pub file_name: String,

    /// Media type essence (e.g. `text/plain`), empty when the part declared none.
    pub content_type: String,

    /// Value of the `charset` parameter of the part's content type.
    pub charset: Option<String>,

    /// Value of the part's `Content-Length` header, if any.
    pub content_length: Option<u64>,

    /// Content type parameters other than `charset`.
    pub content_type_extra: HashMap<String, String>,
}

/// Request-level information handed to [`UploadHandler::handle_raw_input`].
#[derive(Debug)]
pub struct RawInput<'a> {
    /// Request headers, if the parser was created from them.
    pub headers: Option<&'a HeaderMap>,

    /// Declared length of the request body.
    pub content_length: Option<u64>,

    /// Multipart boundary, without the leading hyphens.
    pub boundary: &'a str,

    /// Encoding used for plain fields that do not declare a charset.
    pub encoding: &'static Encoding,
}

/// A participant in the upload pipeline.
///
/// A handler instance lives for a single request. Any state it keeps for the current file must be
/// reset in [`new_file`](Self::new_file).
pub trait UploadHandler {
    /// Preferred chunk size in bytes.
    ///
    /// The parser uses the smallest size requested by any handler of the chain.
    fn chunk_size(&self) -> Option<usize> {
        None
    }

    /// Takes over parsing of the whole request.
    ///
    /// Returning `Some` skips the standard multipart parsing; the returned form is used as-is and
    /// the request body is left unread.
    fn handle_raw_input(
        &mut self,
        _input: &RawInput<'_>,
    ) -> Result<Option<ParsedForm>, UploadError> {
        Ok(None)
    }

    /// Signals that a new file part is starting.
    fn new_file(&mut self, _file: &FileInfo) -> Result<Flow, UploadError> {
        Ok(Flow::Continue)
    }

    /// Receives a chunk of the current file.
    ///
    /// `start` is the offset of the raw chunk within the file part, or the offset of the data
    /// handed over by an earlier handler returning [`ChunkFlow::SkipFile`].
    fn receive_data_chunk(&mut self, data: Bytes, start: u64) -> Result<ChunkFlow, UploadError>;

    /// Signals that the current file part is complete.
    ///
    /// Returning `None` leaves construction of the file to a later handler.
    fn file_complete(&mut self, size: u64) -> Result<Option<UploadedFile>, UploadError>;

    /// Signals that the whole request body has been parsed.
    fn upload_complete(&mut self) -> Result<(), UploadError> {
        Ok(())
    }

    /// Signals that the upload was aborted, either by a handler or by an error.
    fn upload_interrupted(&mut self) {}
}

impl<H: UploadHandler + ?Sized> UploadHandler for Box<H> {
    fn chunk_size(&self) -> Option<usize> {
        (**self).chunk_size()
    }

    fn handle_raw_input(
        &mut self,
        input: &RawInput<'_>,
    ) -> Result<Option<ParsedForm>, UploadError> {
        (**self).handle_raw_input(input)
    }

    fn new_file(&mut self, file: &FileInfo) -> Result<Flow, UploadError> {
        (**self).new_file(file)
    }

    fn receive_data_chunk(&mut self, data: Bytes, start: u64) -> Result<ChunkFlow, UploadError> {
        (**self).receive_data_chunk(data, start)
    }

    fn file_complete(&mut self, size: u64) -> Result<Option<UploadedFile>, UploadError> {
        (**self).file_complete(size)
    }

    fn upload_complete(&mut self) -> Result<(), UploadError> {
        (**self).upload_complete()
    }

    fn upload_interrupted(&mut self) {
        (**self).upload_interrupted()
    }
}
