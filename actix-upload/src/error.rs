//! Error and Result module

use std::io;

use actix_web::{
    error::{ParseError, PayloadError},
    http::StatusCode,
    ResponseError,
};
use derive_more::{Display, Error, From};

/// A set of errors that can occur while streaming a multipart upload through a handler chain.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum UploadError {
    /// Could not find Content-Type header.
    #[display("Could not find Content-Type header")]
    ContentTypeMissing,

    /// Could not parse Content-Type header.
    #[display("Could not parse Content-Type header")]
    ContentTypeParse,

    /// Parsed Content-Type did not have "multipart" top-level media type.
    #[display("Parsed Content-Type did not have 'multipart' top-level media type")]
    ContentTypeIncompatible,

    /// Multipart boundary is not found.
    #[display("Multipart boundary is not found")]
    BoundaryMissing,

    /// Content-Disposition header was not found or not of disposition type "form-data".
    ///
    /// According to [RFC 7578 §4.2](https://datatracker.ietf.org/doc/html/rfc7578#section-4.2) a
    /// Content-Disposition header must always be present and set to "form-data".
    #[display("Content-Disposition header was not found when reading multipart stream")]
    ContentDispositionMissing,

    /// Content-Disposition name parameter was not found.
    #[display("Content-Disposition header has no name parameter")]
    ContentDispositionNameMissing,

    /// Nested multipart is not supported.
    #[display("Nested multipart is not supported")]
    Nested,

    /// Multipart stream is incomplete.
    #[display("Multipart stream is incomplete")]
    Incomplete,

    /// Field headers could not be parsed.
    #[display("{}", _0)]
    Parse(ParseError),

    /// Error from the request payload stream.
    #[display("{}", _0)]
    Payload(PayloadError),

    /// I/O error from a handler's storage.
    #[display("I/O error: {}", _0)]
    Io(io::Error),

    /// A part declared `Content-Transfer-Encoding: base64` but its body was not valid base64.
    #[display("Invalid base64 data in part `{}`", _0)]
    #[from(ignore)]
    Base64(#[error(not(source))] String),

    /// A handler raised the stop-upload signal.
    #[display("Upload stopped by handler")]
    #[from(ignore)]
    UploadStopped {
        /// Whether the remaining request body was left unread.
        connection_reset: bool,
    },

    /// No handler produced a file object for a completed file part.
    #[display("No upload handler produced a file for field `{}`", field_name)]
    #[from(ignore)]
    FileNotProduced {
        /// Form field name of the file part.
        field_name: String,
    },

    /// A chunk reached the handler chain while no file part was open.
    #[display("Data chunk delivered before any file was started")]
    ChunkOutsideFile,

    /// The handler list was mutated after the request body started being consumed.
    #[display("Upload handlers cannot be changed after the request body has been read")]
    HandlersLocked,

    /// The multipart body of this parser has already been consumed.
    #[display("Multipart body has already been parsed")]
    AlreadyParsed,

    /// The number of plain fields exceeded the configured limit.
    #[display("Number of form fields exceeds the limit of {}", _0)]
    #[from(ignore)]
    TooManyFields(#[error(not(source))] usize),

    /// The number of file parts exceeded the configured limit.
    #[display("Number of uploaded files exceeds the limit of {}", _0)]
    #[from(ignore)]
    TooManyFiles(#[error(not(source))] usize),

    /// Plain field data exceeded the configured in-memory limit.
    #[display("Form field data exceeds the limit of {} bytes", _0)]
    #[from(ignore)]
    FieldDataTooLarge(#[error(not(source))] usize),
}

/// Return `BadRequest` for malformed uploads, `InternalServerError` for handler failures.
impl ResponseError for UploadError {
    fn status_code(&self) -> StatusCode {
        match self {
            UploadError::Io(_)
            | UploadError::FileNotProduced { .. }
            | UploadError::ChunkOutsideFile
            | UploadError::HandlersLocked
            | UploadError::AlreadyParsed => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::FieldDataTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}
