//! Streaming file uploads for Actix Web.
//!
//! A `multipart/form-data` body is parsed incrementally. Plain fields are decoded into a
//! [`FieldMap`]. The data of every file part is cut into chunks and pushed through an ordered
//! [`HandlerChain`] of [`UploadHandler`](handlers::UploadHandler)s, the first of which to produce
//! an [`UploadedFile`] decides where the file lives.
//!
//! With the default chain, files up to 2.5MiB are kept in memory by [`MemoryUploadHandler`] and
//! larger ones are spilled to a temporary file by [`TemporaryFileUploadHandler`].
//!
//! # Examples
//!
//! ```no_run
//! use actix_upload::{HandlerKind, UploadConfig, UploadForm};
//! use actix_web::{post, App, HttpServer, Responder};
//!
//! #[post("/")]
//! async fn index(form: UploadForm) -> impl Responder {
//!     if let Some(path) = form.files.get("avatar").and_then(|f| f.temporary_file_path()) {
//!         log::info!("avatar spilled to {path:?}");
//!     }
//!
//!     format!("{} fields, {} files", form.fields.len(), form.files.len())
//! }
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     HttpServer::new(|| {
//!         App::new().service(index).app_data(
//!             UploadConfig::default()
//!                 .max_memory_size(1024 * 1024)
//!                 .handlers(vec![HandlerKind::Memory, HandlerKind::TemporaryFile]),
//!         )
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```

#![doc(html_logo_url = "https://actix.rs/img/logo.png")]
#![doc(html_favicon_url = "https://actix.rs/favicon.ico")]

mod chain;
mod config;
mod error;
mod extractor;
mod file;
pub mod handlers;
mod map;
mod parser;
mod payload;
mod transfer;

pub use self::chain::{HandlerChain, DEFAULT_CHUNK_SIZE};
pub use self::config::{HandlerKind, Limits, UploadConfig};
pub use self::error::UploadError;
pub use self::extractor::UploadForm;
pub use self::file::{Chunks, Lines, UploadedFile};
pub use self::handlers::{MemoryUploadHandler, TemporaryFileUploadHandler, UploadHandler};
pub use self::map::{FieldMap, FileMap, MultiValueMap, ParsedForm};
pub use self::parser::MultipartParser;
