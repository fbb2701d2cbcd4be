//! Process-wide upload configuration.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use actix_web::{web, Error, HttpRequest};

use crate::{
    chain::HandlerChain,
    error::UploadError,
    handlers::{
        MemoryUploadHandler, TemporaryFileUploadHandler, UploadHandler, DEFAULT_MAX_MEMORY_SIZE,
    },
};

type HandlerFactory = Arc<dyn Fn(&UploadConfig) -> Box<dyn UploadHandler> + Send + Sync>;

type UploadErrorHandler = Option<Arc<dyn Fn(UploadError, &HttpRequest) -> Error + Send + Sync>>;

/// A kind of handler to instantiate for every request.
#[derive(Clone)]
pub enum HandlerKind {
    /// [`MemoryUploadHandler`] using the configured maximum memory size.
    Memory,

    /// [`TemporaryFileUploadHandler`] using the configured directory and permissions.
    TemporaryFile,

    /// Handler built by a user-supplied factory.
    Custom(HandlerFactory),
}

impl HandlerKind {
    /// Wraps a factory function building a custom handler for each request.
    pub fn custom<F, H>(factory: F) -> Self
    where
        F: Fn(&UploadConfig) -> H + Send + Sync + 'static,
        H: UploadHandler + 'static,
    {
        HandlerKind::Custom(Arc::new(
            move |config: &UploadConfig| -> Box<dyn UploadHandler> { Box::new(factory(config)) },
        ))
    }

    fn build(&self, config: &UploadConfig) -> Box<dyn UploadHandler> {
        match self {
            HandlerKind::Memory => Box::new(MemoryUploadHandler::new(config.max_memory_size)),

            HandlerKind::TemporaryFile => {
                let mut handler = TemporaryFileUploadHandler::new();
                if let Some(ref dir) = config.temp_dir {
                    handler = handler.directory(dir);
                }
                if let Some(mode) = config.file_permissions {
                    handler = handler.permissions(mode);
                }
                Box::new(handler)
            }

            HandlerKind::Custom(factory) => factory(config),
        }
    }
}

impl fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Memory => f.write_str("Memory"),
            HandlerKind::TemporaryFile => f.write_str("TemporaryFile"),
            HandlerKind::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Limits applied while parsing a multipart body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of plain fields. By default this limit is 1000.
    pub max_fields: Option<usize>,

    /// Maximum number of file parts. By default this limit is 100.
    pub max_files: Option<usize>,

    /// Maximum total size of plain field names and values. By default this limit is 2.5MiB.
    pub max_field_memory: Option<usize>,
}

impl Limits {
    /// Limits that never reject a request.
    pub const UNLIMITED: Limits = Limits {
        max_fields: None,
        max_files: None,
        max_field_memory: None,
    };
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_fields: Some(1_000),
            max_files: Some(100),
            max_field_memory: Some(2_621_440), // 2.5 MiB
        }
    }
}

/// Upload configuration.
///
/// Add to your app data to have it picked up by [`UploadForm`](crate::UploadForm) extractors.
///
/// ```
/// use actix_upload::{HandlerKind, UploadConfig};
/// use actix_web::App;
///
/// let app = App::new().app_data(
///     UploadConfig::default()
///         .max_memory_size(1024 * 1024)
///         .handlers(vec![HandlerKind::Memory, HandlerKind::TemporaryFile]),
/// );
/// ```
#[derive(Clone)]
pub struct UploadConfig {
    handlers: Vec<HandlerKind>,
    max_memory_size: u64,
    temp_dir: Option<PathBuf>,
    file_permissions: Option<u32>,
    limits: Limits,
    err_handler: UploadErrorHandler,
}

impl UploadConfig {
    /// Sets the ordered list of handlers created for every request.
    ///
    /// Defaults to `[Memory, TemporaryFile]`.
    pub fn handlers(mut self, handlers: Vec<HandlerKind>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Sets the maximum size of a file kept in memory. By default this limit is 2.5MiB.
    pub fn max_memory_size(mut self, size: u64) -> Self {
        self.max_memory_size = size;
        self
    }

    /// Sets the directory that temp files will be created in.
    ///
    /// The default temporary file location is platform dependent.
    pub fn temp_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.temp_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Sets the permission mode of new temporary files (Unix only).
    pub fn file_permissions(mut self, mode: u32) -> Self {
        self.file_permissions = Some(mode);
        self
    }

    /// Sets parsing limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets custom error handler.
    pub fn error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(UploadError, &HttpRequest) -> Error + Send + Sync + 'static,
    {
        self.err_handler = Some(Arc::new(f));
        self
    }

    /// Returns the configured parsing limits.
    pub fn get_limits(&self) -> Limits {
        self.limits
    }

    /// Instantiates a fresh handler chain for one request.
    pub fn build_handlers(&self) -> HandlerChain {
        let mut chain = HandlerChain::new();
        for kind in &self.handlers {
            // a new chain is never locked
            let _ = chain.push(kind.build(self));
        }
        chain
    }

    /// Extracts upload config from app data. Check both `T` and `Data<T>`, in that order, and fall
    /// back to the default config.
    pub(crate) fn from_req(req: &HttpRequest) -> Self {
        req.app_data::<Self>()
            .or_else(|| req.app_data::<web::Data<Self>>().map(|d| d.as_ref()))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn map_error(&self, req: &HttpRequest, err: UploadError) -> Error {
        if let Some(ref err_handler) = self.err_handler {
            (err_handler)(err, req)
        } else {
            err.into()
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            handlers: vec![HandlerKind::Memory, HandlerKind::TemporaryFile],
            max_memory_size: DEFAULT_MAX_MEMORY_SIZE,
            temp_dir: None,
            file_permissions: None,
            limits: Limits::default(),
            err_handler: None,
        }
    }
}

impl fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadConfig")
            .field("handlers", &self.handlers)
            .field("max_memory_size", &self.max_memory_size)
            .field("temp_dir", &self.temp_dir)
            .field("file_permissions", &self.file_permissions)
            .field("limits", &self.limits)
            .finish()
    }
}
