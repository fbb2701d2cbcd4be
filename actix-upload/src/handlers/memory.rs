//! Keeps small files in memory.

use actix_web::web::{Bytes, BytesMut};

use super::{ChunkFlow, FileInfo, Flow, UploadHandler};
use crate::{error::UploadError, file::UploadedFile};

/// Default maximum size (2.5MiB) of a file kept in memory.
pub const DEFAULT_MAX_MEMORY_SIZE: u64 = 2_621_440;

/// Upload handler that buffers files in memory.
///
/// Files up to [`max_memory_size`](Self::new) bytes are produced as in-memory [`UploadedFile`]s.
/// As soon as a file grows past that size, the buffered data is handed to the next handler in the
/// chain and this handler steps aside until the next file.
#[derive(Debug)]
pub struct MemoryUploadHandler {
    max_memory_size: u64,
    file: Option<FileInfo>,
    buf: BytesMut,
}

impl MemoryUploadHandler {
    /// Constructs a memory handler with the given maximum in-memory file size.
    pub fn new(max_memory_size: u64) -> Self {
        MemoryUploadHandler {
            max_memory_size,
            file: None,
            buf: BytesMut::new(),
        }
    }
}

impl Default for MemoryUploadHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMORY_SIZE)
    }
}

impl UploadHandler for MemoryUploadHandler {
    fn new_file(&mut self, file: &FileInfo) -> Result<Flow, UploadError> {
        self.buf = BytesMut::new();

        match file.content_length {
            Some(len) if len > self.max_memory_size => {
                log::debug!(
                    "file `{}` announces {} bytes, not keeping it in memory",
                    file.file_name,
                    len
                );
                self.file = None;
                Ok(Flow::SkipFile)
            }
            _ => {
                self.file = Some(file.clone());
                Ok(Flow::Continue)
            }
        }
    }

    fn receive_data_chunk(&mut self, data: Bytes, start: u64) -> Result<ChunkFlow, UploadError> {
        // must agree with the raw size checked in `file_complete`
        let raw_end = start + data.len() as u64;
        let buffered = (self.buf.len() + data.len()) as u64;

        if raw_end > self.max_memory_size || buffered > self.max_memory_size {
            log::debug!(
                "file exceeds {} bytes, handing {} buffered bytes to the next handler",
                self.max_memory_size,
                self.buf.len() + data.len()
            );

            self.file = None;
            let mut spilled = std::mem::take(&mut self.buf);
            spilled.extend_from_slice(&data);
            return Ok(ChunkFlow::SkipFile(spilled.freeze()));
        }

        self.buf.extend_from_slice(&data);
        Ok(ChunkFlow::Consume)
    }

    fn file_complete(&mut self, size: u64) -> Result<Option<UploadedFile>, UploadError> {
        let Some(info) = self.file.take() else {
            return Ok(None);
        };

        if size > self.max_memory_size {
            return Ok(None);
        }

        let data = std::mem::take(&mut self.buf).freeze();
        Ok(Some(UploadedFile::in_memory(&info, data, size)))
    }

    fn upload_interrupted(&mut self) {
        self.file = None;
        self.buf = BytesMut::new();
    }
}
