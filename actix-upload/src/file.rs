//! Uploaded file objects produced by upload handlers.

use std::{
    cmp,
    collections::HashMap,
    fmt,
    fs::File,
    io::{self, Read as _},
    path::Path,
};

use actix_web::web::{Bytes, BytesMut};
use tempfile::TempPath;

use crate::{chain::DEFAULT_CHUNK_SIZE, handlers::FileInfo};

enum Storage {
    Memory(Bytes),
    Temporary(TempPath),
}

/// A file uploaded as part of a multipart request.
///
/// Content is either held in memory or in a temporary file on disk. Temporary files are deleted
/// when the `UploadedFile` is dropped unless they have been [persisted](Self::persist).
pub struct UploadedFile {
    field_name: String,
    name: String,
    size: u64,
    content_type: String,
    charset: Option<String>,
    content_type_extra: HashMap<String, String>,
    storage: Storage,
}

impl UploadedFile {
    /// Constructs a file backed by an in-memory buffer.
    pub fn in_memory(info: &FileInfo, data: Bytes, size: u64) -> Self {
        Self::new(info, size, Storage::Memory(data))
    }

    /// Constructs a file backed by a temporary file on disk.
    pub fn temporary(info: &FileInfo, path: TempPath, size: u64) -> Self {
        Self::new(info, size, Storage::Temporary(path))
    }

    fn new(info: &FileInfo, size: u64, storage: Storage) -> Self {
        UploadedFile {
            field_name: info.field_name.clone(),
            name: info.file_name.clone(),
            size,
            content_type: info.content_type.clone(),
            charset: info.charset.clone(),
            content_type_extra: info.content_type_extra.clone(),
            storage,
        }
    }

    /// Returns the form field name this file was uploaded under.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Returns the sanitized client-side file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of bytes received for this file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the media type essence supplied by the client, e.g. `image/png`.
    ///
    /// Empty if the client did not send one. The value is not validated against the content.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Returns the charset parameter of the content type, if any.
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// Returns content type parameters other than `charset`.
    pub fn content_type_extra(&self) -> &HashMap<String, String> {
        &self.content_type_extra
    }

    /// Returns true if the content is held in memory.
    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Memory(_))
    }

    /// Returns the path of the backing temporary file, if the content is on disk.
    pub fn temporary_file_path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Memory(_) => None,
            Storage::Temporary(path) => Some(&**path),
        }
    }

    /// Reads the whole content.
    pub fn read(&self) -> io::Result<Bytes> {
        match &self.storage {
            Storage::Memory(data) => Ok(data.clone()),
            Storage::Temporary(path) => {
                let mut buf = Vec::with_capacity(self.size as usize);
                File::open(path)?.read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Returns an iterator over the content in chunks of at most `chunk_size` bytes.
    ///
    /// Every call starts again from the beginning of the file.
    pub fn chunks(&self, chunk_size: usize) -> io::Result<Chunks> {
        let chunk_size = cmp::max(chunk_size, 1);

        let source = match &self.storage {
            Storage::Memory(data) => ChunkSource::Memory(data.clone()),
            Storage::Temporary(path) => ChunkSource::File(File::open(path)?),
        };

        Ok(Chunks {
            source,
            chunk_size,
            done: false,
        })
    }

    /// Returns true if reading the file with `chunk_size` takes more than one chunk.
    pub fn multiple_chunks(&self, chunk_size: usize) -> bool {
        self.size > chunk_size as u64
    }

    /// Returns an iterator over the lines of the content.
    ///
    /// Lines are split on `\n` only and include their terminator.
    pub fn lines(&self) -> io::Result<Lines> {
        Ok(Lines {
            chunks: self.chunks(DEFAULT_CHUNK_SIZE)?,
            pending: BytesMut::new(),
        })
    }

    /// Writes the content to `path`.
    ///
    /// Temporary files are moved into place when possible and no longer deleted on drop.
    pub fn persist(self, path: impl AsRef<Path>) -> io::Result<()> {
        match self.storage {
            Storage::Memory(data) => std::fs::write(path, data),
            Storage::Temporary(temp) => match temp.persist(path.as_ref()) {
                Ok(()) => Ok(()),
                // rename across filesystems fails; fall back to a copy
                Err(err) => {
                    std::fs::copy(&err.path, path)?;
                    Ok(())
                }
            },
        }
    }
}

impl fmt::Debug for UploadedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedFile")
            .field("field_name", &self.field_name)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("charset", &self.charset)
            .field("temporary_file_path", &self.temporary_file_path())
            .finish()
    }
}

enum ChunkSource {
    Memory(Bytes),
    File(File),
}

/// Iterator over the content of an [`UploadedFile`], see [`UploadedFile::chunks`].
pub struct Chunks {
    source: ChunkSource,
    chunk_size: usize,
    done: bool,
}

impl Iterator for Chunks {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match &mut self.source {
            ChunkSource::Memory(data) => {
                if data.is_empty() {
                    self.done = true;
                    return None;
                }

                let len = cmp::min(data.len(), self.chunk_size);
                Some(Ok(data.split_to(len)))
            }

            ChunkSource::File(file) => {
                let mut buf = Vec::with_capacity(self.chunk_size);

                match file
                    .by_ref()
                    .take(self.chunk_size as u64)
                    .read_to_end(&mut buf)
                {
                    Ok(0) => {
                        self.done = true;
                        None
                    }
                    Ok(_) => Some(Ok(Bytes::from(buf))),
                    Err(err) => {
                        self.done = true;
                        Some(Err(err))
                    }
                }
            }
        }
    }
}

/// Iterator over the lines of an [`UploadedFile`], see [`UploadedFile::lines`].
pub struct Lines {
    chunks: Chunks,
    pending: BytesMut,
}

impl Iterator for Lines {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(idx) = memchr::memchr(b'\n', &self.pending) {
                return Some(Ok(self.pending.split_to(idx + 1).freeze()));
            }

            match self.chunks.next() {
                Some(Ok(chunk)) => self.pending.extend_from_slice(&chunk),
                Some(Err(err)) => return Some(Err(err)),

                // last line without terminator
                None if !self.pending.is_empty() => return Some(Ok(self.pending.split().freeze())),
                None => return None,
            }
        }
    }
}
