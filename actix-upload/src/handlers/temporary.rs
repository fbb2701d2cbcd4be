//! Writes files to temporary files on disk.

use std::{
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use actix_web::web::Bytes;
use tempfile::NamedTempFile;

use super::{ChunkFlow, FileInfo, Flow, UploadHandler};
use crate::{error::UploadError, file::UploadedFile};

/// Upload handler that streams file data into a temporary file.
///
/// Data is passed on unmodified to the next handler, if any.
#[derive(Debug, Default)]
pub struct TemporaryFileUploadHandler {
    directory: Option<PathBuf>,
    permissions: Option<u32>,
    current: Option<(FileInfo, NamedTempFile)>,
}

impl TemporaryFileUploadHandler {
    /// Constructs a handler writing to the platform's default temporary directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory that temp files will be created in.
    ///
    /// The default temporary file location is platform dependent.
    pub fn directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.directory = Some(dir.as_ref().to_owned());
        self
    }

    /// Sets the permission mode applied to new temporary files.
    ///
    /// Only has an effect on Unix platforms.
    pub fn permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(mode);
        self
    }

    fn create_tempfile(&self) -> io::Result<NamedTempFile> {
        let file = if let Some(ref dir) = self.directory {
            NamedTempFile::new_in(dir)?
        } else {
            NamedTempFile::new()?
        };

        if let Some(mode) = self.permissions {
            set_mode(file.as_file(), mode)?;
        }

        Ok(file)
    }
}

#[cfg(unix)]
fn set_mode(file: &std::fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &std::fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

impl UploadHandler for TemporaryFileUploadHandler {
    fn new_file(&mut self, file: &FileInfo) -> Result<Flow, UploadError> {
        let temp = self.create_tempfile()?;
        log::debug!(
            "writing `{}` to temporary file {}",
            file.file_name,
            temp.path().display()
        );
        self.current = Some((file.clone(), temp));
        Ok(Flow::Continue)
    }

    fn receive_data_chunk(&mut self, data: Bytes, start: u64) -> Result<ChunkFlow, UploadError> {
        let (_, file) = self.current.as_mut().ok_or(UploadError::ChunkOutsideFile)?;
        log::trace!("writing {} bytes for chunk at offset {}", data.len(), start);
        file.write_all(&data)?;
        Ok(ChunkFlow::Forward(data))
    }

    fn file_complete(&mut self, size: u64) -> Result<Option<UploadedFile>, UploadError> {
        let Some((info, mut file)) = self.current.take() else {
            return Ok(None);
        };

        file.flush()?;
        Ok(Some(UploadedFile::temporary(&info, file.into_temp_path(), size)))
    }

    fn upload_complete(&mut self) -> Result<(), UploadError> {
        // a file that was never completed by this handler is not handed out; dropping removes it
        self.current = None;
        Ok(())
    }

    fn upload_interrupted(&mut self) {
        if let Some((info, file)) = self.current.take() {
            log::debug!("removing partial temporary file for `{}`", info.file_name);
            if let Err(err) = file.close() {
                log::warn!("failed to remove temporary file: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn info() -> FileInfo {
        FileInfo {
            field_name: "file".to_owned(),
            file_name: "big.bin".to_owned(),
            content_type: "application/octet-stream".to_owned(),
            charset: None,
            content_length: None,
            content_type_extra: HashMap::new(),
        }
    }

    #[test]
    fn writes_and_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = TemporaryFileUploadHandler::new().directory(dir.path());

        handler.new_file(&info()).unwrap();
        assert_eq!(
            handler
                .receive_data_chunk(Bytes::from_static(b"hello "), 0)
                .unwrap(),
            ChunkFlow::Forward(Bytes::from_static(b"hello "))
        );
        handler
            .receive_data_chunk(Bytes::from_static(b"world"), 6)
            .unwrap();

        let file = handler.file_complete(11).unwrap().unwrap();
        let path = file.temporary_file_path().unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(file.size(), 11);
        assert_eq!(file.read().unwrap(), "hello world");
        assert_eq!(file.name(), "big.bin");
    }

    #[test]
    fn chunk_without_file() {
        let mut handler = TemporaryFileUploadHandler::new();
        assert!(matches!(
            handler.receive_data_chunk(Bytes::from_static(b"x"), 0),
            Err(UploadError::ChunkOutsideFile)
        ));
    }

    #[test]
    fn interrupted_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = TemporaryFileUploadHandler::new().directory(dir.path());

        handler.new_file(&info()).unwrap();
        handler
            .receive_data_chunk(Bytes::from_static(b"partial"), 0)
            .unwrap();
        handler.upload_interrupted();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn applies_permissions() {
        use std::os::unix::fs::PermissionsExt as _;

        let mut handler = TemporaryFileUploadHandler::new().permissions(0o640);
        handler.new_file(&info()).unwrap();
        let file = handler.file_complete(0).unwrap().unwrap();

        let mode = std::fs::metadata(file.temporary_file_path().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }
}
