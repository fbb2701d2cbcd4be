//! Ordered list of upload handlers for a single request.

use std::{cmp, fmt};

use actix_web::web::Bytes;

use crate::{
    error::UploadError,
    file::UploadedFile,
    handlers::{ChunkFlow, FileInfo, Flow, RawInput, UploadHandler},
    map::ParsedForm,
};

/// Chunk size (64KiB) used when no handler asks for a specific size.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// The ordered set of [`UploadHandler`]s processing the file parts of one request.
///
/// Handlers may be added, replaced, or removed until the parser starts reading the request body.
/// After that, the chain is locked and every mutation fails with
/// [`UploadError::HandlersLocked`].
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Box<dyn UploadHandler>>,

    /// Activation flags of each handler for the current file.
    active: Vec<bool>,

    /// File being received, if any.
    current: Option<CurrentFile>,

    /// Number of files started so far.
    file_count: usize,

    chunk_size: Option<usize>,
    locked: bool,
}

struct CurrentFile {
    field_name: String,
    /// Bytes delivered so far for this file.
    received: u64,
}

impl HandlerChain {
    /// Constructs an empty handler chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of handlers in the chain.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if the chain has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns true once the request body has started being consumed.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Appends a handler to the end of the chain.
    pub fn push(&mut self, handler: impl UploadHandler + 'static) -> Result<(), UploadError> {
        self.check_unlocked()?;
        self.handlers.push(Box::new(handler));
        Ok(())
    }

    /// Inserts a handler at position `index`, shifting later handlers down the chain.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert(
        &mut self,
        index: usize,
        handler: impl UploadHandler + 'static,
    ) -> Result<(), UploadError> {
        self.check_unlocked()?;
        self.handlers.insert(index, Box::new(handler));
        Ok(())
    }

    /// Replaces the handler at position `index`, returning the previous one.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn replace(
        &mut self,
        index: usize,
        handler: impl UploadHandler + 'static,
    ) -> Result<Box<dyn UploadHandler>, UploadError> {
        self.check_unlocked()?;
        Ok(std::mem::replace(
            &mut self.handlers[index],
            Box::new(handler),
        ))
    }

    /// Removes and returns the handler at position `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove(&mut self, index: usize) -> Result<Box<dyn UploadHandler>, UploadError> {
        self.check_unlocked()?;
        Ok(self.handlers.remove(index))
    }

    /// Removes every handler.
    pub fn clear(&mut self) -> Result<(), UploadError> {
        self.check_unlocked()?;
        self.handlers.clear();
        Ok(())
    }

    fn check_unlocked(&self) -> Result<(), UploadError> {
        if self.locked {
            log::error!("attempted to modify upload handlers after the request body was read");
            Err(UploadError::HandlersLocked)
        } else {
            Ok(())
        }
    }

    /// Returns the chunk size negotiated between handlers.
    ///
    /// This is the smallest size requested by any handler, or [`DEFAULT_CHUNK_SIZE`] if none of
    /// them has a preference. Fixed once the chain is locked.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or_else(|| self.negotiate_chunk_size())
    }

    fn negotiate_chunk_size(&self) -> usize {
        self.handlers
            .iter()
            .filter_map(|handler| handler.chunk_size())
            .min()
            .map_or(DEFAULT_CHUNK_SIZE, |size| cmp::max(size, 1))
    }

    /// Locks the handler list and fixes the chunk size.
    pub(crate) fn lock(&mut self) {
        if !self.locked {
            self.locked = true;
            self.chunk_size = Some(self.negotiate_chunk_size());
        }
    }

    /// Offers the whole request to each handler until one takes it over.
    pub(crate) fn handle_raw_input(
        &mut self,
        input: &RawInput<'_>,
    ) -> Result<Option<ParsedForm>, UploadError> {
        for handler in &mut self.handlers {
            if let Some(form) = handler.handle_raw_input(input)? {
                return Ok(Some(form));
            }
        }

        Ok(None)
    }

    /// Starts a new file, re-activating every handler.
    pub(crate) fn new_file(&mut self, info: &FileInfo) -> Result<(), UploadError> {
        self.active = vec![true; self.handlers.len()];
        self.file_count += 1;

        log::debug!(
            "starting file #{} `{}` for field `{}`",
            self.file_count,
            info.file_name,
            info.field_name
        );

        for idx in 0..self.handlers.len() {
            if !self.active[idx] {
                continue;
            }

            match self.handlers[idx].new_file(info)? {
                Flow::Continue => {}

                Flow::SkipFile => {
                    log::debug!("handler #{idx} skips file `{}`", info.file_name);
                    self.active[idx] = false;
                }

                Flow::StopFutureHandlers => {
                    log::debug!("handler #{idx} stops later handlers for `{}`", info.file_name);
                    self.active[idx + 1..]
                        .iter_mut()
                        .for_each(|active| *active = false);
                    break;
                }

                Flow::StopUpload { connection_reset } => {
                    self.current = None;
                    return Err(UploadError::UploadStopped { connection_reset });
                }
            }
        }

        self.current = Some(CurrentFile {
            field_name: info.field_name.clone(),
            received: 0,
        });

        Ok(())
    }

    /// Feeds a chunk of the current file through the active handlers.
    pub(crate) fn receive(&mut self, chunk: Bytes) -> Result<(), UploadError> {
        let current = self.current.as_mut().ok_or(UploadError::ChunkOutsideFile)?;

        let mut start = current.received;
        current.received += chunk.len() as u64;
        let end = current.received;

        let mut data = chunk;

        for idx in 0..self.handlers.len() {
            if !self.active[idx] {
                continue;
            }

            match self.handlers[idx].receive_data_chunk(data, start)? {
                ChunkFlow::Forward(next) => data = next,

                ChunkFlow::Consume => break,

                ChunkFlow::SkipFile(next) => {
                    log::debug!("handler #{idx} skips the rest of the current file");
                    self.active[idx] = false;
                    start = end.saturating_sub(next.len() as u64);
                    data = next;
                }

                ChunkFlow::StopUpload { connection_reset } => {
                    self.current = None;
                    return Err(UploadError::UploadStopped { connection_reset });
                }
            }
        }

        Ok(())
    }

    /// Completes the current file, returning the first file object produced by a handler.
    pub(crate) fn complete(&mut self) -> Result<UploadedFile, UploadError> {
        let current = self.current.take().ok_or(UploadError::ChunkOutsideFile)?;

        for idx in 0..self.handlers.len() {
            if !self.active[idx] {
                continue;
            }

            if let Some(file) = self.handlers[idx].file_complete(current.received)? {
                log::debug!(
                    "handler #{idx} produced file for field `{}` ({} bytes)",
                    current.field_name,
                    current.received
                );
                return Ok(file);
            }
        }

        Err(UploadError::FileNotProduced {
            field_name: current.field_name,
        })
    }

    /// Signals the end of the request to every handler.
    pub(crate) fn upload_complete(&mut self) -> Result<(), UploadError> {
        for handler in &mut self.handlers {
            handler.upload_complete()?;
        }
        Ok(())
    }

    /// Signals an aborted upload to every handler.
    pub(crate) fn upload_interrupted(&mut self) {
        self.current = None;
        for handler in &mut self.handlers {
            handler.upload_interrupted();
        }
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.handlers.len())
            .field("chunk_size", &self.chunk_size())
            .field("locked", &self.locked)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    use assert_matches::assert_matches;

    use super::*;
    use crate::handlers::MemoryUploadHandler;

    /// Records every callback it receives into a shared log.
    pub(crate) struct Recorder {
        pub(crate) name: &'static str,
        pub(crate) log: Rc<RefCell<Vec<String>>>,
        pub(crate) chunk_size: Option<usize>,
        pub(crate) on_new_file: Flow,
        pub(crate) produce: bool,
        /// Stop the upload when receiving the chunk at this offset.
        pub(crate) stop_at: Option<u64>,
    }

    impl Recorder {
        pub(crate) fn new(name: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Self {
            Recorder {
                name,
                log: Rc::clone(log),
                chunk_size: None,
                on_new_file: Flow::Continue,
                produce: false,
                stop_at: None,
            }
        }

        fn record(&self, event: String) {
            self.log.borrow_mut().push(format!("{}:{}", self.name, event));
        }
    }

    impl UploadHandler for Recorder {
        fn chunk_size(&self) -> Option<usize> {
            self.chunk_size
        }

        fn new_file(&mut self, file: &FileInfo) -> Result<Flow, UploadError> {
            self.record(format!("new_file({})", file.file_name));
            Ok(self.on_new_file)
        }

        fn receive_data_chunk(&mut self, data: Bytes, start: u64) -> Result<ChunkFlow, UploadError> {
            self.record(format!("chunk({start},{})", data.len()));
            if self.stop_at == Some(start) {
                return Ok(ChunkFlow::StopUpload {
                    connection_reset: true,
                });
            }
            Ok(ChunkFlow::Forward(data))
        }

        fn file_complete(&mut self, size: u64) -> Result<Option<UploadedFile>, UploadError> {
            self.record(format!("file_complete({size})"));
            if !self.produce {
                return Ok(None);
            }

            let data = Bytes::from_static(self.name.as_bytes());
            Ok(Some(UploadedFile::in_memory(&info("x.txt"), data, size)))
        }

        fn upload_complete(&mut self) -> Result<(), UploadError> {
            self.record("upload_complete".to_owned());
            Ok(())
        }

        fn upload_interrupted(&mut self) {
            self.record("upload_interrupted".to_owned());
        }
    }

    pub(crate) fn info(file_name: &str) -> FileInfo {
        FileInfo {
            field_name: "file".to_owned(),
            file_name: file_name.to_owned(),
            content_type: String::new(),
            charset: None,
            content_length: None,
            content_type_extra: HashMap::new(),
        }
    }

    /// Handler that upper-cases data and consumes it when it starts with `!`.
    struct Transform;

    impl UploadHandler for Transform {
        fn receive_data_chunk(&mut self, data: Bytes, _: u64) -> Result<ChunkFlow, UploadError> {
            if data.starts_with(b"!") {
                return Ok(ChunkFlow::Consume);
            }
            Ok(ChunkFlow::Forward(Bytes::from(data.to_ascii_uppercase())))
        }

        fn file_complete(&mut self, _: u64) -> Result<Option<UploadedFile>, UploadError> {
            Ok(None)
        }
    }

    /// Handler that keeps whatever it receives.
    #[derive(Default)]
    struct Collect(Rc<RefCell<Vec<u8>>>);

    impl UploadHandler for Collect {
        fn receive_data_chunk(&mut self, data: Bytes, _: u64) -> Result<ChunkFlow, UploadError> {
            self.0.borrow_mut().extend_from_slice(&data);
            Ok(ChunkFlow::Forward(data))
        }

        fn file_complete(&mut self, size: u64) -> Result<Option<UploadedFile>, UploadError> {
            let data = Bytes::from(self.0.borrow().clone());
            Ok(Some(UploadedFile::in_memory(&info("c"), data, size)))
        }
    }

    fn log() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn negotiates_smallest_chunk_size() {
        let log = log();
        let mut chain = HandlerChain::new();
        assert_eq!(chain.chunk_size(), DEFAULT_CHUNK_SIZE);

        chain.push(Recorder::new("a", &log)).unwrap();
        assert_eq!(chain.chunk_size(), DEFAULT_CHUNK_SIZE);

        chain
            .push(Recorder {
                chunk_size: Some(4096),
                ..Recorder::new("b", &log)
            })
            .unwrap();
        chain
            .insert(
                0,
                Recorder {
                    chunk_size: Some(128 * 1024),
                    ..Recorder::new("c", &log)
                },
            )
            .unwrap();

        chain.lock();
        assert_eq!(chain.chunk_size(), 4096);
    }

    #[test]
    fn mutation_after_lock_is_rejected() {
        let log = log();
        let mut chain = HandlerChain::new();
        chain.push(Recorder::new("a", &log)).unwrap();
        chain.lock();

        assert_matches!(
            chain.push(Recorder::new("b", &log)),
            Err(UploadError::HandlersLocked)
        );
        assert_matches!(
            chain.insert(0, Recorder::new("b", &log)),
            Err(UploadError::HandlersLocked)
        );
        assert!(matches!(
            chain.replace(0, Recorder::new("b", &log)),
            Err(UploadError::HandlersLocked)
        ));
        assert!(matches!(chain.remove(0), Err(UploadError::HandlersLocked)));
        assert_matches!(chain.clear(), Err(UploadError::HandlersLocked));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn chunk_before_new_file() {
        let mut chain = HandlerChain::new();
        chain.lock();
        assert_matches!(
            chain.receive(Bytes::from_static(b"data")),
            Err(UploadError::ChunkOutsideFile)
        );
    }

    #[test]
    fn output_of_one_handler_feeds_the_next() {
        let collected = Rc::new(RefCell::new(Vec::new()));

        let mut chain = HandlerChain::new();
        chain.push(Transform).unwrap();
        chain.push(Collect(Rc::clone(&collected))).unwrap();
        chain.lock();

        chain.new_file(&info("a.txt")).unwrap();
        chain.receive(Bytes::from_static(b"abc")).unwrap();
        chain.receive(Bytes::from_static(b"!skipped")).unwrap();
        chain.receive(Bytes::from_static(b"def")).unwrap();
        let file = chain.complete().unwrap();

        assert_eq!(&collected.borrow()[..], b"ABCDEF");
        // size counts raw bytes, including the short-circuited chunk
        assert_eq!(file.size(), 14);
    }

    #[test]
    fn start_offsets_advance_past_short_circuited_chunks() {
        let log = log();

        let mut chain = HandlerChain::new();
        chain.push(Transform).unwrap();
        chain.push(Recorder::new("r", &log)).unwrap();
        chain.lock();

        chain.new_file(&info("a.txt")).unwrap();
        chain.receive(Bytes::from_static(b"!1")).unwrap();
        chain.receive(Bytes::from_static(b"23")).unwrap();

        assert_eq!(*log.borrow(), ["r:new_file(a.txt)", "r:chunk(2,2)"]);
    }

    #[test]
    fn empty_forward_is_not_a_short_circuit() {
        struct Empty;

        impl UploadHandler for Empty {
            fn receive_data_chunk(&mut self, _: Bytes, _: u64) -> Result<ChunkFlow, UploadError> {
                Ok(ChunkFlow::Forward(Bytes::new()))
            }

            fn file_complete(&mut self, _: u64) -> Result<Option<UploadedFile>, UploadError> {
                Ok(None)
            }
        }

        let log = log();
        let mut chain = HandlerChain::new();
        chain.push(Empty).unwrap();
        chain.push(Recorder::new("r", &log)).unwrap();
        chain.lock();

        chain.new_file(&info("a.txt")).unwrap();
        chain.receive(Bytes::from_static(b"data")).unwrap();

        assert_eq!(log.borrow()[1], "r:chunk(0,0)");
    }

    #[test]
    fn skip_file_is_scoped_to_one_file() {
        let log = log();

        let mut chain = HandlerChain::new();
        chain
            .push(Recorder {
                on_new_file: Flow::SkipFile,
                ..Recorder::new("skip", &log)
            })
            .unwrap();
        chain
            .push(Recorder {
                produce: true,
                ..Recorder::new("keep", &log)
            })
            .unwrap();
        chain.lock();

        chain.new_file(&info("one")).unwrap();
        chain.receive(Bytes::from_static(b"1")).unwrap();
        chain.complete().unwrap();

        // skipping lasted for one file only, the handler is asked again
        chain.new_file(&info("two")).unwrap();

        assert_eq!(
            *log.borrow(),
            [
                "skip:new_file(one)",
                "keep:new_file(one)",
                "keep:chunk(0,1)",
                "keep:file_complete(1)",
                "skip:new_file(two)",
                "keep:new_file(two)",
            ]
        );
    }

    #[test]
    fn skipped_data_is_offset_from_the_end_of_the_chunk() {
        let log = log();

        let mut chain = HandlerChain::new();
        chain.push(MemoryUploadHandler::new(8)).unwrap();
        chain.push(Recorder::new("r", &log)).unwrap();
        chain.lock();

        chain.new_file(&info("a.txt")).unwrap();
        chain.receive(Bytes::from_static(b"abcdef")).unwrap();
        chain.receive(Bytes::from_static(b"ghijkl")).unwrap();
        chain.receive(Bytes::from_static(b"mn")).unwrap();

        assert_eq!(
            *log.borrow(),
            ["r:new_file(a.txt)", "r:chunk(0,12)", "r:chunk(12,2)"]
        );
    }

    #[test]
    fn stop_future_handlers() {
        let log = log();

        let mut chain = HandlerChain::new();
        chain
            .push(Recorder {
                on_new_file: Flow::StopFutureHandlers,
                produce: true,
                ..Recorder::new("first", &log)
            })
            .unwrap();
        chain.push(Recorder::new("second", &log)).unwrap();
        chain.lock();

        chain.new_file(&info("f")).unwrap();
        chain.receive(Bytes::from_static(b"xy")).unwrap();
        let file = chain.complete().unwrap();
        assert_eq!(file.read().unwrap(), "first");

        assert_eq!(
            *log.borrow(),
            [
                "first:new_file(f)",
                "first:chunk(0,2)",
                "first:file_complete(2)"
            ]
        );
    }

    #[test]
    fn first_produced_file_wins() {
        let log = log();

        let mut chain = HandlerChain::new();
        chain.push(Recorder::new("none", &log)).unwrap();
        chain
            .push(Recorder {
                produce: true,
                ..Recorder::new("first", &log)
            })
            .unwrap();
        chain
            .push(Recorder {
                produce: true,
                ..Recorder::new("second", &log)
            })
            .unwrap();
        chain.lock();

        chain.new_file(&info("f")).unwrap();
        let file = chain.complete().unwrap();
        assert_eq!(file.read().unwrap(), "first");
        assert!(!log.borrow().iter().any(|e| e == "second:file_complete(0)"));
    }

    #[test]
    fn no_file_produced() {
        let log = log();
        let mut chain = HandlerChain::new();
        chain.push(Recorder::new("none", &log)).unwrap();
        chain.lock();

        chain.new_file(&info("f")).unwrap();
        assert_matches!(
            chain.complete(),
            Err(UploadError::FileNotProduced { field_name }) if field_name == "file"
        );
    }

    #[test]
    fn stop_upload() {
        let log = log();
        let mut chain = HandlerChain::new();
        chain
            .push(Recorder {
                stop_at: Some(0),
                ..Recorder::new("stop", &log)
            })
            .unwrap();
        chain.lock();

        chain.new_file(&info("f")).unwrap();
        assert_matches!(
            chain.receive(Bytes::from_static(b"x")),
            Err(UploadError::UploadStopped {
                connection_reset: true
            })
        );
        assert_matches!(chain.complete(), Err(UploadError::ChunkOutsideFile));
    }
}
