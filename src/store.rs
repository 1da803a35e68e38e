use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::mem;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::StoreOptions;
use crate::error::{StoreError, StoreResult};
use crate::event::{self, Event, EventKind};
use crate::meta::MetaData;
use crate::segment::Segment;

/// Basename of the advisory lock file inside the store directory.
const LOCK_FILE_NAME: &str = ".lock";

/// The store coordinator: owns the current writable segment and serializes
/// every mutation through a single consumer loop.
///
/// Producers interact with the store only by enqueueing [`Event`]s; the loop
/// processes them strictly in arrival order, so concurrent producers need no
/// locking of their own. [`StoreHandle`] wraps the envelope plumbing for the
/// common case.
pub struct LogStore {
    dir: PathBuf,
    options: StoreOptions,
    current: Segment,
    /// Start offsets of sealed segments, ascending. Seeded from the directory
    /// scan at startup and extended on every rollover.
    sealed_starts: Vec<u64>,
    metadata: MetaData,
    events: mpsc::Receiver<Event>,
    /// Held for the lifetime of the store; the exclusive lock dies with it.
    #[allow(dead_code)]
    dir_lock: File,
}

impl LogStore {
    /// Opens a store over `dir` with a caller-supplied inbound queue.
    ///
    /// The starting offset is the flushed metadata value or, when the
    /// directory already holds segments past it, one past the last record
    /// actually on disk. A shutdown without a metadata flush therefore
    /// resumes after the persisted tail instead of overwriting it.
    pub fn open(
        dir: impl AsRef<Path>,
        options: StoreOptions,
        events: mpsc::Receiver<Event>,
    ) -> StoreResult<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let dir_lock = acquire_dir_lock(&dir)?;

        let mut sealed_starts = list_segment_starts(&dir)?;
        let metadata = MetaData::load(&dir)?;
        if metadata.next_offset == 0 {
            // offsets start at 1; a zero can only come from a mangled document
            return Err(StoreError::MalformedMetadata(
                "NextOffset must be at least 1".to_string(),
            ));
        }

        let mut next_offset = metadata.next_offset;
        if let Some(&last_start) = sealed_starts.last() {
            let last = Segment::open_read_only(&dir, last_start)?;
            next_offset = next_offset.max(last.next_offset());
        }
        // A trailing segment with no records sits exactly at the resume
        // point; the new current segment recreates that pair in place.
        if sealed_starts.last() == Some(&next_offset) {
            sealed_starts.pop();
        }

        let current = Segment::create(&dir, next_offset, &options)?;
        let store = LogStore {
            dir,
            options,
            current,
            sealed_starts,
            metadata: MetaData { next_offset },
            events,
            dir_lock,
        };
        info!("{:?}: opened", store);
        Ok(store)
    }

    /// Creates the inbound queue, opens the store, and returns the producer
    /// handle alongside it.
    pub fn open_with_handle(
        dir: impl AsRef<Path>,
        options: StoreOptions,
    ) -> StoreResult<(Self, StoreHandle)> {
        let (tx, rx) = mpsc::channel(options.event_queue_depth);
        let store = Self::open(dir, options, rx)?;
        Ok((store, StoreHandle { events: tx }))
    }

    /// Spawns the single consumer loop. All state mutation happens on that
    /// task; it exits on `Terminate` or when every queue sender is dropped.
    pub fn run(self) -> JoinHandle<()> {
        tokio::spawn(self.run_loop())
    }

    async fn run_loop(mut self) {
        while let Some(event) = self.events.recv().await {
            trace!("{:?}: dequeued {:?} event", self, event.kind);
            match event.kind {
                EventKind::Put => self.handle_put(event),
                EventKind::Get => self.handle_get(event),
                EventKind::FlushMetaData => self.flush_metadata(),
                EventKind::Terminate => {
                    self.shutdown();
                    return;
                }
                // inbound responses have no meaning here; drop them
                EventKind::Response => debug!("ignoring inbound Response event"),
            }
        }
        // every producer hung up; same teardown as an explicit Terminate
        self.shutdown();
    }

    fn handle_put(&mut self, event: Event) {
        let Event { data, reply, .. } = event;
        let response = match self.append(&data) {
            Ok(offset) => Event::response_ok(event::encode_offset(offset)),
            Err(err) => Event::response_err(err),
        };
        send_reply(reply, response);
    }

    fn handle_get(&mut self, event: Event) {
        let Event { data, reply, .. } = event;
        let response = match self.read(&data) {
            Ok(payload) => Event::response_ok(payload),
            Err(err) => Event::response_err(err),
        };
        send_reply(reply, response);
    }

    /// Appends to the current segment, rolling over to a fresh one when the
    /// byte cap is hit. The retry happens exactly once; a payload no segment
    /// can hold fails without a pointless rollover.
    fn append(&mut self, payload: &[u8]) -> StoreResult<u64> {
        let offset = match self.current.append(payload) {
            Ok(offset) => offset,
            Err(StoreError::SegmentLimitReached { .. }) if !self.current.is_empty() => {
                self.roll_over()?;
                self.current.append(payload)?
            }
            Err(err) => return Err(err),
        };
        self.metadata.next_offset = self.current.next_offset();
        Ok(offset)
    }

    fn roll_over(&mut self) -> StoreResult<()> {
        let next_start = self.current.next_offset();
        debug!("{:?}: rolling over to a new segment at offset {}", self, next_start);

        let incoming = Segment::create(&self.dir, next_start, &self.options)?;
        let mut retired = mem::replace(&mut self.current, incoming);
        retired.close()?;
        self.sealed_starts.push(retired.start_offset());
        Ok(())
    }

    /// Serves a read: current segment when the offset is at or past its
    /// start, otherwise the sealed segment whose range covers the offset,
    /// opened read-only for the duration of the call.
    fn read(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        let offset = event::decode_offset(data)?;
        if offset >= self.current.start_offset() {
            return self.current.read(offset);
        }

        let start = greatest_start_at_or_below(&self.sealed_starts, offset)
            .ok_or(StoreError::OffsetOutOfRange { offset })?;
        trace!(
            "{:?}: historical read of offset {} from sealed segment {}",
            self,
            offset,
            start
        );
        let sealed = Segment::open_read_only(&self.dir, start)?;
        sealed.read(offset)
    }

    /// Fire-and-forget metadata write; the loop must not stall on it, and
    /// there is no reply channel to carry a failure.
    fn flush_metadata(&self) {
        let metadata = self.metadata;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = metadata.persist(&dir) {
                warn!("metadata flush to {:?} failed: {}", dir, err);
            }
        });
    }

    /// Closes the current segment. Metadata is deliberately not flushed
    /// here; durable offset continuity requires an explicit
    /// `FlushMetaData` before `Terminate`.
    fn shutdown(&mut self) {
        info!("{:?}: terminating", self);
        if let Err(err) = self.current.close() {
            error!("failed to close segment {} on shutdown: {}", self.current.base(), err);
        }
    }

    pub fn current_start_offset(&self) -> u64 {
        self.current.start_offset()
    }

    pub fn current_base(&self) -> String {
        self.current.base()
    }

    pub fn metadata(&self) -> MetaData {
        self.metadata
    }

    pub fn sealed_segment_starts(&self) -> &[u64] {
        &self.sealed_starts
    }
}

impl fmt::Debug for LogStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "LogStore {{ dir: {:?}, current: {}, sealed_segments: {}, next_offset: {} }}",
            &self.dir,
            self.current.base(),
            self.sealed_starts.len(),
            self.metadata.next_offset
        )
    }
}

/// Cloneable producer-side handle over the store's inbound queue.
///
/// Every call builds the event envelope with a fresh one-shot reply carrier,
/// so one request consumes exactly one response.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    events: mpsc::Sender<Event>,
}

impl StoreHandle {
    pub fn new(events: mpsc::Sender<Event>) -> Self {
        StoreHandle { events }
    }

    /// Appends a payload and returns the offset the store assigned to it.
    pub async fn put(&self, payload: Vec<u8>) -> StoreResult<u64> {
        let (tx, rx) = oneshot::channel();
        self.request(Event::put(payload, tx), rx)
            .await
            .and_then(|data| event::decode_offset(&data))
    }

    /// Reads back the payload stored at `offset`.
    pub async fn get(&self, offset: u64) -> StoreResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.request(Event::get(offset, tx), rx).await
    }

    /// Asks the store to persist its metadata. No reply is sent; failures
    /// are logged and swallowed by the consumer.
    pub async fn flush_metadata(&self) -> StoreResult<()> {
        self.send(Event::flush_metadata()).await
    }

    /// Stops the consumer loop after closing the current segment. Events
    /// already queued behind the terminate are not processed.
    pub async fn terminate(&self) -> StoreResult<()> {
        self.send(Event::terminate()).await
    }

    async fn request(&self, event: Event, rx: oneshot::Receiver<Event>) -> StoreResult<Vec<u8>> {
        self.send(event).await?;
        let response = rx.await.map_err(|_| StoreError::StoreClosed)?;
        match response.error {
            Some(err) => Err(err),
            None => Ok(response.data),
        }
    }

    async fn send(&self, event: Event) -> StoreResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| StoreError::StoreClosed)
    }
}

/// Delivers a response on the caller's one-shot carrier. A producer that
/// dropped its receiver loses only its own reply; the loop keeps running.
fn send_reply(reply: Option<oneshot::Sender<Event>>, response: Event) {
    match reply {
        Some(tx) => {
            if tx.send(response).is_err() {
                warn!("reply receiver dropped before the response was delivered");
            }
        }
        None => debug!("event expected a reply but carried no reply channel"),
    }
}

fn acquire_dir_lock(dir: &Path) -> StoreResult<File> {
    let lock_path = dir.join(LOCK_FILE_NAME);
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| StoreError::io(&lock_path, e))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| StoreError::StoreLocked {
            path: dir.to_path_buf(),
        })?;
    Ok(lock_file)
}

/// Enumerates `*.index` basenames in `dir`, sorted ascending. Unparsable
/// names are skipped with a warning rather than failing startup.
fn list_segment_starts(dir: &Path) -> StoreResult<Vec<u64>> {
    let mut starts = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("index") {
            continue;
        }
        match path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            Some(start) => starts.push(start),
            None => warn!("ignoring unrecognized index file {:?}", path),
        }
    }
    starts.sort_unstable();
    Ok(starts)
}

/// Greatest element of the sorted `starts` that is ≤ `offset`.
fn greatest_start_at_or_below(starts: &[u64], offset: u64) -> Option<u64> {
    match starts.binary_search(&offset) {
        Ok(i) => Some(starts[i]),
        Err(0) => None,
        Err(i) => Some(starts[i - 1]),
    }
}
