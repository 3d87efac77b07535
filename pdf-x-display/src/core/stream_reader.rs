//! The byte-source reader contract shared by every backend.
//!
//! A [`PDFStream`] hands out at most one full reader and any number of
//! range readers. All backends buffer through [`ReadQueue`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::Notify;

use super::capability::Capability;
use super::error::{PDFError, PDFResult};
use super::lock;

/// Called with `(loaded, total)` as bytes arrive.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Reader over the whole document.
pub trait PDFStreamReader: Send + Sync {
    /// Resolves once length and range support are known.
    fn headers_ready(&self) -> BoxFuture<'static, PDFResult<()>>;

    fn filename(&self) -> Option<String>;

    fn content_length(&self) -> Option<u64>;

    fn is_range_supported(&self) -> bool;

    fn is_streaming_supported(&self) -> bool;

    /// Next chunk, or `None` when done.
    fn read(&self) -> BoxFuture<'_, PDFResult<Option<Bytes>>>;

    fn cancel(&self, reason: PDFError);

    fn set_on_progress(&self, callback: ProgressCallback);
}

/// Reader over `[begin, end)`.
pub trait PDFStreamRangeReader: Send + Sync {
    fn is_streaming_supported(&self) -> bool;

    fn read(&self) -> BoxFuture<'_, PDFResult<Option<Bytes>>>;

    fn cancel(&self, reason: PDFError);

    fn set_on_progress(&self, callback: ProgressCallback);
}

/// A byte source for one document.
pub trait PDFStream: Send + Sync {
    /// Fails when called more than once.
    fn get_full_reader(&self) -> PDFResult<Arc<dyn PDFStreamReader>>;

    /// `None` when the source cannot serve ranges before its full reader
    /// has progressed far enough.
    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn PDFStreamRangeReader>>;

    /// Bytes already delivered by the full reader.
    fn progressive_data_length(&self) -> u64 {
        0
    }

    fn cancel_all_requests(&self, reason: PDFError);
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<Bytes>,
    done: bool,
    error: Option<PDFError>,
    loaded: u64,
    total: Option<u64>,
}

/// Chunk buffer, waiter wakeup, terminal state and progress reporting.
#[derive(Default)]
pub struct ReadQueue {
    state: Mutex<QueueState>,
    changed: Notify,
    on_progress: Mutex<Option<ProgressCallback>>,
}

impl ReadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a chunk; ignored once the queue is done or failed.
    pub fn push(&self, chunk: Bytes) {
        let (loaded, total) = {
            let mut state = lock(&self.state);
            if state.done || state.error.is_some() {
                return;
            }
            state.loaded += chunk.len() as u64;
            state.chunks.push_back(chunk);
            (state.loaded, state.total)
        };
        self.changed.notify_waiters();
        self.report_progress(loaded, total);
    }

    /// No more chunks will arrive; buffered chunks are still delivered.
    pub fn finish(&self) {
        lock(&self.state).done = true;
        self.changed.notify_waiters();
    }

    pub fn fail(&self, error: PDFError) {
        {
            let mut state = lock(&self.state);
            if state.done {
                return;
            }
            state.error.get_or_insert(error);
        }
        self.changed.notify_waiters();
    }

    /// Drops buffered chunks; later reads report done.
    pub fn cancel(&self) {
        {
            let mut state = lock(&self.state);
            state.chunks.clear();
            state.done = true;
        }
        self.changed.notify_waiters();
    }

    pub fn set_total(&self, total: Option<u64>) {
        lock(&self.state).total = total;
    }

    pub fn loaded(&self) -> u64 {
        lock(&self.state).loaded
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).done
    }

    pub fn set_on_progress(&self, callback: ProgressCallback) {
        *lock(&self.on_progress) = Some(callback);
    }

    fn report_progress(&self, loaded: u64, total: Option<u64>) {
        let callback = lock(&self.on_progress).clone();
        if let Some(callback) = callback {
            callback(loaded, total);
        }
    }

    /// A stored error wins over buffered chunks.
    pub async fn read(&self) -> PDFResult<Option<Bytes>> {
        loop {
            let notified = self.changed.notified();
            {
                let mut state = lock(&self.state);
                if let Some(error) = &state.error {
                    return Err(error.clone());
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    return Ok(Some(chunk));
                }
                if state.done {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }
}

/// The `headers_ready` capability plus the negotiated header values.
#[derive(Default)]
pub struct ReaderHeaders {
    pub ready: Capability<()>,
    values: Mutex<HeaderValues>,
}

#[derive(Debug, Clone, Default)]
pub struct HeaderValues {
    pub content_length: Option<u64>,
    pub filename: Option<String>,
    pub is_range_supported: bool,
    pub is_streaming_supported: bool,
}

impl ReaderHeaders {
    pub fn new(initial: HeaderValues) -> Self {
        ReaderHeaders {
            ready: Capability::new(),
            values: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> HeaderValues {
        lock(&self.values).clone()
    }

    /// Stores the negotiated values and resolves `ready`.
    pub fn publish(&self, values: HeaderValues) {
        *lock(&self.values) = values;
        self.ready.resolve(());
    }

    pub fn update(&self, apply: impl FnOnce(&mut HeaderValues)) {
        apply(&mut lock(&self.values));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_chunks_then_done() {
        let queue = ReadQueue::new();
        queue.push(Bytes::from_static(b"ab"));
        queue.push(Bytes::from_static(b"cd"));
        queue.finish();

        assert_eq!(queue.read().await.unwrap(), Some(Bytes::from_static(b"ab")));
        assert_eq!(queue.read().await.unwrap(), Some(Bytes::from_static(b"cd")));
        assert_eq!(queue.read().await.unwrap(), None);
        assert_eq!(queue.loaded(), 4);
    }

    #[tokio::test]
    async fn test_waiting_reader_is_woken() {
        let queue = Arc::new(ReadQueue::new());
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.read().await })
        };
        tokio::task::yield_now().await;
        queue.push(Bytes::from_static(b"x"));
        assert_eq!(reader.await.unwrap().unwrap(), Some(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_error_is_reported_first() {
        let queue = ReadQueue::new();
        queue.push(Bytes::from_static(b"ab"));
        queue.fail(PDFError::StreamError("reset".into()));
        assert!(queue.read().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_drops_buffer_and_ignores_pushes() {
        let queue = ReadQueue::new();
        queue.push(Bytes::from_static(b"ab"));
        queue.cancel();
        queue.push(Bytes::from_static(b"cd"));
        assert_eq!(queue.read().await.unwrap(), None);
    }

    #[test]
    fn test_progress_reports_running_total() {
        let queue = ReadQueue::new();
        queue.set_total(Some(10));
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        queue.set_on_progress(Arc::new(move |loaded, total| {
            assert_eq!(total, Some(10));
            sink.store(loaded, Ordering::SeqCst);
        }));
        queue.push(Bytes::from_static(b"abc"));
        queue.push(Bytes::from_static(b"de"));
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
