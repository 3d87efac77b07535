//! Byte source fed by the embedding host instead of fetched by us.
//!
//! The host owns a [`PDFDataRangeTransport`], pushes progressive data and
//! answers range requests; [`PDFDataTransportStream`] relays those pushes to
//! the readers the session opened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::error::{PDFError, PDFResult};
use super::lock;
use super::network_utils::is_pdf_file;
use super::stream_reader::{
    PDFStream, PDFStreamRangeReader, PDFStreamReader, ProgressCallback, ReadQueue,
};

type RangeListener = Arc<dyn Fn(u64, Bytes) + Send + Sync>;
type ProgressListener = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;
type ProgressiveReadListener = Arc<dyn Fn(Bytes) + Send + Sync>;
type ProgressiveDoneListener = Arc<dyn Fn() + Send + Sync>;
type RangeRequester = Arc<dyn Fn(u64, u64) + Send + Sync>;

enum TransportEvent {
    Range(u64, Bytes),
    Progress(u64, Option<u64>),
    ProgressiveRead(Bytes),
    ProgressiveDone,
}

#[derive(Default)]
struct Listeners {
    range: Vec<RangeListener>,
    progress: Vec<ProgressListener>,
    progressive_read: Vec<ProgressiveReadListener>,
    progressive_done: Vec<ProgressiveDoneListener>,
    /// Events pushed before `transport_ready`
    pending: Vec<TransportEvent>,
    ready: bool,
}

/// Host-side handle for supplying document bytes.
pub struct PDFDataRangeTransport {
    length: u64,
    initial_data: Option<Bytes>,
    progressive_done: bool,
    content_disposition_filename: Option<String>,
    listeners: Mutex<Listeners>,
    requester: Mutex<Option<RangeRequester>>,
    aborted: AtomicBool,
}

impl PDFDataRangeTransport {
    pub fn new(length: u64, initial_data: Option<Bytes>) -> Self {
        PDFDataRangeTransport {
            length,
            initial_data,
            progressive_done: false,
            content_disposition_filename: None,
            listeners: Mutex::new(Listeners::default()),
            requester: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    /// Marks the initial data as the complete progressive stream.
    pub fn with_progressive_done(mut self, done: bool) -> Self {
        self.progressive_done = done;
        self
    }

    pub fn with_content_disposition_filename(mut self, filename: impl Into<String>) -> Self {
        self.content_disposition_filename = Some(filename.into());
        self
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn initial_data(&self) -> Option<&Bytes> {
        self.initial_data.as_ref()
    }

    /// Installs the host callback that serves `request_data_range`.
    pub fn set_range_requester<F>(&self, requester: F)
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        *lock(&self.requester) = Some(Arc::new(requester));
    }

    pub fn add_range_listener<F>(&self, listener: F)
    where
        F: Fn(u64, Bytes) + Send + Sync + 'static,
    {
        lock(&self.listeners).range.push(Arc::new(listener));
    }

    pub fn add_progress_listener<F>(&self, listener: F)
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        lock(&self.listeners).progress.push(Arc::new(listener));
    }

    pub fn add_progressive_read_listener<F>(&self, listener: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        lock(&self.listeners).progressive_read.push(Arc::new(listener));
    }

    pub fn add_progressive_done_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.listeners).progressive_done.push(Arc::new(listener));
    }

    pub fn on_data_range(&self, begin: u64, chunk: Bytes) {
        self.dispatch(TransportEvent::Range(begin, chunk));
    }

    pub fn on_data_progress(&self, loaded: u64, total: Option<u64>) {
        self.dispatch(TransportEvent::Progress(loaded, total));
    }

    pub fn on_data_progressive_read(&self, chunk: Bytes) {
        self.dispatch(TransportEvent::ProgressiveRead(chunk));
    }

    pub fn on_data_progressive_done(&self) {
        self.dispatch(TransportEvent::ProgressiveDone);
    }

    /// Releases events pushed before a stream was attached.
    pub fn transport_ready(&self) {
        let pending = {
            let mut listeners = lock(&self.listeners);
            listeners.ready = true;
            std::mem::take(&mut listeners.pending)
        };
        for event in pending {
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: TransportEvent) {
        let mut listeners = lock(&self.listeners);
        if !listeners.ready {
            listeners.pending.push(event);
            return;
        }
        match event {
            TransportEvent::Range(begin, chunk) => {
                let targets = listeners.range.clone();
                drop(listeners);
                for listener in targets {
                    listener(begin, chunk.clone());
                }
            }
            TransportEvent::Progress(loaded, total) => {
                let targets = listeners.progress.clone();
                drop(listeners);
                for listener in targets {
                    listener(loaded, total);
                }
            }
            TransportEvent::ProgressiveRead(chunk) => {
                let targets = listeners.progressive_read.clone();
                drop(listeners);
                for listener in targets {
                    listener(chunk.clone());
                }
            }
            TransportEvent::ProgressiveDone => {
                let targets = listeners.progressive_done.clone();
                drop(listeners);
                for listener in targets {
                    listener();
                }
            }
        }
    }

    pub fn request_data_range(&self, begin: u64, end: u64) {
        let requester = lock(&self.requester).clone();
        match requester {
            Some(requester) => requester(begin, end),
            None => warn!(begin, end, "No range requester installed on the data transport"),
        }
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

struct TransportState {
    transport: Arc<PDFDataRangeTransport>,
    is_streaming_supported: bool,
    is_range_supported: bool,
    /// Chunks received before the full reader exists
    queued_chunks: Mutex<Option<Vec<Bytes>>>,
    progressive_done: AtomicBool,
    full_reader: Mutex<Option<Arc<TransportFullReader>>>,
    range_readers: Mutex<Vec<Arc<TransportRangeReader>>>,
}

impl TransportState {
    fn on_receive_data(&self, begin: Option<u64>, chunk: Bytes) {
        match begin {
            None => {
                let full_reader = lock(&self.full_reader);
                match full_reader.as_ref() {
                    Some(reader) => reader.queue.push(chunk),
                    None => {
                        if let Some(queued) = lock(&self.queued_chunks).as_mut() {
                            queued.push(chunk);
                        }
                    }
                }
            }
            Some(begin) => {
                let reader = {
                    let mut readers = lock(&self.range_readers);
                    let position = readers.iter().position(|reader| reader.begin == begin);
                    position.map(|index| readers.remove(index))
                };
                match reader {
                    Some(reader) => {
                        reader.queue.push(chunk);
                        reader.queue.finish();
                    }
                    None => debug!(begin, "No range reader for transported data"),
                }
            }
        }
    }
}

/// [`PDFStream`] over a host-driven [`PDFDataRangeTransport`].
pub struct PDFDataTransportStream {
    state: Arc<TransportState>,
}

impl PDFDataTransportStream {
    pub fn new(
        transport: Arc<PDFDataRangeTransport>,
        disable_range: bool,
        disable_stream: bool,
    ) -> Self {
        let mut queued = Vec::new();
        if let Some(initial) = transport.initial_data().filter(|data| !data.is_empty()) {
            queued.push(initial.clone());
        }

        let state = Arc::new(TransportState {
            is_streaming_supported: !disable_stream,
            is_range_supported: !disable_range,
            queued_chunks: Mutex::new(Some(queued)),
            progressive_done: AtomicBool::new(transport.progressive_done),
            full_reader: Mutex::new(None),
            range_readers: Mutex::new(Vec::new()),
            transport: Arc::clone(&transport),
        });

        let weak: Weak<TransportState> = Arc::downgrade(&state);
        transport.add_range_listener({
            let weak = weak.clone();
            move |begin, chunk| {
                if let Some(state) = weak.upgrade() {
                    state.on_receive_data(Some(begin), chunk);
                }
            }
        });
        transport.add_progress_listener({
            let weak = weak.clone();
            move |loaded, total| {
                let Some(state) = weak.upgrade() else { return };
                if total.is_none() {
                    return;
                }
                let reader = lock(&state.full_reader).clone();
                if let Some(reader) = reader {
                    reader.report_progress(loaded, total);
                }
            }
        });
        transport.add_progressive_read_listener({
            let weak = weak.clone();
            move |chunk| {
                if let Some(state) = weak.upgrade() {
                    state.on_receive_data(None, chunk);
                }
            }
        });
        transport.add_progressive_done_listener(move || {
            let Some(state) = weak.upgrade() else { return };
            let reader = lock(&state.full_reader).clone();
            if let Some(reader) = reader {
                reader.queue.finish();
            }
            state.progressive_done.store(true, Ordering::SeqCst);
        });
        transport.transport_ready();

        PDFDataTransportStream { state }
    }
}

impl PDFStream for PDFDataTransportStream {
    fn get_full_reader(&self) -> PDFResult<Arc<dyn PDFStreamReader>> {
        let mut full_reader = lock(&self.state.full_reader);
        if full_reader.is_some() {
            return Err(PDFError::StreamError(
                "PDFDataTransportStream.getFullReader can only be called once.".into(),
            ));
        }

        let queue = ReadQueue::new();
        queue.set_total(Some(self.state.transport.length()));
        for chunk in lock(&self.state.queued_chunks).take().unwrap_or_default() {
            queue.push(chunk);
        }
        if self.state.progressive_done.load(Ordering::SeqCst) {
            queue.finish();
        }

        let filename = self
            .state
            .transport
            .content_disposition_filename
            .clone()
            .filter(|name| is_pdf_file(name));

        let reader = Arc::new(TransportFullReader {
            queue,
            filename,
            content_length: self.state.transport.length(),
            is_range_supported: self.state.is_range_supported,
            is_streaming_supported: self.state.is_streaming_supported,
            on_progress: Mutex::new(None),
        });
        *full_reader = Some(Arc::clone(&reader));
        Ok(reader)
    }

    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn PDFStreamRangeReader>> {
        if end <= self.progressive_data_length() {
            return None;
        }
        let reader = Arc::new(TransportRangeReader {
            begin,
            queue: ReadQueue::new(),
        });
        lock(&self.state.range_readers).push(Arc::clone(&reader));
        self.state.transport.request_data_range(begin, end);
        Some(reader)
    }

    fn progressive_data_length(&self) -> u64 {
        lock(&self.state.full_reader)
            .as_ref()
            .map_or(0, |reader| reader.queue.loaded())
    }

    fn cancel_all_requests(&self, reason: PDFError) {
        if let Some(reader) = lock(&self.state.full_reader).clone() {
            reader.cancel(reason.clone());
        }
        let readers: Vec<_> = lock(&self.state.range_readers).drain(..).collect();
        for reader in readers {
            reader.cancel(reason.clone());
        }
        self.state.transport.abort();
    }
}

struct TransportFullReader {
    queue: ReadQueue,
    filename: Option<String>,
    content_length: u64,
    is_range_supported: bool,
    is_streaming_supported: bool,
    on_progress: Mutex<Option<ProgressCallback>>,
}

impl TransportFullReader {
    fn report_progress(&self, loaded: u64, total: Option<u64>) {
        let callback = lock(&self.on_progress).clone();
        if let Some(callback) = callback {
            callback(loaded, total);
        }
    }
}

impl PDFStreamReader for TransportFullReader {
    fn headers_ready(&self) -> BoxFuture<'static, PDFResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn filename(&self) -> Option<String> {
        self.filename.clone()
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.content_length)
    }

    fn is_range_supported(&self) -> bool {
        self.is_range_supported
    }

    fn is_streaming_supported(&self) -> bool {
        self.is_streaming_supported
    }

    fn read(&self) -> BoxFuture<'_, PDFResult<Option<Bytes>>> {
        Box::pin(self.queue.read())
    }

    fn cancel(&self, _reason: PDFError) {
        self.queue.cancel();
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        *lock(&self.on_progress) = Some(callback);
    }
}

/// Delivers exactly one host-supplied chunk.
struct TransportRangeReader {
    begin: u64,
    queue: ReadQueue,
}

impl PDFStreamRangeReader for TransportRangeReader {
    fn is_streaming_supported(&self) -> bool {
        false
    }

    fn read(&self) -> BoxFuture<'_, PDFResult<Option<Bytes>>> {
        Box::pin(self.queue.read())
    }

    fn cancel(&self, _reason: PDFError) {
        self.queue.cancel();
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.queue.set_on_progress(callback);
    }
}
