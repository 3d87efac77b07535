//! Producer side of a document session.
//!
//! The worker assembles the document bytes through the main side's
//! `GetReader`/`GetRangeReader` streams, opens the document with a
//! [`DocumentProvider`] and then serves page, metadata, operator-list and
//! text-content requests. Parsing itself happens behind [`PdfDocument`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::capability::Capability;
use super::chunked_stream::ChunkedStream;
use super::error::{PDFError, PDFResult, WireError};
use super::lock;
use super::message_handler::MessageHandler;
use super::operator_list::{OpArgs, OpCode, OperatorListWriter};
use super::page::{PageInfo, PageRef, RenderIntent};
use super::readable_stream::{QueueingStrategy, ReadableStream};
use super::stream_sink::StreamSink;
use super::text_content::{TextContentParams, TextContentWriter};
use super::transport::{MessagePort, ObjectData, ObjectMessage, Payload};

/// Contiguous chunks fetched by one range request.
const RANGE_CHUNKS_PER_REQUEST: usize = 8;

/// What the worker hands to the parser.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub data: Bytes,
    pub password: Option<String>,
    /// The host asked not to prefetch data the parser does not need yet.
    pub disable_auto_fetch: bool,
}

/// Opens parsed documents from their bytes.
///
/// A wrong or missing password is reported as [`PDFError::Password`]; the
/// worker then asks the main side for a password and calls `open` again.
pub trait DocumentProvider: Send + Sync + 'static {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, PDFResult<Arc<dyn PdfDocument>>>;
}

/// A parsed document, as seen by the worker.
pub trait PdfDocument: Send + Sync {
    fn num_pages(&self) -> usize;

    /// Permanent and changing identifiers from the trailer `ID` array.
    fn fingerprints(&self) -> Vec<Option<String>>;

    fn page_info(&self, page_index: usize) -> PDFResult<PageInfo>;

    fn page_index(&self, reference: PageRef) -> PDFResult<usize> {
        Err(PDFError::Generic(format!(
            "Invalid pageIndex request for {} {} R.",
            reference.num, reference.r#gen
        )))
    }

    /// Whether the page uses blend modes or soft masks.
    fn has_transparency(&self, _page_index: usize) -> bool {
        false
    }

    /// Evaluates a page into `evaluation`. Ops may be pushed in any number
    /// of batches; await [`PageEvaluation::ready`] between batches to honor
    /// the consumer's backpressure.
    fn operator_list<'a>(
        &'a self,
        page_index: usize,
        evaluation: &'a mut PageEvaluation,
    ) -> BoxFuture<'a, PDFResult<()>>;

    fn text_content<'a>(
        &'a self,
        page_index: usize,
        params: TextContentParams,
        writer: &'a mut TextContentWriter,
    ) -> BoxFuture<'a, PDFResult<()>>;

    fn destinations(&self) -> PDFResult<Value> {
        Ok(Value::Null)
    }

    fn destination(&self, _id: &str) -> PDFResult<Value> {
        Ok(Value::Null)
    }

    fn page_labels(&self) -> PDFResult<Value> {
        Ok(Value::Null)
    }

    fn outline(&self) -> PDFResult<Value> {
        Ok(Value::Null)
    }

    fn permissions(&self) -> PDFResult<Value> {
        Ok(Value::Null)
    }

    fn attachments(&self) -> PDFResult<Value> {
        Ok(Value::Null)
    }

    /// The document information dictionary.
    fn info(&self) -> PDFResult<Value> {
        Ok(Value::Null)
    }

    /// The XMP metadata stream, if any.
    fn metadata(&self) -> PDFResult<Value> {
        Ok(Value::Null)
    }

    fn stats(&self) -> Value {
        Value::Null
    }

    /// The main side could not load font `id`; resend it in a form the
    /// host can draw with.
    fn font_fallback(&self, _id: &str, _handler: &MessageHandler) -> PDFResult<()> {
        Ok(())
    }

    /// Drops caches that can be rebuilt.
    fn cleanup(&self) {}
}

/// Operator-list output of one page evaluation.
pub struct PageEvaluation {
    page_index: usize,
    intent: RenderIntent,
    writer: OperatorListWriter,
    sink: StreamSink,
    handler: MessageHandler,
}

impl PageEvaluation {
    pub(crate) fn new(
        page_index: usize,
        intent: RenderIntent,
        sink: StreamSink,
        handler: MessageHandler,
    ) -> Self {
        PageEvaluation {
            page_index,
            intent,
            writer: OperatorListWriter::new(sink.clone()),
            sink,
            handler,
        }
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn intent(&self) -> RenderIntent {
        self.intent
    }

    pub fn add_op(&mut self, op: OpCode, args: OpArgs) {
        self.writer.add_op(op, args);
    }

    pub fn add_dependency(&mut self, id: &str) {
        self.writer.add_dependency(id);
    }

    pub fn total_length(&self) -> usize {
        self.writer.total_length()
    }

    /// Waits until the consumer can take more chunks.
    pub async fn ready(&self) -> PDFResult<()> {
        self.writer.ready().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.writer.is_cancelled()
    }

    /// Pushes a document-scoped object (`commonobj`).
    pub fn send_common_object(&self, id: &str, data: ObjectData) -> PDFResult<()> {
        self.handler.send(
            "commonobj",
            Payload::Object(ObjectMessage {
                id: id.to_string(),
                page_index: None,
                data,
            }),
        )
    }

    /// Pushes a page-scoped object (`obj`).
    pub fn send_page_object(&self, id: &str, data: ObjectData) -> PDFResult<()> {
        self.handler.send(
            "obj",
            Payload::Object(ObjectMessage {
                id: id.to_string(),
                page_index: Some(self.page_index),
                data,
            }),
        )
    }

    fn finish(mut self) {
        self.writer.flush(true);
        self.sink.close();
    }
}

// Protocol payloads shared by both sides.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DocRequest {
    pub password: Option<String>,
    pub disable_auto_fetch: bool,
    pub range_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DocInfo {
    pub num_pages: usize,
    pub fingerprints: Vec<Option<String>>,
}

/// What the full reader learned from the source once its headers arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderHeadersInfo {
    pub is_streaming_supported: bool,
    pub is_range_supported: bool,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct RangeRequest {
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct ProgressInfo {
    pub loaded: u64,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct PageRequest {
    pub page_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OperatorListRequest {
    pub page_index: usize,
    pub intent: RenderIntent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TextContentRequest {
    pub page_index: usize,
    pub params: TextContentParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StartRenderPageInfo {
    pub transparency: bool,
    pub page_index: usize,
    pub intent: RenderIntent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PasswordReply {
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DestinationRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FontFallbackRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MetadataInfo {
    pub info: Value,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct DataLoadedInfo {
    pub length: usize,
}

struct WorkerSession {
    handler: MessageHandler,
    provider: Arc<dyn DocumentProvider>,
    document: Capability<Arc<dyn PdfDocument>>,
    data: Mutex<Option<Bytes>>,
    requested: AtomicBool,
    terminated: AtomicBool,
    loading: Mutex<Option<AbortHandle>>,
}

impl WorkerSession {
    fn ensure_not_terminated(&self) -> PDFResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(PDFError::abort("Worker was terminated."));
        }
        Ok(())
    }

    fn document(&self) -> impl Future<Output = PDFResult<Arc<dyn PdfDocument>>> + Send + 'static + use<> {
        self.document.promise()
    }

    async fn load(self: Arc<Self>, request: DocRequest) {
        let outcome = self.load_document(request).await;
        match outcome {
            Ok(document) => {
                let info = DocInfo {
                    num_pages: document.num_pages(),
                    fingerprints: document.fingerprints(),
                };
                self.document.resolve(document);
                let sent = Payload::json(&info).and_then(|info| self.handler.send("GetDoc", info));
                if let Err(error) = sent {
                    debug!(%error, "Dropping GetDoc");
                }
            }
            Err(error) => {
                if self.terminated.load(Ordering::SeqCst) {
                    debug!(%error, "Document load stopped by termination");
                    return;
                }
                warn!(%error, "Document load failed");
                self.document.reject(error.clone());
                let sent = Payload::json(&error.to_wire())
                    .and_then(|wire| self.handler.send("DocException", wire));
                if let Err(error) = sent {
                    debug!(%error, "Dropping DocException");
                }
            }
        }
    }

    async fn load_document(&self, request: DocRequest) -> PDFResult<Arc<dyn PdfDocument>> {
        let data = fetch_document(&self.handler, request.range_chunk_size).await?;
        self.ensure_not_terminated()?;
        *lock(&self.data) = Some(data.clone());
        if let Err(error) = Payload::json(&DataLoadedInfo { length: data.len() })
            .and_then(|info| self.handler.send("DataLoaded", info))
        {
            debug!(%error, "Dropping DataLoaded");
        }

        let mut password = request.password;
        loop {
            self.ensure_not_terminated()?;
            let opened = self
                .provider
                .open(OpenRequest {
                    data: data.clone(),
                    password: password.clone(),
                    disable_auto_fetch: request.disable_auto_fetch,
                })
                .await;
            match opened {
                Ok(document) => return Ok(document),
                Err(error @ PDFError::Password { .. }) => {
                    let reply = self
                        .handler
                        .send_with_promise("PasswordRequest", Payload::json(&error.to_wire())?)
                        .await
                        .map_err(|_| error)?;
                    password = Some(reply.parse::<PasswordReply>()?.password);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if let Some(loading) = lock(&self.loading).take() {
            loading.abort();
        }
        self.document
            .reject(PDFError::abort("Worker was terminated."));
        lock(&self.data).take();
    }
}

/// Reads the whole document through the main side's readers.
async fn fetch_document(handler: &MessageHandler, range_chunk_size: usize) -> PDFResult<Bytes> {
    let full = handler.send_with_stream("GetReader", Payload::Null, QueueingStrategy::default());
    let headers: ReaderHeadersInfo = handler
        .send_with_promise("ReaderHeadersReady", Payload::Null)
        .await?
        .parse()?;
    debug!(
        is_range_supported = headers.is_range_supported,
        is_streaming_supported = headers.is_streaming_supported,
        content_length = headers.content_length,
        "Reader headers ready"
    );

    match headers.content_length {
        Some(length) if headers.is_range_supported => {
            fetch_by_ranges(handler, full, length as usize, range_chunk_size).await
        }
        _ => read_whole(handler, &full, headers).await,
    }
}

async fn read_whole(
    handler: &MessageHandler,
    full: &ReadableStream,
    headers: ReaderHeadersInfo,
) -> PDFResult<Bytes> {
    let mut data = BytesMut::with_capacity(headers.content_length.unwrap_or(0) as usize);
    while let Some(chunk) = full.read().await? {
        data.extend_from_slice(&chunk.into_bytes()?);
        if !headers.is_streaming_supported {
            let loaded = data.len() as u64;
            let progress = ProgressInfo {
                loaded,
                total: Some(loaded.max(headers.content_length.unwrap_or(0))),
            };
            handler.send("DocProgress", Payload::json(&progress)?)?;
        }
    }
    if let Some(length) = headers.content_length {
        if length != data.len() as u64 {
            warn!(
                reported = length,
                actual = data.len(),
                "Reported HTTP length is different from actual"
            );
        }
    }
    Ok(data.freeze())
}

/// Chunk bookkeeping shared by the progressive pump and the range loop.
struct Assembly {
    stream: Mutex<ChunkedStream>,
    changed: Notify,
    full_done: AtomicBool,
}

async fn fetch_by_ranges(
    handler: &MessageHandler,
    full: ReadableStream,
    length: usize,
    chunk_size: usize,
) -> PDFResult<Bytes> {
    let assembly = Arc::new(Assembly {
        stream: Mutex::new(ChunkedStream::new(length, chunk_size)),
        changed: Notify::new(),
        full_done: AtomicBool::new(false),
    });
    let full = Arc::new(full);

    let pump = tokio::spawn({
        let assembly = Arc::clone(&assembly);
        let full = Arc::clone(&full);
        async move {
            loop {
                match full.read().await {
                    Ok(Some(chunk)) => {
                        let received = chunk
                            .into_bytes()
                            .and_then(|bytes| lock(&assembly.stream).on_receive_progressive_data(&bytes));
                        if let Err(error) = received {
                            warn!(%error, "Dropping progressive data");
                        }
                        assembly.changed.notify_waiters();
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!(%error, "Full reader stopped, continuing with range requests");
                        break;
                    }
                }
            }
            assembly.full_done.store(true, Ordering::SeqCst);
            assembly.changed.notify_waiters();
        }
    });

    let fetched = fetch_missing_ranges(handler, &assembly, length).await;

    if !pump.is_finished() {
        pump.abort();
        if let Err(error) = full.cancel(PDFError::abort("Document data is loaded.")).await {
            debug!(%error, "Full reader cancel failed");
        }
    }
    fetched?;

    let stream = std::mem::replace(&mut *lock(&assembly.stream), ChunkedStream::new(0, 1));
    stream.into_bytes()
}

async fn fetch_missing_ranges(
    handler: &MessageHandler,
    assembly: &Assembly,
    length: usize,
) -> PDFResult<()> {
    loop {
        let notified = assembly.changed.notified();
        let next = {
            let stream = lock(&assembly.stream);
            if stream.is_data_loaded() {
                return Ok(());
            }
            stream.missing_ranges(RANGE_CHUNKS_PER_REQUEST).first().copied()
        };
        let Some((begin, end)) = next else {
            return Ok(());
        };

        let data = fetch_range(handler, begin as u64, end as u64).await?;
        if data.is_empty() {
            // The source declined the range because the full reader
            // already covers it.
            if assembly.full_done.load(Ordering::SeqCst) {
                return Err(PDFError::StreamError(format!(
                    "No data received for range {begin}-{end}"
                )));
            }
            notified.await;
            continue;
        }
        if data.len() != end - begin {
            return Err(PDFError::StreamError(format!(
                "Range {begin}-{end} returned {} bytes",
                data.len()
            )));
        }

        let loaded = {
            let mut stream = lock(&assembly.stream);
            stream.on_receive_data(begin, &data)?;
            stream.loaded_bytes()
        };
        let progress = ProgressInfo {
            loaded: loaded as u64,
            total: Some(length as u64),
        };
        handler.send("DocProgress", Payload::json(&progress)?)?;
    }
}

async fn fetch_range(handler: &MessageHandler, begin: u64, end: u64) -> PDFResult<Bytes> {
    let stream = handler.send_with_stream(
        "GetRangeReader",
        Payload::json(&RangeRequest { begin, end })?,
        QueueingStrategy::default(),
    );
    let mut data = BytesMut::new();
    while let Some(chunk) = stream.read().await? {
        data.extend_from_slice(&chunk.into_bytes()?);
    }
    Ok(data.freeze())
}

/// Registers the worker-side actions on `handler`.
pub fn setup_worker(handler: &MessageHandler, provider: Arc<dyn DocumentProvider>) -> PDFResult<()> {
    let session = Arc::new(WorkerSession {
        handler: handler.clone(),
        provider,
        document: Capability::new(),
        data: Mutex::new(None),
        requested: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
        loading: Mutex::new(None),
    });

    handler.on("GetDocRequest", {
        let session = Arc::clone(&session);
        move |data: Payload| {
            let session = Arc::clone(&session);
            let accepted = data.parse::<DocRequest>().and_then(|request| {
                session.ensure_not_terminated()?;
                if session.requested.swap(true, Ordering::SeqCst) {
                    return Err(PDFError::Protocol(
                        "GetDocRequest was already received".into(),
                    ));
                }
                let task = tokio::spawn(Arc::clone(&session).load(request));
                *lock(&session.loading) = Some(task.abort_handle());
                Ok(())
            });
            async move { accepted.map(|()| Payload::Null) }
        }
    })?;

    handler.on("GetPage", {
        let session = Arc::clone(&session);
        move |data: Payload| {
            let document = session.document();
            async move {
                let request: PageRequest = data.parse()?;
                let document = document.await?;
                Payload::json(&document.page_info(request.page_index)?)
            }
        }
    })?;

    handler.on("GetPageIndex", {
        let session = Arc::clone(&session);
        move |data: Payload| {
            let document = session.document();
            async move {
                let reference: PageRef = data.parse()?;
                Payload::json(&document.await?.page_index(reference)?)
            }
        }
    })?;

    handler.on("GetDestination", {
        let session = Arc::clone(&session);
        move |data: Payload| {
            let document = session.document();
            async move {
                let request: DestinationRequest = data.parse()?;
                Ok(Payload::Json(document.await?.destination(&request.id)?))
            }
        }
    })?;

    register_document_query(handler, &session, "GetDestinations", |document| {
        document.destinations()
    })?;
    register_document_query(handler, &session, "GetPageLabels", |document| {
        document.page_labels()
    })?;
    register_document_query(handler, &session, "GetOutline", |document| document.outline())?;
    register_document_query(handler, &session, "GetPermissions", |document| {
        document.permissions()
    })?;
    register_document_query(handler, &session, "GetAttachments", |document| {
        document.attachments()
    })?;
    register_document_query(handler, &session, "GetStats", |document| Ok(document.stats()))?;
    register_document_query(handler, &session, "GetMetadata", |document| {
        Ok(serde_json::to_value(MetadataInfo {
            info: document.info()?,
            metadata: document.metadata()?,
        })?)
    })?;

    handler.on("GetData", {
        let session = Arc::clone(&session);
        move |_data: Payload| {
            let data = lock(&session.data).clone();
            async move {
                data.map(Payload::Bytes)
                    .ok_or_else(|| PDFError::Generic("Document data is not loaded yet.".into()))
            }
        }
    })?;

    handler.on_stream("GetOperatorList", {
        let session = Arc::clone(&session);
        move |data: Payload, sink: StreamSink| {
            let session = Arc::clone(&session);
            async move {
                let request: OperatorListRequest = data.parse()?;
                tokio::spawn(serve_operator_list(session, request, sink));
                Ok(())
            }
        }
    })?;

    handler.on_stream("GetTextContent", {
        let session = Arc::clone(&session);
        move |data: Payload, sink: StreamSink| {
            let document = session.document();
            async move {
                let request: TextContentRequest = data.parse()?;
                tokio::spawn(async move {
                    let outcome = async {
                        let document = document.await?;
                        let mut writer = TextContentWriter::new(sink.clone());
                        document
                            .text_content(request.page_index, request.params, &mut writer)
                            .await?;
                        writer.flush();
                        PDFResult::Ok(())
                    }
                    .await;
                    match outcome {
                        Ok(()) => sink.close(),
                        Err(error) => sink.error(error),
                    }
                });
                Ok(())
            }
        }
    })?;

    handler.on("FontFallback", {
        let session = Arc::clone(&session);
        move |data: Payload| {
            let document = session.document();
            let handler = session.handler.clone();
            async move {
                let request: FontFallbackRequest = data.parse()?;
                document.await?.font_fallback(&request.id, &handler)?;
                Ok(Payload::Null)
            }
        }
    })?;

    handler.on("Cleanup", {
        let session = Arc::clone(&session);
        move |_data: Payload| {
            let document = session.document.try_get();
            async move {
                if let Some(Ok(document)) = document {
                    document.cleanup();
                }
                Ok(Payload::Null)
            }
        }
    })?;

    handler.on("Terminate", {
        let session = Arc::clone(&session);
        move |_data: Payload| {
            info!("Terminating worker session");
            session.terminate();
            let handler = session.handler.clone();
            async move {
                handler.destroy();
                Ok(Payload::Null)
            }
        }
    })?;

    // Drop the registered closures once the peer goes away.
    let closed = handler.closed();
    let handler = handler.clone();
    tokio::spawn(async move {
        closed.await;
        handler.destroy();
    });

    Ok(())
}

fn register_document_query<F>(
    handler: &MessageHandler,
    session: &Arc<WorkerSession>,
    action: &str,
    query: F,
) -> PDFResult<()>
where
    F: Fn(&dyn PdfDocument) -> PDFResult<Value> + Send + Sync + 'static,
{
    let query = Arc::new(query);
    let session = Arc::clone(session);
    handler.on(action, move |_data: Payload| {
        let document = session.document();
        let query = Arc::clone(&query);
        async move {
            let document = document.await?;
            Ok(Payload::Json(query(document.as_ref())?))
        }
    })
}

async fn serve_operator_list(session: Arc<WorkerSession>, request: OperatorListRequest, sink: StreamSink) {
    let page_index = request.page_index;
    let outcome = async {
        let document = session.document().await?;
        let start = StartRenderPageInfo {
            transparency: document.has_transparency(page_index),
            page_index,
            intent: request.intent,
        };
        session.handler.send("StartRenderPage", Payload::json(&start)?)?;

        let mut evaluation =
            PageEvaluation::new(page_index, request.intent, sink.clone(), session.handler.clone());
        document.operator_list(page_index, &mut evaluation).await?;
        debug!(page_index, length = evaluation.total_length(), "Operator list complete");
        evaluation.finish();
        PDFResult::Ok(())
    }
    .await;

    if let Err(error) = outcome {
        if sink.is_cancelled() || error.is_cancellation() {
            debug!(page_index, %error, "Operator list stopped");
        } else {
            warn!(page_index, %error, "Operator list failed");
        }
        sink.error(error);
    }
}

struct WorkerInner {
    handler: MessageHandler,
    ready: Capability<()>,
    in_use: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Main-side handle on a worker context.
#[derive(Clone)]
pub struct PDFWorker {
    inner: Arc<WorkerInner>,
}

impl PDFWorker {
    /// Runs the worker on the current runtime.
    pub fn loopback(provider: Arc<dyn DocumentProvider>) -> PDFResult<PDFWorker> {
        let (main_port, worker_port) = MessagePort::pair();
        let worker = PDFWorker::connect(main_port, None)?;

        let handler = MessageHandler::new("worker", "main", worker_port);
        setup_worker(&handler, provider)?;
        handler.send("ready", Payload::Null)?;
        Ok(worker)
    }

    /// Runs the worker on a dedicated thread with its own runtime.
    pub fn spawn_thread(provider: Arc<dyn DocumentProvider>) -> PDFResult<PDFWorker> {
        let (main_port, worker_port) = MessagePort::pair();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread = std::thread::Builder::new()
            .name("pdf-worker".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let handler = MessageHandler::new("worker", "main", worker_port);
                    let booted = setup_worker(&handler, provider)
                        .and_then(|()| handler.send("ready", Payload::Null));
                    if let Err(error) = booted {
                        warn!(%error, "Worker failed to boot");
                        return;
                    }
                    handler.closed().await;
                    debug!("Worker thread exiting");
                });
            })?;

        PDFWorker::connect(main_port, Some(thread))
    }

    fn connect(port: MessagePort, thread: Option<JoinHandle<()>>) -> PDFResult<PDFWorker> {
        let handler = MessageHandler::new("main", "worker", port);
        let ready = Capability::new();
        handler.on("ready", {
            let ready = ready.clone();
            move |_data: Payload| {
                ready.resolve(());
                async { Ok(Payload::Null) }
            }
        })?;
        Ok(PDFWorker {
            inner: Arc::new(WorkerInner {
                handler,
                ready,
                in_use: AtomicBool::new(false),
                thread: Mutex::new(thread),
            }),
        })
    }

    /// Resolves once the worker has booted.
    pub fn promise(&self) -> impl Future<Output = PDFResult<()>> + Send + 'static + use<> {
        self.inner.ready.promise()
    }

    pub fn message_handler(&self) -> &MessageHandler {
        &self.inner.handler
    }

    /// A worker serves one document; binding it twice fails.
    pub(crate) fn bind(&self) -> PDFResult<()> {
        if self.inner.in_use.swap(true, Ordering::SeqCst) {
            return Err(PDFError::Generic("PDFWorker is already in use.".into()));
        }
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.handler.is_destroyed()
    }

    pub fn destroy(&self) {
        self.inner.ready.reject(PDFError::abort("Worker was destroyed."));
        self.inner.handler.destroy();
        // The worker thread exits once its handler sees the closed port.
        lock(&self.inner.thread).take();
    }
}

/// Rebuilds the error of a `PasswordRequest` or `DocException` payload.
pub(crate) fn error_from_payload(data: &Payload) -> PDFError {
    match data.parse::<WireError>() {
        Ok(wire) => PDFError::from_wire(&wire),
        Err(error) => error,
    }
}
