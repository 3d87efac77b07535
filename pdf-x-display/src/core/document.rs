//! Document sessions.
//!
//! [`get_document`] opens a byte source, binds a worker and drives the
//! handshake. The main-side protocol handlers live on [`WorkerTransport`]:
//! they serve the worker's byte reads, forward progress and password
//! prompts, and decode pushed fonts and images into the object pools.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use super::capability::Capability;
use super::config::{DocumentOptions, DocumentSource, MAX_IMAGE_SIZE_TO_CACHE};
use super::error::{PDFError, PDFResult, PasswordReason};
use super::file_stream::PDFFileStream;
use super::font::FontResource;
use super::image::{ImageBitmap, decode_jpeg};
use super::lock;
use super::message_handler::MessageHandler;
use super::object_pool::{PDFObjects, PoolObject};
use super::page::{PDFPageProxy, PageContext, PageInfo, PageRef};
use super::render_task::SurfaceRegistry;
use super::stream_reader::{PDFStream, PDFStreamReader, ProgressCallback};
use super::stream_sink::StreamSink;
use super::transport::{ObjectData, ObjectMessage, Payload};
use super::transport_stream::{PDFDataRangeTransport, PDFDataTransportStream};
use super::worker::{
    DataLoadedInfo, DestinationRequest, DocInfo, DocRequest, FontFallbackRequest, MetadataInfo,
    PDFWorker, PageRequest, PasswordReply, ProgressInfo, RangeRequest, ReaderHeadersInfo,
    StartRenderPageInfo, error_from_payload,
};

/// How long teardown waits for the worker to acknowledge `Terminate`.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the worker's `ready`
    WorkerBooting,
    /// `GetDocRequest` sent, document not parsed yet
    Loading,
    Ready,
    Failed,
    Destroying,
    Destroyed,
}

/// Document-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMetadata {
    pub info: Value,
    pub metadata: Value,
    pub content_disposition_filename: Option<String>,
    pub content_length: Option<u64>,
}

/// Answers a password prompt. Dropping it without answering leaves the
/// load pending until the session is destroyed.
#[derive(Clone)]
pub struct PasswordResponder {
    reply: Capability<String>,
    reason: PDFError,
}

impl PasswordResponder {
    /// Retries opening the document with `password`.
    pub fn respond(&self, password: impl Into<String>) {
        self.reply.resolve(password.into());
    }

    /// Gives up; the load fails with the password error.
    pub fn cancel(&self) {
        self.reply.reject(self.reason.clone());
    }
}

pub type PasswordCallback = Arc<dyn Fn(PasswordReason, PasswordResponder) + Send + Sync>;

struct LoadingShared {
    capability: Capability<PDFDocumentProxy>,
    state: Mutex<SessionState>,
    worker: PDFWorker,
    transport: Mutex<Option<Arc<WorkerTransport>>>,
    destroyed: AtomicBool,
    on_password: Mutex<Option<PasswordCallback>>,
    on_progress: Mutex<Option<ProgressCallback>>,
}

impl LoadingShared {
    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!(from = ?*current, to = ?state, "Session state changed");
            *current = state;
        }
    }

    fn report_progress(&self, loaded: u64, total: Option<u64>) {
        let callback = lock(&self.on_progress).clone();
        if let Some(callback) = callback {
            callback(loaded, total);
        }
    }
}

/// Handle on a document being opened.
#[derive(Clone)]
pub struct PDFDocumentLoadingTask {
    shared: Arc<LoadingShared>,
}

impl PDFDocumentLoadingTask {
    /// Resolves with the document once the worker parsed it.
    pub fn promise(&self) -> impl Future<Output = PDFResult<PDFDocumentProxy>> + Send + 'static + use<> {
        self.shared.capability.promise()
    }

    /// Called when the document needs a password. Without a callback a
    /// password prompt fails the load.
    pub fn on_password<F>(&self, callback: F)
    where
        F: Fn(PasswordReason, PasswordResponder) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_password) = Some(Arc::new(callback));
    }

    /// Called with `(loaded, total)` while the document downloads.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_progress) = Some(Arc::new(callback));
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Aborts loading, or tears down the loaded document. Idempotent.
    pub async fn destroy(&self) -> PDFResult<()> {
        destroy_session(&self.shared).await
    }
}

impl fmt::Debug for PDFDocumentLoadingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PDFDocumentLoadingTask")
            .field("state", &self.state())
            .finish()
    }
}

async fn destroy_session(shared: &Arc<LoadingShared>) -> PDFResult<()> {
    shared.destroyed.store(true, Ordering::SeqCst);
    let transport = lock(&shared.transport).clone();
    match transport {
        Some(transport) => transport.destroy().await?,
        None => {
            shared.worker.destroy();
            shared.set_state(SessionState::Destroyed);
        }
    }
    shared.capability.reject(PDFError::abort("Loading aborted"));
    Ok(())
}

/// Opens `source` through `worker`. Must be called inside a tokio runtime.
///
/// A worker serves a single document; passing one that is already bound
/// fails the returned task.
pub fn get_document(
    source: DocumentSource,
    options: DocumentOptions,
    worker: PDFWorker,
) -> PDFDocumentLoadingTask {
    let shared = Arc::new(LoadingShared {
        capability: Capability::new(),
        state: Mutex::new(SessionState::WorkerBooting),
        worker,
        transport: Mutex::new(None),
        destroyed: AtomicBool::new(false),
        on_password: Mutex::new(None),
        on_progress: Mutex::new(None),
    });

    match Handle::try_current() {
        Ok(runtime) => {
            let opening = Arc::clone(&shared);
            runtime.clone().spawn(async move {
                if let Err(error) = open_session(&opening, source, options, runtime).await {
                    if error.is_cancellation() {
                        debug!(%error, "Document loading stopped");
                    } else {
                        warn!(%error, "Document loading failed");
                    }
                    if opening.capability.reject(error) && !opening.destroyed.load(Ordering::SeqCst) {
                        opening.set_state(SessionState::Failed);
                    }
                }
            });
        }
        Err(error) => {
            shared.capability.reject(PDFError::Generic(format!(
                "get_document requires a tokio runtime: {error}"
            )));
            shared.set_state(SessionState::Failed);
        }
    }

    PDFDocumentLoadingTask { shared }
}

fn create_stream(source: DocumentSource, options: &DocumentOptions) -> PDFResult<Arc<dyn PDFStream>> {
    Ok(match source {
        DocumentSource::Url(url) => network_stream(url, options)?,
        DocumentSource::File(path) => Arc::new(PDFFileStream::new(path, options.clone())),
        DocumentSource::Data(data) => {
            let transport = PDFDataRangeTransport::new(data.len() as u64, Some(data))
                .with_progressive_done(true);
            Arc::new(PDFDataTransportStream::new(Arc::new(transport), true, true))
        }
        DocumentSource::RangeTransport(transport) => Arc::new(PDFDataTransportStream::new(
            transport,
            options.disable_range,
            options.disable_stream,
        )),
    })
}

#[cfg(feature = "network")]
fn network_stream(url: String, options: &DocumentOptions) -> PDFResult<Arc<dyn PDFStream>> {
    Ok(Arc::new(super::network_stream::PDFNetworkStream::new(
        url,
        options.clone(),
    )?))
}

#[cfg(not(feature = "network"))]
fn network_stream(url: String, _options: &DocumentOptions) -> PDFResult<Arc<dyn PDFStream>> {
    Err(PDFError::Generic(format!(
        "Cannot load \"{url}\": built without the network feature"
    )))
}

fn undecodable_image(id: &str, error: &PDFError) -> PDFError {
    PDFError::RenderingError(format!("Image \"{id}\" could not be decoded: {error}"))
}

async fn open_session(
    shared: &Arc<LoadingShared>,
    source: DocumentSource,
    options: DocumentOptions,
    runtime: Handle,
) -> PDFResult<()> {
    shared.worker.bind()?;
    shared.worker.promise().await?;
    if shared.destroyed.load(Ordering::SeqCst) {
        return Err(PDFError::abort("Loading aborted"));
    }

    debug!(?source, "Opening document");
    let stream = create_stream(source, &options)?;
    let transport = WorkerTransport::new(shared, stream, options.clone(), runtime);
    transport.setup_message_handler()?;
    *lock(&shared.transport) = Some(Arc::clone(&transport));
    shared.set_state(SessionState::Loading);

    let request = DocRequest {
        password: options.password.clone(),
        disable_auto_fetch: options.disable_auto_fetch,
        range_chunk_size: options.chunk_size(),
    };
    transport
        .handler
        .send_with_promise("GetDocRequest", Payload::json(&request)?)
        .await?;
    if shared.destroyed.load(Ordering::SeqCst) {
        return Err(PDFError::abort("Loading aborted"));
    }
    Ok(())
}

/// Main side of one document session.
pub(crate) struct WorkerTransport {
    handler: MessageHandler,
    stream: Arc<dyn PDFStream>,
    options: DocumentOptions,
    runtime: Handle,
    loading: Weak<LoadingShared>,
    worker: PDFWorker,
    common_objs: Arc<PDFObjects>,
    registry: SurfaceRegistry,
    full_reader: Mutex<Option<Arc<dyn PDFStreamReader>>>,
    reader_headers: Mutex<Option<ReaderHeadersInfo>>,
    last_progress: Mutex<Option<(u64, Option<u64>)>>,
    page_cache: Mutex<FxHashMap<usize, PDFPageProxy>>,
    page_promises: Mutex<FxHashMap<usize, Capability<PDFPageProxy>>>,
    download_info: Capability<u64>,
    password_reply: Mutex<Option<Capability<String>>>,
    destroyed: AtomicBool,
    destroy_capability: Mutex<Option<Capability<()>>>,
}

impl WorkerTransport {
    fn new(
        shared: &Arc<LoadingShared>,
        stream: Arc<dyn PDFStream>,
        options: DocumentOptions,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(WorkerTransport {
            handler: shared.worker.message_handler().clone(),
            stream,
            options,
            runtime,
            loading: Arc::downgrade(shared),
            worker: shared.worker.clone(),
            common_objs: Arc::new(PDFObjects::new()),
            registry: SurfaceRegistry::new(),
            full_reader: Mutex::new(None),
            reader_headers: Mutex::new(None),
            last_progress: Mutex::new(None),
            page_cache: Mutex::new(FxHashMap::default()),
            page_promises: Mutex::new(FxHashMap::default()),
            download_info: Capability::new(),
            password_reply: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            destroy_capability: Mutex::new(None),
        })
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn setup_message_handler(self: &Arc<Self>) -> PDFResult<()> {
        let handler = &self.handler;

        handler.on_stream("GetReader", {
            let transport = Arc::downgrade(self);
            move |_data: Payload, sink: StreamSink| {
                let opened = upgrade(&transport).and_then(|transport| transport.open_full_reader(&sink));
                async move { opened }
            }
        })?;

        handler.on("ReaderHeadersReady", {
            let transport = Arc::downgrade(self);
            move |_data: Payload| {
                let transport = upgrade(&transport);
                async move { transport?.reader_headers_ready().await }
            }
        })?;

        handler.on_stream("GetRangeReader", {
            let transport = Arc::downgrade(self);
            move |data: Payload, sink: StreamSink| {
                let opened = upgrade(&transport).and_then(|transport| {
                    let range: RangeRequest = data.parse()?;
                    transport.open_range_reader(range, &sink);
                    Ok(())
                });
                async move { opened }
            }
        })?;

        handler.on("GetDoc", {
            let transport = Arc::downgrade(self);
            move |data: Payload| {
                let loaded = upgrade(&transport).and_then(|transport| {
                    let info: DocInfo = data.parse()?;
                    transport.document_loaded(info);
                    Ok(Payload::Null)
                });
                async move { loaded }
            }
        })?;

        handler.on("DocException", {
            let loading = self.loading.clone();
            move |data: Payload| {
                let error = error_from_payload(&data);
                if let Some(loading) = loading.upgrade() {
                    warn!(%error, "Worker failed to load the document");
                    loading.capability.reject(error);
                    loading.set_state(SessionState::Failed);
                }
                async { Ok(Payload::Null) }
            }
        })?;

        handler.on("PasswordRequest", {
            let transport = Arc::downgrade(self);
            move |data: Payload| {
                let error = error_from_payload(&data);
                let transport = upgrade(&transport);
                async move { transport?.request_password(error).await }
            }
        })?;

        handler.on("DataLoaded", {
            let transport = Arc::downgrade(self);
            move |data: Payload| {
                let loaded = data.parse::<DataLoadedInfo>().map(|info| {
                    if let Some(transport) = transport.upgrade() {
                        transport.download_info.resolve(info.length as u64);
                    }
                    Payload::Null
                });
                async move { loaded }
            }
        })?;

        handler.on("DocProgress", {
            let loading = self.loading.clone();
            move |data: Payload| {
                let reported = data.parse::<ProgressInfo>().map(|progress| {
                    if let Some(loading) = loading.upgrade() {
                        loading.report_progress(progress.loaded, progress.total);
                    }
                    Payload::Null
                });
                async move { reported }
            }
        })?;

        handler.on("StartRenderPage", {
            let transport = Arc::downgrade(self);
            move |data: Payload| {
                let started = data.parse::<StartRenderPageInfo>().map(|info| {
                    if let Some(transport) = transport.upgrade() {
                        if transport.is_destroyed() {
                            return Payload::Null;
                        }
                        let page = lock(&transport.page_cache).get(&info.page_index).cloned();
                        match page {
                            Some(page) => page.start_render_page(info.transparency, info.intent),
                            None => warn!(page_index = info.page_index, "StartRenderPage for an unknown page"),
                        }
                    }
                    Payload::Null
                });
                async move { started }
            }
        })?;

        handler.on("commonobj", {
            let transport = Arc::downgrade(self);
            move |data: Payload| {
                let resolved = upgrade(&transport).and_then(|transport| {
                    transport.resolve_common_object(object_message(data)?);
                    Ok(Payload::Null)
                });
                async move { resolved }
            }
        })?;

        handler.on("obj", {
            let transport = Arc::downgrade(self);
            move |data: Payload| {
                let resolved = upgrade(&transport).and_then(|transport| {
                    transport.resolve_page_object(object_message(data)?);
                    Ok(Payload::Null)
                });
                async move { resolved }
            }
        })?;

        Ok(())
    }

    fn open_full_reader(self: &Arc<Self>, sink: &StreamSink) -> PDFResult<()> {
        let reader = self.stream.get_full_reader()?;
        let transport = Arc::downgrade(self);
        reader.set_on_progress(Arc::new(move |loaded, total| {
            if let Some(transport) = transport.upgrade() {
                *lock(&transport.last_progress) = Some((loaded, total));
            }
        }));
        *lock(&self.full_reader) = Some(Arc::clone(&reader));

        sink.on_pull({
            let reader = Arc::clone(&reader);
            let sink = sink.clone();
            move || {
                let reader = Arc::clone(&reader);
                let sink = sink.clone();
                async move {
                    match reader.read().await {
                        Ok(Some(chunk)) => sink.enqueue(Payload::Bytes(chunk), 1),
                        Ok(None) => sink.close(),
                        Err(error) => sink.error(error),
                    }
                    Ok(())
                }
            }
        });
        sink.on_cancel(move |reason| reader.cancel(reason));
        Ok(())
    }

    async fn reader_headers_ready(self: Arc<Self>) -> PDFResult<Payload> {
        let reader = lock(&self.full_reader)
            .clone()
            .ok_or_else(|| PDFError::Protocol("ReaderHeadersReady before GetReader".into()))?;
        reader.headers_ready().await?;

        let info = ReaderHeadersInfo {
            is_streaming_supported: reader.is_streaming_supported(),
            is_range_supported: reader.is_range_supported(),
            content_length: reader.content_length(),
        };
        *lock(&self.reader_headers) = Some(info);
        // Without ranges and streaming the worker reports no progress of
        // its own, so the reader's progress goes straight to the host.
        if !info.is_streaming_supported || !info.is_range_supported {
            if let Some(loading) = self.loading.upgrade() {
                if let Some((loaded, total)) = *lock(&self.last_progress) {
                    loading.report_progress(loaded, total);
                }
                let loading = Arc::downgrade(&loading);
                reader.set_on_progress(Arc::new(move |loaded, total| {
                    if let Some(loading) = loading.upgrade() {
                        loading.report_progress(loaded, total);
                    }
                }));
            }
        }
        Payload::json(&info)
    }

    fn open_range_reader(&self, range: RangeRequest, sink: &StreamSink) {
        let Some(reader) = self.stream.get_range_reader(range.begin, range.end) else {
            trace!(begin = range.begin, end = range.end, "Range already covered by the full reader");
            sink.close();
            return;
        };
        sink.on_pull({
            let reader = Arc::clone(&reader);
            let sink = sink.clone();
            move || {
                let reader = Arc::clone(&reader);
                let sink = sink.clone();
                async move {
                    match reader.read().await {
                        Ok(Some(chunk)) => sink.enqueue(Payload::Bytes(chunk), 1),
                        Ok(None) => sink.close(),
                        Err(error) => sink.error(error),
                    }
                    Ok(())
                }
            }
        });
        sink.on_cancel(move |reason| reader.cancel(reason));
    }

    fn document_loaded(self: &Arc<Self>, info: DocInfo) {
        let Some(loading) = self.loading.upgrade() else {
            return;
        };
        info!(num_pages = info.num_pages, "Document loaded");
        let document = PDFDocumentProxy {
            transport: Arc::clone(self),
            info,
        };
        if loading.capability.resolve(document) {
            loading.set_state(SessionState::Ready);
        }
    }

    async fn request_password(self: Arc<Self>, error: PDFError) -> PDFResult<Payload> {
        let loading = self.loading.upgrade().ok_or_else(|| PDFError::abort("Loading aborted"))?;
        let PDFError::Password { code, .. } = error.clone() else {
            return Err(error);
        };
        let callback = lock(&loading.on_password).clone();
        let Some(callback) = callback else {
            loading.capability.reject(error.clone());
            return Err(error);
        };

        let reply = Capability::new();
        *lock(&self.password_reply) = Some(reply.clone());
        callback(
            code,
            PasswordResponder {
                reply: reply.clone(),
                reason: error.clone(),
            },
        );
        let password = reply.promise().await;
        lock(&self.password_reply).take();
        Payload::json(&PasswordReply { password: password? })
    }

    fn resolve_common_object(&self, message: ObjectMessage) {
        if self.is_destroyed() {
            return;
        }
        let ObjectMessage { id, data, .. } = message;
        if self.common_objs.has(&id) {
            return;
        }
        let object = match data {
            ObjectData::Font(font) => {
                let resource = match FontResource::load(font.clone()) {
                    Ok(resource) => resource,
                    Err(error) => {
                        warn!(%id, %error, "Font failed to load, falling back");
                        self.request_font_fallback(&id);
                        FontResource::fallback(font)
                    }
                };
                PoolObject::Font(Arc::new(resource))
            }
            ObjectData::FontError(wire) => {
                warn!(%id, error = %wire.message, "Error during font loading");
                PoolObject::Font(Arc::new(FontResource::from_error(&id)))
            }
            ObjectData::FontPath(path) => PoolObject::FontPath(Arc::new(path)),
            ObjectData::FontType3Res => PoolObject::FontType3Res,
            image @ (ObjectData::Image(_) | ObjectData::JpegStream(_)) => match decode_image(image) {
                Ok(bitmap) => PoolObject::Image(Arc::new(bitmap)),
                Err(error) => {
                    warn!(%id, %error, "Image could not be decoded");
                    self.common_objs.reject(&id, undecodable_image(&id, &error));
                    return;
                }
            },
        };
        self.common_objs.resolve(&id, object);
    }

    fn request_font_fallback(&self, id: &str) {
        let request = match Payload::json(&FontFallbackRequest { id: id.to_string() }) {
            Ok(request) => request,
            Err(error) => {
                debug!(%id, %error, "Cannot encode FontFallback");
                return;
            }
        };
        let reply = self.handler.send_with_promise("FontFallback", request);
        let id = id.to_string();
        self.runtime.spawn(async move {
            if let Err(error) = reply.await {
                debug!(%id, %error, "FontFallback failed");
            }
        });
    }

    fn resolve_page_object(&self, message: ObjectMessage) {
        if self.is_destroyed() {
            return;
        }
        let ObjectMessage { id, page_index, data } = message;
        let Some(page_index) = page_index else {
            warn!(%id, "Page object without a page index");
            return;
        };
        let page = lock(&self.page_cache).get(&page_index).cloned();
        let Some(page) = page.filter(|page| !page.is_destroyed()) else {
            trace!(%id, page_index, "Object for a page that is gone");
            return;
        };
        if page.objs().has(&id) {
            return;
        }

        match data {
            image @ (ObjectData::Image(_) | ObjectData::JpegStream(_)) => match decode_image(image) {
                Ok(bitmap) => {
                    if bitmap.data.len() as u64 > MAX_IMAGE_SIZE_TO_CACHE {
                        page.set_cleanup_after_render();
                    }
                    page.objs().resolve(&id, PoolObject::Image(Arc::new(bitmap)));
                }
                Err(error) => {
                    warn!(%id, page_index, %error, "Image could not be decoded");
                    page.objs().reject(&id, undecodable_image(&id, &error));
                }
            },
            other => {
                warn!(%id, kind = other.type_name(), "Unexpected page object type");
                page.objs().reject(
                    &id,
                    PDFError::RenderingError(format!("Unexpected {} object \"{id}\"", other.type_name())),
                );
            }
        }
    }

    async fn get_page(self: &Arc<Self>, page_number: usize, num_pages: usize) -> PDFResult<PDFPageProxy> {
        if page_number == 0 || page_number > num_pages {
            return Err(PDFError::Generic("Invalid page request.".into()));
        }
        if self.is_destroyed() {
            return Err(PDFError::abort("Worker was terminated."));
        }
        let page_index = page_number - 1;
        let (capability, fetch) = {
            let mut promises = lock(&self.page_promises);
            match promises.get(&page_index) {
                Some(capability) => (capability.clone(), false),
                None => {
                    let capability = Capability::new();
                    promises.insert(page_index, capability.clone());
                    (capability, true)
                }
            }
        };

        if fetch {
            let transport = Arc::clone(self);
            let pending = capability.clone();
            self.runtime.spawn(async move {
                let outcome = transport.fetch_page(page_index).await;
                if outcome.is_err() {
                    lock(&transport.page_promises).remove(&page_index);
                }
                match outcome {
                    Ok(page) => pending.resolve(page),
                    Err(error) => pending.reject(error),
                };
            });
        }
        capability.promise().await
    }

    async fn fetch_page(self: &Arc<Self>, page_index: usize) -> PDFResult<PDFPageProxy> {
        let info: PageInfo = self
            .handler
            .send_with_promise("GetPage", Payload::json(&PageRequest { page_index })?)
            .await?
            .parse()?;
        if self.is_destroyed() {
            return Err(PDFError::abort("Transport destroyed"));
        }
        let page = PDFPageProxy::new(
            page_index,
            info,
            PageContext {
                handler: self.handler.clone(),
                common_objs: Arc::clone(&self.common_objs),
                registry: self.registry.clone(),
                grace_period: self.options.cancel_grace_period(),
                runtime: self.runtime.clone(),
            },
        );
        lock(&self.page_cache).insert(page_index, page.clone());
        Ok(page)
    }

    async fn query(&self, action: &str, data: Payload) -> PDFResult<Payload> {
        if self.is_destroyed() {
            return Err(PDFError::abort("Worker was terminated."));
        }
        self.handler.send_with_promise(action, data).await
    }

    async fn start_cleanup(&self) -> PDFResult<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        self.handler.send_with_promise("Cleanup", Payload::Null).await?;
        let pages: Vec<_> = lock(&self.page_cache).values().cloned().collect();
        for page in pages {
            if !page.cleanup() {
                debug!(page = page.page_number(), "Cleanup refused while rendering");
                return Err(PDFError::Generic(format!(
                    "startCleanup: Page {} is currently rendering.",
                    page.page_number()
                )));
            }
        }
        self.common_objs.clear();
        Ok(())
    }

    /// Tears the session down. Concurrent and repeated calls share one
    /// teardown.
    async fn destroy(self: &Arc<Self>) -> PDFResult<()> {
        let (capability, first) = {
            let mut slot = lock(&self.destroy_capability);
            match slot.as_ref() {
                Some(capability) => (capability.clone(), false),
                None => {
                    let capability = Capability::new();
                    *slot = Some(capability.clone());
                    (capability, true)
                }
            }
        };
        if !first {
            return capability.promise().await;
        }

        info!("Destroying document session");
        self.destroyed.store(true, Ordering::SeqCst);
        let loading = self.loading.upgrade();
        if let Some(loading) = &loading {
            loading.destroyed.store(true, Ordering::SeqCst);
            loading.set_state(SessionState::Destroying);
        }
        if let Some(reply) = lock(&self.password_reply).take() {
            reply.reject(PDFError::abort(
                "Worker was destroyed during onPassword callback",
            ));
        }

        let pages: Vec<_> = lock(&self.page_cache).drain().map(|(_, page)| page).collect();
        lock(&self.page_promises).clear();
        let terminated = self.handler.send_with_promise("Terminate", Payload::Null);
        join_all(pages.iter().map(|page| page.destroy())).await;
        match tokio::time::timeout(TERMINATE_TIMEOUT, terminated).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => trace!(%error, "Terminate settled with an error"),
            Err(_) => debug!("Worker did not acknowledge Terminate"),
        }

        self.common_objs.clear();
        self.stream
            .cancel_all_requests(PDFError::abort("Worker was terminated."));
        self.handler.destroy();
        self.worker.destroy();
        if let Some(loading) = &loading {
            loading.capability.reject(PDFError::abort("Loading aborted"));
            loading.set_state(SessionState::Destroyed);
        }
        capability.resolve(());
        Ok(())
    }
}

fn upgrade(transport: &Weak<WorkerTransport>) -> PDFResult<Arc<WorkerTransport>> {
    transport
        .upgrade()
        .ok_or_else(|| PDFError::abort("Worker was terminated."))
}

fn object_message(data: Payload) -> PDFResult<ObjectMessage> {
    match data {
        Payload::Object(message) => Ok(message),
        other => Err(PDFError::Protocol(format!(
            "Expected an object payload, got {}",
            other.kind_name()
        ))),
    }
}

fn decode_image(data: ObjectData) -> PDFResult<ImageBitmap> {
    match data {
        ObjectData::Image(image) => image.to_bitmap(),
        ObjectData::JpegStream(jpeg) => decode_jpeg(&jpeg),
        other => Err(PDFError::Protocol(format!(
            "{} is not an image",
            other.type_name()
        ))),
    }
}

/// A loaded document.
#[derive(Clone)]
pub struct PDFDocumentProxy {
    transport: Arc<WorkerTransport>,
    info: DocInfo,
}

impl PDFDocumentProxy {
    pub fn num_pages(&self) -> usize {
        self.info.num_pages
    }

    /// Permanent and changing identifiers from the trailer `/ID`.
    pub fn fingerprints(&self) -> &[Option<String>] {
        &self.info.fingerprints
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.info.fingerprints.first().and_then(|id| id.as_deref())
    }

    /// Range and streaming support negotiated by the full reader.
    pub fn reader_headers(&self) -> Option<ReaderHeadersInfo> {
        *lock(&self.transport.reader_headers)
    }

    /// Page by 1-based number. Repeated requests share one page proxy.
    pub async fn get_page(&self, page_number: usize) -> PDFResult<PDFPageProxy> {
        self.transport.get_page(page_number, self.info.num_pages).await
    }

    pub async fn get_page_index(&self, reference: PageRef) -> PDFResult<usize> {
        self.transport
            .query("GetPageIndex", Payload::json(&reference)?)
            .await?
            .parse()
    }

    pub async fn get_destinations(&self) -> PDFResult<Value> {
        self.json_query("GetDestinations", Payload::Null).await
    }

    pub async fn get_destination(&self, id: &str) -> PDFResult<Value> {
        let request = DestinationRequest { id: id.to_string() };
        self.json_query("GetDestination", Payload::json(&request)?).await
    }

    pub async fn get_page_labels(&self) -> PDFResult<Value> {
        self.json_query("GetPageLabels", Payload::Null).await
    }

    pub async fn get_outline(&self) -> PDFResult<Value> {
        self.json_query("GetOutline", Payload::Null).await
    }

    pub async fn get_permissions(&self) -> PDFResult<Value> {
        self.json_query("GetPermissions", Payload::Null).await
    }

    pub async fn get_attachments(&self) -> PDFResult<Value> {
        self.json_query("GetAttachments", Payload::Null).await
    }

    pub async fn get_stats(&self) -> PDFResult<Value> {
        self.json_query("GetStats", Payload::Null).await
    }

    pub async fn get_metadata(&self) -> PDFResult<DocumentMetadata> {
        let info: MetadataInfo = self
            .transport
            .query("GetMetadata", Payload::Null)
            .await?
            .parse()?;
        let reader = lock(&self.transport.full_reader).clone();
        Ok(DocumentMetadata {
            info: info.info,
            metadata: info.metadata,
            content_disposition_filename: reader.as_ref().and_then(|reader| reader.filename()),
            content_length: reader.as_ref().and_then(|reader| reader.content_length()),
        })
    }

    /// The raw document bytes as assembled by the worker.
    pub async fn get_data(&self) -> PDFResult<Bytes> {
        self.transport
            .query("GetData", Payload::Null)
            .await?
            .into_bytes()
    }

    /// Resolves with the document length once all bytes arrived.
    pub fn get_download_info(&self) -> impl Future<Output = PDFResult<u64>> + Send + 'static + use<> {
        self.transport.download_info.promise()
    }

    /// Frees cached resources on both sides. Fails while a page renders.
    pub async fn cleanup(&self) -> PDFResult<()> {
        self.transport.start_cleanup().await
    }

    /// Destroys the whole session, as the loading task's `destroy` does.
    pub async fn destroy(&self) -> PDFResult<()> {
        self.transport.destroy().await
    }

    pub fn is_destroyed(&self) -> bool {
        self.transport.is_destroyed()
    }

    async fn json_query(&self, action: &str, data: Payload) -> PDFResult<Value> {
        match self.transport.query(action, data).await? {
            Payload::Json(value) => Ok(value),
            Payload::Null => Ok(Value::Null),
            other => Err(PDFError::Protocol(format!(
                "{action} answered with {}",
                other.kind_name()
            ))),
        }
    }
}

impl fmt::Debug for PDFDocumentProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PDFDocumentProxy")
            .field("num_pages", &self.info.num_pages)
            .field("fingerprints", &self.info.fingerprints)
            .finish()
    }
}
