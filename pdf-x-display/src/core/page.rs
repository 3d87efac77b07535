//! Main-side page proxies.
//!
//! A page keeps one operator-list state per [`RenderIntent`]. The first
//! render (or operator-list request) of an intent opens a `GetOperatorList`
//! stream; later render tasks of the same intent share the chunks already
//! received. The intent state is dropped again once it has no render tasks
//! and its list is complete, and the page-scoped object pool goes with it.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::capability::Capability;
use super::config::TEXT_CONTENT_CHUNK_SIZE;
use super::error::{PDFError, PDFResult};
use super::lock;
use super::message_handler::MessageHandler;
use super::object_pool::PDFObjects;
use super::operator_list::{OperatorList, OperatorListChunk};
use super::readable_stream::{QueueingStrategy, ReadableStream};
use super::render_task::{
    InternalRenderTask, RenderParameters, RenderTask, SharedOperatorList, SurfaceRegistry,
    TaskSetup,
};
use super::text_content::{TextContent, TextContentParams};
use super::transport::Payload;
use super::worker::{OperatorListRequest, TextContentRequest};
use crate::rendering::viewport::{PageViewport, ViewportParameters};

/// What an operator list is produced for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderIntent {
    #[default]
    #[serde(rename = "display")]
    Display,
    #[serde(rename = "print")]
    Print,
    /// Display operator list requested without rendering
    #[serde(rename = "oplist")]
    OperatorList,
    /// Print operator list requested without rendering
    #[serde(rename = "print_oplist")]
    PrintOperatorList,
}

impl RenderIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderIntent::Display => "display",
            RenderIntent::Print => "print",
            RenderIntent::OperatorList => "oplist",
            RenderIntent::PrintOperatorList => "print_oplist",
        }
    }

    pub fn is_print(self) -> bool {
        matches!(self, RenderIntent::Print | RenderIntent::PrintOperatorList)
    }

    /// The standalone operator-list counterpart, cached apart from renders.
    pub fn for_operator_list(self) -> Self {
        if self.is_print() {
            RenderIntent::PrintOperatorList
        } else {
            RenderIntent::OperatorList
        }
    }
}

impl fmt::Display for RenderIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indirect reference of a page object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRef {
    pub num: u32,
    pub r#gen: u32,
}

/// Static page properties sent by the worker in answer to `GetPage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageInfo {
    /// Degrees, normalized to 0, 90, 180 or 270
    pub rotate: i32,
    pub reference: Option<PageRef>,
    pub user_unit: f64,
    /// MediaBox intersected with CropBox
    pub view: [f64; 4],
}

impl Default for PageInfo {
    fn default() -> Self {
        PageInfo {
            rotate: 0,
            reference: None,
            user_unit: 1.0,
            view: [0.0, 0.0, 612.0, 792.0],
        }
    }
}

/// Maps any multiple of 90 into `0..360`; other values become 0.
pub fn normalize_rotation(rotate: i32) -> i32 {
    if rotate % 90 != 0 {
        0
    } else {
        rotate.rem_euclid(360)
    }
}

struct IntentState {
    id: u64,
    operator_list: SharedOperatorList,
    /// Settled with the page's transparency by `StartRenderPage`
    display_ready: Option<Capability<bool>>,
    op_list_read: Option<Capability<OperatorList>>,
    render_tasks: Vec<Arc<InternalRenderTask>>,
    stream: Option<Arc<ReadableStream>>,
    cancel_timeout: Option<AbortHandle>,
}

impl IntentState {
    fn new(id: u64) -> Self {
        IntentState {
            id,
            operator_list: Arc::new(Mutex::new(OperatorList::new())),
            display_ready: None,
            op_list_read: None,
            render_tasks: Vec::new(),
            stream: None,
            cancel_timeout: None,
        }
    }
}

#[derive(Default)]
struct PageState {
    intents: FxHashMap<RenderIntent, IntentState>,
    pending_cleanup: bool,
    destroyed: bool,
}

pub(crate) struct PageContext {
    pub handler: MessageHandler,
    pub common_objs: Arc<PDFObjects>,
    pub registry: SurfaceRegistry,
    pub grace_period: Duration,
    pub runtime: Handle,
}

struct PageInner {
    page_index: usize,
    info: PageInfo,
    handler: MessageHandler,
    common_objs: Arc<PDFObjects>,
    objs: Arc<PDFObjects>,
    registry: SurfaceRegistry,
    grace_period: Duration,
    runtime: Handle,
    /// Set when a large image was decoded for this page.
    cleanup_after_render: AtomicBool,
    next_intent_id: AtomicU64,
    state: Mutex<PageState>,
}

/// Proxy for one page of a loaded document.
#[derive(Clone)]
pub struct PDFPageProxy {
    inner: Arc<PageInner>,
}

impl PDFPageProxy {
    pub(crate) fn new(page_index: usize, info: PageInfo, context: PageContext) -> Self {
        let info = PageInfo {
            rotate: normalize_rotation(info.rotate),
            ..info
        };
        PDFPageProxy {
            inner: Arc::new(PageInner {
                page_index,
                info,
                handler: context.handler,
                common_objs: context.common_objs,
                objs: Arc::new(PDFObjects::new()),
                registry: context.registry,
                grace_period: context.grace_period,
                runtime: context.runtime,
                cleanup_after_render: AtomicBool::new(false),
                next_intent_id: AtomicU64::new(1),
                state: Mutex::new(PageState::default()),
            }),
        }
    }

    /// 1-based.
    pub fn page_number(&self) -> usize {
        self.inner.page_index + 1
    }

    pub fn page_index(&self) -> usize {
        self.inner.page_index
    }

    pub fn rotate(&self) -> i32 {
        self.inner.info.rotate
    }

    pub fn reference(&self) -> Option<PageRef> {
        self.inner.info.reference
    }

    pub fn user_unit(&self) -> f64 {
        self.inner.info.user_unit
    }

    pub fn view(&self) -> [f64; 4] {
        self.inner.info.view
    }

    /// Viewport at `scale`, rotated by the page's own rotation unless
    /// `rotation` overrides it.
    pub fn get_viewport(&self, scale: f64, rotation: Option<i32>) -> PDFResult<PageViewport> {
        PageViewport::new(ViewportParameters {
            view_box: self.view(),
            scale,
            rotation: rotation.unwrap_or_else(|| self.rotate()),
            ..Default::default()
        })
    }

    pub(crate) fn objs(&self) -> &Arc<PDFObjects> {
        &self.inner.objs
    }

    pub(crate) fn set_cleanup_after_render(&self) {
        self.inner.cleanup_after_render.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner.state).destroyed
    }

    /// Whether `intent` has been reported display-ready by the worker.
    pub fn is_display_ready(&self, intent: RenderIntent) -> bool {
        lock(&self.inner.state)
            .intents
            .get(&intent)
            .and_then(|state| state.display_ready.as_ref())
            .is_some_and(|ready| ready.settled())
    }

    /// Starts drawing the page onto `params.surface`.
    ///
    /// Fails immediately if the surface is already used by another render
    /// of this session; nothing is sent to the worker in that case.
    pub fn render(&self, params: RenderParameters) -> PDFResult<RenderTask> {
        let inner = &self.inner;
        let surface_lock = inner.registry.acquire(&params.surface)?;
        let intent = params.intent;

        let (task, intent_id, display_ready, start_pump) = {
            let mut state = lock(&inner.state);
            if state.destroyed {
                return Err(PDFError::Generic("Page was destroyed.".into()));
            }
            state.pending_cleanup = false;
            let intent_state = state
                .intents
                .entry(intent)
                .or_insert_with(|| IntentState::new(inner.next_intent_id.fetch_add(1, Ordering::SeqCst)));
            if let Some(timeout) = intent_state.cancel_timeout.take() {
                timeout.abort();
            }

            let start_pump = intent_state.display_ready.is_none();
            let display_ready = intent_state
                .display_ready
                .get_or_insert_with(Capability::new)
                .clone();
            if start_pump {
                *lock(&intent_state.operator_list) = OperatorList::new();
            }

            let intent_id = intent_state.id;
            let page = Arc::downgrade(inner);
            let task = InternalRenderTask::new(
                TaskSetup {
                    page_index: inner.page_index,
                    operator_list: Arc::clone(&intent_state.operator_list),
                    common_objs: Arc::clone(&inner.common_objs),
                    objs: Arc::clone(&inner.objs),
                    surface_lock,
                    runtime: inner.runtime.clone(),
                },
                params,
                Box::new(move |task, error| match page.upgrade() {
                    Some(page) => page.render_completed(intent, intent_id, task, error),
                    None => task.settle(error),
                }),
            );
            intent_state.render_tasks.push(Arc::clone(&task));
            (task, intent_id, display_ready, start_pump)
        };

        debug!(page = self.page_number(), %intent, "Render requested");
        if start_pump {
            if let Err(error) = inner.pump_operator_list(intent, intent_id) {
                display_ready.reject(error);
            }
        }

        let page = Arc::clone(inner);
        let pending = Arc::clone(&task);
        inner.runtime.spawn(async move {
            match display_ready.promise().await {
                Ok(_) if lock(&page.state).destroyed => pending.complete(None),
                Ok(transparency) => match pending.initialize_graphics(transparency) {
                    Ok(()) => pending.operator_list_changed(),
                    Err(error) => pending.complete(Some(error)),
                },
                Err(error) => pending.complete(Some(error)),
            }
        });

        Ok(RenderTask::new(task))
    }

    /// The complete operator list of the page, without rendering it.
    pub fn get_operator_list(
        &self,
        intent: RenderIntent,
    ) -> impl Future<Output = PDFResult<OperatorList>> + Send + 'static + use<> {
        let inner = &self.inner;
        let intent = intent.for_operator_list();
        let (capability, intent_id, start_pump) = {
            let mut state = lock(&inner.state);
            let intent_state = state
                .intents
                .entry(intent)
                .or_insert_with(|| IntentState::new(inner.next_intent_id.fetch_add(1, Ordering::SeqCst)));
            let start_pump = intent_state.op_list_read.is_none();
            let capability = intent_state
                .op_list_read
                .get_or_insert_with(Capability::new)
                .clone();
            (capability, intent_state.id, start_pump)
        };

        if start_pump {
            if let Err(error) = inner.pump_operator_list(intent, intent_id) {
                capability.reject(error);
            }
        }
        capability.promise()
    }

    /// Text items of the page, delivered in chunks.
    pub fn stream_text_content(&self, params: TextContentParams) -> PDFResult<ReadableStream> {
        let request = TextContentRequest {
            page_index: self.inner.page_index,
            params,
        };
        Ok(self.inner.handler.send_with_stream(
            "GetTextContent",
            Payload::json(&request)?,
            QueueingStrategy::with_size(TEXT_CONTENT_CHUNK_SIZE as i64, |chunk| match chunk {
                Payload::TextContent(content) => content.items.len() as i64,
                _ => 1,
            }),
        ))
    }

    pub async fn get_text_content(&self, params: TextContentParams) -> PDFResult<TextContent> {
        let stream = self.stream_text_content(params)?;
        let mut content = TextContent::default();
        while let Some(chunk) = stream.read().await? {
            match chunk {
                Payload::TextContent(chunk) => content.append(chunk),
                other => {
                    return Err(PDFError::Protocol(format!(
                        "Unexpected {} chunk in text content",
                        other.kind_name()
                    )));
                }
            }
        }
        Ok(content)
    }

    /// Frees per-intent state and page objects if nothing is rendering.
    /// Returns false while a render is in progress; cleanup then happens
    /// once it finishes.
    pub fn cleanup(&self) -> bool {
        self.inner.cleanup()
    }

    /// Called when the worker announced `StartRenderPage`.
    pub(crate) fn start_render_page(&self, transparency: bool, intent: RenderIntent) {
        let state = lock(&self.inner.state);
        if let Some(ready) = state
            .intents
            .get(&intent)
            .and_then(|state| state.display_ready.as_ref())
        {
            ready.resolve(transparency);
        }
    }

    /// Cancels every render and operator-list stream of the page. The
    /// returned future resolves once the cancelled render tasks settled.
    pub(crate) fn destroy(&self) -> impl Future<Output = ()> + Send + 'static + use<> {
        let inner = &self.inner;
        let intents: Vec<_> = {
            let mut state = lock(&inner.state);
            state.destroyed = true;
            state
                .intents
                .iter()
                .map(|(intent, state)| {
                    (
                        *intent,
                        state.id,
                        state.op_list_read.is_some(),
                        state.render_tasks.clone(),
                    )
                })
                .collect()
        };

        let mut waiting = Vec::new();
        for (intent, intent_id, op_list_only, tasks) in intents {
            inner.abort_operator_list(
                intent,
                intent_id,
                PDFError::abort("Page was destroyed."),
                true,
            );
            if op_list_only {
                continue;
            }
            for task in tasks {
                waiting.push(task.capability.promise());
                task.cancel(None);
            }
        }
        inner.objs.clear();
        lock(&inner.state).pending_cleanup = false;

        async move {
            join_all(waiting).await;
        }
    }
}

impl PageInner {
    fn intent_matches(state: &PageState, intent: RenderIntent, intent_id: u64) -> bool {
        state
            .intents
            .get(&intent)
            .is_some_and(|state| state.id == intent_id)
    }

    fn pump_operator_list(self: &Arc<Self>, intent: RenderIntent, intent_id: u64) -> PDFResult<()> {
        let request = OperatorListRequest {
            page_index: self.page_index,
            intent,
        };
        let stream = Arc::new(self.handler.send_with_stream(
            "GetOperatorList",
            Payload::json(&request)?,
            QueueingStrategy::default(),
        ));
        {
            let mut state = lock(&self.state);
            match state.intents.get_mut(&intent) {
                Some(intent_state) if intent_state.id == intent_id => {
                    intent_state.stream = Some(Arc::clone(&stream));
                }
                _ => return Ok(()),
            }
        }

        let page = Arc::clone(self);
        self.runtime.spawn(async move {
            loop {
                match stream.read().await {
                    Ok(Some(Payload::OperatorList(chunk))) => {
                        if page.handler.is_destroyed() {
                            return;
                        }
                        page.render_page_chunk(intent, intent_id, chunk);
                    }
                    Ok(Some(other)) => {
                        let error = PDFError::Protocol(format!(
                            "Unexpected {} chunk in operator list",
                            other.kind_name()
                        ));
                        page.operator_list_failed(intent, intent_id, error);
                        return;
                    }
                    Ok(None) => {
                        let mut state = lock(&page.state);
                        if let Some(intent_state) = state.intents.get_mut(&intent) {
                            if intent_state.id == intent_id {
                                intent_state.stream = None;
                            }
                        }
                        return;
                    }
                    Err(error) => {
                        page.operator_list_failed(intent, intent_id, error);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn render_page_chunk(&self, intent: RenderIntent, intent_id: u64, chunk: OperatorListChunk) {
        let (list, tasks, op_list_read) = {
            let state = lock(&self.state);
            let Some(intent_state) = state.intents.get(&intent).filter(|state| state.id == intent_id)
            else {
                return;
            };
            (
                Arc::clone(&intent_state.operator_list),
                intent_state.render_tasks.clone(),
                intent_state.op_list_read.clone(),
            )
        };

        let completed = {
            let mut list = lock(&list);
            list.append_chunk(chunk);
            trace!(page = self.page_index + 1, %intent, length = list.len(), "Operator list chunk");
            list.last_chunk.then(|| list.clone())
        };

        for task in &tasks {
            task.operator_list_changed();
        }
        if let Some(list) = completed {
            if let Some(capability) = op_list_read {
                capability.resolve(list);
            }
            self.try_cleanup();
        }
    }

    fn operator_list_failed(&self, intent: RenderIntent, intent_id: u64, error: PDFError) {
        let (list, tasks, display_ready, op_list_read) = {
            let mut state = lock(&self.state);
            let Some(intent_state) = state
                .intents
                .get_mut(&intent)
                .filter(|state| state.id == intent_id)
            else {
                return;
            };
            intent_state.stream = None;
            (
                Arc::clone(&intent_state.operator_list),
                intent_state.render_tasks.clone(),
                intent_state.display_ready.clone(),
                intent_state.op_list_read.clone(),
            )
        };
        if self.handler.is_destroyed() {
            return;
        }
        if error.is_cancellation() {
            debug!(page = self.page_index + 1, %intent, %error, "Operator list stopped");
        } else {
            warn!(page = self.page_index + 1, %intent, %error, "Operator list failed");
        }

        lock(&list).last_chunk = true;
        for task in &tasks {
            task.operator_list_changed();
        }
        self.try_cleanup();

        if let Some(ready) = display_ready {
            ready.reject(error.clone());
        }
        if let Some(capability) = op_list_read {
            capability.reject(error);
        }
    }

    fn render_completed(
        self: &Arc<Self>,
        intent: RenderIntent,
        intent_id: u64,
        task: &Arc<InternalRenderTask>,
        error: Option<PDFError>,
    ) {
        let list = {
            let mut state = lock(&self.state);
            let list = state.intents.get_mut(&intent).map(|intent_state| {
                intent_state.render_tasks.retain(|other| !Arc::ptr_eq(other, task));
                Arc::clone(&intent_state.operator_list)
            });
            if intent == RenderIntent::Print || self.cleanup_after_render.load(Ordering::SeqCst) {
                state.pending_cleanup = true;
            }
            list
        };
        if let (Some(list), Some(error)) = (&list, &error) {
            if !error.is_cancellation() {
                lock(list).last_chunk = true;
            }
        }
        self.try_cleanup();

        match error {
            Some(error) => {
                task.settle(Some(error.clone()));
                self.abort_operator_list(intent, intent_id, error, false);
            }
            None => task.settle(None),
        }
    }

    /// Stops the operator-list stream of an intent. Unless `force` is set
    /// the stream survives while render tasks remain, and a cancelled
    /// render only stops it after the grace period.
    fn abort_operator_list(
        self: &Arc<Self>,
        intent: RenderIntent,
        intent_id: u64,
        reason: PDFError,
        force: bool,
    ) {
        let stream = {
            let mut state = lock(&self.state);
            let Some(intent_state) = state
                .intents
                .get_mut(&intent)
                .filter(|state| state.id == intent_id)
            else {
                return;
            };
            if intent_state.stream.is_none() {
                return;
            }
            if let Some(timeout) = intent_state.cancel_timeout.take() {
                timeout.abort();
            }
            if !force {
                if !intent_state.render_tasks.is_empty() {
                    return;
                }
                if matches!(reason, PDFError::RenderingCancelled { .. }) {
                    let page = Arc::downgrade(self);
                    let delay = self.grace_period;
                    let timer = self.runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(page) = page.upgrade() {
                            page.abort_operator_list(intent, intent_id, reason, true);
                        }
                    });
                    intent_state.cancel_timeout = Some(timer.abort_handle());
                    return;
                }
            }
            let stream = intent_state.stream.take();
            // A cancelled stream cannot be resumed, so the intent starts
            // over on the next request.
            state.intents.remove(&intent);
            stream
        };

        if let Some(stream) = stream {
            debug!(page = self.page_index + 1, %intent, "Cancelling operator list stream");
            let reason = PDFError::abort(reason.message());
            self.runtime.spawn(async move {
                if let Err(error) = stream.cancel(reason).await {
                    trace!(%error, "Operator list cancel failed");
                }
            });
        }
        self.cleanup();
    }

    fn cleanup(&self) -> bool {
        lock(&self.state).pending_cleanup = true;
        self.try_cleanup()
    }

    fn try_cleanup(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.pending_cleanup || state.destroyed {
            return false;
        }
        for intent_state in state.intents.values() {
            if !intent_state.render_tasks.is_empty() || !lock(&intent_state.operator_list).last_chunk {
                return false;
            }
        }
        state.intents.clear();
        state.pending_cleanup = false;
        drop(state);
        self.objs.clear();
        self.cleanup_after_render.store(false, Ordering::SeqCst);
        debug!(page = self.page_index + 1, "Page cleaned up");
        true
    }
}

impl fmt::Debug for PDFPageProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PDFPageProxy")
            .field("page_number", &self.page_number())
            .field("info", &self.inner.info)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operator_list::{OpArgs, OpCode, numbers};
    use crate::core::render_task::DrawingSurface;
    use crate::core::stream_sink::StreamSink;
    use crate::core::transport::MessagePort;
    use crate::core::worker::StartRenderPageInfo;
    use crate::rendering::device::TestDevice;

    fn chunk(last_chunk: bool, length: usize) -> OperatorListChunk {
        let mut list = OperatorList::new();
        list.add_op(OpCode::SetFillRGBColor, numbers(&[0.0, 0.0, 1.0]));
        list.add_op(OpCode::Rectangle, numbers(&[0.0, 0.0, 10.0, 10.0]));
        list.add_op(OpCode::Fill, OpArgs::new());
        OperatorListChunk {
            fn_array: list.fn_array,
            args_array: list.args_array,
            last_chunk,
            length,
        }
    }

    struct Harness {
        page: PDFPageProxy,
        worker: MessageHandler,
        /// Intents of every `GetOperatorList` request, in arrival order
        intents: Arc<std::sync::Mutex<Vec<RenderIntent>>>,
    }

    /// A page wired to a worker handler that answers `GetOperatorList`
    /// with `chunks` chunks.
    fn harness(chunks: usize, grace_period: Duration) -> Harness {
        let (main_port, worker_port) = MessagePort::pair();
        let main = MessageHandler::new("main", "worker", main_port);
        let worker = MessageHandler::new("worker", "main", worker_port);

        let page = PDFPageProxy::new(
            0,
            PageInfo {
                view: [0.0, 0.0, 10.0, 10.0],
                rotate: -90,
                ..Default::default()
            },
            PageContext {
                handler: main.clone(),
                common_objs: Arc::new(PDFObjects::new()),
                registry: SurfaceRegistry::new(),
                grace_period,
                runtime: Handle::current(),
            },
        );

        main.on("StartRenderPage", {
            let page = page.clone();
            move |data: Payload| {
                let started = data
                    .parse::<StartRenderPageInfo>()
                    .map(|info| page.start_render_page(info.transparency, info.intent));
                async move { started.map(|()| Payload::Null) }
            }
        })
        .unwrap();

        let replies = worker.clone();
        let intents = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&intents);
        worker
            .on_stream("GetOperatorList", move |data: Payload, sink: StreamSink| {
                let replies = replies.clone();
                let seen = Arc::clone(&seen);
                async move {
                    let request: OperatorListRequest = data.parse()?;
                    seen.lock().unwrap().push(request.intent);
                    let start = StartRenderPageInfo {
                        transparency: false,
                        page_index: request.page_index,
                        intent: request.intent,
                    };
                    replies.send("StartRenderPage", Payload::json(&start)?)?;
                    tokio::spawn(async move {
                        for i in 0..chunks {
                            if sink.ready().await.is_err() {
                                return;
                            }
                            sink.enqueue(
                                Payload::OperatorList(chunk(i + 1 == chunks, (i + 1) * 3)),
                                1,
                            );
                        }
                        if chunks > 0 {
                            sink.close();
                        }
                    });
                    Ok(())
                }
            })
            .unwrap();

        Harness {
            page,
            worker,
            intents,
        }
    }

    fn surface() -> DrawingSurface {
        DrawingSurface::new(TestDevice::new(10, 10))
    }

    #[test]
    fn test_normalize_rotation() {
        assert_eq!(normalize_rotation(0), 0);
        assert_eq!(normalize_rotation(450), 90);
        assert_eq!(normalize_rotation(-90), 270);
        assert_eq!(normalize_rotation(45), 0);
    }

    #[test]
    fn test_intent_wire_names() {
        assert_eq!(serde_json::to_string(&RenderIntent::OperatorList).unwrap(), "\"oplist\"");
        assert_eq!(
            serde_json::to_string(&RenderIntent::PrintOperatorList).unwrap(),
            "\"print_oplist\""
        );
        assert_eq!(RenderIntent::Print.for_operator_list(), RenderIntent::PrintOperatorList);
        assert_eq!(RenderIntent::Display.for_operator_list(), RenderIntent::OperatorList);
        assert_eq!(
            serde_json::from_str::<RenderIntent>("\"print\"").unwrap(),
            RenderIntent::Print
        );
        assert_eq!(RenderIntent::Display.to_string(), "display");
    }

    #[tokio::test]
    async fn test_page_properties() {
        let harness = harness(1, Duration::from_millis(10));
        let page = &harness.page;
        assert_eq!(page.page_number(), 1);
        assert_eq!(page.rotate(), 270);
        let viewport = page.get_viewport(2.0, Some(0)).unwrap();
        assert_eq!((viewport.width, viewport.height), (20.0, 20.0));
    }

    #[tokio::test]
    async fn test_render_completes_and_cleans_up() {
        let harness = harness(2, Duration::from_millis(10));
        let page = &harness.page;
        let surface = surface();
        let viewport = page.get_viewport(1.0, Some(0)).unwrap();

        let task = page.render(RenderParameters::new(surface.clone(), viewport)).unwrap();
        task.promise().await.unwrap();
        assert!(page.is_display_ready(RenderIntent::Display));

        let rgba = surface.with_device(|device| device.get_image_data());
        assert_eq!(&rgba.data[0..4], &[0, 0, 255, 255]);

        assert!(page.cleanup());
        assert!(!page.is_display_ready(RenderIntent::Display));
    }

    #[tokio::test]
    async fn test_surface_in_use_fails_fast() {
        let harness = harness(0, Duration::from_millis(10));
        let page = &harness.page;
        let surface = surface();
        let viewport = page.get_viewport(1.0, Some(0)).unwrap();

        let first = page.render(RenderParameters::new(surface.clone(), viewport)).unwrap();
        let second = page.render(RenderParameters::new(surface.clone(), viewport));
        assert_eq!(second.unwrap_err(), PDFError::SurfaceInUse);

        // Rendering never finishes, so the page refuses cleanup.
        assert!(!page.cleanup());

        first.cancel();
        assert!(first.promise().await.unwrap_err().is_cancellation());
        let third = page.render(RenderParameters::new(surface, viewport)).unwrap();
        third.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_stream_for_grace_period() {
        let harness = harness(0, Duration::from_millis(100));
        let page = &harness.page;
        let viewport = page.get_viewport(1.0, Some(0)).unwrap();

        let task = page.render(RenderParameters::new(surface(), viewport)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        task.cancel();
        let _ = task.promise().await;

        // Still within the grace period: the intent state is kept.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(page.is_display_ready(RenderIntent::Display));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!page.is_display_ready(RenderIntent::Display));
        assert!(!harness.worker.is_destroyed());
    }

    #[tokio::test]
    async fn test_print_intent_cleans_up_after_render() {
        let harness = harness(1, Duration::from_millis(10));
        let page = &harness.page;
        let viewport = page.get_viewport(1.0, Some(0)).unwrap();
        let params = RenderParameters::new(surface(), viewport).with_intent(RenderIntent::Print);

        page.render(params).unwrap().promise().await.unwrap();
        assert!(!page.is_display_ready(RenderIntent::Print));
    }

    #[tokio::test]
    async fn test_get_operator_list() {
        let harness = harness(3, Duration::from_millis(10));
        let list = harness.page.get_operator_list(RenderIntent::Display).await.unwrap();
        assert_eq!(list.len(), 9);
        assert!(list.last_chunk);
    }

    #[tokio::test]
    async fn test_print_operator_list_is_cached_apart() {
        let harness = harness(2, Duration::from_millis(10));
        let page = &harness.page;
        let print = page.get_operator_list(RenderIntent::Print).await.unwrap();
        assert_eq!(print.len(), 6);
        // Settled lists are reused per intent.
        page.get_operator_list(RenderIntent::PrintOperatorList).await.unwrap();

        let display = page.get_operator_list(RenderIntent::Display).await.unwrap();
        assert_eq!(display.len(), 6);
        assert_eq!(
            *harness.intents.lock().unwrap(),
            [RenderIntent::PrintOperatorList, RenderIntent::OperatorList]
        );
    }

    #[tokio::test]
    async fn test_destroy_cancels_renders() {
        let harness = harness(0, Duration::from_millis(10));
        let page = &harness.page;
        let viewport = page.get_viewport(1.0, Some(0)).unwrap();
        let task = page.render(RenderParameters::new(surface(), viewport)).unwrap();

        page.destroy().await;
        assert!(page.is_destroyed());
        assert!(task.promise().await.unwrap_err().is_cancellation());
        assert!(page.render(RenderParameters::new(surface(), viewport)).is_err());
    }
}
