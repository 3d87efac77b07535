//! Render tasks: one interpreter run of a page's operator list onto a
//! caller-provided drawing surface.
//!
//! A task waits until its intent reports display-ready, then executes the
//! operator list in time slices as chunks arrive. Continuations go through
//! a [`Scheduler`]; unresolved object dependencies park the task until the
//! object pool settles them.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use super::capability::Capability;
use super::error::{PDFError, PDFResult};
use super::lock;
use super::object_pool::PDFObjects;
use super::operator_list::OperatorList;
use super::page::RenderIntent;
use crate::rendering::context::{RenderingContext, Step};
use crate::rendering::device::Device;
use crate::rendering::graphics_state::Color;
use crate::rendering::matrix::Matrix;
use crate::rendering::scheduler::{EventLoopScheduler, Job, Scheduler};
use crate::rendering::viewport::PageViewport;

/// Operator list shared between the page's chunk pump and its render tasks.
pub type SharedOperatorList = Arc<Mutex<OperatorList>>;

/// Receives the job that runs the next time slice. The callback decides
/// when (or whether) to run it.
pub type ContinueCallback = Arc<dyn Fn(Job) + Send + Sync>;

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// A render target. Clones share the same device and identity.
#[derive(Clone)]
pub struct DrawingSurface {
    id: u64,
    device: Arc<Mutex<Box<dyn Device>>>,
}

impl DrawingSurface {
    pub fn new(device: impl Device + 'static) -> Self {
        DrawingSurface::from_box(Box::new(device))
    }

    pub fn from_box(device: Box<dyn Device>) -> Self {
        DrawingSurface {
            id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
            device: Arc::new(Mutex::new(device)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs `f` with exclusive access to the device.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut dyn Device) -> R) -> R {
        let mut device = lock(&self.device);
        f(device.as_mut())
    }
}

impl fmt::Debug for DrawingSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrawingSurface").field("id", &self.id).finish()
    }
}

/// Surfaces currently being rendered to. One registry per session.
#[derive(Clone, Default)]
pub struct SurfaceRegistry {
    active: Arc<Mutex<FxHashSet<u64>>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `surface` until the returned guard drops.
    pub fn acquire(&self, surface: &DrawingSurface) -> PDFResult<SurfaceLock> {
        if !lock(&self.active).insert(surface.id) {
            return Err(PDFError::SurfaceInUse);
        }
        Ok(SurfaceLock {
            registry: self.clone(),
            id: surface.id,
        })
    }

    pub fn is_active(&self, surface: &DrawingSurface) -> bool {
        lock(&self.active).contains(&surface.id)
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.active).is_empty()
    }
}

/// Exclusive claim on a surface; released on drop.
pub struct SurfaceLock {
    registry: SurfaceRegistry,
    id: u64,
}

impl Drop for SurfaceLock {
    fn drop(&mut self) {
        lock(&self.registry.active).remove(&self.id);
    }
}

impl fmt::Debug for SurfaceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceLock").field("id", &self.id).finish()
    }
}

/// What [`PDFPageProxy::render`](super::page::PDFPageProxy::render) draws
/// and how.
#[derive(Clone)]
pub struct RenderParameters {
    pub surface: DrawingSurface,
    pub viewport: PageViewport,
    pub intent: RenderIntent,
    /// Extra transform applied before the viewport transform
    pub transform: Option<Matrix>,
    /// Page background; white when absent
    pub background: Option<Color>,
    /// Defaults to the event loop of the calling runtime
    pub scheduler: Option<Arc<dyn Scheduler>>,
    pub on_continue: Option<ContinueCallback>,
}

impl RenderParameters {
    pub fn new(surface: DrawingSurface, viewport: PageViewport) -> Self {
        RenderParameters {
            surface,
            viewport,
            intent: RenderIntent::Display,
            transform: None,
            background: None,
            scheduler: None,
            on_continue: None,
        }
    }

    pub fn with_intent(mut self, intent: RenderIntent) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_on_continue<F>(mut self, on_continue: F) -> Self
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        self.on_continue = Some(Arc::new(on_continue));
        self
    }
}

impl fmt::Debug for RenderParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderParameters")
            .field("surface", &self.surface)
            .field("intent", &self.intent)
            .field("transform", &self.transform)
            .field("background", &self.background)
            .finish_non_exhaustive()
    }
}

type CompleteCallback = Box<dyn FnOnce(&Arc<InternalRenderTask>, Option<PDFError>) + Send>;

struct TaskState {
    gfx: Option<RenderingContext>,
    operator_list_index: usize,
    graphics_ready: bool,
    /// A chunk arrived before the graphics were initialized.
    pending_continue: bool,
    surface_lock: Option<SurfaceLock>,
    callback: Option<CompleteCallback>,
}

pub(crate) struct InternalRenderTask {
    page_index: usize,
    operator_list: SharedOperatorList,
    common_objs: Arc<PDFObjects>,
    objs: Arc<PDFObjects>,
    surface: DrawingSurface,
    viewport: PageViewport,
    transform: Option<Matrix>,
    background: Option<Color>,
    scheduler: Arc<dyn Scheduler>,
    on_continue: Option<ContinueCallback>,
    runtime: Handle,
    state: Mutex<TaskState>,
    running: AtomicBool,
    cancelled: AtomicBool,
    pub(crate) capability: Capability<()>,
}

pub(crate) struct TaskSetup {
    pub page_index: usize,
    pub operator_list: SharedOperatorList,
    pub common_objs: Arc<PDFObjects>,
    pub objs: Arc<PDFObjects>,
    pub surface_lock: SurfaceLock,
    pub runtime: Handle,
}

impl InternalRenderTask {
    pub(crate) fn new(
        setup: TaskSetup,
        params: RenderParameters,
        callback: CompleteCallback,
    ) -> Arc<Self> {
        let scheduler = params
            .scheduler
            .unwrap_or_else(|| Arc::new(EventLoopScheduler::new(setup.runtime.clone())));
        Arc::new(InternalRenderTask {
            page_index: setup.page_index,
            operator_list: setup.operator_list,
            common_objs: setup.common_objs,
            objs: setup.objs,
            surface: params.surface,
            viewport: params.viewport,
            transform: params.transform,
            background: params.background,
            scheduler,
            on_continue: params.on_continue,
            runtime: setup.runtime,
            state: Mutex::new(TaskState {
                gfx: None,
                operator_list_index: 0,
                graphics_ready: false,
                pending_continue: false,
                surface_lock: Some(setup.surface_lock),
                callback: Some(callback),
            }),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            capability: Capability::new(),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sets up the drawing surface once the intent is display-ready.
    pub(crate) fn initialize_graphics(self: &Arc<Self>, transparency: bool) -> PDFResult<()> {
        if self.is_cancelled() {
            return Ok(());
        }
        let resume = {
            let mut state = lock(&self.state);
            let mut gfx = RenderingContext::new(Arc::clone(&self.common_objs), Arc::clone(&self.objs));
            self.surface.with_device(|device| {
                gfx.begin_drawing(
                    device,
                    &self.viewport,
                    self.transform.as_ref(),
                    self.background,
                    transparency,
                )
            })?;
            state.gfx = Some(gfx);
            state.graphics_ready = true;
            std::mem::take(&mut state.pending_continue)
        };
        debug!(page = self.page_index + 1, transparency, "Graphics initialized");
        if resume {
            self.continue_rendering();
        }
        Ok(())
    }

    /// New operators were appended to the list.
    pub(crate) fn operator_list_changed(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if !state.graphics_ready {
                state.pending_continue = true;
                return;
            }
        }
        if self.running.load(Ordering::SeqCst) {
            return;
        }
        self.continue_rendering();
    }

    fn continue_rendering(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        if self.is_cancelled() {
            return;
        }
        let task = Arc::clone(self);
        let job: Job = Box::new(move || task.next());
        match &self.on_continue {
            Some(on_continue) => on_continue(job),
            None => self.scheduler.schedule(job),
        }
    }

    /// Runs one time slice.
    fn next(self: &Arc<Self>) {
        if self.is_cancelled() {
            return;
        }

        let outcome = {
            let mut state = lock(&self.state);
            let start = state.operator_list_index;
            let Some(gfx) = state.gfx.as_mut() else {
                return;
            };
            let list = lock(&self.operator_list);
            let step = self
                .surface
                .with_device(|device| gfx.execute_operator_list(device, &list, start, true));
            match step {
                Ok(Step::Done(index)) => {
                    state.operator_list_index = index;
                    if list.last_chunk && index >= list.len() {
                        drop(list);
                        let ended = match state.gfx.take() {
                            Some(mut gfx) => self.surface.with_device(|device| gfx.end_drawing(device)),
                            None => Ok(()),
                        };
                        state.surface_lock = None;
                        Some(ended.map(|()| Step::Done(index)))
                    } else {
                        self.running.store(false, Ordering::SeqCst);
                        None
                    }
                }
                Ok(Step::Yield(index)) => {
                    state.operator_list_index = index;
                    Some(Ok(Step::Yield(index)))
                }
                Ok(Step::Blocked { index, pending }) => {
                    state.operator_list_index = index;
                    Some(Ok(Step::Blocked { index, pending }))
                }
                Err(error) => Some(Err(error)),
            }
        };

        match outcome {
            None => {
                trace!(page = self.page_index + 1, "Waiting for more operators");
            }
            Some(Ok(Step::Done(_))) => {
                debug!(page = self.page_index + 1, "Rendering finished");
                self.complete(None);
            }
            Some(Ok(Step::Yield(_))) => self.continue_rendering(),
            Some(Ok(Step::Blocked { index, pending })) => {
                trace!(page = self.page_index + 1, index, "Waiting for a dependency");
                let task = Arc::clone(self);
                self.runtime.spawn(async move {
                    match pending.await {
                        Ok(_) => task.continue_rendering(),
                        Err(error) if task.is_cancelled() => {
                            trace!(%error, "Dependency failed after cancel");
                        }
                        Err(error) => task.cancel(Some(error)),
                    }
                });
            }
            Some(Err(error)) => {
                warn!(page = self.page_index + 1, %error, "Rendering failed");
                self.cancel(Some(error));
            }
        }
    }

    /// Stops the task. The surface is released before the completion
    /// callback runs.
    pub(crate) fn cancel(self: &Arc<Self>, error: Option<PDFError>) {
        self.running.store(false, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        {
            let mut state = lock(&self.state);
            if let Some(mut gfx) = state.gfx.take() {
                if let Err(error) = self.surface.with_device(|device| gfx.end_drawing(device)) {
                    debug!(%error, "end_drawing failed during cancel");
                }
            }
            state.surface_lock = None;
        }
        let error = error.unwrap_or_else(|| {
            PDFError::rendering_cancelled(
                format!("Rendering cancelled, page {}", self.page_index + 1),
                "canvas",
            )
        });
        self.complete(Some(error));
    }

    pub(crate) fn complete(self: &Arc<Self>, error: Option<PDFError>) {
        let callback = {
            let mut state = lock(&self.state);
            state.surface_lock = None;
            state.callback.take()
        };
        match callback {
            Some(callback) => callback(self, error),
            None => trace!(page = self.page_index + 1, "Render task already completed"),
        }
    }

    /// Settles the task's completion future.
    pub(crate) fn settle(&self, error: Option<PDFError>) {
        match error {
            Some(error) => {
                self.capability.reject(error);
            }
            None => {
                self.capability.resolve(());
            }
        }
    }
}

/// Handle on a running render.
#[derive(Clone)]
pub struct RenderTask {
    internal: Arc<InternalRenderTask>,
}

impl RenderTask {
    pub(crate) fn new(internal: Arc<InternalRenderTask>) -> Self {
        RenderTask { internal }
    }

    /// Resolves when the page is fully drawn; rejects on error or cancel.
    pub fn promise(&self) -> impl Future<Output = PDFResult<()>> + Send + 'static + use<> {
        self.internal.capability.promise()
    }

    /// Cancels rendering. Takes effect at the next time-slice boundary.
    pub fn cancel(&self) {
        if self.internal.capability.settled() {
            return;
        }
        self.internal.cancel(None);
    }

    pub fn is_settled(&self) -> bool {
        self.internal.capability.settled()
    }

    pub fn surface(&self) -> &DrawingSurface {
        &self.internal.surface
    }
}

impl fmt::Debug for RenderTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTask")
            .field("page", &(self.internal.page_index + 1))
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object_pool::PoolObject;
    use crate::core::operator_list::{OpCode, numbers};
    use crate::rendering::device::TestDevice;
    use crate::rendering::viewport::ViewportParameters;
    use std::sync::atomic::AtomicUsize;

    fn viewport() -> PageViewport {
        PageViewport::new(ViewportParameters {
            view_box: [0.0, 0.0, 10.0, 10.0],
            ..Default::default()
        })
        .unwrap()
    }

    fn fill_list(last_chunk: bool) -> OperatorList {
        let mut list = OperatorList::new();
        list.add_op(OpCode::SetFillRGBColor, numbers(&[1.0, 0.0, 0.0]));
        list.add_op(OpCode::Rectangle, numbers(&[0.0, 0.0, 10.0, 10.0]));
        list.add_op(OpCode::Fill, Default::default());
        list.last_chunk = last_chunk;
        list
    }

    struct Fixture {
        task: Arc<InternalRenderTask>,
        list: SharedOperatorList,
        objs: Arc<PDFObjects>,
        surface: DrawingSurface,
        registry: SurfaceRegistry,
        completions: Arc<AtomicUsize>,
    }

    fn fixture(list: OperatorList) -> Fixture {
        let surface = DrawingSurface::new(TestDevice::new(10, 10));
        let registry = SurfaceRegistry::new();
        let list = Arc::new(Mutex::new(list));
        let objs = Arc::new(PDFObjects::new());
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        let task = InternalRenderTask::new(
            TaskSetup {
                page_index: 0,
                operator_list: Arc::clone(&list),
                common_objs: Arc::new(PDFObjects::new()),
                objs: Arc::clone(&objs),
                surface_lock: registry.acquire(&surface).unwrap(),
                runtime: Handle::current(),
            },
            RenderParameters::new(surface.clone(), viewport()),
            Box::new(move |task, error| {
                counter.fetch_add(1, Ordering::SeqCst);
                task.settle(error);
            }),
        );
        Fixture {
            task,
            list,
            objs,
            surface,
            registry,
            completions,
        }
    }

    #[test]
    fn test_registry_rejects_second_claim() {
        let registry = SurfaceRegistry::new();
        let surface = DrawingSurface::new(TestDevice::new(1, 1));
        let claim = registry.acquire(&surface).unwrap();
        assert_eq!(registry.acquire(&surface).unwrap_err(), PDFError::SurfaceInUse);
        assert!(registry.is_active(&surface));

        // Another surface is independent.
        let other = DrawingSurface::new(TestDevice::new(1, 1));
        assert!(registry.acquire(&other).is_ok());

        drop(claim);
        assert!(!registry.is_active(&surface));
        assert!(registry.acquire(&surface).is_ok());
    }

    #[test]
    fn test_clones_share_identity() {
        let surface = DrawingSurface::new(TestDevice::new(1, 1));
        let registry = SurfaceRegistry::new();
        let _claim = registry.acquire(&surface).unwrap();
        assert!(registry.acquire(&surface.clone()).is_err());
    }

    #[tokio::test]
    async fn test_renders_after_graphics_ready() {
        let fixture = fixture(fill_list(true));
        fixture.task.operator_list_changed();
        // Nothing runs before the graphics are initialized.
        tokio::task::yield_now().await;
        assert!(!fixture.task.capability.settled());

        fixture.task.initialize_graphics(false).unwrap();
        RenderTask::new(Arc::clone(&fixture.task)).promise().await.unwrap();

        assert_eq!(fixture.completions.load(Ordering::SeqCst), 1);
        assert!(fixture.registry.is_empty());
        let rgba = fixture.surface.with_device(|device| device.get_image_data());
        assert_eq!(&rgba.data[0..4], &[255, 0, 0, 255]);
    }

    #[tokio::test]
    async fn test_waits_for_last_chunk() {
        let fixture = fixture(fill_list(false));
        fixture.task.initialize_graphics(false).unwrap();
        fixture.task.operator_list_changed();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!fixture.task.capability.settled());
        assert!(!fixture.task.running.load(Ordering::SeqCst));

        lock(&fixture.list).last_chunk = true;
        fixture.task.operator_list_changed();
        RenderTask::new(Arc::clone(&fixture.task)).promise().await.unwrap();
        assert_eq!(fixture.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_surface() {
        let fixture = fixture(fill_list(false));
        fixture.task.initialize_graphics(false).unwrap();
        let handle = RenderTask::new(Arc::clone(&fixture.task));
        handle.cancel();

        let error = handle.promise().await.unwrap_err();
        assert_eq!(
            error,
            PDFError::rendering_cancelled("Rendering cancelled, page 1", "canvas")
        );
        assert!(!fixture.registry.is_active(&fixture.surface));
        assert!(fixture.registry.acquire(&fixture.surface).is_ok());

        // A second cancel does not complete twice.
        handle.cancel();
        fixture.task.cancel(None);
        assert_eq!(fixture.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocked_dependency_resumes() {
        let mut list = OperatorList::new();
        list.add_dependency("img_p0_1");
        list.last_chunk = true;
        let fixture = fixture(list);
        fixture.task.initialize_graphics(false).unwrap();
        fixture.task.operator_list_changed();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!fixture.task.capability.settled());

        fixture.objs.resolve(
            "img_p0_1",
            PoolObject::Image(Arc::new(crate::core::image::ImageBitmap {
                width: 1,
                height: 1,
                data: bytes::Bytes::from_static(&[0, 0, 0, 255]),
            })),
        );
        RenderTask::new(Arc::clone(&fixture.task)).promise().await.unwrap();
    }

    #[tokio::test]
    async fn test_dependency_failure_rejects() {
        let mut list = OperatorList::new();
        list.add_dependency("font_1");
        list.last_chunk = true;
        let fixture = fixture(list);
        fixture.task.initialize_graphics(false).unwrap();
        fixture.task.operator_list_changed();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        fixture.objs.clear();

        let error = RenderTask::new(Arc::clone(&fixture.task))
            .promise()
            .await
            .unwrap_err();
        assert!(!matches!(error, PDFError::RenderingCancelled { .. }));
        assert!(fixture.registry.is_empty());
    }

    #[tokio::test]
    async fn test_on_continue_drives_time_slices() {
        let surface = DrawingSurface::new(TestDevice::new(10, 10));
        let registry = SurfaceRegistry::new();
        let list = Arc::new(Mutex::new(fill_list(true)));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let params = RenderParameters::new(surface.clone(), viewport()).with_on_continue(move |job| {
            seen.fetch_add(1, Ordering::SeqCst);
            job();
        });
        let task = InternalRenderTask::new(
            TaskSetup {
                page_index: 2,
                operator_list: list,
                common_objs: Arc::new(PDFObjects::new()),
                objs: Arc::new(PDFObjects::new()),
                surface_lock: registry.acquire(&surface).unwrap(),
                runtime: Handle::current(),
            },
            params,
            Box::new(|task, error| task.settle(error)),
        );
        task.initialize_graphics(true).unwrap();
        task.operator_list_changed();
        RenderTask::new(task).promise().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
