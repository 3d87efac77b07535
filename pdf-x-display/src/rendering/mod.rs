//! Drawing side of the pipeline.
//!
//! [`RenderingContext`] interprets operator lists onto a [`Device`]. Groups,
//! soft masks and tiling patterns draw into off-screen devices taken from
//! [`CachedSurfaces`] and are composited back when they end.

pub mod cached_surfaces;
pub mod context;
pub mod device;
pub mod graphics_state;
pub mod matrix;
pub mod scheduler;
pub mod skia_device;
pub mod smask;
pub mod viewport;

pub use cached_surfaces::{CachedSurfaces, SurfaceKey, SurfacePurpose};
pub use context::{RenderingContext, Step};
pub use device::{Device, Paint, PathDrawMode, TestDevice};
pub use graphics_state::{
    BlendMode, Color, ColorSource, FillRule, GraphicsState, LineCap, LineJoin, StrokeProps,
    TextRenderingMode,
};
pub use matrix::Matrix;
pub use scheduler::{EventLoopScheduler, Job, Scheduler};
pub use skia_device::SkiaDevice;
pub use smask::SoftMask;
pub use viewport::{PageViewport, ViewportParameters};

#[cfg(feature = "thread-pool")]
pub use scheduler::ThreadPoolScheduler;
