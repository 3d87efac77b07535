//! # pdf-x-display
//!
//! The display half of a PDF renderer. A worker (in-process or on its own
//! thread) parses documents and streams page operator lists over a message
//! protocol; this side loads bytes for it, keeps decoded fonts and images in
//! object pools, and interprets the operator lists onto drawing surfaces in
//! short time slices.
//!
//! Parsing is not part of this crate. A parser plugs in through
//! [`core::DocumentProvider`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use pdf_x_display::core::{
//!     DocumentOptions, DocumentProvider, DocumentSource, DrawingSurface, PDFWorker,
//!     RenderParameters, get_document,
//! };
//! use pdf_x_display::rendering::SkiaDevice;
//!
//! # async fn run(provider: Arc<dyn DocumentProvider>) -> pdf_x_display::core::PDFResult<()> {
//! let worker = PDFWorker::spawn_thread(provider)?;
//! let task = get_document(
//!     DocumentSource::File("document.pdf".into()),
//!     DocumentOptions::default(),
//!     worker,
//! );
//! let document = task.promise().await?;
//!
//! let page = document.get_page(1).await?;
//! let viewport = page.get_viewport(1.5, None)?;
//! let (width, height) = viewport.pixel_size();
//! let surface = DrawingSurface::new(SkiaDevice::new(width, height)?);
//! page.render(RenderParameters::new(surface, viewport))?
//!     .promise()
//!     .await?;
//!
//! document.destroy().await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod rendering;

pub use core::{
    DocumentOptions, DocumentSource, PDFDocumentLoadingTask, PDFDocumentProxy, PDFError,
    PDFPageProxy, PDFResult, PDFWorker, RenderParameters, RenderTask, get_document,
};
pub use rendering::{Device, RenderingContext, SkiaDevice, TestDevice};
