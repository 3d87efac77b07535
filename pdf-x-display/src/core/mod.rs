pub mod capability;
pub mod chunked_stream;
pub mod config;
pub mod document;
pub mod error;
pub mod file_stream;
pub mod font;
pub mod image;
pub mod message_handler;
pub mod network_utils;
pub mod object_pool;
pub mod operator_list;
pub mod page;
pub mod readable_stream;
pub mod render_task;
pub mod stream_reader;
pub mod stream_sink;
pub mod text_content;
pub mod transport;
pub mod transport_stream;
pub mod worker;

#[cfg(feature = "network")]
pub mod network_stream;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use capability::Capability;
pub use config::{DocumentOptions, DocumentSource};
pub use document::{
    DocumentMetadata, PDFDocumentLoadingTask, PDFDocumentProxy, PasswordResponder, SessionState,
    get_document,
};
pub use error::{PDFError, PDFResult, PasswordReason, WireError};
pub use message_handler::MessageHandler;
pub use object_pool::{PDFObjects, PoolObject};
pub use operator_list::{OpArg, OpArgs, OpCode, OperatorList, OperatorListChunk};
pub use page::{PDFPageProxy, PageInfo, PageRef, RenderIntent};
pub use readable_stream::{QueueingStrategy, ReadableStream};
pub use render_task::{DrawingSurface, RenderParameters, RenderTask, SurfaceRegistry};
pub use stream_reader::{PDFStream, PDFStreamRangeReader, PDFStreamReader, ProgressCallback};
pub use stream_sink::StreamSink;
pub use text_content::{TextContent, TextItem};
pub use transport::{Message, MessagePort, Payload};
pub use transport_stream::{PDFDataRangeTransport, PDFDataTransportStream};
pub use worker::{DocumentProvider, PDFWorker, PageEvaluation, PdfDocument, ReaderHeadersInfo};

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
