//! Document open parameters and pipeline constants.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::transport_stream::PDFDataRangeTransport;

/// Default range chunk size: 64KB
pub const DEFAULT_RANGE_CHUNK_SIZE: usize = 65536;

/// Delay before an unused operator-list stream is cancelled after a render
/// was cancelled.
pub const RENDERING_CANCELLED_TIMEOUT: Duration = Duration::from_millis(100);

/// Images with more pixels than this trigger page cleanup after render.
pub const MAX_IMAGE_SIZE_TO_CACHE: u64 = 8_000_000;

/// Delay before a page with no active renders drops its cached resources.
pub const DELAYED_CLEANUP_TIMEOUT: Duration = Duration::from_millis(5000);

pub const TEXT_CONTENT_CHUNK_SIZE: usize = 100;

/// Operators per transmitted operator-list chunk.
pub const OPERATOR_LIST_CHUNK_SIZE: usize = 1000;

/// Where the document bytes come from.
#[derive(Clone)]
pub enum DocumentSource {
    Url(String),
    Data(Bytes),
    File(PathBuf),
    /// Bytes pushed by the embedding host.
    RangeTransport(Arc<PDFDataRangeTransport>),
}

impl fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            DocumentSource::Data(data) => write!(f, "Data({} bytes)", data.len()),
            DocumentSource::File(path) => f.debug_tuple("File").field(path).finish(),
            DocumentSource::RangeTransport(transport) => {
                write!(f, "RangeTransport({} bytes)", transport.length())
            }
        }
    }
}

/// Tunables for opening one document.
///
/// Every field has a default, so partial JSON such as
/// `{"disable_range": true}` deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentOptions {
    pub range_chunk_size: usize,
    pub disable_range: bool,
    pub disable_stream: bool,
    pub disable_auto_fetch: bool,
    pub password: Option<String>,
    pub http_headers: Vec<(String, String)>,
    pub with_credentials: bool,
    /// Known file length, skipping the length probe.
    pub length: Option<u64>,
    /// Largest image (in pixels) the worker should decode; `None` = no limit.
    pub max_image_size: Option<u64>,
    /// Milliseconds to wait before cancelling an operator-list stream that
    /// lost its last render task.
    pub cancel_grace_period_ms: u64,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        DocumentOptions {
            range_chunk_size: DEFAULT_RANGE_CHUNK_SIZE,
            disable_range: false,
            disable_stream: false,
            disable_auto_fetch: false,
            password: None,
            http_headers: Vec::new(),
            with_credentials: false,
            length: None,
            max_image_size: None,
            cancel_grace_period_ms: RENDERING_CANCELLED_TIMEOUT.as_millis() as u64,
        }
    }
}

impl DocumentOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    /// Range chunk size, never zero.
    pub fn chunk_size(&self) -> usize {
        self.range_chunk_size.max(1)
    }
}
