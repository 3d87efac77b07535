//! Filesystem byte source.
//!
//! Ranges are always cheap on a local file, so range support is only
//! turned off by `disable_range`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::task::AbortHandle;
use tracing::debug;

use super::config::DocumentOptions;
use super::error::{PDFError, PDFResult};
use super::lock;
use super::stream_reader::{
    HeaderValues, PDFStream, PDFStreamRangeReader, PDFStreamReader, ProgressCallback, ReadQueue,
    ReaderHeaders,
};

/// Bytes per read from disk.
const READ_CHUNK_SIZE: usize = 65536;

pub struct PDFFileStream {
    path: PathBuf,
    options: DocumentOptions,
    full_reader: Mutex<Option<Arc<FileFullReader>>>,
    range_readers: Mutex<Vec<Arc<FileRangeReader>>>,
}

impl PDFFileStream {
    pub fn new(path: impl Into<PathBuf>, options: DocumentOptions) -> Self {
        PDFFileStream {
            path: path.into(),
            options,
            full_reader: Mutex::new(None),
            range_readers: Mutex::new(Vec::new()),
        }
    }
}

fn missing_pdf(path: &Path) -> PDFError {
    PDFError::MissingPdf(format!("Missing PDF \"{}\".", path.display()))
}

fn map_open_error(path: &Path, error: std::io::Error) -> PDFError {
    if error.kind() == ErrorKind::NotFound {
        missing_pdf(path)
    } else {
        PDFError::from(error)
    }
}

/// Reads `[begin, end)` (or to EOF when `end` is `None`) into `queue`.
async fn pump(
    path: PathBuf,
    begin: u64,
    end: Option<u64>,
    queue: Arc<ReadQueue>,
) -> PDFResult<()> {
    let mut file = File::open(&path)
        .await
        .map_err(|error| map_open_error(&path, error))?;
    if begin > 0 {
        file.seek(SeekFrom::Start(begin)).await?;
    }

    let mut remaining = end.map(|end| end.saturating_sub(begin));
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(left) => (left as usize).min(READ_CHUNK_SIZE),
            None => READ_CHUNK_SIZE,
        };
        let read = file.read(&mut buffer[..want]).await?;
        if read == 0 {
            break;
        }
        queue.push(Bytes::copy_from_slice(&buffer[..read]));
        if let Some(left) = remaining.as_mut() {
            *left -= read as u64;
        }
    }
    queue.finish();
    Ok(())
}

impl PDFStream for PDFFileStream {
    fn get_full_reader(&self) -> PDFResult<Arc<dyn PDFStreamReader>> {
        let mut slot = lock(&self.full_reader);
        if slot.is_some() {
            return Err(PDFError::StreamError(
                "PDFFileStream.getFullReader can only be called once.".into(),
            ));
        }

        let reader = Arc::new(FileFullReader {
            headers: ReaderHeaders::new(HeaderValues {
                is_streaming_supported: !self.options.disable_stream,
                is_range_supported: !self.options.disable_range,
                ..Default::default()
            }),
            queue: Arc::new(ReadQueue::new()),
            task: Mutex::new(None),
        });

        let path = self.path.clone();
        let worker = Arc::clone(&reader);
        let task = tokio::spawn(async move {
            let length = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata.len(),
                Err(error) => {
                    let error = map_open_error(&path, error);
                    worker.queue.fail(error.clone());
                    worker.headers.ready.reject(error);
                    return;
                }
            };

            let mut values = worker.headers.get();
            values.content_length = Some(length);
            worker.queue.set_total(Some(length));
            worker.headers.publish(values.clone());

            if !values.is_streaming_supported && values.is_range_supported {
                worker
                    .queue
                    .fail(PDFError::abort("streaming is disabled"));
                return;
            }
            if let Err(error) = pump(path, 0, None, Arc::clone(&worker.queue)).await {
                worker.queue.fail(error);
            }
        });
        *lock(&reader.task) = Some(task.abort_handle());

        *slot = Some(Arc::clone(&reader));
        Ok(reader)
    }

    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn PDFStreamRangeReader>> {
        let queue = Arc::new(ReadQueue::new());
        queue.set_total(Some(end.saturating_sub(begin)));
        let path = self.path.clone();
        let task = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move {
                if let Err(error) = pump(path, begin, Some(end), Arc::clone(&queue)).await {
                    queue.fail(error);
                }
            }
        });

        let reader = Arc::new(FileRangeReader {
            queue,
            is_streaming_supported: !self.options.disable_stream,
            task: task.abort_handle(),
        });
        let mut readers = lock(&self.range_readers);
        readers.retain(|reader| !reader.queue.is_done());
        readers.push(Arc::clone(&reader));
        Some(reader)
    }

    fn progressive_data_length(&self) -> u64 {
        lock(&self.full_reader)
            .as_ref()
            .map_or(0, |reader| reader.queue.loaded())
    }

    fn cancel_all_requests(&self, reason: PDFError) {
        if let Some(reader) = lock(&self.full_reader).clone() {
            reader.cancel(reason.clone());
        }
        let readers: Vec<_> = lock(&self.range_readers).drain(..).collect();
        for reader in readers {
            reader.cancel(reason.clone());
        }
    }
}

struct FileFullReader {
    headers: ReaderHeaders,
    queue: Arc<ReadQueue>,
    task: Mutex<Option<AbortHandle>>,
}

impl PDFStreamReader for FileFullReader {
    fn headers_ready(&self) -> BoxFuture<'static, PDFResult<()>> {
        Box::pin(self.headers.ready.promise())
    }

    fn filename(&self) -> Option<String> {
        None
    }

    fn content_length(&self) -> Option<u64> {
        self.headers.get().content_length
    }

    fn is_range_supported(&self) -> bool {
        self.headers.get().is_range_supported
    }

    fn is_streaming_supported(&self) -> bool {
        self.headers.get().is_streaming_supported
    }

    fn read(&self) -> BoxFuture<'_, PDFResult<Option<Bytes>>> {
        Box::pin(self.queue.read())
    }

    fn cancel(&self, reason: PDFError) {
        debug!(%reason, "Cancelling file reader");
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.headers.ready.reject(reason);
        self.queue.cancel();
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.queue.set_on_progress(callback);
    }
}

struct FileRangeReader {
    queue: Arc<ReadQueue>,
    is_streaming_supported: bool,
    task: AbortHandle,
}

impl PDFStreamRangeReader for FileRangeReader {
    fn is_streaming_supported(&self) -> bool {
        self.is_streaming_supported
    }

    fn read(&self) -> BoxFuture<'_, PDFResult<Option<Bytes>>> {
        Box::pin(self.queue.read())
    }

    fn cancel(&self, _reason: PDFError) {
        self.task.abort();
        self.queue.cancel();
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.queue.set_on_progress(callback);
    }
}
