//! HTTP byte source built on reqwest.
//!
//! The full request negotiates length and range support from its response
//! headers. When ranges are usable and streaming is off, the full request
//! is dropped as soon as the headers arrive and the session fetches the
//! document through range requests instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::config::DocumentOptions;
use super::error::{PDFError, PDFResult};
use super::lock;
use super::network_utils::{
    create_response_status_error, extract_filename_from_header, validate_range_request_capabilities,
    validate_range_response_status, validate_response_status,
};
use super::stream_reader::{
    HeaderValues, PDFStream, PDFStreamRangeReader, PDFStreamReader, ProgressCallback, ReadQueue,
    ReaderHeaders,
};

pub struct PDFNetworkStream {
    client: Client,
    url: String,
    options: DocumentOptions,
    headers: HeaderMap,
    full_reader: Mutex<Option<Arc<NetworkFullReader>>>,
    range_readers: Mutex<Vec<Arc<NetworkRangeReader>>>,
}

impl PDFNetworkStream {
    pub fn new(url: impl Into<String>, options: DocumentOptions) -> PDFResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PDFError::StreamError(format!("Failed to create HTTP client: {}", e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &options.http_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PDFError::Generic(format!("Invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PDFError::Generic(format!("Invalid header value {value:?}: {e}")))?;
            headers.insert(name, value);
        }

        Ok(PDFNetworkStream {
            client,
            url: url.into(),
            options,
            headers,
            full_reader: Mutex::new(None),
            range_readers: Mutex::new(Vec::new()),
        })
    }
}

async fn send(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    accept_status: fn(u16) -> bool,
) -> PDFResult<Response> {
    let response = client
        .get(url)
        .headers(headers)
        .send()
        .await
        .map_err(|e| PDFError::StreamError(format!("Request for \"{}\" failed: {}", url, e)))?;
    let status = response.status().as_u16();
    if !accept_status(status) {
        return Err(create_response_status_error(status, url));
    }
    Ok(response)
}

fn header_getter(response: &Response) -> impl Fn(&str) -> Option<String> + '_ {
    move |name| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}

/// Pushes the response body into `queue`, chunk by chunk or as one piece.
async fn pump_body(response: Response, queue: &ReadQueue, streaming: bool) -> PDFResult<()> {
    let mut body = response.bytes_stream();
    let mut whole = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| PDFError::StreamError(format!("Body read failed: {}", e)))?;
        if streaming {
            queue.push(chunk);
        } else {
            whole.extend_from_slice(&chunk);
        }
    }
    if !streaming && !whole.is_empty() {
        queue.push(whole.freeze());
    }
    queue.finish();
    Ok(())
}

impl PDFStream for PDFNetworkStream {
    fn get_full_reader(&self) -> PDFResult<Arc<dyn PDFStreamReader>> {
        let mut slot = lock(&self.full_reader);
        if slot.is_some() {
            return Err(PDFError::StreamError(
                "PDFNetworkStream.getFullReader can only be called once.".into(),
            ));
        }

        let reader = Arc::new(NetworkFullReader {
            headers: ReaderHeaders::new(HeaderValues {
                is_streaming_supported: !self.options.disable_stream,
                ..Default::default()
            }),
            queue: ReadQueue::new(),
            task: Mutex::new(None),
        });

        let client = self.client.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();
        let range_chunk_size = self.options.chunk_size();
        let disable_range = self.options.disable_range;
        let known_length = self.options.length;
        let worker = Arc::clone(&reader);

        let task = tokio::spawn(async move {
            let response = match send(&client, &url, headers, validate_response_status).await {
                Ok(response) => response,
                Err(error) => {
                    worker.queue.fail(error.clone());
                    worker.headers.ready.reject(error);
                    return;
                }
            };

            let capabilities = validate_range_request_capabilities(
                header_getter(&response),
                true,
                range_chunk_size,
                disable_range,
            );
            let mut values = worker.headers.get();
            values.is_range_supported = capabilities.allow_range_requests;
            values.content_length = capabilities.suggested_length.or(known_length);
            values.filename = extract_filename_from_header(
                header_getter(&response)("Content-Disposition").as_deref(),
            );
            worker.queue.set_total(values.content_length);
            worker.headers.publish(values.clone());

            if values.is_range_supported && !values.is_streaming_supported {
                debug!(url = %url, "Dropping full request, the document will be fetched by ranges");
                worker.queue.fail(PDFError::abort("Streaming is disabled."));
                return;
            }
            if let Err(error) =
                pump_body(response, &worker.queue, values.is_streaming_supported).await
            {
                worker.queue.fail(error);
            }
        });
        *lock(&reader.task) = Some(task.abort_handle());

        *slot = Some(Arc::clone(&reader));
        Ok(reader)
    }

    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn PDFStreamRangeReader>> {
        let mut headers = self.headers.clone();
        let range = format!("bytes={}-{}", begin, end.saturating_sub(1));
        match HeaderValue::from_str(&range) {
            Ok(value) => {
                headers.insert(reqwest::header::RANGE, value);
            }
            Err(error) => {
                warn!(begin, end, %error, "Invalid range header");
                return None;
            }
        }

        let queue = Arc::new(ReadQueue::new());
        queue.set_total(Some(end.saturating_sub(begin)));
        let client = self.client.clone();
        let url = self.url.clone();
        let streaming = !self.options.disable_stream;
        let task = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move {
                let outcome = match send(&client, &url, headers, validate_range_response_status).await {
                    Ok(response) => pump_body(response, &queue, streaming).await,
                    Err(error) => Err(error),
                };
                if let Err(error) = outcome {
                    queue.fail(error);
                }
            }
        });

        let reader = Arc::new(NetworkRangeReader {
            queue,
            is_streaming_supported: streaming,
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

struct NetworkFullReader {
    headers: ReaderHeaders,
    queue: ReadQueue,
    task: Mutex<Option<AbortHandle>>,
}

impl PDFStreamReader for NetworkFullReader {
    fn headers_ready(&self) -> BoxFuture<'static, PDFResult<()>> {
        Box::pin(self.headers.ready.promise())
    }

    fn filename(&self) -> Option<String> {
        self.headers.get().filename
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

struct NetworkRangeReader {
    queue: Arc<ReadQueue>,
    is_streaming_supported: bool,
    task: AbortHandle,
}

impl PDFStreamRangeReader for NetworkRangeReader {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_invalid_custom_header_is_rejected() {
        let options = DocumentOptions {
            http_headers: vec![("Bad Header".into(), "x".into())],
            ..Default::default()
        };
        assert!(PDFNetworkStream::new("http://localhost/doc.pdf", options).is_err());
    }

    #[tokio::test]
    async fn test_full_reader_only_once() {
        let stream =
            PDFNetworkStream::new("http://127.0.0.1:9/doc.pdf", DocumentOptions::default()).unwrap();
        let reader = stream.get_full_reader().unwrap();
        assert!(stream.get_full_reader().is_err());
        reader.cancel(PDFError::abort("test"));
        assert!(reader.headers_ready().await.is_err());
    }

    /// Answers one request with `status` and `body`, then hangs up.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/doc.pdf", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn test_range_reader_reads_partial_content() {
        let url = serve_once("206 Partial Content", b"3456").await;
        let stream = PDFNetworkStream::new(url, DocumentOptions::default()).unwrap();
        let reader = stream.get_range_reader(3, 7).unwrap();
        assert_eq!(&reader.read().await.unwrap().unwrap()[..], b"3456");
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_range_reader_rejects_whole_document() {
        let url = serve_once("200 OK", b"0123456789").await;
        let stream = PDFNetworkStream::new(url, DocumentOptions::default()).unwrap();
        let reader = stream.get_range_reader(3, 7).unwrap();
        let error = reader.read().await.unwrap_err();
        assert!(matches!(error, PDFError::UnexpectedResponse { status: 200, .. }), "{error:?}");
    }
}
