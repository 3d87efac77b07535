//! Producer side of a stream.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::debug;

use super::error::{PDFError, PDFResult};
use super::lock;
use super::message_handler::StreamChannel;
use super::transport::{Payload, StreamEvent};

type PullHook = Arc<dyn Fn() -> BoxFuture<'static, PDFResult<()>> + Send + Sync>;
type CancelHook = Box<dyn FnOnce(PDFError) + Send>;

struct SinkState {
    desired_size: i64,
    ready: bool,
    /// Closed, errored, cancelled or abandoned; nothing more may be sent.
    finished: bool,
    cancel_reason: Option<PDFError>,
}

struct SinkInner {
    channel: StreamChannel,
    state: Mutex<SinkState>,
    ready_changed: Notify,
    on_pull: Mutex<Option<PullHook>>,
    on_cancel: Mutex<Option<CancelHook>>,
}

/// Handle used by a stream handler to push chunks to the consumer.
///
/// `enqueue` never blocks. Producers that care about backpressure await
/// [`StreamSink::ready`] between chunks.
#[derive(Clone)]
pub struct StreamSink {
    inner: Arc<SinkInner>,
}

impl StreamSink {
    pub(crate) fn new(channel: StreamChannel, desired_size: i64) -> Self {
        StreamSink {
            inner: Arc::new(SinkInner {
                channel,
                state: Mutex::new(SinkState {
                    desired_size,
                    ready: true,
                    finished: false,
                    cancel_reason: None,
                }),
                ready_changed: Notify::new(),
                on_pull: Mutex::new(None),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.inner.channel.stream_id()
    }

    /// Sends a chunk of the given size. Ignored once the stream is finished.
    pub fn enqueue(&self, chunk: Payload, size: i64) {
        {
            let mut state = lock(&self.inner.state);
            if state.finished {
                return;
            }
            let last_desired_size = state.desired_size;
            state.desired_size -= size;
            if last_desired_size > 0 && state.desired_size <= 0 {
                state.ready = false;
            }
        }
        if let Err(error) = self.inner.channel.post(StreamEvent::Enqueue(chunk)) {
            debug!(stream_id = self.stream_id(), %error, "Dropping chunk");
        }
    }

    pub fn close(&self) {
        if !self.finish() {
            return;
        }
        let _ = self.inner.channel.post(StreamEvent::Close);
        self.inner.channel.forget_sink();
        self.release_hooks();
    }

    pub fn error(&self, reason: PDFError) {
        if !self.finish() {
            return;
        }
        let _ = self.inner.channel.post(StreamEvent::Error(reason.to_wire()));
        self.inner.channel.forget_sink();
        self.release_hooks();
    }

    /// Hooks often capture a clone of the sink; drop them once finished.
    fn release_hooks(&self) {
        lock(&self.inner.on_pull).take();
    }

    fn finish(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.finished {
            return false;
        }
        state.finished = true;
        true
    }

    pub fn desired_size(&self) -> i64 {
        lock(&self.inner.state).desired_size
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.inner.state).cancel_reason.is_some()
    }

    /// Resolves when the consumer has capacity again; fails once the
    /// consumer cancelled.
    pub async fn ready(&self) -> PDFResult<()> {
        loop {
            let notified = self.inner.ready_changed.notified();
            {
                let state = lock(&self.inner.state);
                if let Some(reason) = &state.cancel_reason {
                    return Err(reason.clone());
                }
                if state.ready || state.finished {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Called for every PULL; the PULL is acknowledged once the hook's
    /// future settles.
    pub fn on_pull<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PDFResult<()>> + Send + 'static,
    {
        let hook: PullHook = Arc::new(move || -> BoxFuture<'static, PDFResult<()>> {
            Box::pin(hook())
        });
        *lock(&self.inner.on_pull) = Some(hook);
    }

    /// Called once when the consumer cancels.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce(PDFError) + Send + 'static,
    {
        *lock(&self.inner.on_cancel) = Some(Box::new(hook));
    }

    pub(crate) fn handle_pull(&self, desired_size: i64) {
        {
            let mut state = lock(&self.inner.state);
            state.desired_size = desired_size;
            if desired_size > 0 && !state.ready {
                state.ready = true;
                self.inner.ready_changed.notify_waiters();
            }
        }

        let hook = lock(&self.inner.on_pull).clone();
        let channel = self.inner.channel.clone();
        tokio::spawn(async move {
            let outcome = match hook {
                Some(hook) => hook().await,
                None => Ok(()),
            };
            let _ = channel.post(StreamEvent::PullComplete(
                outcome.map_err(|error| error.to_wire()),
            ));
        });
    }

    pub(crate) fn handle_cancel(&self, reason: PDFError) {
        self.abandon(reason.clone());
        if let Some(hook) = lock(&self.inner.on_cancel).take() {
            hook(reason);
        }
        let _ = self.inner.channel.post(StreamEvent::CancelComplete(Ok(())));
    }

    /// Marks the sink dead without telling the peer.
    pub(crate) fn abandon(&self, reason: PDFError) {
        let mut state = lock(&self.inner.state);
        state.finished = true;
        state.ready = false;
        state.cancel_reason.get_or_insert(reason);
        self.inner.ready_changed.notify_waiters();
    }
}
