//! Consumer side of a stream.
//!
//! Pulls are issued only after the producer acknowledged the start, and only
//! while there is spare capacity or a reader is waiting. Chunks that arrive
//! after the stream closed, errored or was cancelled are dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, oneshot};
use tracing::debug;

use super::error::{PDFError, PDFResult};
use super::lock;
use super::message_handler::StreamChannel;
use super::transport::{Payload, StreamEvent};

type SizeFn = Arc<dyn Fn(&Payload) -> i64 + Send + Sync>;

/// Flow-control policy of a stream.
#[derive(Clone)]
pub struct QueueingStrategy {
    /// Capacity the consumer advertises before anything is read.
    pub high_water_mark: i64,
    /// Size of one chunk; every chunk counts as 1 when absent.
    pub size: Option<SizeFn>,
}

impl QueueingStrategy {
    pub fn new(high_water_mark: i64) -> Self {
        QueueingStrategy {
            high_water_mark,
            size: None,
        }
    }

    pub fn with_size<F>(high_water_mark: i64, size: F) -> Self
    where
        F: Fn(&Payload) -> i64 + Send + Sync + 'static,
    {
        QueueingStrategy {
            high_water_mark,
            size: Some(Arc::new(size)),
        }
    }

    fn chunk_size(&self, chunk: &Payload) -> i64 {
        self.size.as_ref().map_or(1, |size| size(chunk))
    }
}

impl Default for QueueingStrategy {
    fn default() -> Self {
        QueueingStrategy::new(1)
    }
}

impl fmt::Debug for QueueingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("size", &self.size.is_some())
            .finish()
    }
}

#[derive(Default)]
struct ControllerState {
    queue: VecDeque<(Payload, i64)>,
    queued_size: i64,
    started: bool,
    pulling: bool,
    pull_again: bool,
    close_requested: bool,
    cancelled: bool,
    error: Option<PDFError>,
    waiting_readers: usize,
    cancel_waiter: Option<oneshot::Sender<PDFResult<()>>>,
}

pub(crate) struct StreamController {
    channel: StreamChannel,
    strategy: QueueingStrategy,
    state: Mutex<ControllerState>,
    changed: Notify,
}

impl StreamController {
    pub(crate) fn new(channel: StreamChannel, strategy: QueueingStrategy) -> Self {
        StreamController {
            channel,
            strategy,
            state: Mutex::new(ControllerState::default()),
            changed: Notify::new(),
        }
    }

    fn desired_size(&self, state: &ControllerState) -> i64 {
        self.strategy.high_water_mark - state.queued_size
    }

    fn pull_if_needed(&self, state: &mut ControllerState) {
        if !state.started || state.close_requested || state.cancelled || state.error.is_some() {
            return;
        }
        let desired_size = self.desired_size(state);
        if state.waiting_readers == 0 && desired_size <= 0 {
            return;
        }
        if state.pulling {
            state.pull_again = true;
            return;
        }
        state.pulling = true;
        if let Err(error) = self.channel.post(StreamEvent::Pull { desired_size }) {
            debug!(stream_id = self.channel.stream_id(), %error, "Pull not sent");
        }
    }

    /// Applies one event from the producer. Returns `true` once the stream
    /// id can be released.
    pub(crate) fn handle_event(&self, event: StreamEvent) -> bool {
        let mut state = lock(&self.state);
        let finished = match event {
            StreamEvent::StartComplete(Ok(())) => {
                state.started = true;
                self.pull_if_needed(&mut state);
                false
            }
            StreamEvent::PullComplete(Ok(())) => {
                state.pulling = false;
                if std::mem::take(&mut state.pull_again) {
                    self.pull_if_needed(&mut state);
                }
                false
            }
            StreamEvent::StartComplete(Err(reason))
            | StreamEvent::PullComplete(Err(reason))
            | StreamEvent::Error(reason) => {
                if !state.cancelled && !state.close_requested && state.error.is_none() {
                    state.error = Some(PDFError::from_wire(&reason));
                    state.queue.clear();
                    state.queued_size = 0;
                }
                !state.cancelled
            }
            StreamEvent::Enqueue(chunk) => {
                if state.close_requested || state.cancelled || state.error.is_some() {
                    debug!(
                        stream_id = self.channel.stream_id(),
                        "Ignoring chunk after the stream finished"
                    );
                } else {
                    let size = self.strategy.chunk_size(&chunk);
                    state.queue.push_back((chunk, size));
                    state.queued_size += size;
                    self.pull_if_needed(&mut state);
                }
                false
            }
            StreamEvent::Close => {
                if !state.cancelled && state.error.is_none() {
                    state.close_requested = true;
                }
                !state.cancelled
            }
            StreamEvent::CancelComplete(outcome) => {
                if let Some(waiter) = state.cancel_waiter.take() {
                    let _ = waiter.send(outcome.map_err(|reason| PDFError::from_wire(&reason)));
                }
                true
            }
            StreamEvent::Pull { .. } | StreamEvent::Cancel(_) => {
                debug!(
                    stream_id = self.channel.stream_id(),
                    "Ignoring producer-side event"
                );
                false
            }
        };
        drop(state);
        self.changed.notify_waiters();
        finished
    }

    /// Terminates the stream locally, e.g. when the handler is destroyed.
    pub(crate) fn fail(&self, reason: PDFError) {
        {
            let mut state = lock(&self.state);
            if state.error.is_none() && !state.close_requested {
                state.error = Some(reason);
                state.queue.clear();
                state.queued_size = 0;
            }
            state.cancel_waiter.take();
        }
        self.changed.notify_waiters();
    }

    async fn read(&self) -> PDFResult<Option<Payload>> {
        loop {
            let notified = self.changed.notified();
            {
                let mut state = lock(&self.state);
                if let Some((chunk, size)) = state.queue.pop_front() {
                    state.queued_size -= size;
                    self.pull_if_needed(&mut state);
                    return Ok(Some(chunk));
                }
                if let Some(error) = &state.error {
                    return Err(error.clone());
                }
                if state.close_requested || state.cancelled {
                    return Ok(None);
                }
                state.waiting_readers += 1;
                self.pull_if_needed(&mut state);
            }
            let _waiting = WaitingReader(self);
            notified.await;
        }
    }

    async fn cancel(&self, reason: PDFError) -> PDFResult<()> {
        let receiver = {
            let mut state = lock(&self.state);
            if state.cancelled || state.close_requested || state.error.is_some() {
                return Ok(());
            }
            state.cancelled = true;
            state.queue.clear();
            state.queued_size = 0;
            let (sender, receiver) = oneshot::channel();
            state.cancel_waiter = Some(sender);
            self.channel.post(StreamEvent::Cancel(reason.to_wire()))?;
            receiver
        };
        self.changed.notify_waiters();
        receiver.await.unwrap_or(Ok(()))
    }
}

struct WaitingReader<'a>(&'a StreamController);

impl Drop for WaitingReader<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        state.waiting_readers = state.waiting_readers.saturating_sub(1);
    }
}

/// Pull-based sequence of chunks produced by the peer.
pub struct ReadableStream {
    controller: Arc<StreamController>,
}

impl ReadableStream {
    pub(crate) fn new(controller: Arc<StreamController>) -> Self {
        ReadableStream { controller }
    }

    /// Next chunk, or `None` once the stream closed or was cancelled.
    pub async fn read(&self) -> PDFResult<Option<Payload>> {
        self.controller.read().await
    }

    /// Asks the producer to stop and waits for its acknowledgement.
    pub async fn cancel(&self, reason: PDFError) -> PDFResult<()> {
        self.controller.cancel(reason).await
    }

    pub fn desired_size(&self) -> i64 {
        let state = lock(&self.controller.state);
        self.controller.desired_size(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message_handler::MessageHandler;
    use crate::core::transport::MessagePort;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair() -> (MessageHandler, MessageHandler) {
        let (main_port, worker_port) = MessagePort::pair();
        (
            MessageHandler::new("main", "worker", main_port),
            MessageHandler::new("worker", "main", worker_port),
        )
    }

    #[tokio::test]
    async fn test_chunks_then_close() {
        let (main, worker) = pair();
        worker
            .on_stream("Numbers", |_, sink| async move {
                tokio::spawn(async move {
                    for i in 0..5u32 {
                        if sink.ready().await.is_err() {
                            return Ok(());
                        }
                        sink.enqueue(Payload::json(&i)?, 1);
                    }
                    sink.close();
                    Ok::<(), PDFError>(())
                });
                Ok(())
            })
            .unwrap();

        let stream = main.send_with_stream("Numbers", Payload::Null, QueueingStrategy::default());
        let mut seen = Vec::new();
        while let Some(chunk) = stream.read().await.unwrap() {
            seen.push(chunk.parse::<u32>().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(stream.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_backpressure_gates_ready() {
        let (main, worker) = pair();
        let (sink_tx, mut sink_rx) = tokio::sync::mpsc::unbounded_channel();
        let (pull_tx, mut pull_rx) = tokio::sync::mpsc::unbounded_channel();
        worker
            .on_stream("Gate", move |_, sink| {
                let pulls = pull_tx.clone();
                sink.on_pull(move || {
                    let _ = pulls.send(());
                    async { Ok(()) }
                });
                let _ = sink_tx.send(sink);
                async { Ok(()) }
            })
            .unwrap();

        let stream = main.send_with_stream("Gate", Payload::Null, QueueingStrategy::new(2));
        let sink = sink_rx.recv().await.unwrap();
        pull_rx.recv().await.unwrap();

        assert_eq!(sink.desired_size(), 2);
        sink.enqueue(Payload::Null, 1);
        sink.enqueue(Payload::Null, 1);
        assert_eq!(sink.desired_size(), 0);

        let waiter = tokio::spawn({
            let sink = sink.clone();
            async move { sink.ready().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Reading frees capacity, which triggers a PULL that reopens the gate.
        assert_eq!(stream.read().await.unwrap(), Some(Payload::Null));
        assert!(waiter.await.unwrap().is_ok());
        assert!(sink.desired_size() > 0);
    }

    #[tokio::test]
    async fn test_error_terminates_stream() {
        let (main, worker) = pair();
        worker
            .on_stream("Broken", |_, sink| async move {
                sink.enqueue(Payload::json(&1)?, 1);
                sink.error(PDFError::InvalidPdf("bad".into()));
                sink.enqueue(Payload::json(&2)?, 1);
                Ok(())
            })
            .unwrap();

        let stream = main.send_with_stream("Broken", Payload::Null, QueueingStrategy::new(8));
        assert_eq!(
            stream.read().await,
            Err(PDFError::InvalidPdf("bad".into()))
        );
    }

    #[tokio::test]
    async fn test_start_failure_errors_stream() {
        let (main, worker) = pair();
        worker
            .on_stream("NoStart", |_, _sink| async move {
                Err(PDFError::MissingPdf("Missing PDF \"x\".".into()))
            })
            .unwrap();

        let stream = main.send_with_stream("NoStart", Payload::Null, QueueingStrategy::default());
        assert!(matches!(stream.read().await, Err(PDFError::MissingPdf(_))));
    }

    #[tokio::test]
    async fn test_cancel_is_acknowledged() {
        let (main, worker) = pair();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&cancelled);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        worker
            .on_stream("Endless", move |_, sink| {
                let seen = Arc::clone(&seen);
                sink.on_cancel(move |reason| {
                    assert!(matches!(reason, PDFError::Abort(_)));
                    seen.fetch_add(1, Ordering::SeqCst);
                });
                let _ = tx.send(sink);
                async { Ok(()) }
            })
            .unwrap();

        let stream = main.send_with_stream("Endless", Payload::Null, QueueingStrategy::default());
        let sink = rx.recv().await.unwrap();

        stream.cancel(PDFError::abort("stop")).await.unwrap();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(sink.is_cancelled());
        assert!(sink.ready().await.is_err());
        assert_eq!(stream.read().await.unwrap(), None);

        // Chunks sent after the cancel are never observed.
        sink.enqueue(Payload::Null, 1);
        assert_eq!(stream.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_on_pull_drives_production() {
        let (main, worker) = pair();
        worker
            .on_stream("Pulled", |_, sink| {
                let counter = Arc::new(AtomicUsize::new(0));
                let producer = sink.clone();
                sink.on_pull(move || {
                    let sink = producer.clone();
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 3 {
                            sink.enqueue(Payload::json(&n)?, 1);
                        } else {
                            sink.close();
                        }
                        Ok(())
                    }
                });
                async { Ok(()) }
            })
            .unwrap();

        let stream = main.send_with_stream("Pulled", Payload::Null, QueueingStrategy::default());
        let mut seen = Vec::new();
        while let Some(chunk) = stream.read().await.unwrap() {
            seen.push(chunk.parse::<usize>().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_destroy_fails_open_streams() {
        let (main, worker) = pair();
        worker
            .on_stream("Silent", |_, _sink| async { Ok(()) })
            .unwrap();

        let stream = main.send_with_stream("Silent", Payload::Null, QueueingStrategy::default());
        main.destroy();
        assert!(matches!(stream.read().await, Err(PDFError::Abort(_))));
    }
}
