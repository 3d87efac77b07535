//! Request/response calls and pull-based streams over a [`MessagePort`].
//!
//! Each side of a port owns one `MessageHandler`. Incoming actions are routed
//! to handlers registered with [`MessageHandler::on`] or
//! [`MessageHandler::on_stream`]; an action nobody registered is a protocol
//! mismatch and shuts the handler down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use super::capability::Capability;
use super::error::{PDFError, PDFResult};
use super::lock;
use super::readable_stream::{QueueingStrategy, ReadableStream, StreamController};
use super::stream_sink::StreamSink;
use super::transport::{
    CallbackResult, Message, MessageBody, MessagePort, Payload, PortSender, StreamEvent,
};

type CallHandler = Arc<dyn Fn(Payload) -> BoxFuture<'static, PDFResult<Payload>> + Send + Sync>;
type StreamHandler =
    Arc<dyn Fn(Payload, StreamSink) -> BoxFuture<'static, PDFResult<()>> + Send + Sync>;

#[derive(Clone)]
enum Registered {
    Call(CallHandler),
    Stream(StreamHandler),
}

/// Addressing for the events of one stream id.
#[derive(Clone)]
pub(crate) struct StreamChannel {
    port: PortSender,
    source_name: Arc<str>,
    target_name: Arc<str>,
    stream_id: u32,
    registry: Weak<HandlerInner>,
}

impl StreamChannel {
    pub(crate) fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub(crate) fn post(&self, event: StreamEvent) -> PDFResult<()> {
        self.port.post_message(Message {
            source_name: self.source_name.to_string(),
            target_name: self.target_name.to_string(),
            body: MessageBody::Stream {
                stream_id: self.stream_id,
                event,
            },
        })
    }

    /// Drops the producer-side registration for this id.
    pub(crate) fn forget_sink(&self) {
        if let Some(inner) = self.registry.upgrade() {
            lock(&inner.sinks).remove(&self.stream_id);
        }
    }
}

pub(crate) struct HandlerInner {
    source_name: Arc<str>,
    target_name: Arc<str>,
    port: PortSender,
    next_callback_id: AtomicU32,
    next_stream_id: AtomicU32,
    handlers: Mutex<FxHashMap<String, Registered>>,
    callbacks: Mutex<FxHashMap<u32, oneshot::Sender<PDFResult<Payload>>>>,
    sinks: Mutex<FxHashMap<u32, StreamSink>>,
    controllers: Mutex<FxHashMap<u32, Arc<StreamController>>>,
    destroyed: AtomicBool,
    fatal: Mutex<Option<PDFError>>,
    listener: Mutex<Option<AbortHandle>>,
    closed: Capability<()>,
}

/// One side of the RPC/streaming protocol.
#[derive(Clone)]
pub struct MessageHandler {
    inner: Arc<HandlerInner>,
}

impl MessageHandler {
    /// Creates a handler and starts listening on `port`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(source_name: &str, target_name: &str, port: MessagePort) -> Self {
        let (sender, receiver) = port.split();
        let inner = Arc::new(HandlerInner {
            source_name: Arc::from(source_name),
            target_name: Arc::from(target_name),
            port: sender,
            next_callback_id: AtomicU32::new(1),
            next_stream_id: AtomicU32::new(1),
            handlers: Mutex::new(FxHashMap::default()),
            callbacks: Mutex::new(FxHashMap::default()),
            sinks: Mutex::new(FxHashMap::default()),
            controllers: Mutex::new(FxHashMap::default()),
            destroyed: AtomicBool::new(false),
            fatal: Mutex::new(None),
            listener: Mutex::new(None),
            closed: Capability::new(),
        });

        let task = tokio::spawn(listen(Arc::downgrade(&inner), receiver));
        *lock(&inner.listener) = Some(task.abort_handle());

        MessageHandler { inner }
    }

    pub fn source_name(&self) -> &str {
        &self.inner.source_name
    }

    pub fn target_name(&self) -> &str {
        &self.inner.target_name
    }

    /// Registers the handler for a call or fire-and-forget action.
    ///
    /// The closure runs synchronously, in arrival order; only the future it
    /// returns runs concurrently with later messages.
    pub fn on<F, Fut>(&self, action: &str, handler: F) -> PDFResult<()>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PDFResult<Payload>> + Send + 'static,
    {
        let handler: CallHandler =
            Arc::new(move |data| -> BoxFuture<'static, PDFResult<Payload>> {
                Box::pin(handler(data))
            });
        self.register(action, Registered::Call(handler))
    }

    /// Registers the handler for a stream-opening action.
    ///
    /// The returned future settles the stream start; long-running producers
    /// spawn their work and return.
    pub fn on_stream<F, Fut>(&self, action: &str, handler: F) -> PDFResult<()>
    where
        F: Fn(Payload, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PDFResult<()>> + Send + 'static,
    {
        let handler: StreamHandler =
            Arc::new(move |data, sink| -> BoxFuture<'static, PDFResult<()>> {
                Box::pin(handler(data, sink))
            });
        self.register(action, Registered::Stream(handler))
    }

    fn register(&self, action: &str, handler: Registered) -> PDFResult<()> {
        let mut handlers = lock(&self.inner.handlers);
        if handlers.contains_key(action) {
            return Err(PDFError::Protocol(format!(
                "There is already an actionName called \"{action}\""
            )));
        }
        handlers.insert(action.to_string(), handler);
        Ok(())
    }

    /// Fire-and-forget.
    pub fn send(&self, action: &str, data: Payload) -> PDFResult<()> {
        self.inner.ensure_alive()?;
        self.inner.post(MessageBody::Action {
            action: action.to_string(),
            data,
            callback_id: None,
            stream_id: None,
            desired_size: None,
        })
    }

    /// Correlated call. The message is sent before this returns; the future
    /// resolves with the peer's answer.
    pub fn send_with_promise(
        &self,
        action: &str,
        data: Payload,
    ) -> impl Future<Output = PDFResult<Payload>> + Send + 'static + use<> {
        let receiver = self.inner.start_call(action, data);
        async move {
            match receiver {
                Ok(receiver) => receiver
                    .await
                    .unwrap_or_else(|_| Err(PDFError::abort("MessageHandler was destroyed."))),
                Err(error) => Err(error),
            }
        }
    }

    /// Opens a stream served by the peer's `on_stream` handler.
    pub fn send_with_stream(
        &self,
        action: &str,
        data: Payload,
        strategy: QueueingStrategy,
    ) -> ReadableStream {
        let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let high_water_mark = strategy.high_water_mark;
        let controller = Arc::new(StreamController::new(
            self.inner.channel(stream_id),
            strategy,
        ));

        let opened = self.inner.ensure_alive().and_then(|()| {
            lock(&self.inner.controllers).insert(stream_id, Arc::clone(&controller));
            self.inner.post(MessageBody::Action {
                action: action.to_string(),
                data,
                callback_id: None,
                stream_id: Some(stream_id),
                desired_size: Some(high_water_mark),
            })
        });

        if let Err(error) = opened {
            lock(&self.inner.controllers).remove(&stream_id);
            controller.fail(error);
        }

        ReadableStream::new(controller)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// The protocol error that stopped this handler, if any.
    pub fn fatal_error(&self) -> Option<PDFError> {
        lock(&self.inner.fatal).clone()
    }

    /// Resolves once the handler stops listening (destroyed, fatal error, or
    /// the peer went away).
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static + use<> {
        let closed = self.inner.closed.promise();
        async move {
            let _ = closed.await;
        }
    }

    /// Stops listening and settles everything still pending with `Abort`.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.abort();
        }
        lock(&self.inner.handlers).clear();
        self.inner
            .shutdown(PDFError::abort("MessageHandler was destroyed."));
    }
}

impl HandlerInner {
    fn ensure_alive(&self) -> PDFResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PDFError::abort("MessageHandler was destroyed."));
        }
        if let Some(error) = lock(&self.fatal).clone() {
            return Err(error);
        }
        Ok(())
    }

    fn post(&self, body: MessageBody) -> PDFResult<()> {
        self.port.post_message(Message {
            source_name: self.source_name.to_string(),
            target_name: self.target_name.to_string(),
            body,
        })
    }

    fn channel(self: &Arc<Self>, stream_id: u32) -> StreamChannel {
        StreamChannel {
            port: self.port.clone(),
            source_name: Arc::clone(&self.source_name),
            target_name: Arc::clone(&self.target_name),
            stream_id,
            registry: Arc::downgrade(self),
        }
    }

    fn start_call(
        &self,
        action: &str,
        data: Payload,
    ) -> PDFResult<oneshot::Receiver<PDFResult<Payload>>> {
        self.ensure_alive()?;
        let callback_id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        lock(&self.callbacks).insert(callback_id, sender);

        let posted = self.post(MessageBody::Action {
            action: action.to_string(),
            data,
            callback_id: Some(callback_id),
            stream_id: None,
            desired_size: None,
        });
        if let Err(error) = posted {
            lock(&self.callbacks).remove(&callback_id);
            return Err(error);
        }
        Ok(receiver)
    }

    fn dispatch(self: &Arc<Self>, message: Message) -> PDFResult<()> {
        if message.target_name != *self.source_name {
            debug!(
                target_name = %message.target_name,
                source_name = %self.source_name,
                "Ignoring message for another handler"
            );
            return Ok(());
        }

        match message.body {
            MessageBody::Action {
                action,
                data,
                callback_id,
                stream_id,
                desired_size,
            } => {
                let handler = lock(&self.handlers).get(&action).cloned();
                let Some(handler) = handler else {
                    return Err(PDFError::Protocol(format!(
                        "Unknown action from {}: {action}",
                        message.source_name
                    )));
                };

                match (handler, callback_id, stream_id) {
                    (Registered::Call(handler), Some(callback_id), None) => {
                        let future = handler(data);
                        let inner = Arc::clone(self);
                        tokio::spawn(async move {
                            let result = match future.await {
                                Ok(payload) => CallbackResult::Data(payload),
                                Err(error) => CallbackResult::Error(error.to_wire()),
                            };
                            if let Err(error) =
                                inner.post(MessageBody::Callback { callback_id, result })
                            {
                                debug!(callback_id, %error, "Dropping call response");
                            }
                        });
                    }
                    (Registered::Call(handler), None, None) => {
                        let future = handler(data);
                        tokio::spawn(async move {
                            if let Err(error) = future.await {
                                warn!(%action, %error, "Action handler failed");
                            }
                        });
                    }
                    (Registered::Stream(handler), None, Some(stream_id)) => {
                        self.open_sink(handler, data, stream_id, desired_size.unwrap_or(1));
                    }
                    _ => {
                        return Err(PDFError::Protocol(format!(
                            "Action {action} was sent with the wrong message kind"
                        )));
                    }
                }
            }
            MessageBody::Callback {
                callback_id,
                result,
            } => {
                let sender = lock(&self.callbacks).remove(&callback_id);
                match sender {
                    Some(sender) => {
                        let outcome = match result {
                            CallbackResult::Data(payload) => Ok(payload),
                            CallbackResult::Error(wire) => Err(PDFError::from_wire(&wire)),
                        };
                        let _ = sender.send(outcome);
                    }
                    None => warn!(callback_id, "Cannot resolve callback"),
                }
            }
            MessageBody::Stream { stream_id, event } => self.process_stream_event(stream_id, event),
        }
        Ok(())
    }

    fn open_sink(
        self: &Arc<Self>,
        handler: StreamHandler,
        data: Payload,
        stream_id: u32,
        desired_size: i64,
    ) {
        let channel = self.channel(stream_id);
        let sink = StreamSink::new(channel.clone(), desired_size);
        lock(&self.sinks).insert(stream_id, sink.clone());

        let start = handler(data, sink);
        tokio::spawn(async move {
            let outcome = start.await.map_err(|error| error.to_wire());
            if let Err(error) = channel.post(StreamEvent::StartComplete(outcome)) {
                debug!(stream_id, %error, "Dropping stream start");
            }
        });
    }

    fn process_stream_event(self: &Arc<Self>, stream_id: u32, event: StreamEvent) {
        match event {
            StreamEvent::Pull { desired_size } => {
                let sink = lock(&self.sinks).get(&stream_id).cloned();
                match sink {
                    Some(sink) => sink.handle_pull(desired_size),
                    None => {
                        let _ = self
                            .channel(stream_id)
                            .post(StreamEvent::PullComplete(Ok(())));
                    }
                }
            }
            StreamEvent::Cancel(reason) => {
                let sink = lock(&self.sinks).remove(&stream_id);
                match sink {
                    Some(sink) => sink.handle_cancel(PDFError::from_wire(&reason)),
                    None => {
                        let _ = self
                            .channel(stream_id)
                            .post(StreamEvent::CancelComplete(Ok(())));
                    }
                }
            }
            event => {
                let controller = lock(&self.controllers).get(&stream_id).cloned();
                let Some(controller) = controller else {
                    debug!(stream_id, kind = ?event.kind(), "Ignoring event for unknown stream");
                    return;
                };
                if controller.handle_event(event) {
                    lock(&self.controllers).remove(&stream_id);
                }
            }
        }
    }

    fn shutdown(&self, reason: PDFError) {
        let callbacks: Vec<_> = lock(&self.callbacks).drain().map(|(_, sender)| sender).collect();
        for sender in callbacks {
            let _ = sender.send(Err(reason.clone()));
        }

        let controllers: Vec<_> = lock(&self.controllers)
            .drain()
            .map(|(_, controller)| controller)
            .collect();
        for controller in controllers {
            controller.fail(reason.clone());
        }

        let sinks: Vec<_> = lock(&self.sinks).drain().map(|(_, sink)| sink).collect();
        for sink in sinks {
            sink.abandon(reason.clone());
        }

        self.closed.resolve(());
    }
}

impl Drop for HandlerInner {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}

async fn listen(inner: Weak<HandlerInner>, mut receiver: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = receiver.recv().await {
        let Some(handler) = inner.upgrade() else {
            return;
        };
        if let Err(fatal) = handler.dispatch(message) {
            error!(source_name = %handler.source_name, %fatal, "Fatal protocol error");
            *lock(&handler.fatal) = Some(fatal.clone());
            handler.shutdown(fatal);
            return;
        }
    }

    if let Some(handler) = inner.upgrade() {
        handler.shutdown(PDFError::abort("Message port was closed."));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::WireError;

    fn pair() -> (MessageHandler, MessageHandler) {
        let (main_port, worker_port) = MessagePort::pair();
        (
            MessageHandler::new("main", "worker", main_port),
            MessageHandler::new("worker", "main", worker_port),
        )
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (main, worker) = pair();
        worker
            .on("Echo", |data| async move { Ok(data) })
            .unwrap();

        let answer = main
            .send_with_promise("Echo", Payload::json(&42).unwrap())
            .await
            .unwrap();
        assert_eq!(answer.parse::<u32>().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_call_error_is_rehydrated() {
        let (main, worker) = pair();
        worker
            .on("Fail", |_| async move {
                Err::<Payload, _>(PDFError::MissingPdf("Missing PDF \"x.pdf\".".into()))
            })
            .unwrap();

        let error = main.send_with_promise("Fail", Payload::Null).await.unwrap_err();
        assert_eq!(error, PDFError::MissingPdf("Missing PDF \"x.pdf\".".into()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let (main, _worker) = pair();
        main.on("A", |_| async { Ok(Payload::Null) }).unwrap();
        assert!(matches!(
            main.on("A", |_| async { Ok(Payload::Null) }),
            Err(PDFError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_action_is_fatal() {
        let (main, worker) = pair();
        let pending = main.send_with_promise("NobodyListens", Payload::Null);

        worker.closed().await;
        assert!(matches!(worker.fatal_error(), Some(PDFError::Protocol(_))));
        assert!(worker.send("Anything", Payload::Null).is_err());

        main.destroy();
        assert!(matches!(pending.await, Err(PDFError::Abort(_))));
    }

    #[tokio::test]
    async fn test_second_resolution_for_same_id_is_ignored() {
        let (main_port, mut peer) = MessagePort::pair();
        let main = MessageHandler::new("main", "worker", main_port);

        let answer = main.send_with_promise("Call", Payload::Null);
        let Some(Message {
            body: MessageBody::Action {
                callback_id: Some(callback_id),
                ..
            },
            ..
        }) = peer.recv().await
        else {
            panic!("expected a call");
        };

        let reply = |result| Message {
            source_name: "worker".into(),
            target_name: "main".into(),
            body: MessageBody::Callback {
                callback_id,
                result,
            },
        };
        peer.post_message(reply(CallbackResult::Data(Payload::json(&1).unwrap())))
            .unwrap();
        peer.post_message(reply(CallbackResult::Error(WireError::named(
            "AbortException",
            "late",
        ))))
        .unwrap();

        assert_eq!(answer.await.unwrap().parse::<u32>().unwrap(), 1);

        // The duplicate is dropped and the handler keeps working.
        let again = main.send_with_promise("Call", Payload::Null);
        assert!(peer.recv().await.is_some());
        main.destroy();
        assert!(matches!(again.await, Err(PDFError::Abort(_))));
    }

    #[tokio::test]
    async fn test_destroy_rejects_pending_calls() {
        let (main, worker) = pair();
        worker
            .on("Slow", |_| async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(Payload::Null)
            })
            .unwrap();

        let pending = main.send_with_promise("Slow", Payload::Null);
        main.destroy();

        assert!(matches!(pending.await, Err(PDFError::Abort(_))));
        assert!(main.is_destroyed());
        assert!(main.send("Slow", Payload::Null).is_err());
    }

    #[tokio::test]
    async fn test_fire_and_forget_runs_in_order() {
        let (main, worker) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker
            .on("Log", move |data| {
                let _ = tx.send(data.parse::<u32>().unwrap_or_default());
                async { Ok(Payload::Null) }
            })
            .unwrap();

        for i in 0..5u32 {
            main.send("Log", Payload::json(&i).unwrap()).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
