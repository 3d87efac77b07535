//! Message shapes and the ordered port that carries them between contexts.
//!
//! A port is one end of an in-order, unbounded channel pair. Both ends may
//! live on the same runtime (loopback) or on different threads.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::{PDFError, PDFResult, WireError};
use super::font::{FontData, PathCommand};
use super::image::ImagePayload;
use super::operator_list::OperatorListChunk;
use super::text_content::TextContent;

/// Callback sub-kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackKind {
    Data = 1,
    Error = 2,
}

/// Stream sub-kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Cancel = 1,
    CancelComplete = 2,
    Close = 3,
    Enqueue = 4,
    Error = 5,
    Pull = 6,
    PullComplete = 7,
    StartComplete = 8,
}

/// Data carried by actions, responses and stream chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Null,
    Json(serde_json::Value),
    Bytes(Bytes),
    OperatorList(OperatorListChunk),
    TextContent(TextContent),
    Object(ObjectMessage),
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> PDFResult<Payload> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Deserializes a JSON payload. `Null` parses as JSON `null`.
    pub fn parse<T: DeserializeOwned>(&self) -> PDFResult<T> {
        match self {
            Payload::Json(value) => Ok(T::deserialize(value)?),
            Payload::Null => Ok(serde_json::from_value(serde_json::Value::Null)?),
            other => Err(PDFError::Protocol(format!(
                "expected a JSON payload, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn into_bytes(self) -> PDFResult<Bytes> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            other => Err(PDFError::Protocol(format!(
                "expected a binary payload, got {}",
                other.kind_name()
            ))),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Null => "null",
            Payload::Json(_) => "json",
            Payload::Bytes(_) => "bytes",
            Payload::OperatorList(_) => "operator list",
            Payload::TextContent(_) => "text content",
            Payload::Object(_) => "object",
        }
    }
}

/// A decoded-resource push (`commonobj` / `obj`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMessage {
    pub id: String,
    /// Set for page-scoped objects.
    pub page_index: Option<usize>,
    pub data: ObjectData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectData {
    Font(FontData),
    /// The worker failed to translate the font.
    FontError(WireError),
    FontPath(Vec<PathCommand>),
    FontType3Res,
    Image(ImagePayload),
    JpegStream(Bytes),
}

impl ObjectData {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectData::Font(_) | ObjectData::FontError(_) => "Font",
            ObjectData::FontPath(_) => "FontPath",
            ObjectData::FontType3Res => "FontType3Res",
            ObjectData::Image(_) => "Image",
            ObjectData::JpegStream(_) => "JpegStream",
        }
    }
}

/// Result half of a correlated call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallbackResult {
    Data(Payload),
    Error(WireError),
}

impl CallbackResult {
    pub fn kind(&self) -> CallbackKind {
        match self {
            CallbackResult::Data(_) => CallbackKind::Data,
            CallbackResult::Error(_) => CallbackKind::Error,
        }
    }
}

/// Stream control and data events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Pull { desired_size: i64 },
    PullComplete(Result<(), WireError>),
    StartComplete(Result<(), WireError>),
    Enqueue(Payload),
    Close,
    Error(WireError),
    Cancel(WireError),
    CancelComplete(Result<(), WireError>),
}

impl StreamEvent {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamEvent::Pull { .. } => StreamKind::Pull,
            StreamEvent::PullComplete(_) => StreamKind::PullComplete,
            StreamEvent::StartComplete(_) => StreamKind::StartComplete,
            StreamEvent::Enqueue(_) => StreamKind::Enqueue,
            StreamEvent::Close => StreamKind::Close,
            StreamEvent::Error(_) => StreamKind::Error,
            StreamEvent::Cancel(_) => StreamKind::Cancel,
            StreamEvent::CancelComplete(_) => StreamKind::CancelComplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Fire-and-forget when both ids are absent; a call when `callback_id`
    /// is set; a stream open when `stream_id` is set.
    Action {
        action: String,
        data: Payload,
        callback_id: Option<u32>,
        stream_id: Option<u32>,
        desired_size: Option<i64>,
    },
    Callback {
        callback_id: u32,
        result: CallbackResult,
    },
    Stream {
        stream_id: u32,
        event: StreamEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub source_name: String,
    pub target_name: String,
    pub body: MessageBody,
}

/// Sending half of a port.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl PortSender {
    pub fn post_message(&self, message: Message) -> PDFResult<()> {
        self.tx
            .send(message)
            .map_err(|_| PDFError::abort("Message port is closed."))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One end of a bidirectional, ordered message channel.
#[derive(Debug)]
pub struct MessagePort {
    sender: PortSender,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl MessagePort {
    /// Creates two connected ports.
    pub fn pair() -> (MessagePort, MessagePort) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();

        (
            MessagePort {
                sender: PortSender { tx: right_tx },
                receiver: left_rx,
            },
            MessagePort {
                sender: PortSender { tx: left_tx },
                receiver: right_rx,
            },
        )
    }

    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    pub fn post_message(&self, message: Message) -> PDFResult<()> {
        self.sender.post_message(message)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (PortSender, mpsc::UnboundedReceiver<Message>) {
        (self.sender, self.receiver)
    }
}
