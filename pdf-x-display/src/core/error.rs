//! Error types for the rendering pipeline.
//!
//! `PDFError` is a closed set. The first group of variants may cross the
//! worker boundary (see [`WireError`]); the rest are local to one context.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a password was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PasswordReason {
    /// The document is encrypted and no password was supplied.
    NeedPassword = 1,
    /// The supplied password was rejected.
    IncorrectPassword = 2,
}

impl PasswordReason {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PasswordReason::NeedPassword),
            2 => Some(PasswordReason::IncorrectPassword),
            _ => None,
        }
    }
}

/// Errors produced by the protocol, the session and the renderer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PDFError {
    /// The document needs a (different) password.
    #[error("{message}")]
    Password { message: String, code: PasswordReason },

    /// The bytes are not a usable PDF file.
    #[error("{0}")]
    InvalidPdf(String),

    /// The resource does not exist (404 or missing file).
    #[error("{0}")]
    MissingPdf(String),

    /// The server answered with an unexpected status.
    #[error("{message}")]
    UnexpectedResponse { message: String, status: u16 },

    /// A failure of unknown kind, wrapped with its original text.
    #[error("{message}")]
    UnknownError { message: String, details: String },

    /// The operation was intentionally cancelled.
    #[error("{0}")]
    Abort(String),

    /// A render task was stopped by its caller.
    #[error("{message}")]
    RenderingCancelled { message: String, kind: String },

    /// Protocol mismatch, e.g. a message for an action nobody registered.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A render was requested on a surface that is already being drawn to.
    #[error("Cannot use the same canvas during multiple render() operations.")]
    SurfaceInUse,

    /// Poll-then-fail read of a pool object that has no value yet.
    #[error("Requesting object that isn't resolved yet {0}.")]
    ObjectNotResolved(String),

    /// Invalid byte range requested
    #[error("Invalid byte range: {begin}..{end}")]
    InvalidByteRange { begin: u64, end: u64 },

    /// Stream operation failed
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Drawing surface failure
    #[error("Rendering error: {0}")]
    RenderingError(String),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

impl PDFError {
    pub fn abort(message: impl Into<String>) -> Self {
        PDFError::Abort(message.into())
    }

    pub fn rendering_cancelled(message: impl Into<String>, kind: impl Into<String>) -> Self {
        PDFError::RenderingCancelled {
            message: message.into(),
            kind: kind.into(),
        }
    }

    /// True for the expected, non-application outcomes of cancelling work.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PDFError::Abort(_) | PDFError::RenderingCancelled { .. }
        )
    }

    /// The message without any kind prefix.
    pub fn message(&self) -> String {
        match self {
            PDFError::Password { message, .. }
            | PDFError::UnexpectedResponse { message, .. }
            | PDFError::UnknownError { message, .. }
            | PDFError::RenderingCancelled { message, .. } => message.clone(),
            PDFError::InvalidPdf(message)
            | PDFError::MissingPdf(message)
            | PDFError::Abort(message)
            | PDFError::Generic(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Converts the error into its serializable form.
    ///
    /// Local kinds are wrapped as `UnknownErrorException`, keeping the
    /// display text as details.
    pub fn to_wire(&self) -> WireError {
        let mut wire = WireError::named(self.wire_name(), self.message());
        match self {
            PDFError::Password { code, .. } => wire.code = Some(code.code()),
            PDFError::UnexpectedResponse { status, .. } => wire.status = Some(*status),
            PDFError::UnknownError { details, .. } => wire.details = Some(details.clone()),
            PDFError::RenderingCancelled { kind, .. } => wire.details = Some(kind.clone()),
            PDFError::InvalidPdf(_) | PDFError::MissingPdf(_) | PDFError::Abort(_) => {}
            other => wire.details = Some(other.to_string()),
        }
        wire
    }

    /// Rebuilds an error received from the peer.
    pub fn from_wire(wire: &WireError) -> Self {
        let message = wire.message.clone();
        match wire.name.as_str() {
            "PasswordException" => PDFError::Password {
                message,
                code: wire
                    .code
                    .and_then(PasswordReason::from_code)
                    .unwrap_or(PasswordReason::NeedPassword),
            },
            "InvalidPDFException" => PDFError::InvalidPdf(message),
            "MissingPDFException" => PDFError::MissingPdf(message),
            "UnexpectedResponseException" => PDFError::UnexpectedResponse {
                message,
                status: wire.status.unwrap_or(0),
            },
            "AbortException" => PDFError::Abort(message),
            "RenderingCancelledException" => PDFError::RenderingCancelled {
                message,
                kind: wire.details.clone().unwrap_or_default(),
            },
            _ => PDFError::UnknownError {
                message,
                details: wire.details.clone().unwrap_or_default(),
            },
        }
    }

    fn wire_name(&self) -> &'static str {
        match self {
            PDFError::Password { .. } => "PasswordException",
            PDFError::InvalidPdf(_) => "InvalidPDFException",
            PDFError::MissingPdf(_) => "MissingPDFException",
            PDFError::UnexpectedResponse { .. } => "UnexpectedResponseException",
            PDFError::Abort(_) => "AbortException",
            PDFError::RenderingCancelled { .. } => "RenderingCancelledException",
            _ => "UnknownErrorException",
        }
    }
}

/// Failure value as it travels over a message port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl WireError {
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        WireError {
            name: name.into(),
            message: message.into(),
            code: None,
            status: None,
            details: None,
        }
    }
}

impl From<&PDFError> for WireError {
    fn from(error: &PDFError) -> Self {
        error.to_wire()
    }
}

impl From<WireError> for PDFError {
    fn from(wire: WireError) -> Self {
        PDFError::from_wire(&wire)
    }
}

impl From<serde_json::Error> for PDFError {
    fn from(error: serde_json::Error) -> Self {
        PDFError::Protocol(format!("malformed payload: {error}"))
    }
}

impl From<std::io::Error> for PDFError {
    fn from(error: std::io::Error) -> Self {
        PDFError::StreamError(error.to_string())
    }
}

/// Result type alias for PDF operations
pub type PDFResult<T> = Result<T, PDFError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kinds_survive_the_wire() {
        let errors = vec![
            PDFError::Password {
                message: "No password given".into(),
                code: PasswordReason::NeedPassword,
            },
            PDFError::InvalidPdf("Invalid PDF structure.".into()),
            PDFError::MissingPdf("Missing PDF \"a.pdf\".".into()),
            PDFError::UnexpectedResponse {
                message: "Unexpected server response (500).".into(),
                status: 500,
            },
            PDFError::UnknownError {
                message: "boom".into(),
                details: "Error: boom".into(),
            },
            PDFError::Abort("Worker was terminated.".into()),
            PDFError::rendering_cancelled("Rendering cancelled, page 1", "canvas"),
        ];

        for error in errors {
            assert_eq!(PDFError::from_wire(&error.to_wire()), error);
        }
    }

    #[test]
    fn test_local_kinds_are_wrapped_as_unknown() {
        let wire = PDFError::SurfaceInUse.to_wire();
        assert_eq!(wire.name, "UnknownErrorException");

        match PDFError::from_wire(&wire) {
            PDFError::UnknownError { message, details } => {
                assert_eq!(
                    message,
                    "Cannot use the same canvas during multiple render() operations."
                );
                assert_eq!(details, message);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unrecognized_name_becomes_unknown_error() {
        let mut wire = WireError::named("FormatError", "Bad xref");
        wire.details = Some("FormatError: Bad xref".into());

        assert_eq!(
            PDFError::from_wire(&wire),
            PDFError::UnknownError {
                message: "Bad xref".into(),
                details: "FormatError: Bad xref".into(),
            }
        );
    }

    #[test]
    fn test_wire_json_shape() {
        let wire = PDFError::UnexpectedResponse {
            message: "Unexpected server response (403).".into(),
            status: 403,
        }
        .to_wire();
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["name"], "UnexpectedResponseException");
        assert_eq!(json["status"], 403);
        assert!(json.get("code").is_none());
    }

    #[test]
    fn test_cancellation_kinds() {
        assert!(PDFError::abort("x").is_cancellation());
        assert!(PDFError::rendering_cancelled("x", "canvas").is_cancellation());
        assert!(!PDFError::InvalidPdf("x".into()).is_cancellation());
    }
}
