//! Envelope: the language-neutral request/response value passed between the
//! HTTP front-door and the dispatcher, and the error kinds a dispatch can
//! resolve to.

use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;

/// An HTTP call translated into a dispatcher-ready request.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request_id: String,
    pub service: String,
    pub method: String,
    pub body: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub deadline: Instant,
}

/// The dispatcher's response to a successfully completed call.
#[derive(Debug, Clone)]
pub struct EnvelopeResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

/// Error kinds the core distinguishes, each surfaced to HTTP as a fixed
/// status code.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("no healthy instance registered for this service")]
    ServiceUnavailable,

    #[error("selected instance's send queue is full")]
    Unavailable,

    #[error("connection to the backend instance was lost")]
    ConnectionLost,

    #[error("request timed out waiting for a response")]
    Timeout,

    #[error("internal dispatcher error: {0}")]
    Internal(String),

    /// The backend itself signalled a non-success outcome via response
    /// metadata; its status is forwarded to the HTTP caller verbatim.
    #[error("backend signalled error status {status}")]
    Backend { status: u16 },
}

impl DispatchError {
    /// Map this error kind to the HTTP status a caller should see.
    pub fn http_status(&self) -> u16 {
        match self {
            DispatchError::ServiceUnavailable => 404,
            DispatchError::Unavailable => 503,
            DispatchError::ConnectionLost => 503,
            DispatchError::Timeout => 504,
            DispatchError::Internal(_) => 500,
            DispatchError::Backend { status } => *status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_matches_fixed_table() {
        assert_eq!(DispatchError::ServiceUnavailable.http_status(), 404);
        assert_eq!(DispatchError::Unavailable.http_status(), 503);
        assert_eq!(DispatchError::ConnectionLost.http_status(), 503);
        assert_eq!(DispatchError::Timeout.http_status(), 504);
        assert_eq!(DispatchError::Internal("boom".into()).http_status(), 500);
        assert_eq!(DispatchError::Backend { status: 422 }.http_status(), 422);
    }
}
