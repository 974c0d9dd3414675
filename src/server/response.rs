//! Transport-agnostic response type shared by all command handlers.
//!
//! Handlers stay testable without sockets: they return an `ApiResponse`,
//! and the hyper glue in `server::run` turns it into a wire response.

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::mpsc;

pub enum ResponsePayload {
    Bytes(Bytes),
    /// Server-sent events: chunks arrive until the sender is dropped.
    Stream(mpsc::Receiver<Bytes>),
}

impl std::fmt::Debug for ResponsePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponsePayload::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            ResponsePayload::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub payload: ResponsePayload,
    pub headers: Vec<(&'static str, String)>,
}

impl ApiResponse {
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            payload: ResponsePayload::Bytes(Bytes::from(value.to_string())),
            headers: Vec::new(),
        }
    }

    pub fn ok_json(value: &serde_json::Value) -> Self {
        Self::json(StatusCode::OK, value)
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            payload: ResponsePayload::Bytes(Bytes::from(body.into())),
            headers: Vec::new(),
        }
    }

    pub fn pem(body: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/x-pem-file",
            payload: ResponsePayload::Bytes(Bytes::from(body)),
            headers: Vec::new(),
        }
    }

    pub fn pem_chain(body: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/pem-certificate-chain",
            payload: ResponsePayload::Bytes(Bytes::from(body)),
            headers: Vec::new(),
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            content_type: "text/plain",
            payload: ResponsePayload::Bytes(Bytes::new()),
            headers: Vec::new(),
        }
    }

    pub fn event_stream(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/event-stream",
            payload: ResponsePayload::Stream(rx),
            headers: vec![("cache-control", "no-cache".to_string())],
        }
    }

    pub fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Buffered body bytes; panics on streaming payloads. Intended for
    /// tests and handlers that post-process their own responses.
    pub fn body_bytes(&self) -> &Bytes {
        match &self.payload {
            ResponsePayload::Bytes(b) => b,
            ResponsePayload::Stream(_) => panic!("streaming response has no body bytes"),
        }
    }

    /// Parse the buffered body as JSON; panics when it is not.
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(self.body_bytes()).expect("response body is JSON")
    }
}
