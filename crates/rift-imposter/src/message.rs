//! Decoded inbound messages and the replies written back to clients.
//!
//! A `Request` is what the Frame Assembler (or hyper, for HTTP) hands to the
//! predicate evaluator and what ends up in the request ledger. Every variant
//! serializes to the Mountebank-style request object that injected functions
//! receive.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Payload representation for raw stream imposters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Payloads are decoded as UTF-8 text (lossy)
    #[default]
    Text,
    /// Payloads are opaque bytes, rendered as base64
    Binary,
}

impl Mode {
    /// Render raw bytes the way they appear in request objects and the ledger.
    pub fn render(self, bytes: &[u8]) -> String {
        match self {
            Mode::Text => String::from_utf8_lossy(bytes).into_owned(),
            Mode::Binary => base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Parse a configured payload into the bytes written on the wire.
    pub fn parse(self, data: &str) -> Result<Bytes, base64::DecodeError> {
        match self {
            Mode::Text => Ok(Bytes::copy_from_slice(data.as_bytes())),
            Mode::Binary => base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map(Bytes::from),
        }
    }
}

/// One complete inbound message.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Request {
    Tcp(TcpRequest),
    Http(HttpRequest),
    Smtp(SmtpRequest),
}

/// Raw stream message assembled by the frame codec.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRequest {
    pub request_from: String,
    /// Text, or base64 in binary mode
    pub data: String,
    #[serde(skip)]
    pub raw: Bytes,
    #[serde(skip)]
    pub mode: Mode,
}

impl TcpRequest {
    pub fn new(request_from: impl Into<String>, raw: Bytes, mode: Mode) -> Self {
        Self {
            request_from: request_from.into(),
            data: mode.render(&raw),
            raw,
            mode,
        }
    }
}

/// HTTP request with its body fully collected.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub request_from: String,
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Mail message accepted by an SMTP imposter.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SmtpRequest {
    pub request_from: String,
    pub envelope_from: String,
    pub envelope_to: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub text: String,
}

/// A request field as seen by predicates.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
    Map(&'a BTreeMap<String, String>),
}

impl Request {
    pub fn request_from(&self) -> &str {
        match self {
            Request::Tcp(r) => &r.request_from,
            Request::Http(r) => &r.request_from,
            Request::Smtp(r) => &r.request_from,
        }
    }

    /// Look up a predicate field by its Mountebank name.
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        match (self, name) {
            (_, "requestFrom") => Some(FieldValue::Text(self.request_from())),
            (Request::Tcp(r), "data") => Some(match r.mode {
                Mode::Text => FieldValue::Text(&r.data),
                Mode::Binary => FieldValue::Bytes(&r.raw),
            }),
            (Request::Http(r), "method") => Some(FieldValue::Text(&r.method)),
            (Request::Http(r), "path") => Some(FieldValue::Text(&r.path)),
            (Request::Http(r), "body") => Some(FieldValue::Text(&r.body)),
            (Request::Http(r), "query") => Some(FieldValue::Map(&r.query)),
            (Request::Http(r), "headers") => Some(FieldValue::Map(&r.headers)),
            _ => None,
        }
    }

    /// Request object handed to injected functions and recorded in the ledger.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Outbound HTTP response.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }
}

/// Connection-level misbehaviour a stub can ask for instead of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Fault {
    ConnectionResetByPeer,
    RandomDataThenClose,
}

impl Fault {
    pub fn as_str(self) -> &'static str {
        match self {
            Fault::ConnectionResetByPeer => "CONNECTION_RESET_BY_PEER",
            Fault::RandomDataThenClose => "RANDOM_DATA_THEN_CLOSE",
        }
    }
}

/// What the connection handler does with a resolved message.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Raw bytes for stream protocols; empty means nothing is written
    Bytes(Bytes),
    Http(HttpResponse),
    Fault(Fault),
    /// Close the connection without replying
    Close,
}

impl Reply {
    /// Ledger rendering of the reply.
    pub fn to_json(&self, mode: Mode) -> serde_json::Value {
        match self {
            Reply::Bytes(bytes) => serde_json::json!({ "data": mode.render(bytes) }),
            Reply::Http(response) => {
                serde_json::to_value(response).unwrap_or(serde_json::Value::Null)
            }
            Reply::Fault(fault) => serde_json::json!({ "fault": fault }),
            Reply::Close => serde_json::Value::Null,
        }
    }
}
