//! Upstream round trips for `proxy` responses.
//!
//! The imposter forwards the inbound message to the real service with the
//! same protocol and relays what comes back. Each upstream also renders the
//! reply as an `is` payload so it can be recorded into the stub store.
//!
//! # Module Structure
//!
//! - `http` - reqwest-backed HTTP upstream
//! - `tcp` - raw TCP upstream, reply ends on close or after an idle window

mod http;
mod tcp;

pub use self::http::HttpUpstream;
pub use self::tcp::TcpUpstream;

use crate::imposter::{ImposterError, Protocol};
use crate::message::{Reply, Request};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid proxy target {0}")]
    InvalidTarget(String),

    #[error("cannot proxy a {request} request to a {upstream} upstream")]
    ProtocolMismatch {
        request: &'static str,
        upstream: &'static str,
    },

    #[error("failed to reach {to}: {source}")]
    Connect {
        to: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to upstream: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// What came back from the real service.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    /// Relayed to the client as-is
    pub reply: Reply,
    /// The same reply as an `is` response payload, for recording
    pub payload: Value,
    pub latency: Duration,
}

/// A real service reachable with the imposter's protocol.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, to: &str, request: &Request) -> Result<UpstreamReply, ProxyError>;
}

/// Check a proxy `to` address before the imposter is bound.
pub fn validate_target(protocol: Protocol, to: &str) -> Result<(), ImposterError> {
    let invalid = |why: &str| ImposterError::InvalidProxy(format!("{to}: {why}"));
    match protocol {
        Protocol::Tcp => tcp::parse_target(to)
            .map(|_| ())
            .map_err(|_| invalid("tcp proxies must point at tcp://host:port")),
        Protocol::Http => {
            let url = reqwest::Url::parse(to).map_err(|e| invalid(&e.to_string()))?;
            match url.scheme() {
                "http" | "https" if url.host_str().is_some() => Ok(()),
                _ => Err(invalid("http proxies must point at an http:// or https:// URL")),
            }
        }
        Protocol::Smtp => Err(invalid("smtp imposters cannot proxy")),
    }
}
