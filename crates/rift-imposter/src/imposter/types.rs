//! Type definitions for imposter declarations, state and errors.
//!
//! Declarations are deserialized as-is from the creator's JSON/YAML and kept
//! verbatim for later description. Everything that can be checked is compiled
//! into runtime form by `core::Imposter::compile` before a socket is bound.

use crate::behaviors::ResponseBehaviors;
use crate::framing::FramingConfig;
use crate::message::Mode;
use crate::recording::ProxyMode;
use crate::scripting::{InjectedFunction, InjectionKind, Sandbox};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
    Smtp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Smtp => "smtp",
        }
    }

    /// Request fields predicates may refer to.
    pub fn predicate_fields(self) -> &'static [&'static str] {
        match self {
            Protocol::Tcp => &["data", "requestFrom"],
            Protocol::Http => &["method", "path", "query", "headers", "body", "requestFrom"],
            Protocol::Smtp => &[],
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stub Types
// ============================================================================

/// Stub definition: all predicates must hold; responses are served in rotation.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stub {
    #[serde(default)]
    pub predicates: Vec<serde_json::Value>,
    #[serde(default)]
    pub responses: Vec<StubResponse>,
}

/// One entry of a stub's response list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "StubResponseRaw", into = "StubResponseRaw")]
pub struct StubResponse {
    pub kind: ResponseKind,
    pub behaviors: Option<ResponseBehaviors>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// Literal payload; its shape depends on the protocol
    Is(serde_json::Value),
    Proxy(ProxyResponse),
    Inject(String),
    Fault(String),
}

impl StubResponse {
    pub fn is(payload: serde_json::Value) -> Self {
        Self {
            kind: ResponseKind::Is(payload),
            behaviors: None,
        }
    }
}

/// Wire form of a response: exactly one of `is`, `proxy`, `inject`, `fault`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StubResponseRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    #[serde(rename = "_behaviors", default, skip_serializing_if = "Option::is_none")]
    pub behaviors: Option<ResponseBehaviors>,
}

impl TryFrom<StubResponseRaw> for StubResponse {
    type Error = String;

    fn try_from(raw: StubResponseRaw) -> Result<Self, Self::Error> {
        let mut kinds = Vec::with_capacity(1);
        if let Some(is) = raw.is {
            kinds.push(ResponseKind::Is(is));
        }
        if let Some(proxy) = raw.proxy {
            kinds.push(ResponseKind::Proxy(proxy));
        }
        if let Some(inject) = raw.inject {
            kinds.push(ResponseKind::Inject(inject));
        }
        if let Some(fault) = raw.fault {
            kinds.push(ResponseKind::Fault(fault));
        }
        let kind = match kinds.len() {
            // an empty response object is an empty `is`
            0 => ResponseKind::Is(serde_json::Value::Object(Default::default())),
            1 => kinds.remove(0),
            _ => {
                return Err(
                    "each response object must have only one type of is, proxy, inject or fault"
                        .to_string(),
                )
            }
        };
        Ok(StubResponse {
            kind,
            behaviors: raw.behaviors,
        })
    }
}

impl From<StubResponse> for StubResponseRaw {
    fn from(response: StubResponse) -> Self {
        let mut raw = StubResponseRaw {
            behaviors: response.behaviors,
            ..Default::default()
        };
        match response.kind {
            ResponseKind::Is(is) => raw.is = Some(is),
            ResponseKind::Proxy(proxy) => raw.proxy = Some(proxy),
            ResponseKind::Inject(inject) => raw.inject = Some(inject),
            ResponseKind::Fault(fault) => raw.fault = Some(fault),
        }
        raw
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub to: String,
    #[serde(default = "default_proxy_mode")]
    pub mode: ProxyMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicate_generators: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub add_wait_behavior: bool,
}

fn default_proxy_mode() -> ProxyMode {
    ProxyMode::ProxyOnce
}

// ============================================================================
// Imposter Config
// ============================================================================

/// `{"inject": "<closure>"}` deciding where a tcp request ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndOfRequestResolver {
    pub inject: String,
}

/// Declaration used to create an imposter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImposterConfig {
    pub protocol: Protocol,
    /// Port for the imposter. If not specified, the OS assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Bind address; defaults to the engine-wide host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Payload representation (tcp only)
    #[serde(default)]
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<FramingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_request_resolver: Option<EndOfRequestResolver>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_response: Option<serde_json::Value>,
    #[serde(default)]
    pub stubs: Vec<Stub>,
}

impl ImposterConfig {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            port: None,
            host: None,
            name: None,
            mode: Mode::Text,
            framing: None,
            end_of_request_resolver: None,
            default_response: None,
            stubs: Vec::new(),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImposterState {
    Created,
    Binding,
    Running,
    Stopping,
    Stopped,
}

// ============================================================================
// Compilation environment
// ============================================================================

/// What declaration compilation needs to know about the imposter and engine.
#[derive(Clone, Copy)]
pub struct CompileEnv<'a> {
    pub protocol: Protocol,
    pub mode: Mode,
    pub allow_injection: bool,
    pub sandbox: &'a dyn Sandbox,
}

impl CompileEnv<'_> {
    pub fn compile_injection(
        &self,
        kind: InjectionKind,
        source: &str,
    ) -> Result<InjectedFunction, ImposterError> {
        if !self.allow_injection {
            return Err(ImposterError::InvalidInjection(
                "injection is not allowed unless the engine runs with --allow-injection"
                    .to_string(),
            ));
        }
        self.sandbox
            .compile(kind, source)
            .map_err(|e| ImposterError::BadData(e.to_string()))
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration and resource errors surfaced to the creator.
#[derive(Debug, thiserror::Error)]
pub enum ImposterError {
    #[error("{0}")]
    BadData(String),
    #[error("{0}")]
    InvalidInjection(String),
    #[error("invalid proxy: {0}")]
    InvalidProxy(String),
    #[error("Port {0} is already in use")]
    PortInUse(u16),
    #[error("Insufficient access to bind port {0}")]
    InsufficientAccess(u16),
    #[error("Failed to bind port {0}: {1}")]
    BindError(u16, String),
    #[error("Imposter not found on port {0}")]
    NotFound(u16),
}

impl ImposterError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ImposterError::BadData(_) => "bad data",
            ImposterError::InvalidInjection(_) => "invalid injection",
            ImposterError::InvalidProxy(_) => "invalid proxy",
            ImposterError::PortInUse(_) | ImposterError::BindError(..) => "resource conflict",
            ImposterError::InsufficientAccess(_) => "insufficient access",
            ImposterError::NotFound(_) => "no such resource",
        }
    }

    /// `{"errors": [{"code": .., "message": ..}]}`
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "errors": [{ "code": self.code(), "message": self.to_string() }]
        })
    }
}
