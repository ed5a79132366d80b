//! Response compilation and payload rendering.
//!
//! Declared responses are checked and turned into [`CompiledResponse`] when
//! the imposter is created. The same payload rules are applied at request
//! time to whatever an injected response returns.

use super::types::{
    CompileEnv, ImposterError, Protocol, ProxyResponse, ResponseKind, StubResponse,
};
use crate::behaviors::{HasRepeatBehavior, ResponseBehaviors};
use crate::message::{Fault, HttpResponse, Mode, Reply};
use crate::proxy::validate_target;
use crate::scripting::{InjectedFunction, InjectionKind};
use serde_json::Value;
use std::collections::BTreeMap;

/// Response ready to be served.
#[derive(Debug, Clone)]
pub struct CompiledResponse {
    pub kind: CompiledKind,
    pub behaviors: ResponseBehaviors,
}

#[derive(Debug, Clone)]
pub enum CompiledKind {
    Is(Reply),
    Proxy(ProxyResponse),
    Inject(InjectedFunction),
    Fault(Fault),
}

impl HasRepeatBehavior for CompiledResponse {
    fn get_repeat(&self) -> Option<u32> {
        self.behaviors.repeat
    }
}

impl CompiledResponse {
    /// What a stub without responses answers with.
    pub fn empty(protocol: Protocol, mode: Mode) -> Result<Self, ImposterError> {
        Ok(Self {
            kind: CompiledKind::Is(
                payload_to_reply(protocol, mode, &Value::Object(Default::default()))
                    .map_err(ImposterError::BadData)?,
            ),
            behaviors: ResponseBehaviors::default(),
        })
    }
}

pub fn compile_response(
    response: &StubResponse,
    env: &CompileEnv<'_>,
) -> Result<CompiledResponse, ImposterError> {
    let behaviors = response.behaviors.clone().unwrap_or_default();
    behaviors.validate().map_err(ImposterError::BadData)?;

    let kind = match &response.kind {
        ResponseKind::Is(payload) => CompiledKind::Is(
            payload_to_reply(env.protocol, env.mode, payload).map_err(ImposterError::BadData)?,
        ),
        ResponseKind::Proxy(proxy) => {
            validate_target(env.protocol, &proxy.to)?;
            for generator in &proxy.predicate_generators {
                if !generator.get("matches").is_some_and(Value::is_object) {
                    return Err(ImposterError::BadData(format!(
                        "predicateGenerators entries need a 'matches' object, found {generator}"
                    )));
                }
            }
            CompiledKind::Proxy(proxy.clone())
        }
        ResponseKind::Inject(source) => {
            CompiledKind::Inject(env.compile_injection(InjectionKind::Response, source)?)
        }
        ResponseKind::Fault(name) => CompiledKind::Fault(parse_fault(name)?),
    };
    Ok(CompiledResponse { kind, behaviors })
}

fn parse_fault(name: &str) -> Result<Fault, ImposterError> {
    serde_json::from_value(Value::String(name.to_string()))
        .map_err(|_| ImposterError::BadData(format!("unknown fault: {name}")))
}

/// Turn an `is`-shaped payload into the reply for `protocol`.
pub fn payload_to_reply(protocol: Protocol, mode: Mode, payload: &Value) -> Result<Reply, String> {
    let Value::Object(fields) = payload else {
        return Err(format!("response must be an object, found {payload}"));
    };
    match protocol {
        Protocol::Tcp => {
            let data = match fields.get("data") {
                None | Some(Value::Null) => return Ok(Reply::Bytes(Default::default())),
                Some(Value::String(data)) => data.clone(),
                Some(_) if mode == Mode::Binary => {
                    return Err("binary mode response data must be a base64 string".to_string())
                }
                Some(other) => other.to_string(),
            };
            mode.parse(&data)
                .map(Reply::Bytes)
                .map_err(|e| format!("response data is not valid base64: {e}"))
        }
        Protocol::Http => http_response(fields).map(Reply::Http),
        Protocol::Smtp => Err("smtp imposters do not send responses".to_string()),
    }
}

fn http_response(fields: &serde_json::Map<String, Value>) -> Result<HttpResponse, String> {
    let status_code = match fields.get("statusCode") {
        None | Some(Value::Null) => 200,
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| format!("invalid statusCode {n}"))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid statusCode {s:?}"))?,
        Some(other) => return Err(format!("invalid statusCode {other}")),
    };
    if !(100..=999).contains(&status_code) {
        return Err(format!("invalid statusCode {status_code}"));
    }

    let mut headers = BTreeMap::new();
    match fields.get("headers") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, value) in map {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                headers.insert(name.clone(), value);
            }
        }
        Some(other) => return Err(format!("headers must be an object, found {other}")),
    }

    let body = match fields.get("body") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(json) => {
            if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
            }
            serde_json::to_string(json).map_err(|e| e.to_string())?
        }
    };

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

/// Reply for a request whose resolution failed.
pub fn failure_reply(protocol: Protocol, code: &str, message: &str) -> Reply {
    match protocol {
        Protocol::Http => {
            let mut headers = BTreeMap::new();
            headers.insert("Content-Type".to_string(), "application/json".to_string());
            Reply::Http(HttpResponse {
                status_code: 500,
                headers,
                body: serde_json::json!({
                    "errors": [{ "code": code, "message": message }]
                })
                .to_string(),
            })
        }
        // stream clients get nothing back for this request
        Protocol::Tcp | Protocol::Smtp => Reply::Bytes(Default::default()),
    }
}
