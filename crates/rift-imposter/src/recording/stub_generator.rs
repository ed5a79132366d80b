//! Stub generation from proxied requests and upstream replies.

use crate::behaviors::{ResponseBehaviors, WaitBehavior};
use crate::imposter::{Stub, StubResponse};
use crate::message::{Mode, Request};
use serde_json::{Map, Value};
use tracing::warn;

/// Build predicates for a recorded stub from the proxy's `predicateGenerators`.
///
/// Each generator selects request fields with `matches` (`true` for a scalar
/// field, an object of `key: true` for `query`/`headers`) and yields one
/// predicate using `predicateOperator` (default `equals`). Generators that
/// select nothing present on the request are skipped.
pub fn generate_predicates(generators: &[Value], request: &Request) -> Vec<Value> {
    let request_json = request.to_json();
    let binary = matches!(request, Request::Tcp(tcp) if tcp.mode == Mode::Binary);
    let mut predicates = Vec::new();

    for gen in generators {
        let Some(gen_obj) = gen.as_object() else {
            continue;
        };
        let Some(matches) = gen_obj.get("matches").and_then(Value::as_object) else {
            continue;
        };

        let case_sensitive = gen_obj
            .get("caseSensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let predicate_operator = gen_obj
            .get("predicateOperator")
            .and_then(Value::as_str)
            .unwrap_or("equals");
        let except = match gen_obj.get("except").and_then(Value::as_str) {
            Some(pattern) if !pattern.is_empty() => match regex::Regex::new(pattern) {
                Ok(re) => Some((pattern, re)),
                Err(e) => {
                    warn!("Ignoring invalid except pattern {:?} in predicate generator: {}", pattern, e);
                    None
                }
            },
            _ => None,
        };

        let strip = |value: &str| -> Value {
            match &except {
                Some((_, re)) if !binary => Value::String(re.replace_all(value, "").into_owned()),
                _ => Value::String(value.to_string()),
            }
        };

        let mut pred_values = Map::new();
        for (field, selector) in matches {
            let Some(actual) = request_json.get(field) else {
                continue;
            };
            match (selector, actual) {
                (Value::Bool(true), Value::String(s)) => {
                    pred_values.insert(field.clone(), strip(s));
                }
                (Value::Bool(true), Value::Object(entries)) => {
                    if !entries.is_empty() {
                        pred_values.insert(field.clone(), actual.clone());
                    }
                }
                (Value::Object(keys), Value::Object(entries)) => {
                    let selected: Map<String, Value> = keys
                        .iter()
                        .filter(|(_, wanted)| wanted.as_bool().unwrap_or(false))
                        .filter_map(|(key, _)| {
                            entries
                                .iter()
                                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                                .map(|(_, v)| (key.clone(), v.clone()))
                        })
                        .collect();
                    if !selected.is_empty() {
                        pred_values.insert(field.clone(), Value::Object(selected));
                    }
                }
                _ => {}
            }
        }

        if pred_values.is_empty() {
            continue;
        }

        let mut predicate = Map::new();
        predicate.insert(predicate_operator.to_string(), Value::Object(pred_values));
        if case_sensitive {
            predicate.insert("caseSensitive".to_string(), Value::Bool(true));
        }
        if let Some((pattern, _)) = &except {
            predicate.insert("except".to_string(), Value::String(pattern.to_string()));
        }
        predicates.push(Value::Object(predicate));
    }

    predicates
}

/// An `is` stub replaying `payload`, optionally delayed by the observed latency.
pub fn recorded_stub(predicates: Vec<Value>, payload: Value, latency_ms: Option<u64>) -> Stub {
    let behaviors = latency_ms.map(|ms| ResponseBehaviors {
        wait: Some(WaitBehavior::Fixed(ms)),
        repeat: None,
    });
    Stub {
        predicates,
        responses: vec![StubResponse {
            behaviors,
            ..StubResponse::is(payload)
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imposter::ResponseKind;
    use crate::message::{HttpRequest, TcpRequest};
    use bytes::Bytes;
    use serde_json::json;

    fn http_request() -> Request {
        let mut request = HttpRequest {
            request_from: "127.0.0.1:1234".to_string(),
            method: "GET".to_string(),
            path: "/users/42".to_string(),
            body: String::new(),
            ..Default::default()
        };
        request.headers.insert("Accept".to_string(), "text/plain".to_string());
        request.headers.insert("X-Trace".to_string(), "abc".to_string());
        request.query.insert("page".to_string(), "2".to_string());
        Request::Http(request)
    }

    #[test]
    fn test_scalar_fields() {
        let generators = vec![json!({"matches": {"method": true, "path": true}})];
        let predicates = generate_predicates(&generators, &http_request());
        assert_eq!(
            predicates,
            vec![json!({"equals": {"method": "GET", "path": "/users/42"}})]
        );
    }

    #[test]
    fn test_selected_headers_and_operator() {
        let generators = vec![json!({
            "matches": {"headers": {"accept": true}, "query": true},
            "predicateOperator": "deepEquals",
            "caseSensitive": true
        })];
        let predicates = generate_predicates(&generators, &http_request());
        assert_eq!(
            predicates,
            vec![json!({
                "deepEquals": {"headers": {"accept": "text/plain"}, "query": {"page": "2"}},
                "caseSensitive": true
            })]
        );
    }

    #[test]
    fn test_except_strips_value() {
        let generators = vec![json!({"matches": {"path": true}, "except": "\\d+"})];
        let predicates = generate_predicates(&generators, &http_request());
        assert_eq!(
            predicates,
            vec![json!({"equals": {"path": "/users/"}, "except": "\\d+"})]
        );
    }

    #[test]
    fn test_tcp_data_and_empty_generators() {
        let request = Request::Tcp(TcpRequest::new("a", Bytes::from_static(b"ping"), Mode::Text));
        let generators = vec![json!({"matches": {"data": true}}), json!({"matches": {"path": true}})];
        assert_eq!(
            generate_predicates(&generators, &request),
            vec![json!({"equals": {"data": "ping"}})]
        );
        assert!(generate_predicates(&[], &request).is_empty());
    }

    #[test]
    fn test_recorded_stub_carries_wait() {
        let stub = recorded_stub(vec![], json!({"data": "pong"}), Some(12));
        assert_eq!(stub.responses.len(), 1);
        assert!(matches!(&stub.responses[0].kind, ResponseKind::Is(p) if p["data"] == "pong"));
        assert_eq!(
            stub.responses[0].behaviors.as_ref().and_then(|b| b.wait),
            Some(WaitBehavior::Fixed(12))
        );
        assert!(recorded_stub(vec![], json!({}), None).responses[0].behaviors.is_none());
    }
}
