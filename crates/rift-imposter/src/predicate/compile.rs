//! Compilation of declared predicates into the closed `Predicate` tree.

use super::string_matcher::{compile_regex, CompiledExcept, Expected, MatchOptions, Operator};
use super::{CachedValue, FieldPredicate, Predicate};
use crate::imposter::{CompileEnv, ImposterError};
use crate::message::Mode;
use crate::scripting::InjectionKind;
use serde_json::{Map, Value};

const MAP_FIELDS: &[&str] = &["query", "headers"];

fn bad(message: impl Into<String>) -> ImposterError {
    ImposterError::BadData(message.into())
}

pub fn compile_predicates(raw: &[Value], env: &CompileEnv<'_>) -> Result<Vec<Predicate>, ImposterError> {
    raw.iter().map(|p| compile_predicate(p, env)).collect()
}

pub fn compile_predicate(raw: &Value, env: &CompileEnv<'_>) -> Result<Predicate, ImposterError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| bad(format!("predicate must be an object, found {raw}")))?;

    let case_sensitive = match obj.get("caseSensitive") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => return Err(bad(format!("caseSensitive must be a boolean, found {other}"))),
    };
    let except = match obj.get("except") {
        None => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(
            CompiledExcept::compile(s, case_sensitive)
                .map_err(|e| bad(format!("invalid except pattern {s:?}: {e}")))?,
        ),
        Some(other) => return Err(bad(format!("except must be a string, found {other}"))),
    };
    let options = MatchOptions {
        case_sensitive,
        except,
    };

    let mut compiled = None;
    for (key, value) in obj {
        let predicate = match key.as_str() {
            "caseSensitive" | "except" => continue,
            "not" => Predicate::Not(Box::new(compile_predicate(value, env)?)),
            "and" | "or" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| bad(format!("{key} must be an array of predicates")))?;
                let inner = items
                    .iter()
                    .map(|p| compile_predicate(p, env))
                    .collect::<Result<Vec<_>, _>>()?;
                if key == "and" {
                    Predicate::And(inner)
                } else {
                    Predicate::Or(inner)
                }
            }
            "inject" => {
                let source = value
                    .as_str()
                    .ok_or_else(|| bad("inject predicate must be a string"))?;
                Predicate::Inject(env.compile_injection(InjectionKind::Predicate, source)?)
            }
            other => match Operator::from_key(other) {
                Some(op) => compile_fields(op, value, &options, env)?,
                None => return Err(bad(format!("unrecognized predicate operator: {other}"))),
            },
        };
        if compiled.replace(predicate).is_some() {
            return Err(bad(format!(
                "predicate must have exactly one operator: {raw}"
            )));
        }
    }
    compiled.ok_or_else(|| bad(format!("missing predicate operator in {raw}")))
}

fn compile_fields(
    op: Operator,
    value: &Value,
    options: &MatchOptions,
    env: &CompileEnv<'_>,
) -> Result<Predicate, ImposterError> {
    let fields = value.as_object().ok_or_else(|| {
        bad(format!(
            "{} predicate must map request fields to expected values",
            op.as_str()
        ))
    })?;

    let allowed = env.protocol.predicate_fields();
    let mut compiled = Vec::with_capacity(fields.len());
    for (field, expected) in fields {
        if !allowed.contains(&field.as_str()) {
            return Err(bad(format!(
                "unknown field '{field}' in {} predicate for {} imposters",
                op.as_str(),
                env.protocol
            )));
        }
        let expected = if MAP_FIELDS.contains(&field.as_str()) {
            compile_map(op, field, expected, options)?
        } else if field == "data" && env.mode == Mode::Binary {
            compile_binary(op, expected, env.mode)?
        } else if field == "body" && (expected.is_object() || expected.is_array()) {
            if !matches!(op, Operator::Equals | Operator::DeepEquals) {
                return Err(bad(format!(
                    "{} predicate cannot compare a JSON body",
                    op.as_str()
                )));
            }
            Expected::Json(expected.clone())
        } else {
            compile_scalar(op, field, expected, options)?
        };
        compiled.push(FieldPredicate {
            field: field.clone(),
            expected,
            options: options.clone(),
        });
    }
    Ok(Predicate::Fields {
        operator: op,
        fields: compiled,
    })
}

fn compile_scalar(
    op: Operator,
    field: &str,
    expected: &Value,
    options: &MatchOptions,
) -> Result<Expected, ImposterError> {
    match (op, expected) {
        (Operator::Exists, Value::Bool(b)) => Ok(Expected::Exists(*b)),
        (Operator::Exists, other) => Err(bad(format!(
            "exists predicate for '{field}' must be true or false, found {other}"
        ))),
        (Operator::Matches, Value::String(pattern)) => compile_regex(pattern, options.case_sensitive)
            .map(|re| Expected::Pattern(re.into()))
            .map_err(|e| bad(format!("invalid regex for '{field}': {e}"))),
        (Operator::Matches, other) => Err(bad(format!(
            "matches predicate for '{field}' must be a string, found {other}"
        ))),
        (_, Value::String(s)) => Ok(Expected::Text(CachedValue::new(s.as_str()))),
        (_, Value::Number(_) | Value::Bool(_)) => {
            Ok(Expected::Text(CachedValue::new(expected.to_string())))
        }
        (_, other) => Err(bad(format!(
            "{} predicate for '{field}' must be a string, found {other}",
            op.as_str()
        ))),
    }
}

fn compile_map(
    op: Operator,
    field: &str,
    expected: &Value,
    options: &MatchOptions,
) -> Result<Expected, ImposterError> {
    if let (Operator::Exists, Value::Bool(b)) = (op, expected) {
        return Ok(Expected::Exists(*b));
    }
    let entries: &Map<String, Value> = expected.as_object().ok_or_else(|| {
        bad(format!(
            "{} predicate for '{field}' must be an object of expected entries",
            op.as_str()
        ))
    })?;
    let entries = entries
        .iter()
        .map(|(key, value)| {
            let expected = compile_scalar(op, &format!("{field}.{key}"), value, options)?;
            Ok((CachedValue::new(key.as_str()), expected))
        })
        .collect::<Result<Vec<_>, ImposterError>>()?;
    Ok(Expected::Map {
        entries,
        // header names are case-insensitive on the wire
        ignore_key_case: field == "headers" || !options.case_sensitive,
    })
}

fn compile_binary(op: Operator, expected: &Value, mode: Mode) -> Result<Expected, ImposterError> {
    match (op, expected) {
        (Operator::Exists, Value::Bool(b)) => Ok(Expected::Exists(*b)),
        (Operator::Matches, _) => Err(bad("the matches predicate is not allowed in binary mode")),
        (_, Value::String(encoded)) => mode
            .parse(encoded)
            .map(|bytes| Expected::Bytes(bytes.to_vec()))
            .map_err(|e| bad(format!("binary predicate value is not valid base64: {e}"))),
        (_, other) => Err(bad(format!(
            "binary {} predicate must be a base64 string, found {other}",
            op.as_str()
        ))),
    }
}
