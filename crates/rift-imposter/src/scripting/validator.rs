//! Creation-time checks for injected closures.

use super::{InjectedFunction, InjectionError, InjectionKind};
use rhai::Engine;
use std::sync::Arc;

/// Number of parameters of a closure literal such as `|request, state| ...`.
///
/// Returns `None` if the source does not start with a closure.
pub fn parse_closure_arity(source: &str) -> Option<usize> {
    let rest = source.trim_start();
    if let Some(after) = rest.strip_prefix("||") {
        return (!after.trim().is_empty()).then_some(0);
    }
    let rest = rest.strip_prefix('|')?;
    let end = rest.find('|')?;
    let params = &rest[..end];
    let mut count = 0;
    for param in params.split(',') {
        let param = param.trim();
        if param.is_empty() || !param.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return None;
        }
        count += 1;
    }
    Some(count)
}

/// Compiles injected sources and checks their shape against the call site.
pub struct ScriptValidator {
    engine: Engine,
}

impl ScriptValidator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        super::rhai_engine::register_host_api(&mut engine);
        Self { engine }
    }

    pub fn validate(
        &self,
        kind: InjectionKind,
        source: &str,
    ) -> Result<InjectedFunction, InjectionError> {
        let arity = parse_closure_arity(source).ok_or_else(|| InjectionError::Compile {
            kind,
            message: "source must be a closure such as |request| { ... }".to_string(),
        })?;

        let range = kind.arity_range();
        if !range.contains(&arity) {
            return Err(InjectionError::Arity {
                kind,
                expected: format!("{} to {}", range.start(), range.end()),
                found: arity,
            });
        }

        let ast = self
            .engine
            .compile(source)
            .map_err(|e| InjectionError::Compile {
                kind,
                message: e.to_string(),
            })?;

        Ok(InjectedFunction {
            kind,
            source: Arc::from(source),
            arity,
            ast: Arc::new(ast),
        })
    }
}

impl Default for ScriptValidator {
    fn default() -> Self {
        Self::new()
    }
}
