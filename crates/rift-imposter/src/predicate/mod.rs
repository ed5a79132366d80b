//! Predicate evaluator.
//!
//! Declared predicates are compiled at imposter creation into a closed
//! [`Predicate`] tree. Evaluation is pure except for injected predicates, the
//! only variant that can fail; a failure skips the stub being tested.
//!
//! - `matcher` - primitive string and byte comparisons
//! - `string_matcher` - operators, options and compiled expected values
//! - `compile` - JSON declaration to `Predicate`

mod compile;
mod matcher;
mod string_matcher;

pub use compile::{compile_predicate, compile_predicates};
pub use matcher::CachedValue;
pub use string_matcher::{CompiledExcept, Expected, MatchOptions, Operator};

use crate::message::Request;
use crate::metrics;
use crate::scripting::{
    InjectedFunction, InjectionError, InjectionKind, InvocationContext, Sandbox,
};
use serde_json::Value;
use std::cell::OnceCell;

#[derive(Debug, Clone)]
pub enum Predicate {
    /// Every listed field must satisfy the operator
    Fields {
        operator: Operator,
        fields: Vec<FieldPredicate>,
    },
    Not(Box<Predicate>),
    Or(Vec<Predicate>),
    And(Vec<Predicate>),
    Inject(InjectedFunction),
}

#[derive(Debug, Clone)]
pub struct FieldPredicate {
    pub field: String,
    pub expected: Expected,
    pub options: MatchOptions,
}

impl FieldPredicate {
    fn matches(&self, operator: Operator, request: &Request) -> bool {
        self.expected
            .matches(operator, request.field(&self.field), &self.options)
    }
}

/// Everything a predicate may look at while deciding one request.
pub struct EvalContext<'a> {
    pub request: &'a Request,
    pub sandbox: &'a dyn Sandbox,
    pub invocation: &'a InvocationContext,
    request_json: OnceCell<Value>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        request: &'a Request,
        sandbox: &'a dyn Sandbox,
        invocation: &'a InvocationContext,
    ) -> Self {
        Self {
            request,
            sandbox,
            invocation,
            request_json: OnceCell::new(),
        }
    }

    fn request_json(&self) -> &Value {
        self.request_json.get_or_init(|| self.request.to_json())
    }
}

impl Predicate {
    /// Whether evaluating this predicate may run injected code.
    pub fn is_injected(&self) -> bool {
        match self {
            Predicate::Fields { .. } => false,
            Predicate::Not(inner) => inner.is_injected(),
            Predicate::Or(inner) | Predicate::And(inner) => inner.iter().any(Predicate::is_injected),
            Predicate::Inject(_) => true,
        }
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool, InjectionError> {
        match self {
            Predicate::Fields { operator, fields } => {
                Ok(fields.iter().all(|f| f.matches(*operator, ctx.request)))
            }
            Predicate::Not(inner) => Ok(!inner.evaluate(ctx)?),
            Predicate::Or(inner) => {
                for predicate in inner {
                    if predicate.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::And(inner) => all_match(inner, ctx),
            Predicate::Inject(function) => {
                let result =
                    ctx.sandbox
                        .evaluate_predicate(function, ctx.request_json(), ctx.invocation);
                metrics::record_injection(InjectionKind::Predicate.as_str(), result.is_ok());
                result
            }
        }
    }
}

/// Implicit AND over a stub's predicates, short-circuiting on the first false.
pub fn all_match(predicates: &[Predicate], ctx: &EvalContext<'_>) -> Result<bool, InjectionError> {
    for predicate in predicates {
        if !predicate.evaluate(ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}
