//! Injection sandbox.
//!
//! User-supplied logic (predicates, response transforms and frame-boundary
//! resolvers) is written as Rhai closures and executed behind the [`Sandbox`]
//! capability trait. Each invocation gets a fresh engine with an operation
//! budget and a cancellation flag, so a runaway or abandoned script never
//! outlives the request that started it.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod completion;
mod logger;
mod rhai_engine;
mod state;
mod validator;

pub use completion::{Completion, CompletionReceiver};
pub use logger::ScriptLogger;
pub use rhai_engine::RhaiSandbox;
pub use state::CallState;
pub use validator::{parse_closure_arity, ScriptValidator};

/// The three places injected logic can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionKind {
    Predicate,
    Response,
    FrameBoundary,
}

impl InjectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionKind::Predicate => "predicate",
            InjectionKind::Response => "response",
            InjectionKind::FrameBoundary => "endOfRequestResolver",
        }
    }

    /// Accepted closure parameter counts.
    pub(crate) fn arity_range(self) -> std::ops::RangeInclusive<usize> {
        match self {
            InjectionKind::Predicate => 1..=2,
            InjectionKind::Response => 1..=4,
            InjectionKind::FrameBoundary => 1..=2,
        }
    }
}

impl fmt::Display for InjectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum InjectionError {
    #[error("{kind} injection does not compile: {message}")]
    Compile { kind: InjectionKind, message: String },

    #[error("{kind} injection must be a closure taking {expected} parameters, found {found}")]
    Arity {
        kind: InjectionKind,
        expected: String,
        found: usize,
    },

    #[error("{kind} injection failed: {message}")]
    Runtime { kind: InjectionKind, message: String },

    #[error("{kind} injection returned {found}, expected {expected}")]
    InvalidReturn {
        kind: InjectionKind,
        expected: &'static str,
        found: String,
    },

    #[error("{kind} injection was cancelled")]
    Cancelled { kind: InjectionKind },

    #[error("response injection finished without calling its completion callback")]
    CompletionDropped,
}

/// A compiled closure ready to be invoked any number of times.
#[derive(Clone)]
pub struct InjectedFunction {
    pub kind: InjectionKind,
    pub source: Arc<str>,
    pub arity: usize,
    pub(crate) ast: Arc<rhai::AST>,
}

impl InjectedFunction {
    /// Response injections taking a callback complete asynchronously.
    pub fn is_async(&self) -> bool {
        self.kind == InjectionKind::Response && self.arity >= 4
    }
}

impl fmt::Debug for InjectedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedFunction")
            .field("kind", &self.kind)
            .field("arity", &self.arity)
            .field("source", &self.source)
            .finish()
    }
}

/// Per-invocation context: who is calling and whether the caller gave up.
///
/// A child context is cancelled when either it or its parent is, so a single
/// imposter-wide cancel reaches every invocation started under it.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub port: u16,
    cancelled: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl InvocationContext {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: None,
        }
    }

    /// A context that can be cancelled on its own or through `self`.
    pub fn child(&self) -> Self {
        Self {
            port: self.port,
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.cancelled)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::Acquire))
    }
}

/// Capability interface over the embedded scripting engine.
pub trait Sandbox: Send + Sync {
    fn compile(&self, kind: InjectionKind, source: &str) -> Result<InjectedFunction, InjectionError>;

    /// `(request[, logger]) -> bool`
    fn evaluate_predicate(
        &self,
        function: &InjectedFunction,
        request: &Value,
        ctx: &InvocationContext,
    ) -> Result<bool, InjectionError>;

    /// Returns `Some(payload)` for synchronous injections. `None` means the
    /// result arrives through `completion`.
    fn evaluate_response(
        &self,
        function: &InjectedFunction,
        request: &Value,
        state: &CallState,
        completion: Completion,
        ctx: &InvocationContext,
    ) -> Result<Option<Value>, InjectionError>;

    /// `(bytes[, logger]) -> bool`
    fn evaluate_frame_boundary(
        &self,
        function: &InjectedFunction,
        buffer: &[u8],
        ctx: &InvocationContext,
    ) -> Result<bool, InjectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_cancel_reaches_child() {
        let parent = InvocationContext::new(4545);
        let child = parent.child();
        let sibling = parent.child();
        assert!(!child.is_cancelled());

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
    }
}
