//! Frame assembly for raw stream imposters.
//!
//! Transport reads arrive in arbitrary pieces. [`FrameReader`] accumulates
//! them per connection and yields complete messages. Built-in boundaries are
//! decided by [`FrameCodec`]; an injected resolver runs on the blocking pool
//! so a slow script only stalls its own connection.

mod codec;
mod reader;

pub use codec::{FrameCodec, FrameError};
pub use reader::FrameReader;

use crate::scripting::{InjectedFunction, InvocationContext, Sandbox};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Declared framing for a tcp imposter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FramingConfig {
    /// Every transport read is one message
    #[default]
    Packet,
    /// The whole connection up to the client's half-close is one message
    Connection,
    /// Messages end at a byte pattern, which is removed from the message
    Delimiter { delimiter: String },
}

/// Built-in boundary decided by [`FrameCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Boundary {
    Packet,
    Connection,
    Delimiter(Vec<u8>),
}

/// How one connection's bytes are split into messages.
#[derive(Clone)]
pub enum FrameStrategy {
    Builtin(Boundary),
    Resolver(ResolverBoundary),
}

/// An injected end-of-request resolver bound to the sandbox that runs it.
#[derive(Clone)]
pub struct ResolverBoundary {
    pub function: InjectedFunction,
    pub sandbox: Arc<dyn Sandbox>,
    pub ctx: InvocationContext,
}

impl std::fmt::Debug for FrameStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameStrategy::Builtin(b) => f.debug_tuple("Builtin").field(b).finish(),
            FrameStrategy::Resolver(r) => f.debug_tuple("Resolver").field(&r.function).finish(),
        }
    }
}
