//! Imposters: virtual services on their own ports.
//!
//! This module provides:
//! - `ImposterManager`: Lifecycle management for imposters
//! - `Imposter`: Individual imposter with its own port, stubs, and ledger
//! - `ImposterConfig`: Declaration used to create imposters
//!
//! ## Module Structure
//!
//! - `types`: Declarations, lifecycle state and errors
//! - `response`: Response compilation and payload rendering
//! - `stubs`: Compiled stubs, matching and recording
//! - `core`: Core Imposter struct and request resolution
//! - `network`: Listener setup
//! - `tcp`, `handler`, `smtp`: Per-protocol connection handling
//! - `manager`: ImposterManager for lifecycle management

mod core;
mod handler;
mod manager;
mod network;
mod response;
mod smtp;
mod stubs;
mod tcp;
mod types;


pub use core::{EngineContext, Imposter};
pub use handler::{header_to_title_case, parse_query_string};
pub use manager::ImposterManager;
pub use response::{failure_reply, payload_to_reply, CompiledKind, CompiledResponse};
pub use stubs::{StubRecord, StubState, StubStore};
pub use types::{
    CompileEnv, EndOfRequestResolver, ImposterConfig, ImposterError, ImposterState, Protocol,
    ProxyResponse, ResponseKind, Stub, StubResponse,
};
