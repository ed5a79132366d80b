//! Proxy recording for Mountebank-compatible record/replay functionality.
//!
//! Supports three modes:
//! - `proxyOnce`: Record the first response, replay it on subsequent matches
//! - `proxyAlways`: Always proxy, record all responses
//! - `proxyTransparent`: Always proxy, never record
//!
//! Recorded responses become ordinary `is` stubs whose predicates are built
//! from the proxied request by the proxy's `predicateGenerators`.
//!
//! # Module Structure
//!
//! - `mode` - Proxy recording mode enum
//! - `stub_generator` - predicate and stub generation from observed traffic

mod mode;
mod stub_generator;

pub use mode::ProxyMode;
pub use stub_generator::{generate_predicates, recorded_stub};
