//! Rift imposter engine.
//!
//! Virtual TCP, HTTP and SMTP services ("imposters") that answer from
//! declared stubs, proxy to real services and record what they see.

pub mod behaviors;
pub mod config;
pub mod framing;
pub mod imposter;
pub mod ledger;
pub mod message;
pub mod metrics;
pub mod predicate;
pub mod proxy;
pub mod recording;
pub mod scripting;
