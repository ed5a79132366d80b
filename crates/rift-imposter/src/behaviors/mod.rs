//! Mountebank-compatible response behaviors.
//!
//! - `wait` - Add latency before the response is written (fixed ms or {min, max} range)
//! - `repeat` - Serve a response N times before cycling to the next one

mod cycler;
mod types;
mod wait;

pub use cycler::{HasRepeatBehavior, StubCycler};
pub use types::ResponseBehaviors;
pub use wait::WaitBehavior;
