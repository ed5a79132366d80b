//! Proxy recording mode definitions.

use serde::{Deserialize, Serialize};

/// Proxy recording mode (Mountebank-compatible)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::enum_variant_names)] // Keep Mountebank-compatible names
pub enum ProxyMode {
    /// Record the first response in front of the proxy stub, replay it afterwards
    #[default]
    ProxyOnce,
    /// Always proxy; every response is appended behind the proxy stub
    ProxyAlways,
    /// Always proxy, never record
    ProxyTransparent,
}

impl ProxyMode {
    pub fn records(self) -> bool {
        self != ProxyMode::ProxyTransparent
    }
}
