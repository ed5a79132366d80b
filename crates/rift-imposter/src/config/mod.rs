//! Engine-wide configuration.
//!
//! Settings that apply to every imposter the engine creates. Loaded from a
//! YAML or JSON file and then overridden by command-line flags.

mod imposters;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use imposters::{load_imposters, ImpostersFile};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Allow `inject` predicates, responses and end-of-request resolvers
    pub allow_injection: bool,

    /// Bind host for imposters that do not name one
    pub host: String,

    /// Bounded wait for an inject response, sync or async
    pub injection_timeout_ms: u64,

    /// Bounded wait for a proxied round trip
    pub proxy_timeout_ms: u64,

    /// Quiet period that ends an upstream TCP reply
    pub tcp_proxy_idle_ms: u64,

    /// How long a stopping imposter lets in-flight requests finish
    pub shutdown_grace_ms: u64,

    /// Operation budget for a single script invocation
    pub max_script_operations: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_injection: false,
            host: "0.0.0.0".to_string(),
            injection_timeout_ms: 30_000,
            proxy_timeout_ms: 30_000,
            tcp_proxy_idle_ms: 100,
            shutdown_grace_ms: 5_000,
            max_script_operations: 50_000_000,
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        // YAML is a superset of JSON, so one parser covers both
        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.host.trim().is_empty() {
            anyhow::bail!("host must not be empty");
        }
        for (name, value) in [
            ("injectionTimeoutMs", self.injection_timeout_ms),
            ("proxyTimeoutMs", self.proxy_timeout_ms),
            ("tcpProxyIdleMs", self.tcp_proxy_idle_ms),
            ("maxScriptOperations", self.max_script_operations),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than 0");
            }
        }
        Ok(())
    }

    pub fn injection_timeout(&self) -> Duration {
        Duration::from_millis(self.injection_timeout_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    pub fn tcp_proxy_idle(&self) -> Duration {
        Duration::from_millis(self.tcp_proxy_idle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
