//! ImposterManager - lifecycle management for multiple imposters.
//!
//! This module handles creating, deleting, and managing multiple imposters,
//! each running on its own port. Creation and deletion on the same port are
//! serialized; different ports proceed independently.

use super::core::{EngineContext, Imposter};
use super::network;
use super::types::{ImposterConfig, ImposterError, ImposterState};
use crate::config::EngineConfig;
use crate::ledger::LedgerEntry;
use crate::proxy::ProxyError;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Manages the lifecycle of multiple imposters
pub struct ImposterManager {
    engine: Arc<EngineContext>,
    /// Active imposters by port
    imposters: RwLock<HashMap<u16, Arc<Imposter>>>,
    /// Held across bind or teardown of a port
    port_locks: Mutex<HashMap<u16, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImposterManager {
    /// Create a new imposter manager
    pub fn new(config: EngineConfig) -> Result<Self, ProxyError> {
        Ok(Self::with_engine(EngineContext::new(config)?))
    }

    /// Manager over an already assembled engine (custom sandbox or upstreams).
    pub fn with_engine(engine: EngineContext) -> Self {
        Self {
            engine: Arc::new(engine),
            imposters: RwLock::new(HashMap::new()),
            port_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    fn port_lock(&self, port: u16) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.port_locks.lock().entry(port).or_default())
    }

    /// Forget the lock for `port` once nobody holds or waits on it.
    fn release_port_lock(&self, port: u16, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.port_locks.lock();
        let unused = locks
            .get(&port)
            .is_some_and(|tracked| Arc::ptr_eq(tracked, &lock) && Arc::strong_count(&lock) == 2);
        if unused {
            locks.remove(&port);
        }
    }

    /// Create and start an imposter
    /// Returns the assigned port (which may have been auto-assigned if not specified)
    pub async fn create_imposter(&self, config: ImposterConfig) -> Result<u16, ImposterError> {
        let requested = config.port.unwrap_or(0);
        let host = config
            .host
            .clone()
            .unwrap_or_else(|| self.engine.config.host.clone());

        // everything is validated before the port is touched
        let imposter = Imposter::compile(config, Arc::clone(&self.engine))?;

        if requested == 0 {
            return self.start(imposter, &host, requested).await;
        }
        let lock = self.port_lock(requested);
        let result = {
            let _guard = lock.lock().await;
            if self.imposters.read().contains_key(&requested) {
                Err(ImposterError::PortInUse(requested))
            } else {
                self.start(imposter, &host, requested).await
            }
        };
        self.release_port_lock(requested, lock);
        result
    }

    async fn start(
        &self,
        mut imposter: Imposter,
        host: &str,
        requested: u16,
    ) -> Result<u16, ImposterError> {
        imposter.set_state(ImposterState::Binding);
        let listener = network::bind(host, requested).await?;
        let port = listener
            .local_addr()
            .map_err(|e| ImposterError::BindError(requested, e.to_string()))?
            .port();
        imposter.bind_port(port);

        let imposter = Arc::new(imposter);
        imposter.start(listener);
        self.imposters.write().insert(port, Arc::clone(&imposter));

        info!(
            "{} imposter {}listening on {}:{}",
            imposter.protocol(),
            imposter
                .config
                .name
                .as_deref()
                .map(|name| format!("'{name}' "))
                .unwrap_or_default(),
            host,
            port
        );
        Ok(port)
    }

    /// Stop an imposter and return its final description, ledger included.
    pub async fn delete_imposter(&self, port: u16) -> Result<serde_json::Value, ImposterError> {
        let lock = self.port_lock(port);
        let removed = {
            let _guard = lock.lock().await;
            let removed = self.imposters.write().remove(&port);
            if let Some(imposter) = &removed {
                imposter.stop().await;
            }
            removed
        };
        self.release_port_lock(port, lock);

        let imposter = removed.ok_or(ImposterError::NotFound(port))?;
        info!("Deleted imposter on port {}", port);
        Ok(imposter.describe(true))
    }

    /// Delete every imposter, returning their final descriptions.
    pub async fn delete_all(&self) -> Vec<serde_json::Value> {
        let mut ports: Vec<u16> = self.imposters.read().keys().copied().collect();
        ports.sort_unstable();

        let mut deleted = Vec::with_capacity(ports.len());
        for port in ports {
            match self.delete_imposter(port).await {
                Ok(description) => deleted.push(description),
                // raced with a concurrent delete
                Err(ImposterError::NotFound(_)) => {}
                Err(e) => warn!("Failed to delete imposter on port {}: {}", port, e),
            }
        }
        deleted
    }

    /// Get an imposter by port
    pub fn get_imposter(&self, port: u16) -> Result<Arc<Imposter>, ImposterError> {
        self.imposters
            .read()
            .get(&port)
            .cloned()
            .ok_or(ImposterError::NotFound(port))
    }

    /// List all imposters, ordered by port
    pub fn list_imposters(&self) -> Vec<Arc<Imposter>> {
        let mut imposters: Vec<_> = self.imposters.read().values().cloned().collect();
        imposters.sort_by_key(|imposter| imposter.port());
        imposters
    }

    /// Requests recorded by the imposter on `port`.
    pub fn requests(&self, port: u16) -> Result<Vec<LedgerEntry>, ImposterError> {
        Ok(self.get_imposter(port)?.requests())
    }

    /// Stop every imposter.
    pub async fn shutdown(&self) {
        let deleted = self.delete_all().await;
        info!("Stopped {} imposter(s)", deleted.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_port_locks_are_released() {
        let manager = ImposterManager::new(EngineConfig {
            host: "127.0.0.1".to_string(),
            ..Default::default()
        })
        .unwrap();
        let free = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let declaration: ImposterConfig =
            serde_json::from_value(json!({"protocol": "tcp", "port": free})).unwrap();

        manager.create_imposter(declaration.clone()).await.unwrap();
        assert!(manager.port_locks.lock().is_empty());
        assert!(matches!(
            manager.create_imposter(declaration).await,
            Err(ImposterError::PortInUse(_))
        ));
        assert!(manager.port_locks.lock().is_empty());

        manager.delete_imposter(free).await.unwrap();
        assert!(manager.delete_imposter(free).await.is_err());
        assert!(manager.port_locks.lock().is_empty());
    }
}
