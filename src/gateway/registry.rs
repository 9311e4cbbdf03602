//! Live facades, one per stored virtual server

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::backend::ConnectionOptions;
use crate::resolver::Resolver;
use crate::virtual_server::{BlobStore, VirtualMcp, VirtualServerHealth, VirtualServerStore};
use crate::{Error, Result};

/// Facades are created on first use and share the store, blob store and
/// resolver.
pub struct VirtualServers {
    store: Arc<dyn VirtualServerStore>,
    blobs: Arc<dyn BlobStore>,
    resolver: Arc<Resolver>,
    options: ConnectionOptions,
    facades: DashMap<String, Arc<VirtualMcp>>,
}

impl VirtualServers {
    /// Empty registry over `store`
    pub fn new(
        store: Arc<dyn VirtualServerStore>,
        blobs: Arc<dyn BlobStore>,
        resolver: Arc<Resolver>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            store,
            blobs,
            resolver,
            options,
            facades: DashMap::new(),
        }
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn VirtualServerStore> {
        &self.store
    }

    /// Facade of a stored virtual server. A facade whose definition was
    /// deleted is dropped and its connections closed.
    pub async fn get(&self, name: &str) -> Result<Arc<VirtualMcp>> {
        if let Err(e) = self.store.get(name).await {
            if let Some((_, stale)) = self.facades.remove(name) {
                info!(server = name, "Virtual server removed, closing backends");
                stale.shutdown().await;
            }
            self.resolver.templates().forget_server(name);
            return Err(e);
        }
        if let Some(facade) = self.facades.get(name) {
            return Ok(Arc::clone(&facade));
        }
        let facade = self
            .facades
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(VirtualMcp::new(
                    name,
                    Arc::clone(&self.store),
                    Arc::clone(&self.blobs),
                    Arc::clone(&self.resolver),
                    self.options.clone(),
                ))
            })
            .clone();
        Ok(facade)
    }

    /// Route an authorization callback to the backend that issued `state`.
    /// Returns `(virtual server, backend)`.
    ///
    /// # Errors
    ///
    /// `StateMismatch` when no backend has `state` pending, otherwise the
    /// flow's own error.
    pub async fn handle_callback(&self, state: &str, code: &str) -> Result<(String, String)> {
        let facades: Vec<_> = self.facades.iter().map(|f| Arc::clone(&f)).collect();
        for facade in facades {
            if let Some(outcome) = facade.handle_callback(state, code).await {
                let backend = outcome?;
                info!(server = facade.name(), backend = %backend, "Backend authorized");
                return Ok((facade.name().to_string(), backend));
            }
        }
        warn!("Authorization callback with unknown state");
        Err(Error::StateMismatch)
    }

    /// Health of every stored virtual server
    pub async fn health(&self) -> Result<Vec<VirtualServerHealth>> {
        let mut report = Vec::new();
        for name in self.store.list().await? {
            report.push(self.get(&name).await?.health());
        }
        Ok(report)
    }

    /// Connect the backends of every stored virtual server
    pub async fn warm_up(&self) -> Result<()> {
        for name in self.store.list().await? {
            self.get(&name).await?.warm_up().await?;
        }
        Ok(())
    }

    /// Close all backend connections
    pub async fn shutdown(&self) {
        let facades: Vec<_> = self.facades.iter().map(|f| Arc::clone(&f)).collect();
        for facade in facades {
            facade.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::testing::options;
    use crate::virtual_server::{MemoryBlobStore, MemoryStore, VirtualServer};

    async fn registry() -> VirtualServers {
        let store = Arc::new(MemoryStore::new());
        store
            .put(VirtualServer {
                name: "demo".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        VirtualServers::new(
            store,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(Resolver::new(ResolutionConfig::default())),
            options(),
        )
    }

    #[tokio::test]
    async fn facades_are_reused() {
        let servers = registry().await;
        let a = servers.get("demo").await.unwrap();
        let b = servers.get("demo").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            servers.get("ghost").await,
            Err(Error::VirtualServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleted_servers_are_dropped() {
        let servers = registry().await;
        servers.get("demo").await.unwrap();
        let _ = servers.resolver.templates().get("demo", "greet", "Hi");
        servers.store().delete("demo").await.unwrap();
        assert!(servers.get("demo").await.is_err());
        assert!(servers.health().await.unwrap().is_empty());
        assert!(servers.resolver.templates().is_empty());
    }

    #[tokio::test]
    async fn unknown_callback_state_is_a_mismatch() {
        let servers = registry().await;
        servers.get("demo").await.unwrap();
        assert!(matches!(
            servers.handle_callback("nope", "code").await,
            Err(Error::StateMismatch)
        ));
    }
}
