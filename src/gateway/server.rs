//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::registry::VirtualServers;
use super::router::{AppState, create_router};
use crate::backend::ConnectionOptions;
use crate::config::Config;
use crate::resolver::Resolver;
use crate::virtual_server::{
    BlobStore, FsBlobStore, MemoryBlobStore, MemoryStore, VirtualServer, VirtualServerStore,
};
use crate::{Error, Result};

/// Virtual MCP gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Facades of the configured virtual servers
    servers: Arc<VirtualServers>,
}

impl Gateway {
    /// Build the stores and seed them from configuration
    pub async fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn VirtualServerStore> = Arc::new(MemoryStore::new());
        let blobs: Arc<dyn BlobStore> = match &config.blobs.dir {
            Some(dir) => Arc::new(FsBlobStore::open(dir.clone()).await?),
            None => Arc::new(MemoryBlobStore::new()),
        };
        let resolver = Arc::new(Resolver::new(config.resolution));
        let options = ConnectionOptions::new(&config)?;
        let servers = Arc::new(VirtualServers::new(
            Arc::clone(&store),
            blobs,
            resolver,
            options,
        ));

        for definition in &config.virtual_servers {
            store.put(VirtualServer::from_config(definition)).await?;
            servers
                .get(&definition.name)
                .await?
                .seed_resources(&definition.resources)
                .await?;
            info!(
                server = %definition.name,
                backends = definition.backends.len(),
                prompts = definition.prompts.len(),
                "Registered virtual server"
            );
        }

        Ok(Self { config, servers })
    }

    /// Facades of the configured virtual servers
    #[must_use]
    pub fn servers(&self) -> &Arc<VirtualServers> {
        &self.servers
    }

    /// Run the gateway until a shutdown signal
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(AppState {
            servers: Arc::clone(&self.servers),
            request_timeout: self.config.server.request_timeout,
        });
        let app = create_router(state);
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("VIRTUAL MCP GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        for definition in &self.config.virtual_servers {
            info!("  POST {}/vmcp/{}", self.config.server.base_url(), definition.name);
        }
        info!("  GET  {}  (authorization callback)", self.config.server.callback_url());
        info!("============================================================");

        // Backends otherwise connect on first use
        let servers = Arc::clone(&self.servers);
        tokio::spawn(async move {
            if let Err(e) = servers.warm_up().await {
                warn!(error = %e, "Warm-up failed");
            }
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutting down backends...");
        self.servers.shutdown().await;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
