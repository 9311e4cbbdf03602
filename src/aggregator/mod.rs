//! Capability Aggregator
//!
//! Owns the backend connections of one virtual server and publishes a
//! merged [`Namespace`] snapshot. Readers clone the current `Arc` and never
//! wait on a rebuild; rebuilds run one at a time and concurrent requests
//! for one coalesce into a single pass.

mod namespace;

pub use namespace::{ItemKind, Member, Namespace, Target};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::backend::{BackendConnection, ConnectionInfo, ConnectionOptions};
use crate::virtual_server::BackendRef;

/// Backend connections and merged namespace of one virtual server
pub struct Aggregator {
    server: String,
    options: ConnectionOptions,
    connections: RwLock<BTreeMap<String, Arc<BackendConnection>>>,
    snapshot: RwLock<Arc<Namespace>>,
    rebuild_gate: tokio::sync::Mutex<()>,
    requested: AtomicU64,
    completed: AtomicU64,
}

impl Aggregator {
    /// Aggregator with no backends
    #[must_use]
    pub fn new(server: impl Into<String>, options: ConnectionOptions) -> Self {
        Self {
            server: server.into(),
            options,
            connections: RwLock::new(BTreeMap::new()),
            snapshot: RwLock::new(Arc::new(Namespace::default())),
            rebuild_gate: tokio::sync::Mutex::new(()),
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Current namespace. Never blocks on a rebuild.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Namespace> {
        Arc::clone(&self.snapshot.read())
    }

    /// Connection by backend name
    #[must_use]
    pub fn connection(&self, name: &str) -> Option<Arc<BackendConnection>> {
        self.connections.read().get(name).cloned()
    }

    /// Every connection, by backend name
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<BackendConnection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Health snapshot of every connection
    #[must_use]
    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .values()
            .map(|c| c.info())
            .collect()
    }

    /// Add (or replace) a connection and rebuild
    pub async fn insert(&self, connection: Arc<BackendConnection>) {
        let previous = self
            .connections
            .write()
            .insert(connection.name().to_string(), connection);
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.refresh().await;
    }

    /// Remove a connection and rebuild
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.connections.write().remove(name);
        match removed {
            Some(connection) => {
                connection.close().await;
                self.refresh().await;
                true
            }
            None => false,
        }
    }

    /// Align connections with a virtual server's backend list. Connections
    /// whose configuration changed are replaced; new ones connect lazily.
    /// Connections created with [`BackendConnection::from_transport`] are
    /// managed through [`insert`](Self::insert)/[`remove`](Self::remove) only.
    pub async fn sync_backends(&self, backends: &[BackendRef]) -> bool {
        let mut removed = Vec::new();
        let mut added = 0usize;
        {
            let mut connections = self.connections.write();
            connections.retain(|name, conn| {
                let keep = conn.config().is_none_or(|config| {
                    backends
                        .iter()
                        .any(|b| b.name == *name && b.config == *config)
                });
                if !keep {
                    removed.push(Arc::clone(conn));
                }
                keep
            });
            for backend in backends {
                if !connections.contains_key(&backend.name) {
                    let conn = BackendConnection::new(
                        backend.name.clone(),
                        backend.config.clone(),
                        &self.options,
                    );
                    connections.insert(backend.name.clone(), Arc::new(conn));
                    added += 1;
                }
            }
        }

        if removed.is_empty() && added == 0 {
            return false;
        }
        info!(
            server = %self.server,
            added,
            removed = removed.len(),
            "Backend set changed"
        );
        for conn in removed {
            conn.close().await;
        }
        self.refresh().await;
        true
    }

    /// Connect every backend that is not connected, concurrently.
    /// Failures are recorded on the connections, not returned.
    pub async fn connect_all(&self) {
        let pending: Vec<_> = self
            .connections
            .read()
            .values()
            .filter(|c| !c.is_connected())
            .cloned()
            .collect();
        join_all(pending.iter().map(|c| c.ensure_connected())).await;
        self.refresh().await;
    }

    /// Snapshot for one request: backends that are down get a lazy
    /// reconnect attempt (subject to their backoff) and the namespace is
    /// rebuilt if anything changed.
    pub async fn prepare(&self) -> Arc<Namespace> {
        let down: Vec<_> = self
            .connections
            .read()
            .values()
            .filter(|c| !c.is_connected())
            .cloned()
            .collect();
        if !down.is_empty() {
            join_all(down.iter().map(|c| c.ensure_connected())).await;
        }

        let current = {
            let snapshot = self.snapshot();
            snapshot.is_current(&self.connections.read())
        };
        if !current {
            self.refresh().await;
        }
        self.snapshot()
    }

    /// Rebuild the namespace. Concurrent callers coalesce: a caller whose
    /// request is covered by a rebuild that started after it returns
    /// without rebuilding again.
    pub async fn refresh(&self) {
        let ticket = self.requested.fetch_add(1, Ordering::AcqRel) + 1;
        let _gate = self.rebuild_gate.lock().await;
        if self.completed.load(Ordering::Acquire) >= ticket {
            debug!(server = %self.server, ticket, "Rebuild coalesced");
            return;
        }

        let target = self.requested.load(Ordering::Acquire);
        let connections = self.connections.read().clone();
        let namespace = Namespace::build(target, &connections);
        *self.snapshot.write() = Arc::new(namespace);
        self.completed.store(target, Ordering::Release);
        debug!(server = %self.server, generation = target, "Namespace rebuilt");
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        for conn in connections {
            conn.close().await;
        }
        self.refresh().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::testing::{MockBackend, connection, options};
    use pretty_assertions::assert_eq;

    async fn aggregator(backends: &[(&str, &Arc<MockBackend>)]) -> Aggregator {
        let agg = Aggregator::new("demo", options());
        for (name, backend) in backends {
            agg.insert(connection(name, backend)).await;
        }
        agg.connect_all().await;
        agg
    }

    #[tokio::test]
    async fn unique_unqualified_tool_resolves() {
        let math = Arc::new(MockBackend::with_tools(&["add"]));
        let text = Arc::new(MockBackend::with_tools(&["echo"]));
        let agg = aggregator(&[("math", &math), ("text", &text)]).await;

        let target = agg.snapshot().resolve_tool("add").unwrap();
        assert_eq!(target.connection.name(), "math");
        assert_eq!(target.local_name, "add");
    }

    #[tokio::test]
    async fn colliding_names_are_ambiguous_until_qualified() {
        let a = Arc::new(MockBackend::with_tools(&["add"]));
        let b = Arc::new(MockBackend::with_tools(&["add"]));
        let agg = aggregator(&[("zeta", &a), ("alpha", &b)]).await;
        let ns = agg.snapshot();

        match ns.resolve_tool("add") {
            Err(Error::AmbiguousReference { name, backends }) => {
                assert_eq!(name, "add");
                assert_eq!(backends, vec!["alpha".to_string(), "zeta".to_string()]);
            }
            other => panic!("expected ambiguity, got {:?}", other.err()),
        }
        let target = ns.resolve_tool("zeta.add").unwrap();
        assert_eq!(target.connection.name(), "zeta");
    }

    #[tokio::test]
    async fn unknown_prefix_is_an_unqualified_name() {
        let a = Arc::new(MockBackend::with_tools(&["add"]));
        let agg = aggregator(&[("math", &a)]).await;
        assert!(matches!(
            agg.snapshot().resolve_tool("calc.add"),
            Err(Error::ToolNotFound(name)) if name == "calc.add"
        ));
        assert!(matches!(
            agg.snapshot().resolve_tool("math.sub"),
            Err(Error::ToolNotFound(name)) if name == "math.sub"
        ));
    }

    #[tokio::test]
    async fn failed_backend_contributes_nothing() {
        let up = Arc::new(MockBackend::with_tools(&["add"]));
        let down = Arc::new(MockBackend::with_tools(&["echo"]));
        down.set_down(true);
        let agg = aggregator(&[("up", &up), ("down", &down)]).await;
        let ns = agg.snapshot();

        let names: Vec<_> = ns.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["up.add".to_string()]);
        assert!(matches!(
            ns.resolve_tool("down.echo"),
            Err(Error::Connection { backend, .. }) if backend == "down"
        ));
    }

    #[tokio::test]
    async fn unqualified_name_of_a_down_owner_reports_the_outage() {
        let math = Arc::new(MockBackend::with_tools(&["add"]).text_resource("math://pi", "3.14"));
        let text = Arc::new(MockBackend::with_tools(&["echo"]));
        let agg = aggregator(&[("math", &math), ("text", &text)]).await;
        assert!(agg.snapshot().resolve_tool("add").is_ok());

        math.set_down(true);
        let ns = agg.prepare().await;
        assert!(matches!(
            ns.resolve_tool("add"),
            Err(Error::Connection { backend, .. }) if backend == "math"
        ));
        assert!(matches!(
            ns.resolve_resource("math://pi"),
            Err(Error::Connection { backend, .. }) if backend == "math"
        ));
        assert!(matches!(ns.resolve_tool("sub"), Err(Error::ToolNotFound(_))));
        assert!(ns.resolve_tool("echo").is_ok());

        math.set_down(false);
        assert!(agg.prepare().await.resolve_tool("add").is_ok());
    }

    #[tokio::test]
    async fn prepare_reconnects_and_rebuilds() {
        let backend = Arc::new(MockBackend::with_tools(&["echo"]));
        backend.set_down(true);
        let agg = aggregator(&[("text", &backend)]).await;
        assert!(agg.snapshot().tools().is_empty());

        backend.set_down(false);
        let ns = agg.prepare().await;
        assert_eq!(ns.tools().len(), 1);
        assert!(ns.resolve_tool("echo").is_ok());
    }

    #[tokio::test]
    async fn snapshots_are_stable_across_rebuilds() {
        let a = Arc::new(MockBackend::with_tools(&["add"]));
        let agg = aggregator(&[("math", &a)]).await;
        let before = agg.snapshot();

        agg.remove("math").await;
        assert!(before.resolve_tool("add").is_ok());
        assert!(agg.snapshot().resolve_tool("add").is_err());
        assert!(agg.snapshot().generation() > before.generation());
    }

    #[tokio::test]
    async fn concurrent_refreshes_settle_on_latest_state() {
        let a = Arc::new(MockBackend::with_tools(&["add"]));
        let agg = Arc::new(aggregator(&[("math", &a)]).await);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let agg = Arc::clone(&agg);
                tokio::spawn(async move { agg.refresh().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        let ns = agg.snapshot();
        assert!(ns.is_current(&agg.connections.read()));
        assert_eq!(ns.tools().len(), 1);
    }

    #[tokio::test]
    async fn resources_keep_uris_and_resolve_by_locator() {
        let docs = Arc::new(
            MockBackend::with_tools(&[]).text_resource("docs://guide", "Read me"),
        );
        let agg = aggregator(&[("docs", &docs)]).await;
        let ns = agg.snapshot();
        assert_eq!(ns.resources()[0].uri, "docs://guide");
        assert_eq!(ns.resolve_locator("docs", "guide").unwrap().local_name, "docs://guide");
        assert_eq!(ns.resolve_resource("docs://guide").unwrap().connection.name(), "docs");
    }
}
