//! Merged, collision-aware namespace over backend catalogs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::backend::{BackendConnection, Catalog};
use crate::protocol::{Prompt, Resource, Tool};
use crate::{Error, Result};

/// Closed set of item kinds a backend exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    /// Callable tool, keyed by name
    Tool,
    /// Readable resource, keyed by URI
    Resource,
    /// Backend prompt template, keyed by name
    Prompt,
}

impl ItemKind {
    fn not_found(self, reference: &str) -> Error {
        match self {
            Self::Tool => Error::ToolNotFound(reference.to_string()),
            Self::Resource => Error::ResourceNotFound(reference.to_string()),
            Self::Prompt => Error::PromptNotFound(reference.to_string()),
        }
    }
}

/// A backend as captured in one namespace snapshot
pub struct Member {
    /// The live connection (used for dispatch)
    pub connection: Arc<BackendConnection>,
    /// Catalog at snapshot time; empty when the backend was down
    pub catalog: Arc<Catalog>,
    /// Whether the backend was connected at snapshot time
    pub available: bool,
    /// Catalog generation at snapshot time
    pub generation: u64,
}

/// A resolved reference: which backend to call, under which local name
pub struct Target {
    /// Owning backend
    pub connection: Arc<BackendConnection>,
    /// Name (or URI) as the backend knows it
    pub local_name: String,
}

/// Immutable snapshot. Readers hold an `Arc` to it for the duration of a
/// request; a rebuild swaps in a new one.
#[derive(Default)]
pub struct Namespace {
    generation: u64,
    members: BTreeMap<String, Member>,
    /// `(kind, unqualified name)` to owning backends, sorted
    index: HashMap<(ItemKind, String), Vec<String>>,
    /// Same keys, for down backends' last known catalogs
    down_index: HashMap<(ItemKind, String), Vec<String>>,
}

fn index_catalog(
    index: &mut HashMap<(ItemKind, String), Vec<String>>,
    backend: &str,
    catalog: &Catalog,
) {
    let keys = catalog
        .tools
        .iter()
        .map(|t| (ItemKind::Tool, t.name.clone()))
        .chain(
            catalog
                .resources
                .iter()
                .map(|r| (ItemKind::Resource, r.uri.clone())),
        )
        .chain(
            catalog
                .prompts
                .iter()
                .map(|p| (ItemKind::Prompt, p.name.clone())),
        );
    for key in keys {
        let owners = index.entry(key).or_default();
        // BTreeMap iteration keeps owners sorted
        if owners.last().map(String::as_str) != Some(backend) {
            owners.push(backend.to_string());
        }
    }
}

impl Namespace {
    /// Merge the current catalogs of `connections`
    #[must_use]
    pub fn build(generation: u64, connections: &BTreeMap<String, Arc<BackendConnection>>) -> Self {
        let mut members = BTreeMap::new();
        let mut index = HashMap::new();
        let mut down_index = HashMap::new();

        for (name, connection) in connections {
            let available = connection.is_connected();
            let catalog = if available {
                connection.catalog()
            } else {
                index_catalog(&mut down_index, name, &connection.last_known_catalog());
                Arc::new(Catalog::default())
            };
            index_catalog(&mut index, name, &catalog);

            members.insert(
                name.clone(),
                Member {
                    connection: Arc::clone(connection),
                    catalog,
                    available,
                    generation: connection.generation(),
                },
            );
        }

        Self {
            generation,
            members,
            index,
            down_index,
        }
    }

    /// Rebuild counter this snapshot was produced by
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this snapshot still matches the live connections
    #[must_use]
    pub fn is_current(&self, connections: &BTreeMap<String, Arc<BackendConnection>>) -> bool {
        self.members.len() == connections.len()
            && connections.iter().all(|(name, conn)| {
                self.members.get(name).is_some_and(|m| {
                    Arc::ptr_eq(&m.connection, conn)
                        && m.available == conn.is_connected()
                        && m.generation == conn.generation()
                })
            })
    }

    /// Backends exposing an unqualified name
    #[must_use]
    pub fn owners(&self, kind: ItemKind, name: &str) -> &[String] {
        self.index
            .get(&(kind, name.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolve a tool reference (`tool` or `backend.tool`)
    ///
    /// # Errors
    ///
    /// `ToolNotFound`, `AmbiguousReference`, or the target backend's
    /// connection error.
    pub fn resolve_tool(&self, reference: &str) -> Result<Target> {
        self.resolve_named(ItemKind::Tool, reference)
    }

    /// Resolve a backend prompt reference (`prompt` or `backend.prompt`)
    ///
    /// # Errors
    ///
    /// `PromptNotFound`, `AmbiguousReference`, or the target backend's
    /// connection error.
    pub fn resolve_prompt(&self, reference: &str) -> Result<Target> {
        self.resolve_named(ItemKind::Prompt, reference)
    }

    /// Resolve a resource by URI across all backends
    ///
    /// # Errors
    ///
    /// `ResourceNotFound`, `AmbiguousReference`, or the connection error
    /// of a down backend that last offered the URI.
    pub fn resolve_resource(&self, uri: &str) -> Result<Target> {
        self.resolve_unqualified(ItemKind::Resource, uri)
    }

    /// Resolve `@resource.<server>://<path>`. When `server` names a backend
    /// the locator is matched against that backend's resources (full URI,
    /// path as URI, or resource name) and otherwise forwarded as written.
    /// Any other `server` is a URI scheme looked up across all backends.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound`, `AmbiguousReference`, or the target backend's
    /// connection error.
    pub fn resolve_locator(&self, server: &str, path: &str) -> Result<Target> {
        let uri = format!("{server}://{path}");
        let Some(member) = self.members.get(server) else {
            return self.resolve_resource(&uri);
        };
        if !member.available {
            return Err(member.connection.unavailable_error());
        }
        let local_name = member
            .catalog
            .resources
            .iter()
            .find(|r| r.uri == uri || r.uri == path || r.name == path)
            .map_or(uri, |r| r.uri.clone());
        Ok(Target {
            connection: Arc::clone(&member.connection),
            local_name,
        })
    }

    /// A reference is qualified iff the text before its first `.` names a
    /// backend of this namespace.
    fn resolve_named(&self, kind: ItemKind, reference: &str) -> Result<Target> {
        if let Some((prefix, local)) = reference.split_once('.') {
            if let Some(member) = self.members.get(prefix) {
                if !member.available {
                    return Err(member.connection.unavailable_error());
                }
                let exists = match kind {
                    ItemKind::Tool => member.catalog.tool(local).is_some(),
                    ItemKind::Prompt => member.catalog.prompt(local).is_some(),
                    ItemKind::Resource => member.catalog.resource(local).is_some(),
                };
                if !exists {
                    return Err(kind.not_found(reference));
                }
                return Ok(Target {
                    connection: Arc::clone(&member.connection),
                    local_name: local.to_string(),
                });
            }
        }
        self.resolve_unqualified(kind, reference)
    }

    fn resolve_unqualified(&self, kind: ItemKind, name: &str) -> Result<Target> {
        match self.owners(kind, name) {
            // A name only a down backend offered fails with its outage
            [] => match self
                .down_index
                .get(&(kind, name.to_string()))
                .and_then(|owners| owners.first())
                .and_then(|owner| self.members.get(owner))
            {
                Some(member) => Err(member.connection.unavailable_error()),
                None => Err(kind.not_found(name)),
            },
            [owner] => {
                let member = self
                    .members
                    .get(owner)
                    .ok_or_else(|| Error::Internal(format!("index names unknown backend {owner}")))?;
                Ok(Target {
                    connection: Arc::clone(&member.connection),
                    local_name: name.to_string(),
                })
            }
            owners => Err(Error::AmbiguousReference {
                name: name.to_string(),
                backends: owners.to_vec(),
            }),
        }
    }

    /// Tools of available backends, under qualified names
    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        self.members
            .iter()
            .flat_map(|(backend, m)| {
                m.catalog.tools.iter().map(move |t| Tool {
                    name: format!("{backend}.{}", t.name),
                    ..t.clone()
                })
            })
            .collect()
    }

    /// Resources of available backends; URIs are kept as-is
    #[must_use]
    pub fn resources(&self) -> Vec<Resource> {
        self.members
            .values()
            .flat_map(|m| m.catalog.resources.iter().cloned())
            .collect()
    }

    /// Backend prompts, under qualified names
    #[must_use]
    pub fn prompts(&self) -> Vec<Prompt> {
        self.members
            .iter()
            .flat_map(|(backend, m)| {
                m.catalog.prompts.iter().map(move |p| Prompt {
                    name: format!("{backend}.{}", p.name),
                    ..p.clone()
                })
            })
            .collect()
    }
}
