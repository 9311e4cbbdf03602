//! Virtual server persistence seam

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CustomPrompt, CustomResource, VirtualServer};
use crate::{Error, Result};

/// CRUD over virtual server definitions.
///
/// Reads return a snapshot; a resolution keeps using the snapshot it
/// started with even if the definition changes meanwhile.
#[async_trait]
pub trait VirtualServerStore: Send + Sync {
    /// Current definition
    async fn get(&self, name: &str) -> Result<Arc<VirtualServer>>;

    /// Names of all virtual servers, sorted
    async fn list(&self) -> Result<Vec<String>>;

    /// Create or replace a virtual server
    async fn put(&self, server: VirtualServer) -> Result<()>;

    /// Delete a virtual server; `false` if it did not exist
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Create or replace a custom prompt
    async fn upsert_prompt(&self, server: &str, prompt: CustomPrompt) -> Result<()>;

    /// Remove a custom prompt; `false` if it did not exist
    async fn remove_prompt(&self, server: &str, prompt: &str) -> Result<bool>;

    /// Attach a custom resource, replacing one with the same filename
    async fn add_resource(&self, server: &str, resource: CustomResource) -> Result<()>;

    /// Set a config value
    async fn set_environment_variable(&self, server: &str, key: &str, value: &str) -> Result<()>;
}

/// In-memory store; mutations replace the stored snapshot
#[derive(Default)]
pub struct MemoryStore {
    servers: DashMap<String, Arc<VirtualServer>>,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut VirtualServer)) -> Result<()> {
        let mut entry = self
            .servers
            .get_mut(name)
            .ok_or_else(|| Error::VirtualServerNotFound(name.to_string()))?;
        let mut server = VirtualServer::clone(&entry);
        f(&mut server);
        *entry = Arc::new(server);
        Ok(())
    }
}

#[async_trait]
impl VirtualServerStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Arc<VirtualServer>> {
        self.servers
            .get(name)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| Error::VirtualServerNotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.servers.iter().map(|s| s.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn put(&self, server: VirtualServer) -> Result<()> {
        if server.name.is_empty() {
            return Err(Error::Config("virtual server without a name".into()));
        }
        self.servers.insert(server.name.clone(), Arc::new(server));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.servers.remove(name).is_some())
    }

    async fn upsert_prompt(&self, server: &str, prompt: CustomPrompt) -> Result<()> {
        self.update(server, |s| {
            match s.prompts.iter_mut().find(|p| p.name == prompt.name) {
                Some(existing) => *existing = prompt,
                None => s.prompts.push(prompt),
            }
        })
    }

    async fn remove_prompt(&self, server: &str, prompt: &str) -> Result<bool> {
        let mut removed = false;
        self.update(server, |s| {
            let before = s.prompts.len();
            s.prompts.retain(|p| p.name != prompt);
            removed = s.prompts.len() != before;
        })?;
        Ok(removed)
    }

    async fn add_resource(&self, server: &str, resource: CustomResource) -> Result<()> {
        self.update(server, |s| {
            s.resources
                .retain(|r| r.original_filename != resource.original_filename);
            s.resources.push(resource);
        })
    }

    async fn set_environment_variable(&self, server: &str, key: &str, value: &str) -> Result<()> {
        self.update(server, |s| {
            s.environment_variables
                .insert(key.to_string(), value.to_string());
        })
    }
}
