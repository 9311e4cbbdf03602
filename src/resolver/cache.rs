//! Parsed-template cache

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use vmcp_core::Template;

struct Cached {
    text: String,
    template: Arc<Template>,
}

/// Parsed templates keyed by virtual server, then prompt name. An edited
/// prompt replaces its slot, so the cache holds at most one parse per
/// prompt that still exists.
#[derive(Default)]
pub struct TemplateCache {
    servers: DashMap<String, HashMap<String, Cached>>,
}

impl TemplateCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `text` of `server`'s prompt `prompt`, or return the cached
    /// parse if the text is unchanged
    #[must_use]
    pub fn get(&self, server: &str, prompt: &str, text: &str) -> Arc<Template> {
        if let Some(prompts) = self.servers.get(server) {
            if let Some(cached) = prompts.get(prompt).filter(|c| c.text == text) {
                return Arc::clone(&cached.template);
            }
        }
        let template = Arc::new(vmcp_core::parse(text));
        self.servers.entry(server.to_string()).or_default().insert(
            prompt.to_string(),
            Cached {
                text: text.to_string(),
                template: Arc::clone(&template),
            },
        );
        template
    }

    /// Drop `server`'s entries for prompts that `keep` rejects
    pub fn retain_prompts(&self, server: &str, keep: impl Fn(&str) -> bool) {
        if let Some(mut prompts) = self.servers.get_mut(server) {
            prompts.retain(|name, _| keep(name));
        }
    }

    /// Drop every entry of a deleted virtual server
    pub fn forget_server(&self, server: &str) {
        self.servers.remove(server);
    }

    /// Number of cached templates
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.iter().map(|prompts| prompts.len()).sum()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn same_text_parses_once() {
        let cache = TemplateCache::new();
        let a = cache.get("demo", "greet", "Hello @param.name");
        let b = cache.get("demo", "greet", "Hello @param.name");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let c = cache.get("demo", "other", "Hello @param.name");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn edits_replace_the_prompt_slot() {
        let cache = TemplateCache::new();
        for revision in 0..1000 {
            cache.get("demo", "greet", &format!("Hello @param.name, take {revision}"));
        }
        assert_eq!(cache.len(), 1);

        let latest = cache.get("demo", "greet", "Hello @param.name, take 999");
        let again = cache.get("demo", "greet", "Hello @param.name, take 999");
        assert!(Arc::ptr_eq(&latest, &again));
    }

    #[test]
    fn removed_prompts_and_servers_are_dropped() {
        let cache = TemplateCache::new();
        cache.get("demo", "keep", "a");
        cache.get("demo", "gone", "b");
        cache.get("other", "x", "c");

        cache.retain_prompts("demo", |name| name == "keep");
        assert_eq!(cache.len(), 2);

        cache.forget_server("other");
        assert_eq!(cache.len(), 1);
        cache.forget_server("demo");
        assert!(cache.is_empty());
    }
}
