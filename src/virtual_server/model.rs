//! Virtual server records

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::LOCAL_SCHEME;
use crate::config::{BackendConfig, VirtualServerConfig};
use crate::protocol::{Prompt, PromptArgument, Resource};

/// A composite endpoint: custom prompts and resources over a set of backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualServer {
    /// Identity
    pub name: String,
    /// Human-readable name
    pub display_name: Option<String>,
    /// Composite prompts, in declaration order
    pub prompts: Vec<CustomPrompt>,
    /// Uploaded resources
    pub resources: Vec<CustomResource>,
    /// Owner-set config values
    pub environment_variables: HashMap<String, String>,
    /// Composed backends
    pub backends: Vec<BackendRef>,
}

impl VirtualServer {
    /// Build from a config definition. Seed resources are attached
    /// separately once their content is in the blob store.
    #[must_use]
    pub fn from_config(config: &VirtualServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            display_name: config.display_name.clone(),
            prompts: config.prompts.clone(),
            resources: Vec::new(),
            environment_variables: config.environment_variables.clone(),
            backends: config
                .backends
                .iter()
                .filter(|(_, backend)| backend.enabled)
                .map(|(name, backend)| BackendRef {
                    name: name.clone(),
                    config: backend.clone(),
                })
                .collect(),
        }
    }

    /// Custom prompt by name
    #[must_use]
    pub fn prompt(&self, name: &str) -> Option<&CustomPrompt> {
        self.prompts.iter().find(|p| p.name == name)
    }

    /// Custom resource by its exposed filename
    #[must_use]
    pub fn resource(&self, filename: &str) -> Option<&CustomResource> {
        self.resources
            .iter()
            .find(|r| r.original_filename == filename)
    }
}

/// A backend composed into a virtual server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRef {
    /// Backend name, unique within the virtual server
    pub name: String,
    /// Transport and auth settings
    pub config: BackendConfig,
}

/// Server-defined prompt template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomPrompt {
    /// Name, unique within the virtual server
    pub name: String,
    /// Description shown in `prompts/list`
    pub description: Option<String>,
    /// Raw template text
    pub text: String,
    /// The only parameter names callers may bind
    pub variables: Vec<PromptVariable>,
    /// Config keys this prompt may read through `@config`
    pub environment_variables: Vec<String>,
    /// Default arguments for tool calls in the template
    pub tool_calls: Vec<ToolCallDefault>,
}

impl CustomPrompt {
    /// Declared variable by name
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&PromptVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Whether `@config.<key>` is allowed
    #[must_use]
    pub fn allows_config(&self, key: &str) -> bool {
        self.environment_variables.iter().any(|k| k == key)
    }

    /// Declared default arguments for a tool reference. An exact match on
    /// the reference as written wins over a match on the bare tool name.
    #[must_use]
    pub fn tool_defaults(&self, reference: &str, tool: &str) -> Option<&Map<String, Value>> {
        self.tool_calls
            .iter()
            .find(|d| d.tool == reference)
            .or_else(|| self.tool_calls.iter().find(|d| d.tool == tool))
            .map(|d| &d.arguments)
    }

    /// Metadata for `prompts/list`
    #[must_use]
    pub fn to_protocol(&self) -> Prompt {
        Prompt {
            name: self.name.clone(),
            title: None,
            description: self.description.clone(),
            arguments: self
                .variables
                .iter()
                .map(|v| PromptArgument {
                    name: v.name.clone(),
                    description: v.description.clone(),
                    required: v.required && v.default.is_none(),
                })
                .collect(),
        }
    }
}

/// Declared prompt parameter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptVariable {
    /// Parameter name
    pub name: String,
    /// Description
    pub description: Option<String>,
    /// Caller must supply it (unless a default exists)
    pub required: bool,
    /// Bound when the caller omits the argument
    pub default: Option<String>,
}

/// Default argument mapping for one tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCallDefault {
    /// `tool` or `server.tool`
    pub tool: String,
    /// Argument defaults; string values may be `@param.<name>`
    pub arguments: Map<String, Value>,
}

/// Content uploaded to a virtual server, stored in the blob store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomResource {
    /// Identity
    pub id: String,
    /// Name the resource is exposed under
    pub original_filename: String,
    /// MIME type
    pub content_type: String,
    /// Content-addressed blob id
    pub blob_id: String,
    /// Upload time
    pub created_at: DateTime<Utc>,
}

impl CustomResource {
    /// Create a record for stored content
    #[must_use]
    pub fn new(
        original_filename: impl Into<String>,
        content_type: impl Into<String>,
        blob_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            original_filename: original_filename.into(),
            content_type: content_type.into(),
            blob_id: blob_id.into(),
            created_at: Utc::now(),
        }
    }

    /// `vmcp://<original_filename>`
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{LOCAL_SCHEME}://{}", self.original_filename)
    }

    /// Listing entry
    #[must_use]
    pub fn to_protocol(&self) -> Resource {
        Resource {
            uri: self.uri(),
            name: self.original_filename.clone(),
            title: None,
            description: None,
            mime_type: Some(self.content_type.clone()),
            size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> CustomPrompt {
        serde_yaml::from_str(
            r#"
name: report
text: "@tool.calc.add(a: int) @tool.add()"
variables:
  - { name: who, required: true }
  - { name: tone, required: true, default: "friendly" }
environment_variables: [api_key]
tool_calls:
  - tool: add
    arguments: { a: 1, b: 2 }
  - tool: calc.add
    arguments: { a: 5, b: "@param.who" }
"#,
        )
        .unwrap()
    }

    #[test]
    fn qualified_tool_defaults_win() {
        let p = prompt();
        assert_eq!(p.tool_defaults("calc.add", "add").unwrap()["a"], 5);
        assert_eq!(p.tool_defaults("add", "add").unwrap()["a"], 1);
        assert_eq!(p.tool_defaults("other.add", "add").unwrap()["a"], 1);
        assert!(p.tool_defaults("sub", "sub").is_none());
    }

    #[test]
    fn defaulted_variables_listed_optional() {
        let listed = prompt().to_protocol();
        assert!(listed.arguments[0].required);
        assert!(!listed.arguments[1].required);
    }

    #[test]
    fn config_access_is_declared() {
        let p = prompt();
        assert!(p.allows_config("api_key"));
        assert!(!p.allows_config("secret"));
    }

    #[test]
    fn custom_resource_uri_uses_local_scheme() {
        let r = CustomResource::new("notes.md", "text/markdown", "abc");
        assert_eq!(r.uri(), "vmcp://notes.md");
        assert_eq!(r.to_protocol().mime_type.as_deref(), Some("text/markdown"));
    }
}
