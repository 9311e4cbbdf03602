//! Virtual servers: data model, storage seams and the MCP facade

mod blob;
mod facade;
mod model;
mod store;

pub use blob::{
    BlobStore, FsBlobStore, MemoryBlobStore, blob_id, guess_content_type, is_textual,
};
pub use facade::{VirtualMcp, VirtualServerHealth};
pub use model::{
    BackendRef, CustomPrompt, CustomResource, PromptVariable, ToolCallDefault, VirtualServer,
};
pub use store::{MemoryStore, VirtualServerStore};

/// Reserved `@resource` server name for a virtual server's own resources
pub const LOCAL_SCHEME: &str = "vmcp";
