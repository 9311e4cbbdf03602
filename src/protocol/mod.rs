//! MCP protocol types (version 2025-06-18)

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP protocol version spoken on both sides of the gateway
pub const PROTOCOL_VERSION: &str = "2025-06-18";
