//! Gateway server implementation

mod registry;
mod router;
mod server;

pub use registry::VirtualServers;
pub use router::{AppState, create_router};
pub use server::Gateway;
