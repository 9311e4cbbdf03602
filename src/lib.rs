//! Virtual MCP Gateway Library
//!
//! Composes several MCP backends into virtual servers. Each virtual server
//! exposes the merged tools, resources and prompts of its backends plus its
//! own composite prompts, whose text embeds directives:
//!
//! ```text
//! @param.<name>
//! @config.<name>
//! @tool.[<server>.]<tool>(<arg>: <type> = <value>, ...)
//! @resource.<server>://<path>
//! @prompt.<name>
//! ```
//!
//! `prompts/get` on a composite prompt resolves every directive in order,
//! calling backend tools and reading resources as it goes, and returns the
//! final text as one user message.
//!
//! # Layout
//!
//! - [`backend`]: one MCP session per backend, lazy reconnect, OAuth
//! - [`aggregator`]: collision-aware merged namespace snapshots
//! - [`resolver`]: the resolution engine and template lint
//! - [`virtual_server`]: data model, store seams and the MCP facade
//! - [`gateway`]: the axum HTTP surface

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod protocol;
pub mod resolver;
pub mod transport;
pub mod virtual_server;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` takes precedence over `level`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
    }

    Ok(())
}
