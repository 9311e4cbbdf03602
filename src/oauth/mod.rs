//! Delegated authorization for backends
//!
//! Backends that answer `401` need an OAuth authorization code before the
//! gateway can connect. Each backend connection owns one [`AuthFlow`]; the
//! flow issues the authorization URL (with CSRF `state` and PKCE), accepts
//! the callback, and exchanges the code through an [`AuthorizationServer`].

mod callback;
mod client;
mod flow;
mod metadata;
mod token;

pub use callback::{CallbackParams, error_page, success_page};
pub use client::OAuthClient;
pub use flow::{AuthFlow, AuthState, AuthorizationRequest, AuthorizationServer};
pub use metadata::{AuthorizationServerMetadata, base_url};
pub use token::{TokenInfo, TokenResponse};
