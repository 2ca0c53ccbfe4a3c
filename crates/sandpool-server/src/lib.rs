//! # sandpool-server
//!
//! HTTP front door for a [`sandpool_core::SandboxService`].
//!
//! The request body is handed to a warm sandbox as-is and the sandbox's
//! output is returned as the response body.

pub mod config;
pub mod http;

pub use config::{ConfigError, ServerConfig};
pub use http::{build_router, serve, AppState};
