//! # HTTP Server Module
//!
//! The gateway in front of the edge runtime.
//!
//! # Endpoints
//!
//! - `/health` - Gateway and runtime health
//! - `/functions/v1/:function/*` - Function invocation (proxied)
//! - `/admin/v1/*` - Function, secret, config and runtime management

pub mod admin_routes;
pub mod config;
pub mod functions_routes;
pub mod observability_routes;
pub mod server;

pub use config::HttpServerConfig;
pub use server::HttpServer;
