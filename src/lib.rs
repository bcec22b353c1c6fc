//! edgeplane - control plane for self-hosted edge functions
//!
//! Supervises an edge runtime subprocess, stores function secrets and
//! metadata, and fronts the runtime with an HTTP gateway.

pub mod auth;
pub mod cli;
pub mod functions;
pub mod http_server;
pub mod observability;
