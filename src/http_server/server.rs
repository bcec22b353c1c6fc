//! # HTTP Server
//!
//! Combines the health, invocation and admin routers and serves them until
//! the shutdown token fires.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::admin_routes::{admin_routes, AdminState};
use super::config::HttpServerConfig;
use super::functions_routes::{functions_routes, FunctionsState};
use super::observability_routes::health_routes;
use crate::auth::JwtValidator;
use crate::functions::{FunctionsProxy, Service};

/// HTTP gateway for the functions control plane
pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub fn new(
        config: HttpServerConfig,
        service: Arc<Service>,
        jwt: JwtValidator,
        shutdown: CancellationToken,
    ) -> Self {
        let router = Self::build_router(&config, service, jwt, shutdown.clone());
        Self {
            config,
            router,
            shutdown,
        }
    }

    fn cors_layer(config: &HttpServerConfig) -> CorsLayer {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();

            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }

    fn build_router(
        config: &HttpServerConfig,
        service: Arc<Service>,
        jwt: JwtValidator,
        shutdown: CancellationToken,
    ) -> Router {
        let proxy = FunctionsProxy::new(service.runtime().config().base_url())
            .with_prefix(config.functions_prefix.clone());
        let functions_state = Arc::new(FunctionsState::new(service.clone(), proxy, jwt));
        let admin_state = Arc::new(AdminState::new(service.clone(), shutdown));

        Router::new()
            .merge(health_routes(service))
            // Invocations answer their own preflights
            .nest(&config.functions_prefix, functions_routes(functions_state))
            .nest(
                &config.admin_prefix,
                admin_routes(admin_state).layer(Self::cors_layer(config)),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    /// Get the router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Serve until the shutdown token is cancelled
    pub async fn start(self) -> Result<(), std::io::Error> {
        let addr: SocketAddr = self.config.socket_addr().parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid socket address '{}': {}", self.config.socket_addr(), e),
            )
        })?;

        let listener = TcpListener::bind(addr).await?;
        info!(
            op = "http.listening",
            addr = %listener.local_addr()?,
            functions = %self.config.functions_prefix,
            admin = %self.config.admin_prefix,
        );

        let shutdown = self.shutdown.clone();
        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        info!(op = "http.stopped");
        Ok(())
    }
}
