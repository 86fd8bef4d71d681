//! HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use didentity_auth::TokenLifecycleManager;
use didentity_secrets::SecretBroker;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::routes::create_router;
use crate::state::AppState;

/// The authentication HTTP server.
#[derive(Debug, Clone)]
pub struct AuthServer {
    state: Arc<AppState>,
}

impl AuthServer {
    /// Creates a server over the lifecycle manager and the broker it reads
    /// keys through.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        auth: Arc<TokenLifecycleManager>,
        broker: Arc<SecretBroker>,
    ) -> Self {
        Self {
            state: Arc::new(AppState::new(config, auth, broker)),
        }
    }

    /// Returns the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Creates the router without starting the server.
    pub fn router(&self) -> axum::Router {
        create_router(Arc::clone(&self.state))
    }

    /// Serves on the configured address until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the server stops abnormally.
    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> ServerResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config().bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the server stops abnormally.
    pub async fn serve_listener<F>(&self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        info!(addr = %local, "auth server listening");

        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;

        info!("auth server shut down");
        Ok(())
    }
}
