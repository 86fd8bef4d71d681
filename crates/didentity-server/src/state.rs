//! Shared state for the HTTP server.

use std::sync::Arc;
use std::time::Instant;

use didentity_auth::TokenLifecycleManager;
use didentity_secrets::SecretBroker;

use crate::config::ServerConfig;

/// Shared state handed to every handler.
#[derive(Debug)]
pub struct AppState {
    config: ServerConfig,
    auth: Arc<TokenLifecycleManager>,
    broker: Arc<SecretBroker>,
    start_time: Instant,
}

impl AppState {
    /// Creates the state.
    pub fn new(
        config: ServerConfig,
        auth: Arc<TokenLifecycleManager>,
        broker: Arc<SecretBroker>,
    ) -> Self {
        Self {
            config,
            auth,
            broker,
            start_time: Instant::now(),
        }
    }

    /// Server configuration.
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The token lifecycle manager.
    pub fn auth(&self) -> &TokenLifecycleManager {
        &self.auth
    }

    /// The secret broker.
    pub fn broker(&self) -> &SecretBroker {
        &self.broker
    }

    /// Seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
