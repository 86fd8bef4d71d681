//! Server configuration.

use std::net::SocketAddr;

/// Default bind address.
pub const DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 8004);

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    pub bind_addr: SocketAddr,
    /// CORS allowed origins (empty means all).
    pub cors_origins: Vec<String>,
    /// Take the client address for rate limiting from `X-Forwarded-For`.
    ///
    /// Only enable behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR,
            cors_origins: Vec::new(),
            trust_forwarded_for: false,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with the specified bind address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    /// Sets the CORS allowed origins.
    #[must_use]
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    /// Trusts `X-Forwarded-For` for the client address.
    #[must_use]
    pub const fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8004);
        assert!(config.cors_origins.is_empty());
        assert!(!config.trust_forwarded_for);
    }

    #[test]
    fn builder() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ServerConfig::new(addr)
            .with_cors_origins(vec!["http://localhost:3000".to_string()])
            .with_trust_forwarded_for(true);
        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.cors_origins.len(), 1);
        assert!(config.trust_forwarded_for);
    }
}
