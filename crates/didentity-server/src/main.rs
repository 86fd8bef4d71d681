//! DIDentity auth server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use didentity_auth::{
    CredentialVerifier, InMemoryCredentialStore, InMemoryRateLimiter, InMemoryRevocationStore,
    RateLimitConfig, RateLimiter, RedisRateLimiter, RedisRevocationStore, RevocationStore,
    TokenIssuer, TokenLifecycleManager, TracingEventPublisher,
};
use didentity_secrets::config::{DEFAULT_KV_MOUNT, DEFAULT_STORE_ADDRESS};
use didentity_secrets::{
    AuditLog, BrokerConfig, DEFAULT_AUDIT_LOG_CAPACITY, EnvFallback, SecretBroker, StoreConfig,
};
use didentity_server::{AuthServer, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// DIDentity authentication service.
#[derive(Parser, Debug)]
#[command(name = "didentity-auth-server", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "DIDENTITY_BIND", default_value = "0.0.0.0:8004")]
    bind: SocketAddr,

    /// Vault address.
    #[arg(long, env = "VAULT_ADDR", default_value = DEFAULT_STORE_ADDRESS)]
    vault_addr: String,

    /// Vault token.
    #[arg(long, env = "VAULT_TOKEN", default_value = "root", hide_env_values = true)]
    vault_token: String,

    /// KV v2 mount.
    #[arg(long, env = "VAULT_KV_MOUNT", default_value = DEFAULT_KV_MOUNT)]
    vault_mount: String,

    /// Secret cache lifetime in seconds.
    #[arg(long, env = "SECRET_CACHE_TTL_SECS", default_value_t = 300)]
    cache_ttl_secs: u64,

    /// Most recent secret access records kept in memory.
    #[arg(long, env = "AUDIT_LOG_CAPACITY", default_value_t = DEFAULT_AUDIT_LOG_CAPACITY)]
    audit_log_capacity: usize,

    /// Redis URL for revocations and rate limits shared across instances.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Login attempts allowed per window.
    #[arg(long, env = "LOGIN_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Login rate-limit window in seconds.
    #[arg(long, env = "LOGIN_WINDOW_SECS", default_value_t = 60)]
    window_secs: u64,

    /// Allowed CORS origins, comma separated. Empty allows any.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,

    /// Take the client address from `X-Forwarded-For`.
    #[arg(long, env = "TRUST_FORWARDED_FOR")]
    trust_forwarded_for: bool,

    /// Emit logs as JSON.
    #[arg(long, env = "DIDENTITY_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

/// Builds the shared stores: Redis when configured, otherwise process-local
/// stores with a periodic sweep.
async fn shared_stores(
    redis_url: Option<&str>,
    limits: RateLimitConfig,
) -> anyhow::Result<(Arc<dyn RevocationStore>, Arc<dyn RateLimiter>)> {
    if let Some(url) = redis_url {
        let revocations = RedisRevocationStore::connect(url)
            .await
            .context("connecting revocation store")?;
        let limiter = RedisRateLimiter::connect(url, limits)
            .await
            .context("connecting rate limiter")?;
        info!("using redis for revocations and rate limits");
        return Ok((Arc::new(revocations), Arc::new(limiter)));
    }

    warn!("REDIS_URL not set; revocations and rate limits are local to this process");
    let revocations = Arc::new(InMemoryRevocationStore::new());
    let limiter = Arc::new(InMemoryRateLimiter::new(limits));

    let (sweep_revocations, sweep_limiter) = (Arc::clone(&revocations), Arc::clone(&limiter));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let purged = sweep_revocations.purge_expired();
            let idle = sweep_limiter.cleanup();
            if purged + idle > 0 {
                info!(purged, idle, "swept local stores");
            }
        }
    });

    Ok((revocations, limiter))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let store = StoreConfig::new(&args.vault_addr, &args.vault_token).with_mount(&args.vault_mount);
    let broker_config =
        BrokerConfig::new(store).with_cache_ttl(Duration::from_secs(args.cache_ttl_secs));
    let (broker, audit_rx) = SecretBroker::from_config(&broker_config, EnvFallback::standard())
        .context("configuring secret broker")?;
    let audit_log = Arc::new(AuditLog::with_capacity(args.audit_log_capacity));
    let _collector = audit_log.spawn_collector(audit_rx);
    let broker = Arc::new(broker);

    let limits = RateLimitConfig::new(args.max_attempts, Duration::from_secs(args.window_secs));
    let (revocations, limiter) = shared_stores(args.redis_url.as_deref(), limits).await?;

    let verifier = CredentialVerifier::new(Arc::new(InMemoryCredentialStore::new()))
        .context("initializing credential verifier")?;
    let issuer = TokenIssuer::new(Arc::clone(&broker) as _, revocations);
    let auth = TokenLifecycleManager::new(verifier, issuer)
        .with_rate_limiter(limiter)
        .with_events(Arc::new(TracingEventPublisher));

    let config = ServerConfig::new(args.bind)
        .with_cors_origins(args.cors_origins)
        .with_trust_forwarded_for(args.trust_forwarded_for);

    info!(bind = %args.bind, vault = %args.vault_addr, "starting DIDentity auth server");
    AuthServer::new(config, Arc::new(auth), broker)
        .serve_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
