use sipcore::config::Config;
use sipcore::domain::access_control::AccessGuard;
use sipcore::domain::location::{LocationRepository, LocationService};
use sipcore::domain::subscriber::SubscriberRepository;
use sipcore::infrastructure::persistence::{InMemoryLocationRepository, InMemorySubscriberRepository};
use sipcore::infrastructure::protocols::sip::{DigestAuth, SipServer};
use sipcore::interface::api::{build_router, init_metrics, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "postgres")]
use sipcore::infrastructure::persistence::{
    create_pool, mask_password, PgLocationRepository, PgSubscriberRepository,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting sipcore");

    let config = Config::load()?;
    info!(
        "Configuration loaded: realm {}, {} listen endpoints",
        config.sip.realm,
        config.sip.listen.len()
    );

    let (locations, subscribers) = open_repositories(&config).await?;

    let location = Arc::new(LocationService::new(locations));
    let access = Arc::new(AccessGuard::new(config.access_config()?));
    let auth = if config.auth.enabled {
        info!("Digest authentication enabled for realm {}", config.sip.realm);
        Some(Arc::new(DigestAuth::new(
            &config.sip.realm,
            subscribers,
            Duration::from_secs(config.auth.nonce_ttl_secs),
        )))
    } else {
        None
    };

    let mut server = SipServer::new(config.server_config(), location.clone(), access, auth);
    if config.needs_tls() {
        server = server.with_tls(config.tls.build_acceptor()?);
        info!("TLS acceptor ready");
    }
    server.start().await?;

    if config.api.enabled {
        let prometheus_handle = init_metrics()?;
        let state = AppState::new(location, server.transactions().clone());
        let app = build_router(state, prometheus_handle);
        let listener = tokio::net::TcpListener::bind(config.api.bind).await?;
        info!("Admin API listening on http://{}", config.api.bind);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Admin API server error: {}", e);
            }
        });
    }

    info!("sipcore running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    server.stop().await?;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_repositories(
    config: &Config,
) -> anyhow::Result<(Arc<dyn LocationRepository>, Arc<dyn SubscriberRepository>)> {
    if let Some(db_config) = config.database_config() {
        info!("Using PostgreSQL at {}", mask_password(&db_config.url));
        let pool = create_pool(&db_config).await?;
        return Ok((
            Arc::new(PgLocationRepository::new(pool.clone())),
            Arc::new(PgSubscriberRepository::new(pool)),
        ));
    }
    Ok(in_memory_repositories(config))
}

#[cfg(not(feature = "postgres"))]
async fn open_repositories(
    config: &Config,
) -> anyhow::Result<(Arc<dyn LocationRepository>, Arc<dyn SubscriberRepository>)> {
    if config.database.url.is_some() {
        warn!("database.url is set but sipcore was built without the postgres feature");
    }
    Ok(in_memory_repositories(config))
}

fn in_memory_repositories(
    config: &Config,
) -> (Arc<dyn LocationRepository>, Arc<dyn SubscriberRepository>) {
    info!("Using in-memory location store");
    if config.auth.enabled {
        warn!("Authentication enabled without a database: no subscriber can register");
    }
    (
        Arc::new(InMemoryLocationRepository::new()),
        Arc::new(InMemorySubscriberRepository::new()),
    )
}
