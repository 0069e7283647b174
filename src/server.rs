//! Service wiring and HTTP server
//!
//! `Services::build` assembles the database, entity store, node and router services,
//! gateway registry and cron scheduler from a `Config`. The CLI uses it for single
//! ticks; `start_server` adds the ops API and the in-process cron daemon.

use crate::{
    api::ops::{create_ops_routes, OpsState},
    config::Config,
    cron::{CronContext, CronDaemon, CronScheduler, LogNotifier, Notifier, WebhookNotifier},
    logging::LogService,
    node::{GatewayContext, GatewayRegistry, NodeService, SubscriptionCache},
    router::{FilterRegistry, RouterRepository, RouterService, TransformRegistry},
    store::{Database, EntityStore, RetryPolicy, SqliteEntityStore},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Every long-lived service of one Magelink instance
#[derive(Clone)]
pub struct Services {
    pub db: Database,
    pub entities: Arc<dyn EntityStore>,
    pub nodes: Arc<NodeService>,
    pub router: Arc<RouterService>,
    pub log: LogService,
    pub cron: Arc<CronScheduler>,
}

impl Services {
    /// Build with the built-in gateways, transforms and filters
    pub async fn build(config: &Config) -> Result<Self> {
        Self::build_with(
            config,
            GatewayRegistry::with_builtin(),
            TransformRegistry::with_builtin(),
            FilterRegistry::with_builtin(),
        )
        .await
    }

    /// Build with caller-supplied registries
    pub async fn build_with(
        config: &Config,
        gateways: GatewayRegistry,
        transforms: TransformRegistry,
        filters: FilterRegistry,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!("🗄️ Initializing database");
        let db = Database::connect(&config.database.path).await?;
        let pool = db.pool().clone();

        let log = LogService::new(pool.clone(), &config.logging.enabled_levels);
        let retry = RetryPolicy::new(config.sync.write_attempts, config.sync.write_backoff_ms);
        let entities: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(pool.clone()));

        tracing::info!("🛰️ Initializing node and router services");
        let nodes = Arc::new(NodeService::new(
            pool.clone(),
            Arc::clone(&entities),
            Arc::new(SubscriptionCache::new()),
            retry,
        ));
        let router = Arc::new(RouterService::new(
            RouterRepository::new(pool.clone()),
            Arc::clone(&entities),
            transforms,
            filters,
            log.clone(),
            retry,
        ));

        tracing::info!("🔌 Gateway types: {:?}", gateways.types());
        let ctx = CronContext {
            pool,
            services: GatewayContext {
                nodes: Arc::clone(&nodes),
                router: Arc::clone(&router),
                entities: Arc::clone(&entities),
                log: log.clone(),
            },
            gateways: Arc::new(gateways),
            sync: config.sync.clone(),
        };

        let notifier: Arc<dyn Notifier> = match &config.cron.notify_url {
            Some(url) => Arc::new(WebhookNotifier::new(url)?),
            None => Arc::new(LogNotifier),
        };

        tracing::info!("⏰ Initializing cron scheduler ({} jobs)", config.cron.jobs.len());
        let cron = Arc::new(CronScheduler::from_config(&config.cron, ctx, notifier, log.clone())?);

        Ok(Self {
            db,
            entities,
            nodes,
            router,
            log,
            cron,
        })
    }
}

/// Install the fmt subscriber; `RUST_LOG` overrides the default filter
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "magelink=debug" } else { "magelink=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

/// Ops router over already-built services
pub fn create_app(services: &Services) -> Router {
    let state = OpsState {
        cron: Arc::clone(&services.cron),
        nodes: Arc::clone(&services.nodes),
    };

    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_ops_routes().with_state(state))
}

/// Serve the ops API and run the cron daemon until the process stops
pub async fn start_server(config: Config) -> Result<()> {
    tracing::info!("Starting Magelink server...");

    let services = Services::build(&config).await?;

    let daemon = CronDaemon::new(Arc::clone(&services.cron)).await?;
    daemon.start().await?;

    let app = create_app(&services);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    let served = axum::serve(listener, app.into_make_service()).await;
    daemon.stop().await?;
    served?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
