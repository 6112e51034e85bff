//! Rowsync Server - bidirectional change-data-capture sync between a MySQL and
//! a PostgreSQL database.

use rowsync_engine::{
    LoopGuard, MappingDocument, MappingRegistry, ResolverRegistry, System, SystemNames,
    TableMapping,
};
use rowsync_server::config::{Config, FeedConfig, FeedKind};
use rowsync_server::db::{self, MySqlStore, PgStore, Stores};
use rowsync_server::error::Result;
use rowsync_server::feed::{EventSource, NdjsonSource, TopicRouter};
use rowsync_server::health::{AlertThresholds, Monitor, SyncMetrics};
use rowsync_server::publish::{LogPublisher, OutcomePublisher};
use rowsync_server::shutdown::Shutdown;
use rowsync_server::sync::{initial_sync, Dispatcher, Pipeline};
use rowsync_server::{build_router, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        instance = %config.instance_id,
        mysql = %config.mysql.redacted_url("mysql"),
        postgres = %config.postgres.redacted_url("postgres"),
        "Starting Rowsync Server"
    );

    // Connect both databases
    let mysql = db::create_mysql_pool(&config.mysql).await?;
    let postgres = db::create_pg_pool(&config.postgres).await?;
    let stores = Stores::new(
        Arc::new(MySqlStore::new(mysql)),
        Arc::new(PgStore::new(postgres)),
    );

    // Mappings and conflict resolvers
    let names = SystemNames::default()
        .with_database(System::A, &config.mysql.database)
        .with_database(System::B, &config.postgres.database);
    let (registry, forward) = load_mappings(&config, names)?;
    let resolvers = ResolverRegistry::with_source_priority(config.sync.source_priority);
    registry.validate_strategies(config.sync.default_strategy, &resolvers)?;
    tracing::info!(
        mappings = registry.len(),
        forward = forward.len(),
        "Table mappings loaded"
    );

    let metrics = Arc::new(SyncMetrics::new());
    let publisher = outcome_publisher(&config)?;

    let mut guard = LoopGuard::new(&config.instance_id);
    if let Some(column) = &config.sync.provenance_column {
        guard = guard.with_marker_column(column.clone());
    }
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(resolvers),
            stores.clone(),
            publisher,
            metrics.clone(),
        )
        .with_loop_guard(guard)
        .with_default_strategy(config.sync.default_strategy),
    );

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    // Health monitor
    let monitor = Monitor::new(
        stores,
        metrics.clone(),
        AlertThresholds::from(&config.health),
        config.health.data_dir.clone(),
    );
    let monitor = tokio::spawn(monitor.run(config.health.interval, shutdown.subscribe()));

    if config.sync.initial_sync {
        initial_sync(
            &dispatcher,
            forward.iter(),
            config.sync.batch_size,
            &shutdown.subscribe(),
        )
        .await?;
    }

    // Change feed
    let source = open_feed(&config.feed).await?;
    let router = TopicRouter::new(
        config.feed.system_a_topic_prefix.clone(),
        config.feed.system_b_topic_prefix.clone(),
    );
    let pipeline = Pipeline::new(dispatcher, router)
        .with_workers(config.sync.workers)
        .with_capacity(config.sync.batch_size);
    let pipeline_shutdown = shutdown.clone();
    let pipeline = tokio::spawn(async move {
        let result = pipeline.run(source, pipeline_shutdown.subscribe()).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Sync pipeline failed");
        }
        // Without a feed there is nothing left to serve.
        pipeline_shutdown.trigger();
        result
    });

    // Health surface
    let app = build_router(AppState {
        metrics,
        data_dir: config.health.data_dir.clone(),
    });
    let addr = format!("{}:{}", config.health.host, config.health.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.triggered().await })
        .await?;

    shutdown.trigger();
    pipeline.await??;
    monitor.await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Build the registry from `SYNC_MAPPINGS_FILE` or the built-in document.
///
/// Returns the registry with reverses derived, and the forward mappings as
/// configured.
fn load_mappings(config: &Config, names: SystemNames) -> Result<(MappingRegistry, Vec<TableMapping>)> {
    let document = match &config.sync.mappings_file {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading mapping document");
            MappingDocument::parse(&std::fs::read_to_string(path)?)?
        }
        None => MappingDocument::builtin(),
    };
    let forward = document.mappings.clone();

    let mut registry = MappingRegistry::from_document(document, names)?;
    let derived = registry.derive_reverse_mappings()?;
    tracing::debug!(?derived, "Reverse mappings derived");

    Ok((registry, forward))
}

#[cfg(feature = "kafka")]
fn outcome_publisher(config: &Config) -> Result<Arc<dyn OutcomePublisher>> {
    use rowsync_server::publish::KafkaPublisher;

    match config.feed.kind {
        FeedKind::Kafka => Ok(Arc::new(KafkaPublisher::connect(
            &config.feed.bootstrap_servers,
            config.feed.outcome_topic.clone(),
        )?)),
        FeedKind::File => Ok(Arc::new(LogPublisher)),
    }
}

#[cfg(not(feature = "kafka"))]
fn outcome_publisher(_config: &Config) -> Result<Arc<dyn OutcomePublisher>> {
    Ok(Arc::new(LogPublisher))
}

async fn open_feed(config: &FeedConfig) -> Result<Box<dyn EventSource>> {
    match config.kind {
        FeedKind::File => {
            tracing::info!(path = %config.file, "Reading change events from file");
            Ok(Box::new(NdjsonSource::open(&config.file).await?))
        }
        FeedKind::Kafka => kafka_feed(config),
    }
}

#[cfg(feature = "kafka")]
fn kafka_feed(config: &FeedConfig) -> Result<Box<dyn EventSource>> {
    Ok(Box::new(rowsync_server::feed::KafkaSource::connect(config)?))
}

#[cfg(not(feature = "kafka"))]
fn kafka_feed(_config: &FeedConfig) -> Result<Box<dyn EventSource>> {
    use rowsync_server::config::ConfigError;
    use rowsync_server::error::SyncError;

    Err(SyncError::Config(ConfigError::InvalidValue {
        var: "SYNC_FEED",
        reason: "kafka feed requires building with the `kafka` feature".to_string(),
    }))
}
