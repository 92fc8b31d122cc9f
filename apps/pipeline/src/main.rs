mod ai_client;
mod broker;
mod config;
mod errors;
mod models;
mod object_store;
mod pipeline;
mod priority;
mod redis_conn;
mod requests;
mod routes;
mod state;
mod status_cache;
mod store;
#[cfg(test)]
mod testing;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ai_client::{AiClient, ResumeServices};
use crate::broker::{Broker, BrokerSettings, Publisher, RedisQueueStore};
use crate::config::Config;
use crate::object_store::{ObjectStore, S3ObjectStore};
use crate::pipeline::ranking::{PagingSettings, RankingOrchestrator};
use crate::pipeline::resume_processor::{IngestRetry, ResumeProcessor};
use crate::pipeline::workers::Workers;
use crate::redis_conn::RedisHandle;
use crate::routes::build_router;
use crate::state::AppState;
use crate::status_cache::{RedisKeyValueStore, StatusCache};
use crate::store::{PgRecruitingStore, RecruitingStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ranking pipeline v{}", env!("CARGO_PKG_VERSION"));

    // Document store
    let pg = Arc::new(PgRecruitingStore::connect(&config.database_url).await?);
    let store: Arc<dyn RecruitingStore> = pg.clone();

    // Status cache and broker each get their own lazily connected handle
    let pipeline_config = &config.pipeline;
    let cache_redis = RedisHandle::open(
        "status-cache",
        &config.redis_url,
        pipeline_config.reconnect_delay,
    )?;
    let cache = StatusCache::new(
        Arc::new(RedisKeyValueStore::new(cache_redis.clone())),
        pipeline_config.status_ttl_secs,
    );

    let broker_redis = RedisHandle::open(
        "broker",
        &config.broker_url,
        pipeline_config.reconnect_delay,
    )?;
    let broker = Arc::new(Broker::new(
        Arc::new(RedisQueueStore::new(broker_redis)),
        BrokerSettings::from(pipeline_config),
    ));
    broker.connect().await?;
    let publisher: Arc<dyn Publisher> = broker.clone();
    info!("Broker topology declared");

    // Object store
    let s3 = build_s3_client(&config).await;
    let objects: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(s3, config.s3_bucket.clone()));
    info!("S3 client initialized");

    // AI services
    let services: Arc<dyn ResumeServices> = Arc::new(AiClient::new(&config)?);
    info!("AI service client initialized");

    let workers = if config.run_workers {
        let processor = ResumeProcessor::new(
            store.clone(),
            objects.clone(),
            services.clone(),
            cache.clone(),
            publisher.clone(),
            IngestRetry::from(pipeline_config),
        );
        let orchestrator = Arc::new(RankingOrchestrator::new(
            store.clone(),
            objects.clone(),
            services.clone(),
            cache.clone(),
            publisher.clone(),
            PagingSettings::from(pipeline_config),
        ));
        Some(Workers::start(
            &broker,
            processor,
            orchestrator,
            pipeline_config,
        )?)
    } else {
        None
    };

    if config.run_http {
        let state = AppState {
            store: store.clone(),
            cache: cache.clone(),
            publisher: publisher.clone(),
            results_freshness: pipeline_config.results_freshness,
        };

        let app = build_router(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
        info!("Listening on {addr}");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    info!("Shutting down");
    if let Some(workers) = workers {
        workers.shutdown().await;
    }
    broker.close().await;
    cache_redis.close().await;
    pg.close().await;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
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
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "ranking-pipeline-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(config.aws_region.clone()))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
