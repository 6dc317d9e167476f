use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use banter_protocol::{EventType, SnowflakeGenerator};
use hub::bridge::{BROADCAST_GROUP, BroadcastFanout};
use hub::config::HubConfig;
use hub::durable::kafka::{KafkaConsumer, KafkaLog};
use hub::metrics::HubMetrics;
use hub::rate_limit::RedisRateLimiter;
use hub::stores::memory::{MemoryDirectMessageStore, MemoryMembership, MemoryUserDirectory};
use hub::stores::redis_cache::{CacheManager, CachedMembership, CachedUserDirectory};
use hub::{AppState, Hub, HubDeps};

const CONSUMER_DRAIN: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = HubConfig::from_env().expect("invalid configuration");
    let metrics = Arc::new(HubMetrics::new());
    let ids = SnowflakeGenerator::new(config.machine_id).expect("MACHINE_ID out of range");

    info!(redis = %config.redis_url, "connecting to redis...");
    let redis_client = redis::Client::open(config.redis_url.as_str()).expect("invalid REDIS_URL");
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .expect("failed to connect to redis");
    let cache = CacheManager::new(redis_conn.clone(), metrics.clone());
    let limiter = Arc::new(RedisRateLimiter::new(redis_conn, config.rate_limit_per_minute));

    info!(brokers = %config.kafka_brokers, "connecting durable-log producer...");
    let producer = Arc::new(
        KafkaLog::new(&config.kafka_brokers, ids.clone()).expect("failed to build kafka producer"),
    );

    // Backing stores are external collaborators; until their integration is
    // wired, the in-memory tables stand behind the read-through cache.
    let membership = Arc::new(CachedMembership::new(cache.clone(), MemoryMembership::new()));
    let users = Arc::new(CachedUserDirectory::new(cache));
    let direct_messages = MemoryDirectMessageStore::new();

    let hub = Hub::start(HubDeps {
        producer,
        limiter,
        membership,
        users,
        direct_messages,
        ids,
        metrics: metrics.clone(),
        subscribe_workers: config.subscribe_workers,
        allow_all_server_members: config.allow_all_server_members,
    });

    let fanout = Arc::new(BroadcastFanout::new(hub.clone()));
    let consumer = KafkaConsumer::new(
        &config.kafka_brokers,
        BROADCAST_GROUP,
        EventType::BroadcastChannelMessageAdd.as_str(),
        fanout,
    )
    .expect("failed to build fan-out consumer");
    hub.attach_consumer(Box::new(consumer));
    hub.start_consumers();

    let state = AppState { hub: hub.clone(), metrics };
    let router = hub::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "hub listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    if let Err(e) = hub.shutdown(CONSUMER_DRAIN).await {
        tracing::error!(error = %e, "consumer drain incomplete");
    }
    info!("hub shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
