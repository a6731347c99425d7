//! Herald API server binary entrypoint.
//!
//! Wires the PostgreSQL ledger, preference store and schedule store, the
//! provider adapters that have credentials, and the Redis dead-letter sink
//! into one engine, then serves HTTP next to the scheduler and retry workers.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::{create_pool, run_migrations};
use herald_common::redis_pool::create_redis_pool;
use herald_common::types::Channel;
use herald_engine::Engine;
use herald_engine::escalation::RedisEscalation;
use herald_engine::pg_ledger::PgLedger;
use herald_engine::preferences::PgPreferenceResolver;
use herald_engine::scheduler::{PgScheduleStore, Scheduler};
use herald_notifier::ChannelRegistry;
use herald_notifier::mail::MailAdapter;
use herald_notifier::push::PushAdapter;
use herald_notifier::realtime::RealtimeAdapter;
use herald_notifier::sms::SmsAdapter;

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting Herald API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    // Create Redis connection
    let redis = create_redis_pool(&config.redis_url).await?;

    let registry = build_registry(&config, redis.clone())?;

    let scheduler =
        Scheduler::new(&config.engine).with_store(Arc::new(PgScheduleStore::new(pool.clone())));

    let engine = Engine::new(
        &config.engine,
        Arc::new(PgLedger::new(pool.clone())),
        Arc::new(PgPreferenceResolver::new(pool)),
        Arc::new(registry),
        Arc::new(RedisEscalation::new(redis)),
        scheduler,
    );

    engine.scheduler.restore().await?;

    let workers = engine.spawn_workers();

    // Build router
    let app = create_router(AppState::new(engine))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server exited with error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    for worker in workers {
        worker.abort();
    }

    tracing::info!("Herald API server stopped.");
    Ok(())
}

/// `RUST_LOG` filter with a debug default; `LOG_FORMAT=json` for JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "herald_api=debug,herald_engine=debug,herald_notifier=debug,tower_http=debug",
        )
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Register an adapter for every channel whose credentials are configured.
/// Realtime only needs Redis and is always available.
fn build_registry(
    config: &AppConfig,
    redis: redis::aio::ConnectionManager,
) -> anyhow::Result<ChannelRegistry> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let limit = |channel: Channel| config.engine.rate_limits.get(&channel).copied();
    let mut registry = ChannelRegistry::new();

    match (&config.resend_api_key, &config.email_from) {
        (Some(key), Some(from)) => registry.register(
            Arc::new(MailAdapter::new(client.clone(), key, from)),
            limit(Channel::Mail),
        ),
        _ => tracing::warn!(channel = %Channel::Mail, "RESEND_API_KEY/EMAIL_FROM not set, channel disabled"),
    }

    match (
        &config.twilio_account_sid,
        &config.twilio_auth_token,
        &config.sms_from,
    ) {
        (Some(sid), Some(token), Some(from)) => registry.register(
            Arc::new(SmsAdapter::new(client.clone(), sid, token, from)),
            limit(Channel::Sms),
        ),
        _ => tracing::warn!(
            channel = %Channel::Sms,
            "TWILIO_ACCOUNT_SID/TWILIO_AUTH_TOKEN/SMS_FROM not set, channel disabled"
        ),
    }

    match (&config.push_gateway_url, &config.push_api_key) {
        (Some(url), Some(key)) => registry.register(
            Arc::new(PushAdapter::new(client, url, key)),
            limit(Channel::Push),
        ),
        _ => tracing::warn!(channel = %Channel::Push, "PUSH_GATEWAY_URL/PUSH_API_KEY not set, channel disabled"),
    }

    registry.register(
        Arc::new(RealtimeAdapter::new(
            redis,
            config.realtime_channel_prefix.clone(),
        )),
        limit(Channel::Realtime),
    );

    Ok(registry)
}
