//! Thin demo binary wiring the scheduler, a pluggable distributed lock, and
//! the DLQ consumer into one process, modeled on the teacher's
//! `crates/ingress-rpc/src/main.rs` (`clap` + `dotenvy` + `tracing` bootstrap,
//! a long-running service awaited until an interrupt signal arrives).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xcron_core::{ExponentialBackoff, MaxAttemptsRetryPolicy};
use xcron_dlq::{DlqConsumer, DlqConsumerConfig, MessageHandler};
use xcron_lock::LockProvider;
use xcron_scheduler::{Scheduler, SchedulerConfig};
use xcron_tracing::OtelJobTracer;

#[derive(Clone, Debug, ValueEnum)]
enum LockBackend {
    Noop,
    Redis,
    K8s,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// Distributed lock backend jobs acquire before executing.
    #[arg(long, env = "XCRON_LOCK_BACKEND", value_enum, default_value = "noop")]
    lock_backend: LockBackend,

    /// Redis connection URL, required when `lock_backend = redis`.
    #[arg(long, env = "XCRON_REDIS_URL")]
    redis_url: Option<String>,

    /// Kubernetes namespace leases are created in, required when
    /// `lock_backend = k8s`.
    #[arg(long, env = "XCRON_K8S_NAMESPACE", default_value = "default")]
    k8s_namespace: String,

    /// Default job lock TTL in seconds.
    #[arg(long, env = "XCRON_LOCK_TTL_SECONDS", default_value = "30")]
    lock_ttl_seconds: u64,

    /// Cron expression for the built-in demo heartbeat job.
    #[arg(long, env = "XCRON_HEARTBEAT_SCHEDULE", default_value = "@every 1m")]
    heartbeat_schedule: String,

    /// Enable the DLQ consumer alongside the scheduler.
    #[arg(long, env = "XCRON_DLQ_ENABLED", default_value = "false")]
    dlq_enabled: bool,

    /// Kafka bootstrap servers for the DLQ consumer.
    #[arg(long, env = "XCRON_KAFKA_BROKERS")]
    kafka_brokers: Option<String>,

    /// Comma-separated source topics the DLQ consumer reads from.
    #[arg(long, env = "XCRON_DLQ_SOURCE_TOPICS")]
    dlq_source_topics: Option<String>,

    /// Topic failed-but-retryable messages are republished to.
    #[arg(long, env = "XCRON_DLQ_RETRY_TOPIC", default_value = "xcron-retry")]
    dlq_retry_topic: String,

    /// Topic for messages that exhausted their retries.
    #[arg(long, env = "XCRON_DLQ_DEAD_LETTER_TOPIC", default_value = "xcron-dlq")]
    dlq_dead_letter_topic: String,

    /// Consumer group id for the DLQ consumer.
    #[arg(long, env = "XCRON_DLQ_GROUP_ID", default_value = "xcron-dlq-consumer")]
    dlq_group_id: String,

    #[arg(long, env = "XCRON_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "XCRON_TRACING_ENABLED", default_value = "false")]
    tracing_enabled: bool,

    #[arg(long, env = "XCRON_OTLP_ENDPOINT", default_value = "http://localhost:4317")]
    otlp_endpoint: String,

    /// Bind address for the Prometheus metrics exporter. Unset disables it.
    #[arg(long, env = "XCRON_METRICS_ADDRESS")]
    metrics_address: Option<std::net::SocketAddr>,
}

/// Installs the global metrics recorder, matching the teacher's
/// `tips-audit`/`tips-core` pattern of a single `PrometheusBuilder`
/// http-listener exporter per process.
fn init_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install prometheus exporter")
}

/// Demo handler for the DLQ consumer: logs and always succeeds. A real
/// deployment supplies its own `MessageHandler` implementation.
struct LoggingHandler;

#[async_trait::async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, _ctx: &CancellationToken, msg: &rdkafka::message::BorrowedMessage<'_>) -> anyhow::Result<()> {
        use rdkafka::Message;
        info!(topic = msg.topic(), partition = msg.partition(), offset = msg.offset(), "processed dlq-monitored message");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    let log_level = parse_log_level(&config.log_level);
    if config.tracing_enabled {
        xcron_tracing::init_tracing(
            env!("CARGO_PKG_NAME").to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
            config.otlp_endpoint.clone(),
            log_level,
        )
        .context("failed to initialize tracing")?;
    } else {
        tracing_subscriber::fmt().with_max_level(tracing_level(log_level)).init();
    }

    if let Some(addr) = config.metrics_address {
        init_prometheus_exporter(addr)?;
        info!(address = %addr, "prometheus exporter listening");
    }

    let identity = format!(
        "{}-{}",
        hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_else(|| "xcron-agent".to_string()),
        std::process::id()
    );

    let default_lock: Arc<dyn LockProvider> = build_lock_provider(&config, &identity).await?;

    let scheduler = Arc::new(Scheduler::new(SchedulerConfig {
        default_lock,
        default_lock_ttl: Duration::from_secs(config.lock_ttl_seconds),
        ..Default::default()
    }));

    scheduler
        .add_func(
            "heartbeat",
            &config.heartbeat_schedule,
            |_ctx| async {
                info!("heartbeat");
                Ok(())
            },
        )
        .retry_policy(Arc::new(MaxAttemptsRetryPolicy::new(3)))
        .backoff_policy(Arc::new(ExponentialBackoff::default()))
        .tracer(Arc::new(OtelJobTracer::new()))
        .register()
        .context("failed to register heartbeat job")?;

    scheduler.start();
    info!(jobs = ?scheduler.entries(), "scheduler started");

    let root_ctx = CancellationToken::new();

    let dlq_handle = if config.dlq_enabled {
        let consumer = Arc::new(build_dlq_consumer(&config)?);
        let ctx = root_ctx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = consumer.clone().run(ctx).await {
                warn!(error = %e, "dlq consumer exited with error");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    root_ctx.cancel();
    if let Some(handle) = dlq_handle {
        let _ = handle.await;
    }

    let stopped_in_time = scheduler.stop(Duration::from_secs(30)).await;
    if !stopped_in_time {
        warn!("scheduler did not drain in-flight executions within the shutdown timeout");
    }

    Ok(())
}

fn parse_log_level(level: &str) -> tracing_subscriber::filter::LevelFilter {
    use tracing_subscriber::filter::LevelFilter;
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        other => {
            warn!("invalid log level '{other}', defaulting to info");
            LevelFilter::INFO
        }
    }
}

fn tracing_level(filter: tracing_subscriber::filter::LevelFilter) -> tracing::Level {
    filter.into_level().unwrap_or(tracing::Level::INFO)
}

async fn build_lock_provider(config: &Config, identity: &str) -> anyhow::Result<Arc<dyn LockProvider>> {
    match config.lock_backend {
        LockBackend::Noop => Ok(Arc::new(xcron_lock::NoopLock::new())),
        LockBackend::Redis => {
            let url = config.redis_url.as_deref().context("--redis-url is required when lock-backend=redis")?;
            let pool = deadpool_redis::Config::from_url(url)
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                .context("failed to create redis pool")?;
            Ok(Arc::new(xcron_lock::RedisLock::new(pool, identity.to_string())))
        }
        LockBackend::K8s => {
            let client = kube::Client::try_default().await.context("failed to build kubernetes client")?;
            Ok(Arc::new(xcron_lock::KubernetesLeaseLock::new(client, config.k8s_namespace.clone(), identity.to_string())))
        }
    }
}

fn build_dlq_consumer(config: &Config) -> anyhow::Result<DlqConsumer<LoggingHandler>> {
    let brokers = config.kafka_brokers.as_deref().context("--kafka-brokers is required when dlq-enabled=true")?;
    let source_topics: Vec<String> = config
        .dlq_source_topics
        .as_deref()
        .context("--dlq-source-topics is required when dlq-enabled=true")?
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();

    let mut consumer_config = HashMap::new();
    consumer_config.insert("bootstrap.servers".to_string(), brokers.to_string());
    consumer_config.insert("group.id".to_string(), config.dlq_group_id.clone());
    consumer_config.insert("enable.auto.commit".to_string(), "false".to_string());
    consumer_config.insert("auto.offset.reset".to_string(), "earliest".to_string());

    let dlq_config = DlqConsumerConfig {
        consumer_config,
        producer_config: None,
        source_topics,
        retry_topic: config.dlq_retry_topic.clone(),
        dlq_topic: config.dlq_dead_letter_topic.clone(),
        ..Default::default()
    };

    xcron_dlq::DlqConsumer::new(
        dlq_config,
        Arc::new(LoggingHandler),
        Arc::new(MaxAttemptsRetryPolicy::new(3)),
        Arc::new(ExponentialBackoff::default()),
    )
    .map_err(anyhow::Error::from)
}
