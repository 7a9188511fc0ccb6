use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use abstractdatabase::{MemoryStore, StoreConfig, ValidationStore};
use abstractgateway::{Gateway, GatewayTransport};
use anyhow::{Context, Result};
use clap::Parser;
use mqtt::{MqttDownstreamConfig, MqttGateway, MqttGatewayConfig, UpstreamConfig};
use postgresdb::PostgresValidationStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use validationengine::{
    AmqpBroker, AtomicMetrics, Broker, BrokerPublisher, ConsumerPipeline, Dispatcher, DurabilityCache,
    InMemoryBroker, PipelineConfig, PipelineMetrics, Topology,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "validation-pipeline", about = "Fare-validation ingestion pipeline")]
struct Args {
    /// Directory of the durability cache.
    #[arg(long, env = "CACHE_DIR", default_value = "./validation-cache")]
    cache_dir: PathBuf,

    #[arg(long, env = "ZONES", default_value_t = 10)]
    zones: u32,

    #[arg(long, env = "PUBLISH_WORKERS", default_value_t = 1)]
    publish_workers: usize,

    #[arg(long, env = "BATCH_SIZE", default_value_t = 1000)]
    batch_size: usize,

    /// Seconds before a partial batch is flushed.
    #[arg(long, env = "FLUSH_INTERVAL_SECS", default_value_t = 5)]
    flush_interval_secs: u64,

    /// Without a broker URL, events flow through an in-process broker and are
    /// lost on exit unless the cache holds them.
    #[arg(long, env = "AMQP_URL")]
    amqp_url: Option<String>,

    /// Without a Postgres host, batches go to an in-process store.
    #[arg(long, env = "PG_HOST")]
    pg_host: Option<String>,

    #[arg(long, env = "PG_PORT", default_value_t = 5432)]
    pg_port: u16,

    #[arg(long, env = "PG_DATABASE", default_value = "validations")]
    pg_database: String,

    #[arg(long, env = "PG_USER", default_value = "postgres")]
    pg_user: String,

    #[arg(long, env = "PG_PASSWORD")]
    pg_password: Option<String>,

    #[arg(long, env = "PG_TABLE", default_value = "validations")]
    pg_table: String,

    /// Without an MQTT host, the pipeline only replays the cache.
    #[arg(long, env = "MQTT_HOST")]
    mqtt_host: Option<String>,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "validation-ingress")]
    mqtt_client_id: String,

    #[arg(long, env = "MQTT_FILTER", default_value = "validations/#")]
    mqtt_filter: String,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let defaults = PipelineConfig::default();
        let mut dispatcher = defaults.dispatcher.clone();
        dispatcher.publish_workers = self.publish_workers;
        let mut consumer = defaults.consumer.clone();
        consumer.batch_size = self.batch_size;
        consumer.flush_interval = Duration::from_secs(self.flush_interval_secs);

        let cfg = PipelineConfig::builder()
            .dispatcher(dispatcher)
            .consumer(consumer)
            .cache_dir(&self.cache_dir)
            .zones(self.zones)
            .build()?;
        Ok(cfg)
    }

    fn mqtt_config(&self, host: &str) -> MqttGatewayConfig {
        MqttGatewayConfig {
            downstream: MqttDownstreamConfig {
                host: host.to_string(),
                port: self.mqtt_port,
                client_id: self.mqtt_client_id.clone(),
                subscribe_filter: self.mqtt_filter.clone(),
                ..MqttDownstreamConfig::default()
            },
            upstream: UpstreamConfig::default(),
            ..MqttGatewayConfig::default()
        }
    }
}

async fn open_broker(args: &Args) -> Result<Arc<dyn Broker>> {
    let Some(url) = args.amqp_url.as_deref() else {
        warn!("no AMQP URL configured, using the in-process broker");
        return Ok(Arc::new(InMemoryBroker::new("validations")));
    };
    let broker = AmqpBroker::connect("validation-pipeline", url)
        .await
        .context("connecting to the AMQP broker")?;
    Ok(Arc::new(broker))
}

async fn open_store(args: &Args) -> Result<Arc<dyn ValidationStore>> {
    let Some(host) = args.pg_host.as_deref() else {
        warn!("no Postgres host configured, persisting to memory");
        return Ok(MemoryStore::new("memory"));
    };
    let cfg = StoreConfig::builder()
        .application_name("validation-pipeline")
        .endpoint(host, args.pg_port)
        .database(args.pg_database.as_str())
        .credentials(args.pg_user.as_str(), args.pg_password.clone())
        .table(args.pg_table.as_str())
        .build()?;
    let store = PostgresValidationStore::connect(&cfg)
        .await
        .with_context(|| format!("connecting to postgres at {host}:{}", args.pg_port))?;
    store.ensure_schema().await.context("creating validation table")?;
    Ok(Arc::new(store))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let cfg = args.pipeline_config().context("invalid pipeline configuration")?;
    let metrics = Arc::new(AtomicMetrics::default());
    let dyn_metrics: Arc<dyn PipelineMetrics> = metrics.clone();

    let store = open_store(&args).await?;

    let broker = open_broker(&args).await?;
    let topology = Arc::new(Topology::new(cfg.topology.clone()));
    {
        let channel = broker.open_channel().await.context("opening admin channel")?;
        topology.declare(channel.as_ref()).await.context("declaring topology")?;
        channel.close().await?;
    }
    info!(
        exchange = topology.exchange_name(),
        zones = topology.router().zone_count(),
        "broker topology ready"
    );

    let cache = DurabilityCache::open(&cfg.cache, dyn_metrics.clone())
        .await
        .context("opening durability cache")?;

    let dispatch_shutdown = CancellationToken::new();
    let (dispatcher, queue) = Dispatcher::new(cfg.dispatcher.clone(), dispatch_shutdown.clone(), dyn_metrics.clone());
    let mut publishers = Vec::with_capacity(cfg.dispatcher.publish_workers);
    for _ in 0..cfg.dispatcher.publish_workers.max(1) {
        let publisher = BrokerPublisher::open(broker.as_ref(), topology.clone(), cache.clone(), dyn_metrics.clone())
            .await
            .context("opening publisher channel")?;
        publishers.push(publisher);
    }
    let workers = dispatcher.spawn_workers(queue, publishers);

    let recovery = cache.recover().await.context("recovering cached events")?;
    if !recovery.is_empty() {
        let total = recovery.events.len();
        match dispatcher.replay(recovery.events).await {
            Ok(n) => {
                info!(files = recovery.files.len(), events = n, "replayed cached events");
                if cfg.cache.archive_after_replay {
                    cache.archive(&recovery.files).await.context("archiving replayed cache files")?;
                }
            }
            Err((n, e)) => warn!(replayed = n, total, "cache replay interrupted, files kept: {e}"),
        }
    }

    let fatal = CancellationToken::new();
    let pipeline = ConsumerPipeline::start(
        broker.as_ref(),
        &topology,
        store,
        cache.clone(),
        dyn_metrics.clone(),
        &cfg.consumer,
        fatal.clone(),
    )
    .await
    .context("starting consumer pipeline")?;
    info!(consumers = pipeline.consumer_count(), "consumer pipeline started");

    let gateway = Gateway::new("mqtt", dispatcher.clone());
    let ingress = match args.mqtt_host.as_deref() {
        Some(host) => {
            let mut mqtt = MqttGateway::new(args.mqtt_config(host));
            mqtt.connect().await?;
            let gw = gateway.clone();
            Some(tokio::spawn(async move { mqtt.run(&gw).await }))
        }
        None => {
            warn!("no MQTT host configured, ingress disabled");
            None
        }
    };

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r.context("listening for ctrl-c")?;
            info!("shutdown requested");
        }
        _ = fatal.cancelled() => error!("consumer pipeline failed, shutting down"),
    }

    gateway.shutdown();
    if let Some(handle) = ingress {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("mqtt gateway ended with error: {e:#}"),
            Err(e) => warn!("mqtt gateway task failed: {e}"),
        }
    }

    dispatch_shutdown.cancel();
    let report = workers.join().await.context("joining publish workers")?;
    info!(published = report.published, failed = report.failed, "publish workers stopped");

    let drained = pipeline.shutdown().await;
    let flushed = cache.flush().await.context("flushing durability cache")?;
    info!(flushed, "durability cache flushed");
    if let Err(e) = broker.close().await {
        warn!(broker = broker.name(), "closing broker connection: {e}");
    }

    info!(
        metrics = %serde_json::to_string(&metrics.snapshot())?,
        "pipeline stopped"
    );

    let drained = drained.context("draining consumer pipeline")?;
    info!(persisted = drained.persisted, cached = drained.cached, "consumer pipeline drained");
    Ok(())
}
