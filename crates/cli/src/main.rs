use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use flotilla_cluster::kube_impl::{DiscoveryRestMapper, KubeClusterGateway};
use flotilla_cluster::{ClusterGateway, RestMapper};
use flotilla_core::interpret::FakeInterpreter;
use flotilla_core::BackoffPolicy;
use flotilla_dispatch::{Dispatcher, VersionRegistry};
use flotilla_store::{MemoryWorkStore, WorkStore};
use flotilla_sync::{
    run_workers, LiveObjectCache, ObjectCache, RequeuePolicy, TracingEventSink, WorkQueue,
    WorkReconciler,
};

#[derive(Parser, Debug)]
#[command(name = "flotillad", version, about = "Flotilla multi-cluster sync daemon")]
struct Cli {
    /// Member clusters, as "name" (default kubeconfig context) or
    /// "name=context".
    #[arg(long = "cluster", required = true)]
    clusters: Vec<String>,

    /// Reconcile worker count
    #[arg(long = "workers", default_value_t = 4)]
    workers: usize,

    /// Resync sweep interval in seconds
    #[arg(long = "resync-secs", default_value_t = 30)]
    resync_secs: u64,

    /// Conflict retry backoff base duration
    #[arg(long = "retry-backoff-duration-ms", default_value_t = 10)]
    retry_backoff_duration_ms: u64,

    /// Conflict retry backoff factor
    #[arg(long = "retry-backoff-factor", default_value_t = 1.0)]
    retry_backoff_factor: f64,

    /// Conflict retry backoff jitter fraction
    #[arg(long = "retry-backoff-jitter", default_value_t = 0.1)]
    retry_backoff_jitter: f64,

    /// Conflict retry attempts
    #[arg(long = "retry-backoff-steps", default_value_t = 5)]
    retry_backoff_steps: u32,

    /// Conflict retry backoff cap (0 = uncapped)
    #[arg(long = "retry-backoff-cap-ms", default_value_t = 0)]
    retry_backoff_cap_ms: u64,

    /// Requeue backoff base for failed reconciles
    #[arg(long = "requeue-base-ms", default_value_t = 500)]
    requeue_base_ms: u64,

    /// Requeue backoff cap
    #[arg(long = "requeue-max-secs", default_value_t = 60)]
    requeue_max_secs: u64,
}

impl Cli {
    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            duration: Duration::from_millis(self.retry_backoff_duration_ms),
            factor: self.retry_backoff_factor,
            jitter: self.retry_backoff_jitter,
            steps: self.retry_backoff_steps,
            cap: (self.retry_backoff_cap_ms > 0)
                .then(|| Duration::from_millis(self.retry_backoff_cap_ms)),
        }
    }

    fn requeue(&self) -> RequeuePolicy {
        RequeuePolicy {
            base: Duration::from_millis(self.requeue_base_ms),
            max: Duration::from_secs(self.requeue_max_secs),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("FLOTILLA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLOTILLA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FLOTILLA_METRICS_ADDR; expected host:port");
        }
    }
}

async fn kube_client(context: Option<&str>) -> Result<kube::Client> {
    match context {
        None => kube::Client::try_default()
            .await
            .context("building default kube client"),
        Some(ctx) => {
            let options = kube::config::KubeConfigOptions {
                context: Some(ctx.to_string()),
                ..Default::default()
            };
            let config = kube::Config::from_kubeconfig(&options)
                .await
                .with_context(|| format!("loading kubeconfig context {}", ctx))?;
            kube::Client::try_from(config).context("building kube client")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let backoff = cli.backoff();

    let mut gateway = KubeClusterGateway::new();
    let mut first_client = None;
    for spec in &cli.clusters {
        let (name, context) = match spec.split_once('=') {
            Some((name, context)) => (name, Some(context)),
            None => (spec.as_str(), None),
        };
        let client = kube_client(context).await?;
        if first_client.is_none() {
            first_client = Some(client.clone());
        }
        gateway.insert(name, client);
    }
    let gateway: Arc<dyn ClusterGateway> = Arc::new(gateway);

    // Endpoint mapping comes from API discovery against the first member;
    // homogeneous fleets are assumed here, heterogeneous ones plug in a
    // per-cluster mapper.
    let mapper: Arc<dyn RestMapper> = Arc::new(
        DiscoveryRestMapper::discover(first_client.expect("at least one cluster")).await?,
    );

    let store = Arc::new(MemoryWorkStore::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(VersionRegistry::new()),
        Arc::clone(&gateway),
        Arc::clone(&mapper),
        Arc::new(FakeInterpreter::new()),
        backoff.clone(),
    ));
    let cache: Arc<dyn ObjectCache> = Arc::new(LiveObjectCache::new(
        Arc::clone(&gateway),
        Arc::clone(&mapper),
    ));
    let reconciler = Arc::new(WorkReconciler::new(
        Arc::clone(&store) as Arc<dyn WorkStore>,
        dispatcher,
        Arc::clone(&gateway),
        cache,
        Arc::new(TracingEventSink),
        backoff,
    ));

    let queue = WorkQueue::new(cli.requeue());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = run_workers(
        Arc::clone(&queue),
        reconciler,
        cli.workers,
        shutdown_rx,
    );
    info!(workers = cli.workers, clusters = cli.clusters.len(), "flotillad started");

    // Periodic resync sweep: every stored Work goes back through the queue.
    let resync_queue = Arc::clone(&queue);
    let resync_store = Arc::clone(&store);
    let mut resync_shutdown = shutdown_tx.subscribe();
    let resync = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(cli.resync_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for work_ref in resync_store.all_refs() {
                        resync_queue.enqueue(work_ref);
                    }
                }
                changed = resync_shutdown.changed() => {
                    if changed.is_err() || *resync_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    resync.await.ok();
    for handle in workers {
        handle.await.ok();
    }
    Ok(())
}
