//! vsync - projects objects of a virtual cluster into a host namespace

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Secret};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use vsync::retry::{retry_with_backoff, RetryConfig};
use vsync::syncers::persistentvolumes::{claim_watch, FakePersistentVolumeSyncer};
use vsync::syncers::{csidrivers, priorityclasses, secrets, SyncerFuture, SyncerSet};
use vsync_common::kube_utils::create_client;
use vsync_common::telemetry::{init_telemetry, TelemetryConfig};
use vsync_common::{KubeObjectClient, SyncConfig};
use vsync_mappings::{KubeObjectExistence, MemoryBackend, Store};
use vsync_syncer::FakeSyncController;

/// vsync - keeps tenant objects of a virtual cluster in step with a host namespace
#[derive(Parser, Debug)]
#[command(name = "vsync", version, about, long_about = None)]
struct Cli {
    /// Instance name, used as naming suffix and ownership marker
    #[arg(long, env = "VSYNC_NAME", default_value = "vcluster")]
    name: String,

    /// Host namespace namespaced objects are projected into
    #[arg(long, env = "VSYNC_HOST_NAMESPACE", default_value = "vcluster")]
    host_namespace: String,

    /// Kubeconfig of the virtual cluster; the host cluster is inferred
    #[arg(long, env = "VSYNC_VIRTUAL_KUBECONFIG")]
    virtual_kubeconfig: Option<PathBuf>,

    /// Virtual label keys copied verbatim to the host (`prefix/*` matches a prefix)
    #[arg(long = "sync-label", env = "VSYNC_SYNC_LABELS", value_delimiter = ',')]
    sync_labels: Vec<String>,

    /// Parallel reconciliations per kind
    #[arg(long, env = "VSYNC_MAX_CONCURRENT_RECONCILES")]
    max_concurrent_reconciles: Option<usize>,

    /// Seconds between mapping garbage collection runs
    #[arg(long, env = "VSYNC_GC_INTERVAL_SECS")]
    gc_interval_secs: Option<u64>,

    /// OTLP endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(&self.name, &self.host_namespace)
            .with_sync_labels(self.sync_labels.clone());
        if let Some(max) = self.max_concurrent_reconciles {
            config.max_concurrent_reconciles = max.max(1);
        }
        if let Some(secs) = self.gc_interval_secs {
            config.gc_interval = std::time::Duration::from_secs(secs.max(1));
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let telemetry = TelemetryConfig {
        service_name: format!("vsync-{}", args.name),
        otlp_endpoint: args.otlp_endpoint.clone(),
        ..Default::default()
    };
    init_telemetry(telemetry).map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    run(args).await
}

async fn run(args: Cli) -> anyhow::Result<()> {
    let config = Arc::new(args.sync_config());
    tracing::info!(
        name = %config.name,
        host_namespace = %config.host_namespace,
        "Starting vsync"
    );

    let virtual_client = create_client(args.virtual_kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create virtual cluster client: {}", e))?;
    let host_client = create_client(None)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create host cluster client: {}", e))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown requested");
            cancel.cancel();
        }
    });

    let existence = KubeObjectExistence::new(virtual_client.clone(), host_client.clone())
        .register::<Secret>()
        .register::<PriorityClass>()
        .register::<CSIDriver>()
        .register::<PersistentVolume>();
    let store = Arc::new(Store::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(existence),
    ));
    retry_with_backoff(&RetryConfig::default(), "load_mappings", &cancel, || {
        store.start(cancel.clone())
    })
    .await?;
    let gc = store.start_garbage_collection(config.gc_interval, cancel.clone());

    let set = SyncerSet {
        config: config.clone(),
        virtual_client: virtual_client.clone(),
        host_client,
        store,
        cancel: cancel.clone(),
    };

    let mut syncers: Vec<SyncerFuture> = vec![
        set.start(secrets::registration(&config)).await?,
        set.start(priorityclasses::registration(&config)).await?,
        set.start(csidrivers::registration(&config)).await?,
    ];
    syncers.push(fake_persistent_volumes(virtual_client, config, cancel.clone()));

    tracing::info!(syncers = syncers.len(), "Synchronizers running");
    futures::future::join_all(syncers).await;

    cancel.cancel();
    let _ = gc.await;
    tracing::info!("vsync stopped");
    Ok(())
}

fn fake_persistent_volumes(
    virtual_client: Client,
    config: Arc<SyncConfig>,
    cancel: CancellationToken,
) -> SyncerFuture {
    let claims = Arc::new(KubeObjectClient::<PersistentVolumeClaim>::new(
        virtual_client.clone(),
    ));
    let volumes = Arc::new(KubeObjectClient::<PersistentVolume>::new(
        virtual_client.clone(),
    ));
    let controller = Arc::new(FakeSyncController::new(
        Arc::new(FakePersistentVolumeSyncer::new(claims)),
        volumes,
    ));
    let sources = claim_watch(virtual_client.clone());
    Box::pin(async move {
        let name = controller.name().to_string();
        if let Err(e) = controller
            .run(virtual_client, sources, &config, cancel)
            .await
        {
            tracing::error!(syncer = %name, error = %e, "Syncer failed");
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
