//! Engine controller binary

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use engine_common::telemetry::{init_telemetry, TelemetryConfig};
use engine_common::etcd::parse_locator;
use engine_common::{
    Clock, CouchArchive, EtcdStatusStore, MemoryArchive, ResultArchive, RunRepository,
    StatusStore, StoreRunRepository, SystemClock,
};
use engine_controller::{
    Controller, Heartbeat, InterruptCollector, InterruptHandler, InterruptProcessor, PodCleanup,
    Scheduler, SettingsManager, WorkerEnvironment,
};
use engine_kube::{ClusterFacade, ConfigMapStatusStore, KubeFacade};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Schedules queued test runs onto Kubernetes worker pods
#[derive(Parser, Debug)]
#[command(name = "engine-controller", version, about, long_about = None)]
struct Cli {
    /// Namespace holding the controller, its settings and the worker pods
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of this controller replica, recorded on every run it claims
    #[arg(long, env = "PODNAME", default_value = "k8s-controller")]
    pod_name: String,

    /// ConfigMap holding the controller settings
    #[arg(long, env = "CONFIG", default_value = "config")]
    config_map: String,

    /// Install name prefixing the etcd and ras app labels
    #[arg(long, env = "GALASA_INSTALL_NAME", default_value = "")]
    install_name: String,

    /// Dynamic status store locator, e.g. `etcd:http://etcd:2379`
    #[arg(long, env = "GALASA_DYNAMICSTATUS_STORE")]
    status_store: Option<String>,

    /// ConfigMap holding the run store when no etcd locator is configured
    #[arg(long, env = "RUN_STORE_CONFIG_MAP", default_value = "engine-runs")]
    store_config_map: String,

    /// Base URL of the result archive; archive updates stay in memory if unset
    #[arg(long, env = "GALASA_RAS_URL")]
    archive_url: Option<String>,

    /// Bearer token for the result archive
    #[arg(long, env = "GALASA_RAS_TOKEN", hide_env_values = true)]
    archive_token: Option<String>,

    /// Log human-readable text instead of JSON
    #[arg(long, env = "LOG_TEXT")]
    text_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json_logs: !cli.text_logs,
        attributes: vec![("k8s.pod.name".to_string(), cli.pod_name.clone())],
        ..Default::default()
    })
    .context("failed to initialize telemetry")?;

    info!(
        namespace = %cli.namespace,
        controller = %cli.pod_name,
        config_map = %cli.config_map,
        "Starting engine controller"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let facade: Arc<dyn ClusterFacade> = Arc::new(KubeFacade::new(
        client.clone(),
        &cli.namespace,
        &cli.install_name,
    ));
    let store: Arc<dyn StatusStore> = match cli.status_store.as_deref().and_then(parse_locator) {
        Some(endpoints) => Arc::new(
            EtcdStatusStore::connect(&endpoints)
                .await
                .context("failed to connect to the etcd status store")?,
        ),
        None => {
            warn!(
                config_map = %cli.store_config_map,
                "No etcd status store configured, keeping runs in a ConfigMap"
            );
            Arc::new(ConfigMapStatusStore::new(
                client,
                &cli.namespace,
                &cli.store_config_map,
            ))
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let runs: Arc<dyn RunRepository> =
        Arc::new(StoreRunRepository::new(store.clone(), clock.clone()));
    let archive: Arc<dyn ResultArchive> = match cli.archive_url {
        Some(url) => Arc::new(CouchArchive::new(url, cli.archive_token)),
        None => {
            warn!("No archive URL configured, archive updates will not be persisted");
            Arc::new(MemoryArchive::new())
        }
    };

    let settings = Arc::new(SettingsManager::new(facade.clone(), &cli.config_map));
    settings
        .reload()
        .await
        .context("failed to load controller settings")?;

    let controller = Controller::new(
        settings.clone(),
        Heartbeat::new(store, clock.clone(), settings.subscribe(), &cli.pod_name),
        Scheduler::new(
            facade.clone(),
            runs.clone(),
            clock.clone(),
            settings.subscribe(),
            &cli.pod_name,
            WorkerEnvironment::from_process(),
        ),
        InterruptHandler::new(
            InterruptCollector::new(facade.clone(), runs.clone(), clock, settings.subscribe()),
            InterruptProcessor::new(facade.clone(), runs, archive),
        ),
        PodCleanup::new(facade, settings.subscribe()),
    );

    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        shutdown.cancel();
    });

    controller.run(cancel).await;
    info!("Engine controller stopped");
    Ok(())
}
