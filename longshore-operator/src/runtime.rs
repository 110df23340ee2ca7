use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    applier::{Applier, ExecApplier},
    appstate::Monitor,
    channel::ChannelClient,
    config::OperatorConfig,
    deploy::{
        ClusterFacade, DeployCoordinator, DeployWorker, KubeCluster,
        NamespaceWatchHandle, WORK_QUEUE_DEPTH,
    },
    hooks::HooksRegistry,
    report::{ControlPlaneClient, StatusReporter},
    web,
};

/// Status snapshots in flight between the monitor and the reporter.
const STATUS_QUEUE_DEPTH: usize = 64;

/// Informer updates in flight between the channel pump and the monitor.
const MONITOR_QUEUE_DEPTH: usize = 32;

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &OperatorConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Spawn the liveness HTTP server.
pub fn spawn_http(addr: SocketAddr) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { web::run_http_server(addr).await })
}

/// Start every operator task and run until the control channel stops after
/// a shutdown signal, or the HTTP server fails.
pub async fn run_all(
    client: Client,
    cfg: OperatorConfig,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let applier: Arc<dyn Applier> =
        Arc::new(ExecApplier::new(cfg.exec.clone()).await?);
    let cluster: Arc<dyn ClusterFacade> =
        Arc::new(KubeCluster::new(client.clone()));
    let reports =
        Arc::new(ControlPlaneClient::new(&cfg.api_endpoint, &cfg.token));
    let hooks = Arc::new(HooksRegistry::new(client.clone()));
    // hook jobs in the deploy target namespace are cleaned from the start
    hooks.ensure(&cfg.target_namespace);
    let ns_watch =
        Arc::new(NamespaceWatchHandle::new(client.clone(), hooks.clone()));

    let (orders_tx, orders_rx) = mpsc::channel(WORK_QUEUE_DEPTH);
    let (statuses_tx, statuses_rx) = mpsc::channel(STATUS_QUEUE_DEPTH);
    let (monitor_tx, monitor_rx) = mpsc::channel(MONITOR_QUEUE_DEPTH);

    let coordinator = Arc::new(DeployCoordinator::new(
        applier.clone(),
        cluster,
        hooks,
        Duration::from_secs(cfg.crd_settle_secs),
    ));
    let worker =
        DeployWorker::new(coordinator, applier, reports.clone(), ns_watch);
    let monitor = Monitor::new(
        client,
        cfg.target_namespace.clone(),
        statuses_tx,
        cancel.child_token(),
    );
    let reporter = Arc::new(StatusReporter::new(reports));
    let channel_client = ChannelClient::new(
        cfg.channel_addr.clone(),
        cfg.token.clone(),
        orders_tx,
        monitor_tx,
        cancel.child_token(),
    );

    tokio::spawn(worker.run(orders_rx));
    tokio::spawn(monitor.run(monitor_rx));
    tokio::spawn(reporter.run(statuses_rx));
    let channel = tokio::spawn(channel_client.run());
    let http = spawn_http(compute_http_addr(&cfg));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        }
    });

    tokio::select! {
        res = channel => res?,
        res = http => res??,
    }
    cancel.cancel();
    Ok(())
}
