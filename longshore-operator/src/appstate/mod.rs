//! Application health monitoring.
//!
//! The [`Monitor`] owns one [`AppMonitor`](app_monitor::AppMonitor) task
//! per application and routes informer sets to it. Each monitor watches the
//! resources named by its informers and emits a full [`AppStatus`] snapshot
//! whenever any resource changes state; the reporter throttles and ships
//! those snapshots upstream.

use std::collections::HashMap;

use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use longshore_wire::AppStatus;

mod app_monitor;
mod health;
mod watchers;

use app_monitor::AppMonitor;

/// Pending informer sets per application. Replacement sets supersede queued
/// ones quickly, so a short queue is enough.
const SET_QUEUE_DEPTH: usize = 4;

#[derive(Debug)]
pub enum MonitorCommand {
    /// Replace the informer set for one application.
    Apply {
        app_id: String,
        informers: Vec<String>,
    },
}

pub struct Monitor {
    client: Client,
    default_namespace: String,
    output: mpsc::Sender<AppStatus>,
    cancel: CancellationToken,
    apps: HashMap<String, mpsc::Sender<Vec<String>>>,
}

impl Monitor {
    pub fn new(
        client: Client,
        default_namespace: String,
        output: mpsc::Sender<AppStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            default_namespace,
            output,
            cancel,
            apps: HashMap::new(),
        }
    }

    /// Dispatch commands until cancelled or the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<MonitorCommand>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { return };
                    match cmd {
                        MonitorCommand::Apply { app_id, informers } => {
                            self.apply(app_id, informers).await;
                        }
                    }
                }
            }
        }
    }

    async fn apply(&mut self, app_id: String, informers: Vec<String>) {
        if let Some(sets) = self.apps.get(&app_id) {
            if sets.send(informers.clone()).await.is_ok() {
                return;
            }
            // the monitor task is gone; replace it
            self.apps.remove(&app_id);
        }
        let (sets_tx, sets_rx) = mpsc::channel(SET_QUEUE_DEPTH);
        let monitor = AppMonitor::new(
            app_id.clone(),
            self.client.clone(),
            self.default_namespace.clone(),
            self.output.clone(),
            self.cancel.child_token(),
        );
        tokio::spawn(monitor.run(sets_rx));
        if sets_tx.send(informers).await.is_err() {
            warn!(app_id = %app_id, "app monitor exited before its first informer set");
        }
        self.apps.insert(app_id, sets_tx);
    }
}
