//! Per-app throttled status pushes.
//!
//! Watchers emit status snapshots in bursts while an app converges. Each
//! app gets one push loop behind a `watch` channel: push the latest
//! snapshot, sleep the throttle window, wait for the next change. A burst
//! inside the window collapses to a single push carrying the freshest
//! snapshot. The push itself is never skipped; the content hash only tells
//! apart genuine changes from re-sends in the logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use longshore_wire::AppStatus;

use super::client::ControlPlaneClient;

const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

pub struct StatusReporter {
    client: Arc<ControlPlaneClient>,
    pushers: Mutex<HashMap<String, watch::Sender<AppStatus>>>,
}

impl StatusReporter {
    pub fn new(client: Arc<ControlPlaneClient>) -> Self {
        Self {
            client,
            pushers: Mutex::new(HashMap::new()),
        }
    }

    /// Drains the monitor's output channel for the process lifetime.
    pub async fn run(
        self: Arc<Self>,
        mut statuses: mpsc::Receiver<AppStatus>,
    ) {
        while let Some(status) = statuses.recv().await {
            self.dispatch(status);
        }
    }

    fn dispatch(&self, status: AppStatus) {
        let app_id = status.app_id.clone();
        let mut pushers =
            self.pushers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = pushers.get(&app_id) {
            let _ = tx.send(status);
            return;
        }
        let (tx, rx) = watch::channel(status);
        tokio::spawn(push_loop(self.client.clone(), rx));
        pushers.insert(app_id, tx);
    }
}

async fn push_loop(
    client: Arc<ControlPlaneClient>,
    mut statuses: watch::Receiver<AppStatus>,
) {
    let mut last_hash = None;
    loop {
        let status = statuses.borrow_and_update().clone();
        let hash = content_hash(&status);
        if last_hash == Some(hash) {
            debug!(app_id = %status.app_id, "resource states unchanged since last push");
        }
        last_hash = Some(hash);
        if let Err(e) = client.put_app_status(&status).await {
            warn!(app_id = %status.app_id, error = %e, "failed to push app status");
        }
        tokio::time::sleep(THROTTLE_WINDOW).await;
        if statuses.changed().await.is_err() {
            return;
        }
    }
}

/// Hash over the resource states only. `updated_at` moves on every snapshot
/// and must not hide genuine duplicates.
fn content_hash(status: &AppStatus) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for rs in &status.resource_states {
        hasher.update(rs.kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(rs.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(rs.namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(rs.state.to_string().as_bytes());
        hasher.update([0xff]);
    }
    hasher.finalize().into()
}
