//! One task per application, owning its informer set and aggregate status.
//!
//! Every informer set the control plane sends starts a fresh watch
//! generation: the previous generation's tasks are cancelled, the status is
//! reseeded with every tracked resource at `Missing`, and events from older
//! generations are dropped by epoch. The seeded status is pushed straight
//! away so the control plane sees the new resource set before the first
//! watch event lands.

use chrono::Utc;
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use longshore_wire::{AppStatus, ResourceState, State, StatusInformer};

use super::watchers::{self, WatchEvent};

/// Watch event channel depth per application.
const EVENT_QUEUE_DEPTH: usize = 64;

pub struct AppMonitor {
    app_id: String,
    client: Client,
    default_namespace: String,
    output: mpsc::Sender<AppStatus>,
    cancel: CancellationToken,
}

impl AppMonitor {
    pub fn new(
        app_id: String,
        client: Client,
        default_namespace: String,
        output: mpsc::Sender<AppStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            app_id,
            client,
            default_namespace,
            output,
            cancel,
        }
    }

    /// Drive the monitor until cancelled or the informer channel closes.
    pub async fn run(self, mut sets: mpsc::Receiver<Vec<String>>) {
        let (events_tx, mut events) =
            mpsc::channel::<WatchEvent>(EVENT_QUEUE_DEPTH);
        let mut epoch: u64 = 0;
        let mut generation: Option<CancellationToken> = None;
        let mut status = AppStatus::new(&self.app_id);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                set = sets.recv() => {
                    let Some(set) = set else { return };
                    if let Some(previous) = generation.take() {
                        previous.cancel();
                    }
                    epoch += 1;
                    let informers =
                        parse_informers(&set, &self.default_namespace);
                    info!(
                        app_id = %self.app_id,
                        epoch,
                        informers = informers.len(),
                        "restarting status watchers"
                    );
                    status = seed_status(&self.app_id, &informers);
                    if self.output.send(status.clone()).await.is_err() {
                        return;
                    }
                    let token = self.cancel.child_token();
                    watchers::spawn_watchers(
                        &self.client,
                        epoch,
                        watchers::watch_targets(&informers),
                        &events_tx,
                        &token,
                    );
                    generation = Some(token);
                }
                event = events.recv() => {
                    // the sender half lives on self, so recv cannot fail
                    let Some(event) = event else { return };
                    if event.epoch != epoch {
                        debug!(
                            app_id = %self.app_id,
                            event_epoch = event.epoch,
                            epoch,
                            "dropping event from a cancelled watch generation"
                        );
                        continue;
                    }
                    if apply_new(&mut status, event.state) {
                        status.updated_at = Utc::now();
                        if self.output.send(status.clone()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Parse and normalize raw informer strings, dropping malformed entries.
pub(super) fn parse_informers(
    raw: &[String],
    default_namespace: &str,
) -> Vec<StatusInformer> {
    raw.iter()
        .filter_map(|s| match s.parse::<StatusInformer>() {
            Ok(informer) => Some(informer.normalize(default_namespace)),
            Err(e) => {
                warn!(error = %e, "ignoring malformed informer");
                None
            }
        })
        .collect()
}

/// Fresh status with every informed resource at `Missing`, sorted and
/// deduplicated by identity.
pub(super) fn seed_status(
    app_id: &str,
    informers: &[StatusInformer],
) -> AppStatus {
    let mut resource_states: Vec<ResourceState> = informers
        .iter()
        .map(|informer| ResourceState {
            kind: informer.kind.clone(),
            name: informer.name.clone(),
            namespace: informer.namespace.clone(),
            state: State::Missing,
        })
        .collect();
    resource_states.sort_by(ResourceState::identity_order);
    resource_states.dedup_by(|a, b| a.identity() == b.identity());
    let mut status = AppStatus::new(app_id);
    status.resource_states = resource_states;
    status
}

/// Fold one observation into the status. Returns whether anything changed;
/// observations for untracked resources are ignored.
pub(super) fn apply_new(
    status: &mut AppStatus,
    incoming: ResourceState,
) -> bool {
    let Some(existing) = status
        .resource_states
        .iter_mut()
        .find(|rs| rs.identity() == incoming.identity())
    else {
        return false;
    };
    if existing.state == incoming.state {
        return false;
    }
    existing.state = incoming.state;
    true
}
