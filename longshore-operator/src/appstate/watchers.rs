//! Per-(kind, namespace) watch tasks.
//!
//! Each task runs one `kube-rs` watcher, maps events of tracked objects
//! through the health predicates and pushes epoch-tagged `ResourceState`
//! updates. Objects outside the informer set are ignored. A relist that no
//! longer carries a tracked object demotes it to `Missing`, as does an
//! observed delete.

use std::collections::BTreeSet;
use std::fmt::Debug;

use futures_util::TryStreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, PersistentVolumeClaim};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::watcher;
use kube::runtime::{WatchStreamExt, watcher::watcher as watch_stream};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use longshore_wire::{ResourceState, State, StatusInformer, min_state};

use super::health;

/// One observation from a watch task, tagged with the generation that
/// spawned the task.
#[derive(Debug)]
pub struct WatchEvent {
    pub epoch: u64,
    pub state: ResourceState,
}

/// Tracked objects of one kind in one namespace; one watch task each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub kind: String,
    pub namespace: String,
    pub names: BTreeSet<String>,
}

pub fn watch_targets(informers: &[StatusInformer]) -> Vec<WatchTarget> {
    let mut targets: Vec<WatchTarget> = Vec::new();
    for informer in informers {
        match targets.iter_mut().find(|t| {
            t.kind == informer.kind && t.namespace == informer.namespace
        }) {
            Some(target) => {
                target.names.insert(informer.name.clone());
            }
            None => targets.push(WatchTarget {
                kind: informer.kind.clone(),
                namespace: informer.namespace.clone(),
                names: BTreeSet::from([informer.name.clone()]),
            }),
        }
    }
    targets
}

pub fn spawn_watchers(
    client: &Client,
    epoch: u64,
    targets: Vec<WatchTarget>,
    events: &mpsc::Sender<WatchEvent>,
    cancel: &CancellationToken,
) {
    for target in targets {
        let events = events.clone();
        let cancel = cancel.clone();
        match target.kind.as_str() {
            "deployment" => {
                let api: Api<Deployment> =
                    Api::namespaced(client.clone(), &target.namespace);
                tokio::spawn(watch_states(
                    api,
                    target,
                    epoch,
                    events,
                    cancel,
                    health::deployment_state,
                ));
            }
            "statefulset" => {
                let api: Api<StatefulSet> =
                    Api::namespaced(client.clone(), &target.namespace);
                tokio::spawn(watch_states(
                    api,
                    target,
                    epoch,
                    events,
                    cancel,
                    health::stateful_set_state,
                ));
            }
            // service health is observed through its Endpoints object,
            // which shares the service name
            "service" => {
                let api: Api<Endpoints> =
                    Api::namespaced(client.clone(), &target.namespace);
                tokio::spawn(watch_states(
                    api,
                    target,
                    epoch,
                    events,
                    cancel,
                    health::endpoints_state,
                ));
            }
            "persistentvolumeclaim" => {
                let api: Api<PersistentVolumeClaim> =
                    Api::namespaced(client.clone(), &target.namespace);
                tokio::spawn(watch_states(
                    api,
                    target,
                    epoch,
                    events,
                    cancel,
                    health::pvc_state,
                ));
            }
            "ingress" => {
                let api: Api<Ingress> =
                    Api::namespaced(client.clone(), &target.namespace);
                tokio::spawn(watch_ingresses(
                    client.clone(),
                    api,
                    target,
                    epoch,
                    events,
                    cancel,
                ));
            }
            other => {
                warn!(kind = other, "informer kind has no watcher");
            }
        }
    }
}

async fn watch_states<K>(
    api: Api<K>,
    target: WatchTarget,
    epoch: u64,
    events: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
    health: fn(&K) -> State,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream =
        watch_stream(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);
    let mut relisted: BTreeSet<String> = BTreeSet::new();
    let mut relisting = false;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.try_next() => match next {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(e) => {
                    warn!(kind = %target.kind, namespace = %target.namespace, error = %e, "watch error");
                    continue;
                }
            },
        };
        match event {
            watcher::Event::Init => {
                relisting = true;
                relisted.clear();
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let name = obj.name_any();
                if !target.names.contains(&name) {
                    continue;
                }
                if relisting {
                    relisted.insert(name.clone());
                }
                send(&events, epoch, &target, name, health(&obj)).await;
            }
            watcher::Event::InitDone => {
                relisting = false;
                let gone: Vec<String> =
                    target.names.difference(&relisted).cloned().collect();
                for name in gone {
                    send(&events, epoch, &target, name, State::Missing)
                        .await;
                }
            }
            watcher::Event::Delete(obj) => {
                let name = obj.name_any();
                if !target.names.contains(&name) {
                    continue;
                }
                send(&events, epoch, &target, name, State::Missing).await;
            }
        }
    }
}

async fn watch_ingresses(
    client: Client,
    api: Api<Ingress>,
    target: WatchTarget,
    epoch: u64,
    events: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    let stream =
        watch_stream(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);
    let mut relisted: BTreeSet<String> = BTreeSet::new();
    let mut relisting = false;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.try_next() => match next {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(e) => {
                    warn!(namespace = %target.namespace, error = %e, "ingress watch error");
                    continue;
                }
            },
        };
        match event {
            watcher::Event::Init => {
                relisting = true;
                relisted.clear();
            }
            watcher::Event::InitApply(ing) | watcher::Event::Apply(ing) => {
                let name = ing.name_any();
                if !target.names.contains(&name) {
                    continue;
                }
                if relisting {
                    relisted.insert(name.clone());
                }
                let state =
                    ingress_state(&client, &target.namespace, &ing).await;
                send(&events, epoch, &target, name, state).await;
            }
            watcher::Event::InitDone => {
                relisting = false;
                let gone: Vec<String> =
                    target.names.difference(&relisted).cloned().collect();
                for name in gone {
                    send(&events, epoch, &target, name, State::Missing)
                        .await;
                }
            }
            watcher::Event::Delete(ing) => {
                let name = ing.name_any();
                if !target.names.contains(&name) {
                    continue;
                }
                send(&events, epoch, &target, name, State::Missing).await;
            }
        }
    }
}

/// Worst of the backend service states and the external address. An ingress
/// without its own default backend consults the cluster-shared one.
async fn ingress_state(
    client: &Client,
    namespace: &str,
    ingress: &Ingress,
) -> State {
    let mut states = Vec::new();
    match health::default_backend_service(ingress) {
        Some(name) => states
            .push(endpoints_state_by_name(client, namespace, &name).await),
        None => states.push(
            endpoints_state_by_name(
                client,
                "kube-system",
                "default-http-backend",
            )
            .await,
        ),
    }
    for name in health::rule_backend_services(ingress) {
        states
            .push(endpoints_state_by_name(client, namespace, &name).await);
    }
    states.push(health::external_address_state(ingress));
    min_state(states)
}

async fn endpoints_state_by_name(
    client: &Client,
    namespace: &str,
    name: &str,
) -> State {
    let api: Api<Endpoints> = Api::namespaced(client.clone(), namespace);
    match api.get_opt(name).await {
        Ok(Some(endpoints)) => health::endpoints_state(&endpoints),
        Ok(None) => State::Missing,
        Err(e) => {
            warn!(namespace, service = name, error = %e, "failed to read backend endpoints");
            State::Missing
        }
    }
}

async fn send(
    events: &mpsc::Sender<WatchEvent>,
    epoch: u64,
    target: &WatchTarget,
    name: String,
    state: State,
) {
    let event = WatchEvent {
        epoch,
        state: ResourceState {
            kind: target.kind.clone(),
            name,
            namespace: target.namespace.clone(),
            state,
        },
    };
    if events.send(event).await.is_err() {
        debug!("status event channel closed");
    }
}
