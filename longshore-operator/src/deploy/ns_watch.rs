//! Namespace watch for late hook registration.
//!
//! Deploys can name additional namespaces before they exist. The watch task
//! observes Namespace objects and registers the hook controller as soon as
//! a watched namespace appears; with the `"*"` wildcard every namespace
//! counts. Reconfiguration cancels the running task and starts a fresh one
//! only when the watched set actually changed.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::runtime::watcher;
use kube::runtime::{WatchStreamExt, watcher::watcher as watch_stream};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::hooks::HooksRegistry;

pub struct NamespaceWatchHandle {
    client: Client,
    hooks: Arc<HooksRegistry>,
    inner: tokio::sync::Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    namespaces: BTreeSet<String>,
    cancel: Option<CancellationToken>,
}

impl NamespaceWatchHandle {
    pub fn new(client: Client, hooks: Arc<HooksRegistry>) -> Self {
        Self {
            client,
            hooks,
            inner: tokio::sync::Mutex::new(WatchState::default()),
        }
    }

    /// Replace the watch task when the watched set changed; a no-op
    /// otherwise.
    pub async fn reconfigure(&self, namespaces: BTreeSet<String>) {
        let mut state = self.inner.lock().await;
        if state.namespaces == namespaces {
            return;
        }
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        let cancel = CancellationToken::new();
        info!(namespaces = ?namespaces, "watching namespaces for hook registration");
        tokio::spawn(watch_namespaces(
            self.client.clone(),
            self.hooks.clone(),
            namespaces.clone(),
            cancel.clone(),
        ));
        state.namespaces = namespaces;
        state.cancel = Some(cancel);
    }
}

async fn watch_namespaces(
    client: Client,
    hooks: Arc<HooksRegistry>,
    namespaces: BTreeSet<String>,
    cancel: CancellationToken,
) {
    let api: Api<Namespace> = Api::all(client);
    let wildcard = namespaces.contains("*");
    let stream = watch_stream(api, watcher::Config::default())
        .default_backoff()
        .applied_objects();
    tokio::pin!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.try_next() => match next {
                Ok(Some(ns)) => {
                    let name = ns.name_any();
                    if wildcard || namespaces.contains(&name) {
                        hooks.ensure(&name);
                    }
                }
                Ok(None) => return,
                Err(e) => warn!(error = %e, "namespace watch error"),
            },
        }
    }
}
