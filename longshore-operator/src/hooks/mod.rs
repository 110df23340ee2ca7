//! Hook job cleanup.
//!
//! Rendered app manifests may carry Jobs annotated with
//! `kots.io/hook-delete-policy`. A small controller per registered
//! namespace watches Jobs and deletes the ones whose policy matches their
//! terminal status, so finished hooks do not pile up between deploys.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use longshore_wire::{
    HOOK_DELETE_ON_FAILED, HOOK_DELETE_ON_SUCCEEDED,
    HOOK_DELETE_POLICY_ANNOTATION,
};

const RESYNC: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum HookError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

struct HookContext {
    client: Client,
}

/// Starts and tracks hook controllers. Registration is idempotent per
/// namespace; controllers run until process shutdown.
pub struct HooksRegistry {
    client: Client,
    registered: Mutex<HashSet<String>>,
}

impl HooksRegistry {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Start a Job controller for `namespace`. `"*"` watches every
    /// namespace and makes later single-namespace registrations no-ops.
    pub fn ensure(&self, namespace: &str) {
        let mut registered =
            self.registered.lock().unwrap_or_else(|p| p.into_inner());
        if registered.contains("*")
            || !registered.insert(namespace.to_string())
        {
            return;
        }
        let api: Api<Job> = if namespace == "*" {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        };
        let ctx = Arc::new(HookContext {
            client: self.client.clone(),
        });
        info!(namespace, "starting hook job controller");
        tokio::spawn(
            Controller::new(api, watcher::Config::default())
                .run(reconcile, error_policy, ctx)
                .for_each(|res| async move {
                    if let Err(e) = res {
                        debug!(error = %e, "hook job reconcile error");
                    }
                }),
        );
    }
}

/// Registration seam for the deploy path.
pub trait HookRegistrar: Send + Sync {
    fn ensure(&self, namespace: &str);
}

impl HookRegistrar for HooksRegistry {
    fn ensure(&self, namespace: &str) {
        HooksRegistry::ensure(self, namespace)
    }
}

async fn reconcile(
    job: Arc<Job>,
    ctx: Arc<HookContext>,
) -> Result<Action, HookError> {
    if should_delete_job(&job) {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
        let dp = DeleteParams::background().grace_period(0);
        match api.delete(&name, &dp).await {
            Ok(_) => {
                info!(namespace = %namespace, job = %name, "deleted finished hook job")
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Action::requeue(RESYNC))
}

fn error_policy(
    _job: Arc<Job>,
    error: &HookError,
    _ctx: Arc<HookContext>,
) -> Action {
    warn!(error = %error, "hook job reconcile failed");
    Action::requeue(RESYNC)
}

/// A hook job goes away once no pods are active and its delete policy
/// matches the terminal counters.
pub fn should_delete_job(job: &Job) -> bool {
    let Some(policy) = job.annotations().get(HOOK_DELETE_POLICY_ANNOTATION)
    else {
        return false;
    };
    let status = job.status.as_ref();
    if status.and_then(|s| s.active).unwrap_or(0) > 0 {
        return false;
    }
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    (policy.contains(HOOK_DELETE_ON_SUCCEEDED) && succeeded > 0)
        || (policy.contains(HOOK_DELETE_ON_FAILED) && failed > 0)
}
