//! Deploy orchestration.
//!
//! `DeployCoordinator::execute` runs one deploy command end to end: stale
//! object removal, namespace draining, namespace, hook and pull secret
//! setup, staged apply (CRDs first), then the helm releases.
//! Application-level failures (dry run, apply, helm) fold into the
//! `DeployResult`; hard failures (undecodable bundles, drain timeout)
//! abort with an error and produce no report, leaving the retry to the
//! control plane.
//!
//! `DeployWorker` drains the order queue fed by the channel pump, reports
//! outcomes over HTTP and keeps the namespace watch in sync after
//! successful deploys.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use longshore_wire::{
    ApplicationManifests, CommandResult, DeployResult, PreflightRequest,
    SupportBundleRequest,
};

use crate::applier::Applier;
use crate::hooks::HookRegistrar;
use crate::report::ControlPlaneClient;

use super::DeployError;
use super::charts::{self, ChartSet};
use super::cluster::ClusterFacade;
use super::diff::{self, DiffOptions};
use super::docs::{self, ManifestDoc};
use super::drain;
use super::locks::AppLockRegistry;
use super::ns_watch::NamespaceWatchHandle;

/// Orders queued ahead of the worker; sends backpressure the channel pump
/// once this many commands are waiting.
pub const WORK_QUEUE_DEPTH: usize = 32;

const POST_DRAIN_GRACE: Duration = Duration::from_secs(20);

/// Work handed from the channel pump to the deploy worker.
#[derive(Debug)]
pub enum WorkOrder {
    Deploy(Box<ApplicationManifests>),
    Preflight(PreflightRequest),
    SupportBundle(SupportBundleRequest),
}

pub struct DeployCoordinator {
    applier: Arc<dyn Applier>,
    cluster: Arc<dyn ClusterFacade>,
    hooks: Arc<dyn HookRegistrar>,
    locks: AppLockRegistry,
    crd_settle: Duration,
}

impl DeployCoordinator {
    pub fn new(
        applier: Arc<dyn Applier>,
        cluster: Arc<dyn ClusterFacade>,
        hooks: Arc<dyn HookRegistrar>,
        crd_settle: Duration,
    ) -> Self {
        Self {
            applier,
            cluster,
            hooks,
            locks: AppLockRegistry::new(),
            crd_settle,
        }
    }

    /// Runs one deploy command. `Ok` carries the outcome to report,
    /// including handled failures with `is_error` set; `Err` means the
    /// deploy aborted before producing a reportable outcome.
    #[instrument(skip_all, fields(app_id = %cmd.app_id, app_slug = %cmd.app_slug))]
    pub async fn execute(
        &self,
        cmd: &ApplicationManifests,
    ) -> Result<DeployResult, DeployError> {
        let lock = self.locks.lock_for(&cmd.app_id);
        let _serialized = lock.lock().await;

        let current = docs::decode_bundle(&cmd.manifests, &cmd.namespace)?;
        let previous =
            docs::decode_bundle(&cmd.previous_manifests, &cmd.namespace)?;

        if !cmd.previous_manifests.is_empty() {
            self.remove_stale(&previous, &current, cmd).await?;
        }
        if !cmd.clear_namespaces.is_empty() {
            self.drain_namespaces(cmd).await?;
        }
        self.prepare_namespaces(cmd).await;

        let (first, rest) = docs::split_first_apply(&current);
        let groups = docs::group_by_namespace(&rest);
        let mut result = DeployResult::new(&cmd.app_id);

        if first.is_empty() {
            if !self.dry_run(cmd, &groups, &mut result).await {
                // handled failure: reported upstream, nothing else to do
                return Ok(result);
            }
        } else {
            self.apply_first(cmd, &first, &mut result).await;
        }
        self.apply_groups(cmd, &groups, &mut result).await;
        self.run_helm(cmd, &mut result).await;

        Ok(result)
    }

    /// Deletes documents the new revision dropped, collecting their claims
    /// first when `clear_pvcs` asks for it. Individual deletions are best
    /// effort.
    async fn remove_stale(
        &self,
        previous: &[ManifestDoc],
        current: &[ManifestDoc],
        cmd: &ApplicationManifests,
    ) -> Result<(), DeployError> {
        let opts = DiffOptions {
            additional_namespaces: &cmd.additional_namespaces,
            is_restore: cmd.is_restore,
        };
        let stale = diff::removable_docs(previous, current, &opts);
        if stale.is_empty() {
            return Ok(());
        }
        info!(count = stale.len(), "removing objects dropped from the new revision");

        // Claims must be looked up while the owning pods still exist.
        let claims = if cmd.clear_pvcs {
            let owners = diff::pvc_owner_workloads(&stale);
            if owners.is_empty() {
                Vec::new()
            } else {
                match self.cluster.claims_for_workloads(&owners).await {
                    Ok(claims) => claims,
                    Err(e) => {
                        warn!(error = %e, "failed to collect claims of removed workloads");
                        Vec::new()
                    }
                }
            }
        } else {
            Vec::new()
        };

        for doc in &stale {
            // Waiting on a claim deadlocks while a pod still mounts it.
            let wait = cmd.wait && !doc.is_pvc();
            if let Err(e) = self
                .applier
                .remove(&doc.key.namespace, &doc.yaml, wait, &cmd.kubectl_version)
                .await
            {
                warn!(
                    kind = %doc.key.kind,
                    name = %doc.key.name,
                    namespace = %doc.key.namespace,
                    error = %e,
                    "failed to remove stale object"
                );
            }
        }

        for claim in &claims {
            info!(namespace = %claim.namespace, claim = %claim.name, "deleting claim of removed workload");
            if let Err(e) = self.cluster.delete_claim(claim).await {
                warn!(namespace = %claim.namespace, claim = %claim.name, error = %e, "failed to delete claim");
            }
        }
        Ok(())
    }

    async fn drain_namespaces(
        &self,
        cmd: &ApplicationManifests,
    ) -> Result<(), DeployError> {
        for namespace in &cmd.clear_namespaces {
            drain::wait_for_drain(namespace, || {
                self.cluster.sweep_app_objects(
                    namespace,
                    &cmd.app_slug,
                    cmd.is_restore,
                )
            })
            .await?;
        }
        // terminating objects release cluster-side dependents a little
        // after the namespace reads empty
        tokio::time::sleep(POST_DRAIN_GRACE).await;
        Ok(())
    }

    async fn prepare_namespaces(&self, cmd: &ApplicationManifests) {
        // a wildcard registration first makes the per-namespace ones no-ops
        if cmd.additional_namespaces.iter().any(|ns| ns == "*") {
            self.hooks.ensure("*");
        }
        for namespace in cmd
            .additional_namespaces
            .iter()
            .filter(|ns| ns.as_str() != "*")
        {
            if let Err(e) = self.cluster.ensure_namespace(namespace).await {
                warn!(namespace = %namespace, error = %e, "failed to ensure additional namespace");
            }
            self.hooks.ensure(namespace);
        }
        if cmd.image_pull_secret.trim().is_empty() {
            return;
        }
        for namespace in std::iter::once(&cmd.namespace)
            .chain(cmd.additional_namespaces.iter())
            .filter(|ns| ns.as_str() != "*")
        {
            if let Err(e) = self
                .cluster
                .apply_secret(namespace, &cmd.image_pull_secret)
                .await
            {
                warn!(namespace = %namespace, error = %e, "failed to ensure image pull secret");
            }
        }
    }

    /// Dry-runs every namespace group. Returns false on the first failure,
    /// with the captured output folded into `result`.
    async fn dry_run(
        &self,
        cmd: &ApplicationManifests,
        groups: &[(String, String)],
        result: &mut DeployResult,
    ) -> bool {
        for (namespace, yaml) in groups {
            match self
                .applier
                .apply(
                    namespace,
                    &cmd.app_slug,
                    yaml,
                    true,
                    cmd.annotate_slug,
                    &cmd.kubectl_version,
                )
                .await
            {
                Ok(out) => {
                    append_output(&mut result.dryrun_stdout, &out.stdout);
                    append_output(&mut result.dryrun_stderr, &out.stderr);
                }
                Err(e) => {
                    let (stdout, stderr) = e.output();
                    append_output(&mut result.dryrun_stdout, &stdout);
                    append_output(&mut result.dryrun_stderr, &stderr);
                    result.is_error = true;
                    warn!(namespace = %namespace, error = %e, "dry run failed");
                    return false;
                }
            }
        }
        true
    }

    /// Applies CRDs ahead of everything else. Dry-running them is unsafe:
    /// dependent custom resources in the same bundle assume they exist.
    async fn apply_first(
        &self,
        cmd: &ApplicationManifests,
        first: &[&ManifestDoc],
        result: &mut DeployResult,
    ) {
        let yaml = first
            .iter()
            .map(|d| d.yaml.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        info!(count = first.len(), "applying custom resource definitions first");
        match self
            .applier
            .apply(
                &cmd.namespace,
                &cmd.app_slug,
                &yaml,
                false,
                cmd.annotate_slug,
                &cmd.kubectl_version,
            )
            .await
        {
            Ok(out) => {
                append_output(&mut result.apply_stdout, &out.stdout);
                append_output(&mut result.apply_stderr, &out.stderr);
            }
            Err(e) => {
                let (stdout, stderr) = e.output();
                append_output(&mut result.apply_stdout, &stdout);
                append_output(&mut result.apply_stderr, &stderr);
                result.is_error = true;
                warn!(error = %e, "failed to apply custom resource definitions");
            }
        }
        // the api server needs a moment before the new types resolve
        tokio::time::sleep(self.crd_settle).await;
    }

    async fn apply_groups(
        &self,
        cmd: &ApplicationManifests,
        groups: &[(String, String)],
        result: &mut DeployResult,
    ) {
        for (namespace, yaml) in groups {
            match self
                .applier
                .apply(
                    namespace,
                    &cmd.app_slug,
                    yaml,
                    false,
                    cmd.annotate_slug,
                    &cmd.kubectl_version,
                )
                .await
            {
                Ok(out) => {
                    append_output(&mut result.apply_stdout, &out.stdout);
                    append_output(&mut result.apply_stderr, &out.stderr);
                }
                Err(e) => {
                    let (stdout, stderr) = e.output();
                    append_output(&mut result.apply_stdout, &stdout);
                    append_output(&mut result.apply_stderr, &stderr);
                    result.is_error = true;
                    warn!(namespace = %namespace, error = %e, "apply failed");
                }
            }
        }
    }

    async fn run_helm(
        &self,
        cmd: &ApplicationManifests,
        result: &mut DeployResult,
    ) {
        let current_archive =
            cmd.charts.as_deref().filter(|a| !a.trim().is_empty());
        let previous_archive =
            cmd.previous_charts.as_deref().filter(|a| !a.trim().is_empty());
        if current_archive.is_none() && previous_archive.is_none() {
            return;
        }

        // An unreadable archive makes the release diff meaningless; skip
        // the whole helm phase rather than uninstalling on bad data.
        let current = match current_archive.map(ChartSet::unpack).transpose()
        {
            Ok(set) => set,
            Err(e) => {
                append_output(&mut result.helm_stderr, &e.to_string());
                result.is_error = true;
                warn!(error = %e, "failed to unpack current charts");
                return;
            }
        };
        let previous =
            match previous_archive.map(ChartSet::unpack).transpose() {
                Ok(set) => set,
                Err(e) => {
                    append_output(&mut result.helm_stderr, &e.to_string());
                    result.is_error = true;
                    warn!(error = %e, "failed to unpack previous charts");
                    return;
                }
            };

        if let Some(previous) = &previous {
            for release in charts::removed_releases(previous, current.as_ref())
            {
                info!(release = %release, "uninstalling removed chart release");
                match self
                    .applier
                    .helm_uninstall(&cmd.namespace, &release)
                    .await
                {
                    Ok(out) => {
                        append_output(&mut result.helm_stdout, &out.stdout);
                        append_output(&mut result.helm_stderr, &out.stderr);
                    }
                    Err(e) => {
                        let (stdout, stderr) = e.output();
                        append_output(&mut result.helm_stdout, &stdout);
                        append_output(&mut result.helm_stderr, &stderr);
                        result.is_error = true;
                        warn!(release = %release, error = %e, "helm uninstall failed");
                    }
                }
            }
        }
        if let Some(current) = &current {
            for release in current.releases() {
                info!(release = %release, "upgrading chart release");
                match self
                    .applier
                    .helm_upgrade_install(
                        &cmd.namespace,
                        release,
                        &current.chart_dir(release),
                    )
                    .await
                {
                    Ok(out) => {
                        append_output(&mut result.helm_stdout, &out.stdout);
                        append_output(&mut result.helm_stderr, &out.stderr);
                    }
                    Err(e) => {
                        let (stdout, stderr) = e.output();
                        append_output(&mut result.helm_stdout, &stdout);
                        append_output(&mut result.helm_stderr, &stderr);
                        result.is_error = true;
                        warn!(release = %release, error = %e, "helm upgrade failed");
                    }
                }
            }
        }
    }
}

fn append_output(buf: &mut String, chunk: &str) {
    if chunk.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(chunk);
}

/// Target plus additional namespaces, wildcard included.
pub fn watched_namespaces(cmd: &ApplicationManifests) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    set.insert(cmd.namespace.clone());
    set.extend(cmd.additional_namespaces.iter().cloned());
    set
}

/// Consumes queued work one order at a time, keeping subprocess execution
/// off the channel pump.
pub struct DeployWorker {
    coordinator: Arc<DeployCoordinator>,
    applier: Arc<dyn Applier>,
    reports: Arc<ControlPlaneClient>,
    ns_watch: Arc<NamespaceWatchHandle>,
}

impl DeployWorker {
    pub fn new(
        coordinator: Arc<DeployCoordinator>,
        applier: Arc<dyn Applier>,
        reports: Arc<ControlPlaneClient>,
        ns_watch: Arc<NamespaceWatchHandle>,
    ) -> Self {
        Self {
            coordinator,
            applier,
            reports,
            ns_watch,
        }
    }

    pub async fn run(self, mut orders: mpsc::Receiver<WorkOrder>) {
        while let Some(order) = orders.recv().await {
            match order {
                WorkOrder::Deploy(cmd) => self.handle_deploy(*cmd).await,
                WorkOrder::Preflight(req) => self.handle_preflight(req).await,
                WorkOrder::SupportBundle(req) => {
                    self.handle_support_bundle(req).await
                }
            }
        }
    }

    #[instrument(skip_all, fields(app_id = %cmd.app_id))]
    async fn handle_deploy(&self, cmd: ApplicationManifests) {
        match self.coordinator.execute(&cmd).await {
            Ok(result) => {
                if result.is_error {
                    warn!("deploy finished with errors");
                } else {
                    info!("deploy finished");
                }
                if let Err(e) = self
                    .reports
                    .put_deploy_result(&cmd.result_callback, &result)
                    .await
                {
                    error!(error = %e, "failed to report deploy result");
                }
                self.ns_watch.reconfigure(watched_namespaces(&cmd)).await;
            }
            Err(e) => {
                // no report; the control plane retries with a fresh command
                error!(error = %e, "deploy aborted");
            }
        }
    }

    #[instrument(skip_all, fields(app_id = %req.app_id))]
    async fn handle_preflight(&self, req: PreflightRequest) {
        info!("running preflight checks");
        let result = match self
            .applier
            .preflight(&req.uri, req.ignore_permissions)
            .await
        {
            Ok(out) => CommandResult {
                app_id: req.app_id.clone(),
                is_error: false,
                stdout: out.stdout,
                stderr: out.stderr,
            },
            Err(e) => {
                warn!(error = %e, "preflight checks failed");
                let (stdout, stderr) = e.output();
                CommandResult {
                    app_id: req.app_id.clone(),
                    is_error: true,
                    stdout,
                    stderr,
                }
            }
        };
        if let Err(e) = self
            .reports
            .put_command_result(&req.result_callback, &result)
            .await
        {
            error!(error = %e, "failed to report preflight result");
        }
    }

    #[instrument(skip_all, fields(app_id = %req.app_id))]
    async fn handle_support_bundle(&self, req: SupportBundleRequest) {
        info!("collecting support bundle");
        let result = match self.applier.support_bundle(&req.uri).await {
            Ok(out) => CommandResult {
                app_id: req.app_id.clone(),
                is_error: false,
                stdout: out.stdout,
                stderr: out.stderr,
            },
            Err(e) => {
                warn!(error = %e, "support bundle collection failed");
                let (stdout, stderr) = e.output();
                CommandResult {
                    app_id: req.app_id.clone(),
                    is_error: true,
                    stdout,
                    stderr,
                }
            }
        };
        if let Err(e) = self
            .reports
            .put_command_result(&req.result_callback, &result)
            .await
        {
            error!(error = %e, "failed to report support bundle result");
        }
    }
}
