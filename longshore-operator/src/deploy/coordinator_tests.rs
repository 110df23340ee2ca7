#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use kube::{Client, Config};
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use longshore_wire::{ApplicationManifests, DeployResult};

    use crate::applier::{Applier, ApplierError, ExecOutput};
    use crate::deploy::DeployError;
    use crate::deploy::cluster::{ClusterFacade, OwnerWorkload, PvcRef};
    use crate::deploy::coordinator::{
        DeployCoordinator, DeployWorker, WorkOrder,
    };
    use crate::deploy::ns_watch::NamespaceWatchHandle;
    use crate::hooks::{HookRegistrar, HooksRegistry};
    use crate::report::ControlPlaneClient;

    #[derive(Debug, Clone, PartialEq)]
    enum ApplierCall {
        Apply {
            namespace: String,
            dry_run: bool,
            yaml: String,
        },
        Remove {
            namespace: String,
            wait: bool,
            yaml: String,
        },
        HelmUninstall {
            release: String,
        },
        HelmUpgrade {
            release: String,
        },
    }

    #[derive(Default)]
    struct MockApplier {
        calls: Mutex<Vec<ApplierCall>>,
        fail_dry_run: bool,
        fail_apply_in: Option<String>,
    }

    impl MockApplier {
        fn calls(&self) -> Vec<ApplierCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Applier for MockApplier {
        async fn apply(
            &self,
            namespace: &str,
            _slug: &str,
            yaml: &str,
            dry_run: bool,
            _annotate_slug: bool,
            _kubectl_version: &str,
        ) -> Result<ExecOutput, ApplierError> {
            self.calls.lock().unwrap().push(ApplierCall::Apply {
                namespace: namespace.to_string(),
                dry_run,
                yaml: yaml.to_string(),
            });
            let forced_failure = (dry_run && self.fail_dry_run)
                || self.fail_apply_in.as_deref() == Some(namespace);
            if forced_failure {
                return Err(ApplierError::CommandFailed {
                    command: "kubectl apply".into(),
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "field is immutable".into(),
                });
            }
            Ok(ExecOutput {
                stdout: format!("configured {namespace}"),
                stderr: String::new(),
            })
        }

        async fn remove(
            &self,
            namespace: &str,
            yaml: &str,
            wait: bool,
            _kubectl_version: &str,
        ) -> Result<ExecOutput, ApplierError> {
            self.calls.lock().unwrap().push(ApplierCall::Remove {
                namespace: namespace.to_string(),
                wait,
                yaml: yaml.to_string(),
            });
            Ok(ExecOutput::default())
        }

        async fn helm_uninstall(
            &self,
            _namespace: &str,
            release: &str,
        ) -> Result<ExecOutput, ApplierError> {
            self.calls.lock().unwrap().push(ApplierCall::HelmUninstall {
                release: release.to_string(),
            });
            Ok(ExecOutput {
                stdout: format!("release \"{release}\" uninstalled"),
                stderr: String::new(),
            })
        }

        async fn helm_upgrade_install(
            &self,
            _namespace: &str,
            release: &str,
            _chart_dir: &Path,
        ) -> Result<ExecOutput, ApplierError> {
            self.calls.lock().unwrap().push(ApplierCall::HelmUpgrade {
                release: release.to_string(),
            });
            Ok(ExecOutput {
                stdout: format!("release \"{release}\" deployed"),
                stderr: String::new(),
            })
        }

        async fn preflight(
            &self,
            _uri: &str,
            _ignore_permissions: bool,
        ) -> Result<ExecOutput, ApplierError> {
            Ok(ExecOutput::default())
        }

        async fn support_bundle(
            &self,
            _uri: &str,
        ) -> Result<ExecOutput, ApplierError> {
            Ok(ExecOutput::default())
        }
    }

    #[derive(Default)]
    struct MockCluster {
        ensured: Mutex<Vec<String>>,
        secret_namespaces: Mutex<Vec<String>>,
        claims: Vec<PvcRef>,
        claim_queries: Mutex<Vec<OwnerWorkload>>,
        deleted_claims: Mutex<Vec<PvcRef>>,
        sweep_counts: Mutex<Vec<usize>>,
        sweeps: AtomicU32,
    }

    #[async_trait]
    impl ClusterFacade for MockCluster {
        async fn ensure_namespace(
            &self,
            name: &str,
        ) -> Result<(), DeployError> {
            self.ensured.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn apply_secret(
            &self,
            namespace: &str,
            _yaml: &str,
        ) -> Result<(), DeployError> {
            self.secret_namespaces
                .lock()
                .unwrap()
                .push(namespace.to_string());
            Ok(())
        }

        async fn claims_for_workloads(
            &self,
            owners: &[OwnerWorkload],
        ) -> Result<Vec<PvcRef>, DeployError> {
            self.claim_queries.lock().unwrap().extend_from_slice(owners);
            Ok(self.claims.clone())
        }

        async fn delete_claim(
            &self,
            claim: &PvcRef,
        ) -> Result<(), DeployError> {
            self.deleted_claims.lock().unwrap().push(claim.clone());
            Ok(())
        }

        async fn sweep_app_objects(
            &self,
            _namespace: &str,
            _app_slug: &str,
            _is_restore: bool,
        ) -> Result<usize, DeployError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            let mut counts = self.sweep_counts.lock().unwrap();
            let remaining = if counts.len() > 1 {
                counts.remove(0)
            } else {
                counts.first().copied().unwrap_or(0)
            };
            Ok(remaining)
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        registered: Mutex<Vec<String>>,
    }

    impl HookRegistrar for RecordingHooks {
        fn ensure(&self, namespace: &str) {
            self.registered.lock().unwrap().push(namespace.to_string());
        }
    }

    const PLAIN_BUNDLE: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: api\n  namespace: edge\n";

    const CRD_BUNDLE: &str = "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n";

    fn b64(text: &str) -> String {
        BASE64.encode(text)
    }

    fn command(manifests: &str) -> ApplicationManifests {
        ApplicationManifests {
            app_id: "a1".into(),
            app_slug: "myapp".into(),
            namespace: "apps".into(),
            manifests: b64(manifests),
            result_callback: "/api/v1/deploy/result".into(),
            ..Default::default()
        }
    }

    fn coordinator(
        applier: &Arc<MockApplier>,
        cluster: &Arc<MockCluster>,
    ) -> DeployCoordinator {
        DeployCoordinator::new(
            applier.clone(),
            cluster.clone(),
            Arc::new(RecordingHooks::default()),
            Duration::from_secs(5),
        )
    }

    fn chart_archive(releases: &[&str]) -> String {
        let mut buf = Vec::new();
        {
            let enc = GzEncoder::new(&mut buf, Compression::default());
            let mut builder = tar::Builder::new(enc);
            for release in releases {
                let data = format!("name: {release}\n");
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(
                        &mut header,
                        format!("{release}/Chart.yaml"),
                        data.as_bytes(),
                    )
                    .unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }
        BASE64.encode(&buf)
    }

    /// A worker whose reports and cluster traffic both land on `uri`.
    fn worker(uri: &str, applier: &Arc<MockApplier>) -> DeployWorker {
        // Tests build kube clients without going through main(), which is
        // where the process-level rustls provider is normally installed.
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        );
        let coordinator = Arc::new(DeployCoordinator::new(
            applier.clone(),
            Arc::new(MockCluster::default()),
            Arc::new(RecordingHooks::default()),
            Duration::from_secs(5),
        ));
        let client =
            Client::try_from(Config::new(uri.parse().unwrap())).unwrap();
        let hooks = Arc::new(HooksRegistry::new(client.clone()));
        let ns_watch = Arc::new(NamespaceWatchHandle::new(client, hooks));
        let reports = Arc::new(ControlPlaneClient::new(uri, "token"));
        DeployWorker::new(coordinator, applier.clone(), reports, ns_watch)
    }

    #[tokio::test]
    async fn plain_deploy_dry_runs_then_applies_per_namespace() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster::default());
        let cmd = command(PLAIN_BUNDLE);

        let result =
            coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        assert!(!result.is_error);
        assert!(result.dryrun_stdout.contains("configured apps"));
        assert!(result.apply_stdout.contains("configured edge"));

        let calls = applier.calls();
        let dry: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                ApplierCall::Apply { namespace, dry_run: true, .. } => {
                    Some(namespace.as_str())
                }
                _ => None,
            })
            .collect();
        let real: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                ApplierCall::Apply { namespace, dry_run: false, .. } => {
                    Some(namespace.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(dry, ["apps", "edge"]);
        assert_eq!(real, ["apps", "edge"]);
        // every dry run precedes every real apply
        let first_real = calls
            .iter()
            .position(|c| {
                matches!(c, ApplierCall::Apply { dry_run: false, .. })
            })
            .unwrap();
        assert!(calls[..first_real].iter().all(|c| matches!(
            c,
            ApplierCall::Apply { dry_run: true, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn crds_apply_first_and_skip_the_dry_run() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster::default());
        let cmd = command(CRD_BUNDLE);

        let result =
            coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        assert!(!result.is_error);
        let calls = applier.calls();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            ApplierCall::Apply { dry_run, yaml, .. } => {
                assert!(!dry_run);
                assert!(yaml.contains("CustomResourceDefinition"));
                assert!(!yaml.contains("kind: Deployment"));
            }
            other => panic!("unexpected call {other:?}"),
        }
        match &calls[1] {
            ApplierCall::Apply { dry_run, yaml, .. } => {
                assert!(!dry_run);
                assert!(yaml.contains("kind: Deployment"));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_dry_run_is_reported_not_applied() {
        let applier = Arc::new(MockApplier {
            fail_dry_run: true,
            ..Default::default()
        });
        let cluster = Arc::new(MockCluster::default());
        let cmd = command(PLAIN_BUNDLE);

        let result =
            coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        assert!(result.is_error);
        assert!(result.dryrun_stderr.contains("field is immutable"));
        assert!(applier.calls().iter().all(|c| matches!(
            c,
            ApplierCall::Apply { dry_run: true, .. }
        )));
    }

    #[tokio::test]
    async fn apply_failure_in_one_namespace_does_not_abort_the_rest() {
        let applier = Arc::new(MockApplier {
            fail_apply_in: Some("apps".into()),
            ..Default::default()
        });
        let cluster = Arc::new(MockCluster::default());
        // dry run also runs against "apps"; restrict the failure to the
        // real pass by keeping dry runs passing
        let cmd = ApplicationManifests {
            previous_manifests: String::new(),
            ..command(PLAIN_BUNDLE)
        };

        let result =
            coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        // the dry run against "apps" already failed and stopped the flow
        assert!(result.is_error);

        // with CRDs present there is no dry run, so the edge group still
        // applies after the apps failure
        let applier = Arc::new(MockApplier {
            fail_apply_in: Some("apps".into()),
            ..Default::default()
        });
        let with_crd = format!(
            "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n---\n{PLAIN_BUNDLE}"
        );
        let cmd = command(&with_crd);
        tokio::time::pause();
        let result =
            coordinator(&applier, &cluster).execute(&cmd).await.unwrap();
        assert!(result.is_error);
        let real: Vec<_> = applier
            .calls()
            .iter()
            .filter_map(|c| match c {
                ApplierCall::Apply { namespace, dry_run: false, .. } => {
                    Some(namespace.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(real, ["apps", "apps", "edge"]);
    }

    #[tokio::test]
    async fn stale_documents_are_removed_with_pvc_wait_override() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster::default());
        let previous = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: old-web\n---\napiVersion: v1\nkind: PersistentVolumeClaim\nmetadata:\n  name: old-data\n";
        let cmd = ApplicationManifests {
            previous_manifests: b64(previous),
            wait: true,
            ..command(PLAIN_BUNDLE)
        };

        coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        let removes: Vec<_> = applier
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ApplierCall::Remove { wait, yaml, .. } => Some((wait, yaml)),
                _ => None,
            })
            .collect();
        assert_eq!(removes.len(), 2);
        for (wait, yaml) in removes {
            if yaml.contains("PersistentVolumeClaim") {
                assert!(!wait, "claim removal must not wait");
            } else {
                assert!(wait);
            }
        }
    }

    #[tokio::test]
    async fn clear_pvcs_deletes_claims_of_removed_workloads() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster {
            claims: vec![PvcRef {
                namespace: "apps".into(),
                name: "data-db-0".into(),
            }],
            ..Default::default()
        });
        let previous = "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: db\n";
        let cmd = ApplicationManifests {
            previous_manifests: b64(previous),
            clear_pvcs: true,
            ..command(PLAIN_BUNDLE)
        };

        coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        let queries = cluster.claim_queries.lock().unwrap().clone();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].kind, "StatefulSet");
        assert_eq!(queries[0].name, "db");
        let deleted = cluster.deleted_claims.lock().unwrap().clone();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "data-db-0");
    }

    #[tokio::test]
    async fn without_clear_pvcs_claims_are_left_alone() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster {
            claims: vec![PvcRef {
                namespace: "apps".into(),
                name: "data-db-0".into(),
            }],
            ..Default::default()
        });
        let previous = "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: db\n";
        let cmd = ApplicationManifests {
            previous_manifests: b64(previous),
            ..command(PLAIN_BUNDLE)
        };

        coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        assert!(cluster.claim_queries.lock().unwrap().is_empty());
        assert!(cluster.deleted_claims.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_drain_polls_until_clear() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster {
            sweep_counts: Mutex::new(vec![3, 1, 0]),
            ..Default::default()
        });
        let cmd = ApplicationManifests {
            clear_namespaces: vec!["drop-ns".into()],
            ..command(PLAIN_BUNDLE)
        };

        let result =
            coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        assert!(!result.is_error);
        assert_eq!(cluster.sweeps.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_that_never_clears_aborts_the_deploy() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster {
            sweep_counts: Mutex::new(vec![1]),
            ..Default::default()
        });
        let cmd = ApplicationManifests {
            clear_namespaces: vec!["drop-ns".into()],
            ..command(PLAIN_BUNDLE)
        };

        let err = coordinator(&applier, &cluster)
            .execute(&cmd)
            .await
            .unwrap_err();

        match err {
            DeployError::NamespaceClearTimeout { namespace, attempts } => {
                assert_eq!(namespace, "drop-ns");
                assert_eq!(attempts, 60);
            }
            other => panic!("unexpected error {other}"),
        }
        // nothing was applied
        assert!(applier.calls().is_empty());
    }

    #[tokio::test]
    async fn additional_namespaces_and_pull_secret_are_ensured() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster::default());
        let hooks = Arc::new(RecordingHooks::default());
        let cmd = ApplicationManifests {
            additional_namespaces: vec!["edge".into(), "*".into()],
            image_pull_secret:
                "apiVersion: v1\nkind: Secret\nmetadata:\n  name: registry-creds\n"
                    .into(),
            ..command(PLAIN_BUNDLE)
        };

        DeployCoordinator::new(
            applier.clone(),
            cluster.clone(),
            hooks.clone(),
            Duration::from_secs(5),
        )
        .execute(&cmd)
        .await
        .unwrap();

        assert_eq!(*cluster.ensured.lock().unwrap(), ["edge"]);
        assert_eq!(
            *cluster.secret_namespaces.lock().unwrap(),
            ["apps", "edge"]
        );
        // the wildcard registers ahead of the named namespaces
        assert_eq!(*hooks.registered.lock().unwrap(), ["*", "edge"]);
    }

    #[tokio::test]
    async fn hook_registration_happens_during_namespace_prepare() {
        let applier = Arc::new(MockApplier {
            fail_dry_run: true,
            ..Default::default()
        });
        let cluster = Arc::new(MockCluster::default());
        let hooks = Arc::new(RecordingHooks::default());
        let cmd = ApplicationManifests {
            additional_namespaces: vec!["edge".into(), "batch".into()],
            ..command(PLAIN_BUNDLE)
        };

        let result = DeployCoordinator::new(
            applier.clone(),
            cluster.clone(),
            hooks.clone(),
            Duration::from_secs(5),
        )
        .execute(&cmd)
        .await
        .unwrap();

        // registration is part of namespace preparation, not contingent
        // on the deploy outcome
        assert!(result.is_error);
        assert_eq!(*hooks.registered.lock().unwrap(), ["edge", "batch"]);
    }

    #[tokio::test]
    async fn helm_uninstalls_removed_releases_and_upgrades_current() {
        let applier = Arc::new(MockApplier::default());
        let cluster = Arc::new(MockCluster::default());
        let cmd = ApplicationManifests {
            charts: Some(chart_archive(&["redis"])),
            previous_charts: Some(chart_archive(&["postgres", "redis"])),
            ..command(PLAIN_BUNDLE)
        };

        let result =
            coordinator(&applier, &cluster).execute(&cmd).await.unwrap();

        assert!(!result.is_error);
        assert!(result.helm_stdout.contains("uninstalled"));
        let helm: Vec<_> = applier
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    ApplierCall::HelmUninstall { .. }
                        | ApplierCall::HelmUpgrade { .. }
                )
            })
            .collect();
        assert_eq!(
            helm,
            [
                ApplierCall::HelmUninstall { release: "postgres".into() },
                ApplierCall::HelmUpgrade { release: "redis".into() },
            ]
        );
    }

    #[tokio::test]
    async fn worker_reports_each_deploy_outcome_once() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/deploy/result"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let applier = Arc::new(MockApplier::default());
        let (tx, rx) = mpsc::channel(4);
        tx.send(WorkOrder::Deploy(Box::new(command(PLAIN_BUNDLE))))
            .await
            .unwrap();
        drop(tx);
        worker(&server.uri(), &applier).run(rx).await;

        let results: Vec<DeployResult> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/api/v1/deploy/result")
            .map(|r| r.body_json().unwrap())
            .collect();
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_error);
        assert_eq!(results[0].app_id, "a1");
    }

    #[tokio::test]
    async fn aborted_deploys_produce_no_report() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        // an undecodable bundle aborts before producing a result
        let applier = Arc::new(MockApplier::default());
        let cmd = ApplicationManifests {
            manifests: "%%% not base64 %%%".into(),
            ..command(PLAIN_BUNDLE)
        };
        let (tx, rx) = mpsc::channel(4);
        tx.send(WorkOrder::Deploy(Box::new(cmd))).await.unwrap();
        drop(tx);
        worker(&server.uri(), &applier).run(rx).await;

        assert!(server.received_requests().await.unwrap().is_empty());
        assert!(applier.calls().is_empty());
    }
}
