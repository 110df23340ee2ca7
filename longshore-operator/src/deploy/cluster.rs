//! Direct Kubernetes API operations used by the deploy coordinator.
//!
//! Everything kubectl cannot do well lives here: namespace creation, image
//! pull secret upserts, claim collection for removed workloads, and the
//! discovery-driven namespace sweep. The trait keeps the coordinator
//! testable without a cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolumeClaim, Pod, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams,
};
use kube::core::DynamicObject;
use kube::discovery::{Discovery, Scope, verbs};
use kube::{Client, ResourceExt};
use tracing::{debug, instrument, warn};

use super::DeployError;
use super::drain::{Disposition, classify, sweepable_resource};

pub const FIELD_MANAGER: &str = "longshore-operator";

/// A removed workload whose pods may still reference claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerWorkload {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl OwnerWorkload {
    fn owns(&self, pod: &Pod) -> bool {
        if self.kind == "Pod" {
            return pod.name_any() == self.name;
        }
        pod.owner_references().iter().any(|or| {
            or.api_version == self.api_version
                && or.kind == self.kind
                && or.name == self.name
        })
    }
}

/// A claim slated for removal once `clear_pvcs` is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PvcRef {
    pub namespace: String,
    pub name: String,
}

#[async_trait]
pub trait ClusterFacade: Send + Sync {
    /// Create the namespace when it does not exist yet.
    async fn ensure_namespace(&self, name: &str) -> Result<(), DeployError>;

    /// Server-side apply of a rendered Secret manifest into `namespace`.
    async fn apply_secret(
        &self,
        namespace: &str,
        yaml: &str,
    ) -> Result<(), DeployError>;

    /// Claims referenced by pods belonging to the given removed workloads.
    async fn claims_for_workloads(
        &self,
        owners: &[OwnerWorkload],
    ) -> Result<Vec<PvcRef>, DeployError>;

    /// Delete a claim immediately, letting dependents go away in the
    /// background.
    async fn delete_claim(&self, claim: &PvcRef) -> Result<(), DeployError>;

    /// One drain pass over `namespace`: delete the app's objects and report
    /// how many are still present.
    async fn sweep_app_objects(
        &self,
        namespace: &str,
        app_slug: &str,
        is_restore: bool,
    ) -> Result<usize, DeployError>;
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ClusterFacade for KubeCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<(), DeployError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                debug!(namespace = name, "created namespace");
                Ok(())
            }
            Err(e) if already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        yaml: &str,
    ) -> Result<(), DeployError> {
        let secret: Secret = serde_yaml::from_str(yaml)?;
        let name = secret.name_any();
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &pp, &Patch::Apply(&secret)).await?;
        debug!(namespace, secret = %name, "applied image pull secret");
        Ok(())
    }

    async fn claims_for_workloads(
        &self,
        owners: &[OwnerWorkload],
    ) -> Result<Vec<PvcRef>, DeployError> {
        let mut claims = Vec::new();
        let mut namespaces: Vec<&str> =
            owners.iter().map(|o| o.namespace.as_str()).collect();
        namespaces.sort_unstable();
        namespaces.dedup();

        for namespace in namespaces {
            let api: Api<Pod> =
                Api::namespaced(self.client.clone(), namespace);
            let pods = api.list(&ListParams::default()).await?;
            for pod in pods {
                let owned = owners
                    .iter()
                    .filter(|o| o.namespace == namespace)
                    .any(|o| o.owns(&pod));
                if !owned {
                    continue;
                }
                for volume in
                    pod.spec.iter().flat_map(|s| s.volumes.iter().flatten())
                {
                    if let Some(pvc) = &volume.persistent_volume_claim {
                        let claim = PvcRef {
                            namespace: namespace.to_string(),
                            name: pvc.claim_name.clone(),
                        };
                        if !claims.contains(&claim) {
                            claims.push(claim);
                        }
                    }
                }
            }
        }
        Ok(claims)
    }

    async fn delete_claim(&self, claim: &PvcRef) -> Result<(), DeployError> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &claim.namespace);
        let dp = DeleteParams::background().grace_period(0);
        match api.delete(&claim.name, &dp).await {
            Ok(_) => {
                debug!(namespace = %claim.namespace, claim = %claim.name, "deleted claim");
                Ok(())
            }
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip_all, fields(namespace, app_slug))]
    async fn sweep_app_objects(
        &self,
        namespace: &str,
        app_slug: &str,
        is_restore: bool,
    ) -> Result<usize, DeployError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let dp = DeleteParams::background().grace_period(0);
        let mut remaining = 0usize;

        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if caps.scope != Scope::Namespaced
                    || !caps.supports_operation(verbs::LIST)
                    || !caps.supports_operation(verbs::DELETE)
                    || !sweepable_resource(&ar.plural)
                {
                    continue;
                }
                let api: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    namespace,
                    &ar,
                );
                // A kind that cannot be listed (RBAC, aggregated API being
                // unavailable) is skipped rather than holding the drain open.
                let list = match api.list(&ListParams::default()).await {
                    Ok(list) => list,
                    Err(e) => {
                        debug!(kind = %ar.kind, error = %e, "skipping unlistable resource");
                        continue;
                    }
                };
                for item in list {
                    match classify(&item.metadata, app_slug, is_restore) {
                        Some(Disposition::Delete) => {
                            let name = item.name_any();
                            if let Err(e) = api.delete(&name, &dp).await {
                                if !not_found(&e) {
                                    warn!(kind = %ar.kind, name = %name, error = %e, "failed to delete app object");
                                }
                            }
                            remaining += 1;
                        }
                        Some(Disposition::AwaitDeletion) => remaining += 1,
                        Some(Disposition::Spare) | None => {}
                    }
                }
            }
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimVolumeSource, PodSpec, Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;

    fn pod(
        name: &str,
        owner: Option<(&str, &str, &str)>,
        claims: &[&str],
    ) -> Pod {
        let owner_references = owner.map(|(api_version, kind, owner_name)| {
            vec![OwnerReference {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                name: owner_name.to_string(),
                uid: "u1".to_string(),
                ..Default::default()
            }]
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                owner_references,
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(
                    claims
                        .iter()
                        .map(|claim| Volume {
                            name: format!("{claim}-vol"),
                            persistent_volume_claim: Some(
                                PersistentVolumeClaimVolumeSource {
                                    claim_name: claim.to_string(),
                                    ..Default::default()
                                },
                            ),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn workload_owns_pod_through_owner_reference() {
        let owner = OwnerWorkload {
            api_version: "apps/v1".into(),
            kind: "StatefulSet".into(),
            name: "db".into(),
            namespace: "apps".into(),
        };
        assert!(owner.owns(&pod("db-0", Some(("apps/v1", "StatefulSet", "db")), &[])));
        assert!(!owner.owns(&pod("web-0", Some(("apps/v1", "StatefulSet", "web")), &[])));
        assert!(!owner.owns(&pod("db-0", Some(("batch/v1", "Job", "db")), &[])));
        assert!(!owner.owns(&pod("orphan", None, &[])));
    }

    #[test]
    fn bare_pod_owner_matches_by_name() {
        let owner = OwnerWorkload {
            api_version: "v1".into(),
            kind: "Pod".into(),
            name: "scratch".into(),
            namespace: "apps".into(),
        };
        assert!(owner.owns(&pod("scratch", None, &["data"])));
        assert!(!owner.owns(&pod("other", None, &["data"])));
    }
}
