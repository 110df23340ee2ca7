pub mod charts;
pub mod cluster;
pub mod coordinator;
pub mod diff;
pub mod docs;
pub mod drain;
pub mod locks;
pub mod ns_watch;

#[cfg(test)]
mod coordinator_tests;

pub use cluster::{ClusterFacade, KubeCluster, OwnerWorkload, PvcRef};
pub use coordinator::{
    DeployCoordinator, DeployWorker, WORK_QUEUE_DEPTH, WorkOrder,
    watched_namespaces,
};
pub use locks::AppLockRegistry;
pub use ns_watch::NamespaceWatchHandle;

use thiserror::Error;

use crate::applier::ApplierError;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("failed to decode manifest bundle: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("manifest bundle is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("failed to parse manifest document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error(
        "namespace {namespace} still holds app objects after {attempts} attempts"
    )]
    NamespaceClearTimeout { namespace: String, attempts: u32 },
    #[error(transparent)]
    Applier(#[from] ApplierError),
    #[error("chart archive error: {0}")]
    Archive(#[source] std::io::Error),
}
