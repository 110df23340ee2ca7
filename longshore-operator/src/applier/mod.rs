pub mod exec;

pub use exec::*;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Captured output of one subprocess invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum ApplierError {
    #[error(
        "unable to find '{name}' executable, make sure it is installed and in PATH"
    )]
    BinaryNotFound {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' exited with status {code:?}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("io error running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stage manifests for kustomize: {0}")]
    Stage(#[source] std::io::Error),
}

impl ApplierError {
    /// Captured output of a failed command, empty for non-exec failures.
    pub fn output(&self) -> (String, String) {
        match self {
            ApplierError::CommandFailed { stdout, stderr, .. } => {
                (stdout.clone(), stderr.clone())
            }
            other => (String::new(), other.to_string()),
        }
    }
}

/// Boundary to the external apply machinery. The production implementation
/// shells out; tests substitute a recording mock.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply a multi-document YAML bundle into `namespace` through a staged
    /// kustomization.
    async fn apply(
        &self,
        namespace: &str,
        slug: &str,
        yaml: &str,
        dry_run: bool,
        annotate_slug: bool,
        kubectl_version: &str,
    ) -> Result<ExecOutput, ApplierError>;

    /// Delete the objects of a YAML document.
    async fn remove(
        &self,
        namespace: &str,
        yaml: &str,
        wait: bool,
        kubectl_version: &str,
    ) -> Result<ExecOutput, ApplierError>;

    async fn helm_uninstall(
        &self,
        namespace: &str,
        release: &str,
    ) -> Result<ExecOutput, ApplierError>;

    async fn helm_upgrade_install(
        &self,
        namespace: &str,
        release: &str,
        chart_dir: &Path,
    ) -> Result<ExecOutput, ApplierError>;

    async fn preflight(
        &self,
        uri: &str,
        ignore_permissions: bool,
    ) -> Result<ExecOutput, ApplierError>;

    async fn support_bundle(
        &self,
        uri: &str,
    ) -> Result<ExecOutput, ApplierError>;
}
