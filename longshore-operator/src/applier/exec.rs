use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use longshore_wire::APP_SLUG_ANNOTATION;

use crate::config::ExecConfig;

use super::{Applier, ApplierError, ExecOutput};

const SERVICE_ACCOUNT_DIR: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount";

/// kubectl connection flags derived from the in-cluster environment.
/// Outside a cluster no flags are set and the ambient kubeconfig applies.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFlags {
    pub server: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

impl ConnectionFlags {
    pub fn detect() -> Self {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok();
        let port = std::env::var("KUBERNETES_SERVICE_PORT").ok();
        let (Some(host), Some(port)) = (host, port) else {
            return Self::default();
        };
        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let token_file = sa.join("token");
        let ca_file = sa.join("ca.crt");
        Self {
            server: Some(format!("https://{host}:{port}")),
            token_file: token_file.is_file().then_some(token_file),
            ca_file: ca_file.is_file().then_some(ca_file),
        }
    }

    /// The token is re-read on every invocation; service account tokens
    /// rotate while the process runs.
    async fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(server) = &self.server {
            args.push(format!("--server={server}"));
        }
        if let Some(token_file) = &self.token_file {
            match tokio::fs::read_to_string(token_file).await {
                Ok(token) => args.push(format!("--token={}", token.trim())),
                Err(e) => {
                    warn!(error = %e, "failed to read service account token")
                }
            }
        }
        if let Some(ca_file) = &self.ca_file {
            args.push(format!(
                "--certificate-authority={}",
                ca_file.display()
            ));
        }
        args
    }
}

/// Pick the kubectl binary for a requested version: a matching
/// `kubectl-v<version>` under `bin_dir` wins, otherwise the default binary.
pub fn resolve_kubectl(
    bin_dir: &str,
    default_bin: &str,
    version: &str,
) -> String {
    if bin_dir.is_empty() || version.is_empty() || version == "latest" {
        return default_bin.to_string();
    }
    let candidate = Path::new(bin_dir).join(format!("kubectl-v{version}"));
    if candidate.is_file() {
        candidate.to_string_lossy().into_owned()
    } else {
        default_bin.to_string()
    }
}

#[derive(Serialize)]
struct Kustomization {
    resources: Vec<String>,
    #[serde(
        rename = "commonAnnotations",
        skip_serializing_if = "Option::is_none"
    )]
    common_annotations: Option<BTreeMap<String, String>>,
}

fn kustomization_yaml(
    slug: &str,
    annotate_slug: bool,
) -> Result<String, serde_yaml::Error> {
    let common_annotations = annotate_slug.then(|| {
        let mut annotations = BTreeMap::new();
        annotations
            .insert(APP_SLUG_ANNOTATION.to_string(), slug.to_string());
        annotations
    });
    serde_yaml::to_string(&Kustomization {
        resources: vec!["all.yaml".to_string()],
        common_annotations,
    })
}

/// Shells out to kubectl/kustomize/helm and the troubleshoot binaries.
pub struct ExecApplier {
    cfg: ExecConfig,
    conn: ConnectionFlags,
}

impl ExecApplier {
    /// Only succeeds when kubectl and kustomize can be found; helm and the
    /// troubleshoot binaries are checked on first use.
    pub async fn new(cfg: ExecConfig) -> Result<Self, ApplierError> {
        let applier = Self {
            conn: ConnectionFlags::detect(),
            cfg,
        };
        applier
            .check_binary(&applier.cfg.kubectl_bin, &["version", "--client"])
            .await?;
        applier
            .check_binary(&applier.cfg.kustomize_bin, &["version"])
            .await?;
        Ok(applier)
    }

    async fn check_binary(
        &self,
        bin: &str,
        args: &[&str],
    ) -> Result<(), ApplierError> {
        Command::new(bin)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| ApplierError::BinaryNotFound {
                name: bin.to_string(),
                source,
            })?;
        Ok(())
    }

    async fn run(
        &self,
        bin: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, ApplierError> {
        let command = format!("{bin} {}", args.join(" "));
        debug!(bin, "exec");
        let mut cmd = Command::new(bin);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ApplierError::BinaryNotFound {
                    name: bin.to_string(),
                    source,
                }
            } else {
                ApplierError::Io {
                    command: command.clone(),
                    source,
                }
            }
        })?;
        // Feed stdin while the output pipes drain; writing the whole
        // payload up front deadlocks once the child fills a pipe buffer
        // nothing is reading yet.
        let stdin_pipe = child.stdin.take();
        let feed = async {
            if let (Some(mut pipe), Some(input)) = (stdin_pipe, stdin) {
                // a child that stops reading early is judged by its
                // exit status, not by this write
                if let Err(e) = pipe.write_all(input).await {
                    debug!(command = %command, error = %e, "stdin closed early");
                }
            }
        };
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|source| ApplierError::Io {
            command: command.clone(),
            source,
        })?;
        let out = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if output.status.success() {
            Ok(out)
        } else {
            Err(ApplierError::CommandFailed {
                command,
                code: output.status.code(),
                stdout: out.stdout,
                stderr: out.stderr,
            })
        }
    }

    fn kubectl_for(&self, version: &str) -> String {
        resolve_kubectl(&self.cfg.bin_dir, &self.cfg.kubectl_bin, version)
    }

    /// Render the staged bundle with kustomize.
    async fn kustomize_build(
        &self,
        yaml: &str,
        slug: &str,
        annotate_slug: bool,
    ) -> Result<String, ApplierError> {
        let staging = tempfile::tempdir().map_err(ApplierError::Stage)?;
        tokio::fs::write(staging.path().join("all.yaml"), yaml)
            .await
            .map_err(ApplierError::Stage)?;
        let kustomization = kustomization_yaml(slug, annotate_slug)
            .map_err(|e| {
                ApplierError::Stage(std::io::Error::other(e.to_string()))
            })?;
        tokio::fs::write(
            staging.path().join("kustomization.yaml"),
            kustomization,
        )
        .await
        .map_err(ApplierError::Stage)?;

        let args =
            vec!["build".to_string(), staging.path().display().to_string()];
        let rendered =
            self.run(&self.cfg.kustomize_bin, &args, None).await?;
        Ok(rendered.stdout)
    }
}

#[async_trait]
impl Applier for ExecApplier {
    #[instrument(skip_all, fields(ns = %namespace, dry_run))]
    async fn apply(
        &self,
        namespace: &str,
        slug: &str,
        yaml: &str,
        dry_run: bool,
        annotate_slug: bool,
        kubectl_version: &str,
    ) -> Result<ExecOutput, ApplierError> {
        let rendered =
            self.kustomize_build(yaml, slug, annotate_slug).await?;

        let mut args = self.conn.args().await;
        args.push("apply".to_string());
        if !namespace.is_empty() {
            args.push("-n".to_string());
            args.push(namespace.to_string());
        }
        if dry_run {
            args.push("--dry-run=client".to_string());
        }
        args.push("-f".to_string());
        args.push("-".to_string());

        self.run(
            &self.kubectl_for(kubectl_version),
            &args,
            Some(rendered.as_bytes()),
        )
        .await
    }

    #[instrument(skip_all, fields(ns = %namespace, wait))]
    async fn remove(
        &self,
        namespace: &str,
        yaml: &str,
        wait: bool,
        kubectl_version: &str,
    ) -> Result<ExecOutput, ApplierError> {
        let mut args = self.conn.args().await;
        args.push("delete".to_string());
        if !namespace.is_empty() {
            args.push("-n".to_string());
            args.push(namespace.to_string());
        }
        args.push(format!("--wait={wait}"));
        args.push("--ignore-not-found=true".to_string());
        args.push("-f".to_string());
        args.push("-".to_string());

        self.run(
            &self.kubectl_for(kubectl_version),
            &args,
            Some(yaml.as_bytes()),
        )
        .await
    }

    #[instrument(skip_all, fields(ns = %namespace, release))]
    async fn helm_uninstall(
        &self,
        namespace: &str,
        release: &str,
    ) -> Result<ExecOutput, ApplierError> {
        let args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        self.run(&self.cfg.helm_bin, &args, None).await
    }

    #[instrument(skip_all, fields(ns = %namespace, release))]
    async fn helm_upgrade_install(
        &self,
        namespace: &str,
        release: &str,
        chart_dir: &Path,
    ) -> Result<ExecOutput, ApplierError> {
        let args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            release.to_string(),
            chart_dir.display().to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        self.run(&self.cfg.helm_bin, &args, None).await
    }

    async fn preflight(
        &self,
        uri: &str,
        ignore_permissions: bool,
    ) -> Result<ExecOutput, ApplierError> {
        let mut args = vec![
            uri.to_string(),
            "--interactive=false".to_string(),
            "--format=json".to_string(),
        ];
        if ignore_permissions {
            args.push("--collect-without-permissions".to_string());
        }
        self.run(&self.cfg.preflight_bin, &args, None).await
    }

    async fn support_bundle(
        &self,
        uri: &str,
    ) -> Result<ExecOutput, ApplierError> {
        let args =
            vec![uri.to_string(), "--interactive=false".to_string()];
        self.run(&self.cfg.support_bundle_bin, &args, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kustomization_without_annotation() {
        let yaml = kustomization_yaml("myapp", false).unwrap();
        assert!(yaml.contains("all.yaml"));
        assert!(!yaml.contains("commonAnnotations"));
    }

    #[test]
    fn kustomization_with_slug_annotation() {
        let yaml = kustomization_yaml("myapp", true).unwrap();
        assert!(yaml.contains("commonAnnotations"));
        assert!(yaml.contains("kots.io/app-slug: myapp"));
    }

    #[test]
    fn resolve_kubectl_prefers_versioned_binary() {
        let dir = tempfile::tempdir().unwrap();
        let versioned = dir.path().join("kubectl-v1.31.0");
        std::fs::write(&versioned, b"").unwrap();

        let got = resolve_kubectl(
            &dir.path().display().to_string(),
            "kubectl",
            "1.31.0",
        );
        assert_eq!(got, versioned.display().to_string());
    }

    #[test]
    fn resolve_kubectl_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        for version in ["1.99.0", "", "latest"] {
            let got = resolve_kubectl(
                &dir.path().display().to_string(),
                "kubectl",
                version,
            );
            assert_eq!(got, "kubectl");
        }
        assert_eq!(resolve_kubectl("", "kubectl", "1.31.0"), "kubectl");
    }

    #[test]
    fn connection_flags_default_outside_cluster() {
        // test processes do not run with the in-cluster env unless the suite
        // sets it, and these tests never do
        if std::env::var("KUBERNETES_SERVICE_HOST").is_err() {
            let flags = ConnectionFlags::detect();
            assert!(flags.server.is_none());
            assert!(flags.token_file.is_none());
        }
    }

    #[tokio::test]
    async fn remove_streams_large_manifests_without_stalling() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        // stand-in that answers version checks and otherwise echoes stdin
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("kubectl");
        std::fs::write(
            &bin,
            "#!/bin/sh\ncase \"$1\" in\n  version) exit 0 ;;\nesac\nexec cat\n",
        )
        .unwrap();
        std::fs::set_permissions(
            &bin,
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let cfg = ExecConfig {
            kubectl_bin: bin.display().to_string(),
            kustomize_bin: bin.display().to_string(),
            ..Default::default()
        };
        let applier = ExecApplier::new(cfg).await.unwrap();

        // several pipe buffers worth of payload in both directions
        let doc = format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: big\ndata:\n  blob: {}",
            "x".repeat(4 * 1024 * 1024)
        );
        let out = tokio::time::timeout(
            Duration::from_secs(30),
            applier.remove("default", &doc, false, ""),
        )
        .await
        .expect("remove stalled while the child was emitting output")
        .unwrap();
        assert_eq!(out.stdout.len(), doc.len());
    }
}
