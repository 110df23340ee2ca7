use serde::{Deserialize, Serialize};

/// Desired state for one application revision, carried by the `deploy`
/// command. Transient; lives for the duration of one deploy invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationManifests {
    pub app_id: String,
    pub app_slug: String,
    /// Selects a versioned kubectl binary when one is installed.
    #[serde(default)]
    pub kubectl_version: String,
    #[serde(default)]
    pub additional_namespaces: Vec<String>,
    /// Rendered image pull Secret manifest, applied into every target
    /// namespace when present.
    #[serde(default)]
    pub image_pull_secret: String,
    /// Deploy target namespace; documents without an explicit namespace and
    /// informers without one land here.
    pub namespace: String,
    /// Base64 multi-document YAML of the previous revision.
    #[serde(default)]
    pub previous_manifests: String,
    /// Base64 multi-document YAML of the desired revision.
    #[serde(default)]
    pub manifests: String,
    /// Base64 tar.gz of helm chart directories for the desired revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_charts: Option<String>,
    #[serde(default)]
    pub wait: bool,
    /// Path under the API endpoint the deploy result is PUT to.
    pub result_callback: String,
    #[serde(default)]
    pub clear_namespaces: Vec<String>,
    #[serde(default)]
    pub clear_pvcs: bool,
    /// Inject `kots.io/app-slug` as a common annotation on applied objects.
    #[serde(default)]
    pub annotate_slug: bool,
    #[serde(default)]
    pub is_restore: bool,
}
