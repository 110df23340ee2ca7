use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Base URL of the control-plane HTTP API, used for result callbacks
    /// and status pushes.
    /// Env: LONGSHORE_API_ENDPOINT
    #[envconfig(
        from = "LONGSHORE_API_ENDPOINT",
        default = "http://longshore-api:3000"
    )]
    pub api_endpoint: String,

    /// host:port of the control-plane channel listener.
    /// Env: LONGSHORE_CHANNEL_ADDR
    #[envconfig(from = "LONGSHORE_CHANNEL_ADDR", default = "longshore-api:3030")]
    pub channel_addr: String,

    /// Cluster connection token, sent in the channel hello and as the basic
    /// auth password on HTTP callbacks.
    /// Env: LONGSHORE_TOKEN
    #[envconfig(from = "LONGSHORE_TOKEN", default = "")]
    pub token: String,

    /// Namespace documents and informers default to when they carry none.
    /// Env: LONGSHORE_TARGET_NAMESPACE
    #[envconfig(from = "LONGSHORE_TARGET_NAMESPACE", default = "default")]
    pub target_namespace: String,

    #[envconfig(from = "HTTP_PORT", default = "8088")]
    pub http_port: u16,

    /// Settle sleep after applying CustomResourceDefinitions, so the API
    /// server caches them before dependent objects arrive.
    /// Env: LONGSHORE_CRD_SETTLE_SECS
    #[envconfig(from = "LONGSHORE_CRD_SETTLE_SECS", default = "5")]
    pub crd_settle_secs: u64,

    #[envconfig(nested)]
    pub exec: ExecConfig,
}

/// Paths for the executables the operator shells out to.
#[derive(Envconfig, Clone, Debug)]
pub struct ExecConfig {
    #[envconfig(from = "LONGSHORE_KUBECTL_BIN", default = "kubectl")]
    pub kubectl_bin: String,

    #[envconfig(from = "LONGSHORE_KUSTOMIZE_BIN", default = "kustomize")]
    pub kustomize_bin: String,

    #[envconfig(from = "LONGSHORE_HELM_BIN", default = "helm")]
    pub helm_bin: String,

    #[envconfig(from = "LONGSHORE_PREFLIGHT_BIN", default = "preflight")]
    pub preflight_bin: String,

    #[envconfig(
        from = "LONGSHORE_SUPPORT_BUNDLE_BIN",
        default = "support-bundle"
    )]
    pub support_bundle_bin: String,

    /// Directory holding versioned kubectl binaries (`kubectl-v<version>`).
    /// Empty disables version resolution.
    /// Env: LONGSHORE_BIN_DIR
    #[envconfig(from = "LONGSHORE_BIN_DIR", default = "")]
    pub bin_dir: String,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            kubectl_bin: "kubectl".into(),
            kustomize_bin: "kustomize".into(),
            helm_bin: "helm".into(),
            preflight_bin: "preflight".into(),
            support_bundle_bin: "support-bundle".into(),
            bin_dir: String::new(),
        }
    }
}
