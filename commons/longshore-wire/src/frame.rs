use serde::{Deserialize, Serialize};

use crate::manifests::ApplicationManifests;

/// Frames the control plane sends to the operator. The `event` tag mirrors
/// the command name; `payload` carries the command body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ControlFrame {
    /// Connection acknowledgement, expected shortly after `hello`.
    Welcome(Welcome),
    /// Heartbeat reply.
    Pong,
    /// Desired-state deploy command.
    Deploy(Box<ApplicationManifests>),
    /// Replaces the set of resources whose health is tracked for an app.
    AppInformers(AppInformersSpec),
    Preflight(PreflightRequest),
    SupportBundle(SupportBundleRequest),
}

/// Frames the operator sends to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum OperatorFrame {
    /// First frame after connect; authenticates the cluster connection.
    Hello(Hello),
    /// Heartbeat.
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub token: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// Heartbeat interval the server wants; the operator defaults to 25s
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInformersSpec {
    pub app_id: String,
    /// `[namespace/]kind/name` strings, parsed via [`crate::StatusInformer`].
    pub informers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightRequest {
    pub app_id: String,
    /// Location of the preflight spec handed to the preflight binary.
    pub uri: String,
    #[serde(default)]
    pub ignore_permissions: bool,
    pub result_callback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportBundleRequest {
    pub app_id: String,
    pub uri: String,
    pub result_callback: String,
}
