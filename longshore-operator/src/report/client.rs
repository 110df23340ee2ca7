//! HTTP client for the control plane's REST surface.

use longshore_wire::{AppStatus, CommandResult, DeployResult};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use super::ReportError;

pub const APP_STATUS_PATH: &str = "/api/v1/appstatus";

/// Authenticated client for result callbacks and status pushes. Auth is
/// HTTP basic with an empty username and the connection token as password.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl ControlPlaneClient {
    pub fn new(api_endpoint: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: api_endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// `PUT` a deploy outcome to the callback path the command named.
    /// The control plane acknowledges with 200.
    pub async fn put_deploy_result(
        &self,
        callback: &str,
        result: &DeployResult,
    ) -> Result<(), ReportError> {
        self.put_json(callback, result, StatusCode::OK).await
    }

    /// `PUT` a preflight or support-bundle outcome; acknowledged with 200.
    pub async fn put_command_result(
        &self,
        callback: &str,
        result: &CommandResult,
    ) -> Result<(), ReportError> {
        self.put_json(callback, result, StatusCode::OK).await
    }

    /// `PUT` an application status snapshot; acknowledged with 204.
    pub async fn put_app_status(
        &self,
        status: &AppStatus,
    ) -> Result<(), ReportError> {
        self.put_json(APP_STATUS_PATH, status, StatusCode::NO_CONTENT)
            .await
    }

    async fn put_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        success: StatusCode,
    ) -> Result<(), ReportError> {
        let url = if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        };
        let res = self
            .http
            .put(&url)
            .basic_auth("", Some(&self.token))
            .json(body)
            .send()
            .await?;
        let status = res.status();
        if status != success {
            return Err(ReportError::UnexpectedStatus { url, status });
        }
        debug!(%url, %status, "reported to control plane");
        Ok(())
    }
}
