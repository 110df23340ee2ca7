use serde::{Deserialize, Serialize};

/// Outcome of one deploy command, PUT to the command's result callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub app_id: String,
    pub is_error: bool,
    pub dryrun_stdout: String,
    pub dryrun_stderr: String,
    pub apply_stdout: String,
    pub apply_stderr: String,
    pub helm_stdout: String,
    pub helm_stderr: String,
}

impl DeployResult {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Default::default()
        }
    }
}

/// Outcome of a preflight or support-bundle command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub app_id: String,
    pub is_error: bool,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_result_uses_camel_case_keys() {
        let mut r = DeployResult::new("a1");
        r.is_error = true;
        r.dryrun_stderr = "boom".into();
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["appId"], "a1");
        assert_eq!(v["isError"], true);
        assert_eq!(v["dryrunStderr"], "boom");
        assert!(v.get("dryrun_stderr").is_none());
    }
}
