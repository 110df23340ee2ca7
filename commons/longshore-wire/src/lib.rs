pub mod codec;
pub mod frame;
pub mod informer;
pub mod manifests;
pub mod result;
pub mod status;

pub use codec::*;
pub use frame::*;
pub use informer::*;
pub use manifests::*;
pub use result::*;
pub use status::*;

use thiserror::Error;

/// Annotation marking applied objects with their owning app slug; cleanup
/// passes identify ownership through it.
pub const APP_SLUG_ANNOTATION: &str = "kots.io/app-slug";

/// Label excluding an object from restore-time deletion.
pub const EXCLUDE_FROM_BACKUP_LABEL: &str = "velero.io/exclude-from-backup";

/// Annotation carrying job hook deletion policies.
pub const HOOK_DELETE_POLICY_ANNOTATION: &str = "kots.io/hook-delete-policy";
pub const HOOK_DELETE_ON_SUCCEEDED: &str = "hook-succeeded";
pub const HOOK_DELETE_ON_FAILED: &str = "hook-failed";

#[derive(Error, Debug)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid status informer '{0}', expected [namespace/]kind/name")]
    InformerFormat(String),
}
