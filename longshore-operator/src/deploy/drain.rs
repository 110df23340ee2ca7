//! Namespace draining.
//!
//! Clearing a namespace is a poll loop: every pass enumerates namespaced
//! resources, deletes the app's objects, and counts what is still present.
//! The loop ends when nothing remains or the attempt budget runs out.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::time::sleep;

use longshore_wire::{APP_SLUG_ANNOTATION, EXCLUDE_FROM_BACKUP_LABEL};

use super::DeployError;

pub const DRAIN_ATTEMPTS: u32 = 60;
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(2);

/// Resource plurals that are either virtual or self-expiring and must not
/// be swept.
const UNSWEEPABLE: [&str; 8] = [
    "bindings",
    "events",
    "controllerrevisions",
    "localsubjectaccessreviews",
    "selfsubjectaccessreviews",
    "selfsubjectrulesreviews",
    "subjectaccessreviews",
    "tokenreviews",
];

pub fn sweepable_resource(plural: &str) -> bool {
    !UNSWEEPABLE.contains(&plural)
}

/// What one sweep should do with an object it found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Belongs to the app; delete it and keep waiting for it to go away.
    Delete,
    /// Already terminating; keep waiting.
    AwaitDeletion,
    /// Belongs to the app but is spared by the restore exclusion; does not
    /// hold the drain open.
    Spare,
}

/// Classifies an object found during a sweep. `None` means the object does
/// not belong to the app at all.
pub fn classify(
    meta: &ObjectMeta,
    app_slug: &str,
    is_restore: bool,
) -> Option<Disposition> {
    let annotated = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(APP_SLUG_ANNOTATION))
        .is_some_and(|slug| slug == app_slug);
    if !annotated {
        return None;
    }
    if is_restore {
        let excluded = meta
            .labels
            .as_ref()
            .and_then(|l| l.get(EXCLUDE_FROM_BACKUP_LABEL))
            .is_some_and(|v| v == "true");
        if excluded {
            return Some(Disposition::Spare);
        }
    }
    if meta.deletion_timestamp.is_some() {
        return Some(Disposition::AwaitDeletion);
    }
    Some(Disposition::Delete)
}

/// Runs `sweep` until it reports zero remaining objects. Each sweep that
/// leaves objects behind is followed by a fixed pause; running out of
/// attempts is a hard error because later deploy steps assume the
/// namespace is empty.
pub async fn wait_for_drain<F, Fut>(
    namespace: &str,
    mut sweep: F,
) -> Result<(), DeployError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, DeployError>>,
{
    for attempt in 1..=DRAIN_ATTEMPTS {
        let remaining = sweep().await?;
        if remaining == 0 {
            return Ok(());
        }
        tracing::debug!(
            namespace,
            remaining,
            attempt,
            "namespace still holds app objects"
        );
        sleep(DRAIN_INTERVAL).await;
    }
    Err(DeployError::NamespaceClearTimeout {
        namespace: namespace.to_string(),
        attempts: DRAIN_ATTEMPTS,
    })
}
