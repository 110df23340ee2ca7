//! Stale-document diffing between consecutive deployments.

use std::collections::HashSet;

use super::cluster::OwnerWorkload;
use super::docs::{DocKey, ManifestDoc};

/// Workload kinds whose pods can reference claims slated for removal.
const PVC_OWNER_KINDS: [&str; 5] =
    ["Deployment", "StatefulSet", "Job", "CronJob", "Pod"];

pub struct DiffOptions<'a> {
    pub additional_namespaces: &'a [String],
    pub is_restore: bool,
}

/// Documents present in the previous deployment but absent from the current
/// one. Skips namespaces that moved into the additional set, and during a
/// restore skips anything excluded from backup.
pub fn removable_docs<'a>(
    previous: &'a [ManifestDoc],
    current: &[ManifestDoc],
    opts: &DiffOptions<'_>,
) -> Vec<&'a ManifestDoc> {
    let current_keys: HashSet<&DocKey> = current
        .iter()
        .filter(|d| d.identified())
        .map(|d| &d.key)
        .collect();
    previous
        .iter()
        .filter(|d| d.identified() && !current_keys.contains(&d.key))
        .filter(|d| {
            if d.is_namespace()
                && opts.additional_namespaces.iter().any(|ns| *ns == d.key.name)
            {
                return false;
            }
            !(opts.is_restore && d.excluded_from_backup())
        })
        .collect()
}

/// Workloads among the removable documents whose pods must be scanned for
/// claim references before anything is deleted.
pub fn pvc_owner_workloads(stale: &[&ManifestDoc]) -> Vec<OwnerWorkload> {
    stale
        .iter()
        .filter(|d| PVC_OWNER_KINDS.contains(&d.key.kind.as_str()))
        .map(|d| OwnerWorkload {
            api_version: d.key.api_version.clone(),
            kind: d.key.kind.clone(),
            name: d.key.name.clone(),
            namespace: d.key.namespace.clone(),
        })
        .collect()
}
