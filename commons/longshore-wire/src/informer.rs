use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WireError;

/// One resource whose health the control plane wants tracked, parsed from
/// `[namespace/]kind/name`. A missing namespace stays empty until
/// [`StatusInformer::normalize`] fills in the deploy target namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInformer {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

/// Canonical kind names for the shorthand and plural spellings accepted in
/// informer strings. Unknown kinds pass through lowercased.
pub fn canonical_kind(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "deploy" | "deployments" => "deployment",
        "sts" | "statefulsets" => "statefulset",
        "svc" | "services" => "service",
        "ing" | "ingresses" => "ingress",
        "pvc" | "persistentvolumeclaims" => "persistentvolumeclaim",
        other => other,
    };
    canonical.to_string()
}

impl StatusInformer {
    /// Apply canonical kind naming and default an empty namespace to the
    /// deploy target namespace.
    pub fn normalize(mut self, default_namespace: &str) -> Self {
        self.kind = canonical_kind(&self.kind);
        if self.namespace.is_empty() {
            self.namespace = default_namespace.to_string();
        }
        self
    }
}

impl FromStr for StatusInformer {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let (namespace, kind, name) = match parts.as_slice() {
            [kind, name] => ("", *kind, *name),
            [ns, kind, name] => (*ns, *kind, *name),
            _ => return Err(WireError::InformerFormat(s.to_string())),
        };
        if kind.is_empty() || name.is_empty() {
            return Err(WireError::InformerFormat(s.to_string()));
        }
        Ok(StatusInformer {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }
}
