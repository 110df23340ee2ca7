//! Manifest bundle decoding.
//!
//! Deploy commands carry base64-encoded multi-document YAML. Every document
//! is kept verbatim for kubectl, plus a parsed identity so stale documents
//! can be diffed against the previous deployment.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_yaml::Value;

use longshore_wire::EXCLUDE_FROM_BACKUP_LABEL;

use super::DeployError;

/// Identity of a rendered manifest document. Two documents describe the
/// same object only when all four fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct ManifestDoc {
    pub key: DocKey,
    /// Original document text, passed through to kubectl untouched.
    pub yaml: String,
    value: Value,
}

impl ManifestDoc {
    /// Documents without a kind and name cannot be diffed or deleted
    /// individually; they still participate in apply.
    pub fn identified(&self) -> bool {
        !self.key.kind.is_empty() && !self.key.name.is_empty()
    }

    pub fn is_crd(&self) -> bool {
        self.key.kind == "CustomResourceDefinition"
            && self.key.api_version.starts_with("apiextensions.k8s.io")
    }

    pub fn is_namespace(&self) -> bool {
        self.key.kind == "Namespace"
    }

    pub fn is_pvc(&self) -> bool {
        self.key.kind == "PersistentVolumeClaim"
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.value
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.get(key))
            .and_then(Value::as_str)
    }

    pub fn excluded_from_backup(&self) -> bool {
        self.label(EXCLUDE_FROM_BACKUP_LABEL) == Some("true")
    }
}

/// Decodes a base64 manifest bundle into its documents. An empty bundle is
/// valid and yields no documents.
pub fn decode_bundle(
    encoded: &str,
    target_namespace: &str,
) -> Result<Vec<ManifestDoc>, DeployError> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = BASE64.decode(encoded)?;
    let text = String::from_utf8(bytes)?;
    parse_docs(&text, target_namespace)
}

/// Splits multi-document YAML and parses each document's identity.
/// Documents that are pure comments or whitespace are dropped.
pub fn parse_docs(
    text: &str,
    target_namespace: &str,
) -> Result<Vec<ManifestDoc>, DeployError> {
    let mut docs = Vec::new();
    for chunk in split_documents(text) {
        let value: Value = serde_yaml::from_str(chunk)?;
        if value.is_null() {
            continue;
        }
        let api_version = str_field(&value, "apiVersion");
        let kind = str_field(&value, "kind");
        let metadata = value.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(target_namespace)
            .to_string();
        docs.push(ManifestDoc {
            key: DocKey { api_version, kind, name, namespace },
            yaml: chunk.trim().to_string(),
            value,
        });
    }
    Ok(docs)
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Splits on `---` separator lines. serde_yaml's multi-document support is
/// not used here because the original text of each document must survive
/// for kubectl.
fn split_documents(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    for (offset, line) in line_spans(text) {
        if line.trim_end() == "---" {
            chunks.push(&text[start..offset]);
            start = offset + line.len();
        }
    }
    chunks.push(&text[start..]);
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

fn line_spans(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |line| {
        let span = (offset, line);
        offset += line.len();
        span
    })
}

/// Partitions documents into the first-apply set (CRDs) and everything else.
pub fn split_first_apply(
    docs: &[ManifestDoc],
) -> (Vec<&ManifestDoc>, Vec<&ManifestDoc>) {
    docs.iter().partition(|d| d.is_crd())
}

/// Groups documents by target namespace, preserving both document order and
/// the order namespaces first appear. Each group re-joins its documents into
/// one multi-document stream for a single kubectl invocation.
pub fn group_by_namespace(docs: &[&ManifestDoc]) -> Vec<(String, String)> {
    let mut groups: Vec<(String, Vec<&str>)> = Vec::new();
    for doc in docs {
        match groups.iter_mut().find(|(ns, _)| *ns == doc.key.namespace) {
            Some((_, members)) => members.push(&doc.yaml),
            None => groups.push((doc.key.namespace.clone(), vec![&doc.yaml])),
        }
    }
    groups
        .into_iter()
        .map(|(ns, members)| (ns, members.join("\n---\n")))
        .collect()
}
