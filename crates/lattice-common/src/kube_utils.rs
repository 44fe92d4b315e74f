//! Shared Kubernetes utilities
//!
//! Small helpers used across the builders and controllers: object identity,
//! not-found detection and stable hashing for persisted names.

use std::fmt;

use kube::{Resource, ResourceExt};

/// Namespace/name pair identifying a namespaced Kubernetes object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl NamespacedName {
    /// Create a new namespaced name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build from any namespaced kube resource; missing namespace maps to "default"
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Whether a kube error is an HTTP 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether the object carries a deletion timestamp
pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Read a single annotation value
pub fn annotation<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Truncate a string to at most `max` characters
pub fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function must be used whenever the hash is persisted (cloud resource
/// names, tags, stack IDs).
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    #[test]
    fn hash_is_stable_and_compact() {
        let a = deterministic_hash("tg1/ns1/svc1/ns1/false");
        let b = deterministic_hash("tg1/ns1/svc1/ns1/false");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, deterministic_hash("tg1/ns1/svc1/ns1/true"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("", 3), "");
    }

    #[test]
    fn namespaced_name_from_object() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("tg1".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let nn = NamespacedName::of(&svc);
        assert_eq!(nn.to_string(), "ns1/tg1");
        assert!(!is_being_deleted(&svc));
    }

    #[test]
    fn annotations_and_deletion() {
        let mut annotations = BTreeMap::new();
        annotations.insert("a".to_string(), "b".to_string());
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("tg1".to_string()),
                annotations: Some(annotations),
                deletion_timestamp: Some(Time(chrono::Utc::now())),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(annotation(&svc, "a"), Some("b"));
        assert_eq!(annotation(&svc, "missing"), None);
        assert!(is_being_deleted(&svc));
        assert_eq!(NamespacedName::of(&svc).namespace, "default");
    }
}
