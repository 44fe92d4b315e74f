//! Process-wide record of what references each target group
//!
//! A target group may be wanted by route backend references and by a
//! ServiceExport at the same time. It is only deleted once neither wants it.

use dashmap::DashMap;
use lattice_model::resources::TargetGroupOrigin;

/// Which kinds of source currently reference a target group
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReferencedBy {
    /// Referenced by a route backend reference
    pub by_backend_ref: bool,
    /// Referenced by a ServiceExport
    pub by_service_export: bool,
}

impl ReferencedBy {
    /// Whether anything references the group
    pub fn is_referenced(&self) -> bool {
        self.by_backend_ref || self.by_service_export
    }

    fn set(&mut self, origin: TargetGroupOrigin, referenced: bool) {
        match origin {
            TargetGroupOrigin::BackendRef => self.by_backend_ref = referenced,
            TargetGroupOrigin::ServiceExport => self.by_service_export = referenced,
        }
    }
}

/// Reference flags keyed by target group name
#[derive(Debug, Default)]
pub struct TargetGroupRegistry {
    entries: DashMap<String, ReferencedBy>,
}

impl TargetGroupRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether a source of the given origin references the group,
    /// returning the combined state. Unreferenced entries are dropped.
    pub fn mark(&self, name: &str, origin: TargetGroupOrigin, referenced: bool) -> ReferencedBy {
        let mut entry = self.entries.entry(name.to_string()).or_default();
        entry.set(origin, referenced);
        let state = *entry;
        drop(entry);
        if !state.is_referenced() {
            self.entries.remove_if(name, |_, v| !v.is_referenced());
        }
        state
    }

    /// Current state of a group
    pub fn get(&self, name: &str) -> ReferencedBy {
        self.entries.get(name).map(|e| *e).unwrap_or_default()
    }

    /// Number of tracked groups
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no group is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_survives_until_both_sources_release_it() {
        let registry = TargetGroupRegistry::new();
        registry.mark("k8s-tg1", TargetGroupOrigin::BackendRef, true);
        registry.mark("k8s-tg1", TargetGroupOrigin::ServiceExport, true);

        let state = registry.mark("k8s-tg1", TargetGroupOrigin::BackendRef, false);
        assert!(state.is_referenced());
        assert!(state.by_service_export);

        let state = registry.mark("k8s-tg1", TargetGroupOrigin::ServiceExport, false);
        assert!(!state.is_referenced());
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_group_is_unreferenced() {
        let registry = TargetGroupRegistry::new();
        assert_eq!(registry.get("missing"), ReferencedBy::default());
        assert!(!registry.mark("missing", TargetGroupOrigin::BackendRef, false).is_referenced());
        assert_eq!(registry.len(), 0);
    }
}
