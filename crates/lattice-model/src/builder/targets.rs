//! Targets builder: endpoint selection from EndpointSlices

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use lattice_common::kube_utils::NamespacedName;
use lattice_common::Result;
use tracing::debug;

use super::BuildContext;
use crate::resources::{Target, TargetsSpec};
use crate::stack::{ResourceId, ResourceKind, Stack};

/// Builds the targets of one target group
pub(crate) struct TargetsBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> TargetsBuilder<'a> {
    pub(crate) fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    /// Add the targets of `target_group`.
    ///
    /// A missing or deleted backend yields an empty target list so stale
    /// endpoints get deregistered.
    pub(crate) async fn build(
        &self,
        stack: &mut Stack,
        target_group: &ResourceId,
        service: Option<&Service>,
        declared_port: Option<i32>,
        is_deleted: bool,
    ) -> Result<ResourceId> {
        let targets = match service {
            Some(service) if !is_deleted => {
                let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
                let slices = self
                    .ctx
                    .reader
                    .list_endpoint_slices(&namespace, &service.name_any())
                    .await?;
                select_targets(service, declared_port, &slices)
            }
            _ => Vec::new(),
        };

        debug!(target_group = %target_group, count = targets.len(), "selected targets");
        let id = ResourceId::derive(ResourceKind::Targets, &[target_group.as_str()]);
        stack.add(
            id,
            TargetsSpec {
                target_group: target_group.clone(),
                targets,
            },
        )
    }
}

/// Select the endpoints to register for a service.
///
/// With a declared port that maps to a named service port, only endpoint
/// ports of that name qualify. Without a declared port, or when the service
/// exposes a single unnamed port, every endpoint port qualifies whatever the
/// declared port is.
/// Terminating endpoints never qualify.
pub fn select_targets(
    service: &Service,
    declared_port: Option<i32>,
    slices: &[EndpointSlice],
) -> Vec<Target> {
    let service_ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default();

    let single_unnamed = matches!(
        service_ports,
        [only] if only.name.as_deref().map_or(true, str::is_empty)
    );

    // None: every endpoint port qualifies
    let required_name: Option<Option<&str>> = if single_unnamed {
        None
    } else {
        declared_port.and_then(|port| match service_ports.iter().find(|sp| sp.port == port) {
            Some(sp) => sp.name.as_deref().filter(|n| !n.is_empty()).map(Some),
            None => Some(None),
        })
    };

    let mut targets = Vec::new();
    for slice in slices {
        for endpoint_port in slice.ports.iter().flatten() {
            let Some(port) = endpoint_port.port else {
                continue;
            };
            if let Some(required) = required_name {
                if required.is_none() || endpoint_port.name.as_deref() != required {
                    continue;
                }
            }

            for endpoint in &slice.endpoints {
                let conditions = endpoint.conditions.as_ref();
                if conditions.and_then(|c| c.terminating).unwrap_or(false) {
                    continue;
                }
                let ready = conditions.and_then(|c| c.ready).unwrap_or(true);
                let pod = endpoint
                    .target_ref
                    .as_ref()
                    .filter(|r| r.kind.as_deref() == Some("Pod"))
                    .and_then(|r| {
                        Some(NamespacedName::new(
                            r.namespace.clone().unwrap_or_default(),
                            r.name.clone()?,
                        ))
                    });

                targets.extend(endpoint.addresses.iter().map(|ip| Target {
                    ip: ip.clone(),
                    port,
                    ready,
                    pod: pod.clone(),
                }));
            }
        }
    }

    targets.sort();
    targets.dedup();
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{endpoint_slice, ready, service, Address};

    fn ports(targets: &[Target]) -> Vec<(&str, i32)> {
        targets.iter().map(|t| (t.ip.as_str(), t.port)).collect()
    }

    #[test]
    fn named_port_matches_by_name() {
        let svc = service("ns1", "web", &[(Some("http"), 80), (Some("admin"), 9090)]);
        let slices = vec![endpoint_slice(
            "ns1",
            "web",
            &[(Some("http"), 8080), (Some("admin"), 9091)],
            &[ready("10.0.0.1")],
        )];

        assert_eq!(ports(&select_targets(&svc, Some(80), &slices)), vec![("10.0.0.1", 8080)]);
        assert_eq!(ports(&select_targets(&svc, Some(9090), &slices)), vec![("10.0.0.1", 9091)]);
        assert_eq!(
            ports(&select_targets(&svc, None, &slices)),
            vec![("10.0.0.1", 8080), ("10.0.0.1", 9091)]
        );
        assert!(select_targets(&svc, Some(443), &slices).is_empty());
    }

    #[test]
    fn unnamed_port_skips_name_matching() {
        let svc = service("ns1", "web", &[(None, 80)]);
        let slices = vec![endpoint_slice(
            "ns1",
            "web",
            &[(None, 8080)],
            &[ready("10.0.0.2"), ready("10.0.0.1")],
        )];
        let targets = select_targets(&svc, Some(80), &slices);
        assert_eq!(ports(&targets), vec![("10.0.0.1", 8080), ("10.0.0.2", 8080)]);
        assert_eq!(targets[0].pod, Some(NamespacedName::new("ns1", "web-1")));
    }

    #[test]
    fn single_unnamed_port_ignores_a_mismatched_declared_port() {
        let svc = service("ns1", "web", &[(None, 80)]);
        let slices = vec![endpoint_slice(
            "ns1",
            "web",
            &[(None, 8080)],
            &[ready("10.0.0.1"), ready("10.0.0.2")],
        )];
        let targets = select_targets(&svc, Some(81), &slices);
        assert_eq!(ports(&targets), vec![("10.0.0.1", 8080), ("10.0.0.2", 8080)]);
    }

    #[test]
    fn terminating_endpoints_are_excluded_even_when_ready() {
        let svc = service("ns1", "web", &[(None, 80)]);
        let slices = vec![endpoint_slice(
            "ns1",
            "web",
            &[(None, 8080)],
            &[
                Address {
                    ip: "10.0.0.1",
                    ready: true,
                    terminating: true,
                },
                Address {
                    ip: "10.0.0.2",
                    ready: false,
                    terminating: false,
                },
            ],
        )];
        let targets = select_targets(&svc, None, &slices);
        assert_eq!(ports(&targets), vec![("10.0.0.2", 8080)]);
        assert!(!targets[0].ready);
    }
}
