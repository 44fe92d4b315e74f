//! Access log subscription builder

use lattice_common::crd::{AccessLogPolicy, GATEWAY_API_GROUP};
use lattice_common::kube_utils::{is_being_deleted, NamespacedName};
use lattice_common::{Error, Result};
use tracing::{debug, instrument};

use super::service::resolve_service_name;
use super::BuildContext;
use crate::resources::{default_service_name, AccessLogSource, AccessLogSubscriptionSpec};
use crate::route::RouteKind;
use crate::stack::{ResourceId, ResourceKind, Stack};

/// Builds the access log subscription of an AccessLogPolicy
pub struct AccessLogSubscriptionBuilder<'a> {
    ctx: BuildContext<'a>,
}

impl<'a> AccessLogSubscriptionBuilder<'a> {
    /// Create an access log subscription builder
    pub fn new(ctx: BuildContext<'a>) -> Self {
        Self { ctx }
    }

    /// Build the subscription for a policy.
    ///
    /// Gateways log through their service network, routes through their
    /// service. A missing target only fails while the policy is live.
    #[instrument(skip(self, policy), fields(policy = %NamespacedName::of(policy)))]
    pub async fn build(&self, policy: &AccessLogPolicy) -> Result<Stack> {
        let policy_id = NamespacedName::of(policy);
        let is_deleted = is_being_deleted(policy);
        let target_ref = &policy.spec.target_ref;

        if !policy.spec.destination_arn.starts_with("arn:") {
            return Err(Error::validation_for_field(
                policy_id.to_string(),
                "spec.destinationArn",
                format!("{:?} is not an ARN", policy.spec.destination_arn),
            ));
        }
        if target_ref.group != GATEWAY_API_GROUP {
            return Err(Error::validation_for_field(
                policy_id.to_string(),
                "spec.targetRef.group",
                format!("unsupported target group {:?}", target_ref.group),
            ));
        }

        let namespace = target_ref
            .namespace
            .clone()
            .unwrap_or_else(|| policy_id.namespace.clone());

        let source = if target_ref.kind == "Gateway" {
            let gateway = self.ctx.reader.get_gateway(&namespace, &target_ref.name).await?;
            if gateway.is_none() && !is_deleted {
                return Err(Error::not_found(
                    "Gateway",
                    format!("{namespace}/{}", target_ref.name),
                ));
            }
            AccessLogSource::ServiceNetwork(target_ref.name.clone())
        } else {
            let kind = RouteKind::from_kind(&target_ref.kind)
                .filter(|k| *k != RouteKind::Tls)
                .ok_or_else(|| {
                    Error::validation_for_field(
                        policy_id.to_string(),
                        "spec.targetRef.kind",
                        format!("unsupported target kind {:?}", target_ref.kind),
                    )
                })?;
            let route = self
                .ctx
                .reader
                .get_route(kind, &namespace, &target_ref.name)
                .await?;
            match route {
                Some(route) => {
                    AccessLogSource::Service(resolve_service_name(self.ctx, &route).await?)
                }
                None if !is_deleted => {
                    return Err(Error::not_found(
                        kind.as_str(),
                        format!("{namespace}/{}", target_ref.name),
                    ))
                }
                // Route already gone: its service can only carry the default name
                None => {
                    AccessLogSource::Service(default_service_name(&target_ref.name, &namespace))
                }
            }
        };

        debug!(source = ?source, "resolved access log source");
        let mut stack = Stack::new(policy_id.clone());
        let spec = AccessLogSubscriptionSpec {
            source,
            destination_arn: policy.spec.destination_arn.clone(),
            policy: policy_id.clone(),
            is_deleted,
        };
        stack.add(
            ResourceId::derive(
                ResourceKind::AccessLogSubscription,
                &[&policy_id.namespace, &policy_id.name],
            ),
            spec,
        )?;
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, FixtureReader};
    use kube::api::ObjectMeta;
    use lattice_common::annotations;
    use lattice_common::crd::{AccessLogPolicySpec, PolicyTargetReference};

    fn policy(kind: &str, name: &str, arn: &str) -> AccessLogPolicy {
        AccessLogPolicy {
            metadata: ObjectMeta {
                name: Some("logs".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            spec: AccessLogPolicySpec {
                target_ref: PolicyTargetReference {
                    group: GATEWAY_API_GROUP.to_string(),
                    kind: kind.to_string(),
                    name: name.to_string(),
                    namespace: None,
                },
                destination_arn: arn.to_string(),
            },
            status: None,
        }
    }

    async fn build(
        reader: &FixtureReader,
        policy: &AccessLogPolicy,
    ) -> Result<AccessLogSubscriptionSpec> {
        let config = fixture::config();
        let stack = AccessLogSubscriptionBuilder::new(BuildContext::new(reader, &config))
            .build(policy)
            .await?;
        Ok(stack.list::<AccessLogSubscriptionSpec>()[0].spec.clone())
    }

    const BUCKET: &str = "arn:aws:s3:::access-logs";

    #[tokio::test]
    async fn story_gateway_policy_logs_service_network() {
        let (reader, _) = fixture::standard_graph();
        let spec = build(&reader, &policy("Gateway", "gw1", BUCKET))
            .await
            .expect("should build");
        assert_eq!(spec.source, AccessLogSource::ServiceNetwork("gw1".to_string()));
        assert_eq!(spec.destination_arn, BUCKET);
    }

    #[tokio::test]
    async fn story_route_policy_logs_service_with_override() {
        let (reader, route) = fixture::standard_graph();
        let spec = build(&reader, &policy("HTTPRoute", "svc1", BUCKET))
            .await
            .expect("should build");
        assert_eq!(spec.source, AccessLogSource::Service("svc1-ns1".to_string()));

        let mut overridden = match route {
            crate::route::Route::Http(r) => r,
            _ => unreachable!("standard graph uses an HTTPRoute"),
        };
        overridden.metadata.annotations = Some(
            [(annotations::SERVICE_NAME_OVERRIDE.to_string(), "checkout".to_string())].into(),
        );
        let reader = reader.with_route(overridden.into());
        let spec = build(&reader, &policy("HTTPRoute", "svc1", BUCKET))
            .await
            .expect("should build");
        assert_eq!(spec.source, AccessLogSource::Service("checkout".to_string()));
    }

    #[tokio::test]
    async fn story_deleted_policy_unsubscribes_the_overridden_service() {
        let (reader, route) = fixture::standard_graph();
        let mut overridden = match route {
            crate::route::Route::Http(r) => r,
            _ => unreachable!("standard graph uses an HTTPRoute"),
        };
        overridden.metadata.annotations = Some(
            [(annotations::SERVICE_NAME_OVERRIDE.to_string(), "checkout".to_string())].into(),
        );
        let reader = reader.with_route(overridden.into());

        let mut deleted = policy("HTTPRoute", "svc1", BUCKET);
        deleted.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        let spec = build(&reader, &deleted).await.expect("should build");

        assert!(spec.is_deleted);
        assert_eq!(spec.source, AccessLogSource::Service("checkout".to_string()));
    }

    #[tokio::test]
    async fn story_missing_target_fails_until_deleted() {
        let reader = FixtureReader::new();
        let err = build(&reader, &policy("Gateway", "gone", BUCKET))
            .await
            .expect_err("should fail");
        assert!(err.is_not_found());

        let mut deleted = policy("Gateway", "gone", BUCKET);
        deleted.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        let spec = build(&reader, &deleted).await.expect("should build");
        assert!(spec.is_deleted);
    }

    #[tokio::test]
    async fn story_invalid_policies_are_rejected() {
        let reader = FixtureReader::new();
        let err = build(&reader, &policy("Gateway", "gw1", "s3://bucket"))
            .await
            .expect_err("should fail");
        assert!(err.is_validation());

        let err = build(&reader, &policy("TLSRoute", "db", BUCKET))
            .await
            .expect_err("should fail");
        assert!(err.is_validation());
    }
}
