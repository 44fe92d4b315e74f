//! In-memory mesh backend
//!
//! Enforces the constraints synthesis must respect: unique names, unique rule
//! priorities per listener, and no deletion of resources still in use. Used
//! by dry runs and tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use lattice_common::crd::HealthCheckConfig;

use crate::api::{
    AccessLogSubscriptionInput, AccessLogSubscriptionRecord, ActionRecord, ApiError, ApiResult,
    LatticeApi, ListenerInput, ListenerRecord, RuleInput, RuleRecord, ServiceInput,
    ServiceNetworkAssociationRecord, ServiceNetworkInput, ServiceNetworkRecord, ServiceRecord,
    Tags, TargetGroupInput, TargetGroupRecord, TargetRecord, VpcAssociationRecord,
};

/// Mesh API backed by process memory
#[derive(Debug)]
pub struct InMemoryLatticeApi {
    account_id: String,
    region: String,
    next_id: AtomicU64,
    mutations: AtomicUsize,
    service_networks: DashMap<String, ServiceNetworkRecord>,
    vpc_associations: DashMap<String, VpcAssociationRecord>,
    services: DashMap<String, ServiceRecord>,
    associations: DashMap<String, ServiceNetworkAssociationRecord>,
    listeners: DashMap<String, ListenerRecord>,
    rules: DashMap<String, RuleRecord>,
    target_groups: DashMap<String, TargetGroupRecord>,
    targets: DashMap<String, BTreeSet<TargetRecord>>,
    subscriptions: DashMap<String, AccessLogSubscriptionRecord>,
}

fn sorted<T: Clone>(map: &DashMap<String, T>, keep: impl Fn(&T) -> bool) -> Vec<T> {
    let mut entries: Vec<(String, T)> = map
        .iter()
        .filter(|e| keep(e.value()))
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().map(|(_, v)| v).collect()
}

fn forwards_to(action: &ActionRecord, target_group_id: &str) -> bool {
    match action {
        ActionRecord::Forward(targets) => {
            targets.iter().any(|t| t.target_group_id == target_group_id)
        }
        ActionRecord::FixedResponse { .. } => false,
    }
}

impl InMemoryLatticeApi {
    /// Create an empty backend for the given account and region
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            next_id: AtomicU64::new(1),
            mutations: AtomicUsize::new(0),
            service_networks: DashMap::new(),
            vpc_associations: DashMap::new(),
            services: DashMap::new(),
            associations: DashMap::new(),
            listeners: DashMap::new(),
            rules: DashMap::new(),
            target_groups: DashMap::new(),
            targets: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    fn id(&self, prefix: &str) -> String {
        format!("{prefix}-{:017x}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn arn(&self, path: &str) -> String {
        format!(
            "arn:aws:vpc-lattice:{}:{}:{path}",
            self.region, self.account_id
        )
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of mutating calls served so far
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Every service network
    pub fn service_networks(&self) -> Vec<ServiceNetworkRecord> {
        sorted(&self.service_networks, |_| true)
    }

    /// Every VPC association
    pub fn vpc_associations(&self) -> Vec<VpcAssociationRecord> {
        sorted(&self.vpc_associations, |_| true)
    }

    /// Every service
    pub fn services(&self) -> Vec<ServiceRecord> {
        sorted(&self.services, |_| true)
    }

    /// Every service network association
    pub fn service_network_associations(&self) -> Vec<ServiceNetworkAssociationRecord> {
        sorted(&self.associations, |_| true)
    }

    /// Every listener
    pub fn listeners(&self) -> Vec<ListenerRecord> {
        sorted(&self.listeners, |_| true)
    }

    /// Every rule
    pub fn rules(&self) -> Vec<RuleRecord> {
        sorted(&self.rules, |_| true)
    }

    /// Every target group
    pub fn target_groups(&self) -> Vec<TargetGroupRecord> {
        sorted(&self.target_groups, |_| true)
    }

    /// Targets of one group, sorted
    pub fn targets(&self, target_group_id: &str) -> Vec<TargetRecord> {
        self.targets
            .get(target_group_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every access log subscription
    pub fn access_log_subscriptions(&self) -> Vec<AccessLogSubscriptionRecord> {
        sorted(&self.subscriptions, |_| true)
    }

    fn check_priority(&self, input: &RuleInput, rule_id: Option<&str>) -> ApiResult<()> {
        let taken = self.rules.iter().any(|r| {
            r.rule.listener_id == input.listener_id
                && r.rule.priority == input.priority
                && Some(r.id.as_str()) != rule_id
        });
        if taken {
            return Err(ApiError::Conflict(format!(
                "priority {} already in use on listener {}",
                input.priority, input.listener_id
            )));
        }
        if !(1..=100).contains(&input.priority) {
            return Err(ApiError::Validation(format!(
                "priority {} out of range",
                input.priority
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LatticeApi for InMemoryLatticeApi {
    async fn find_service_network(&self, name: &str) -> ApiResult<Option<ServiceNetworkRecord>> {
        Ok(sorted(&self.service_networks, |n| n.network.name == name)
            .into_iter()
            .next())
    }

    async fn create_service_network(
        &self,
        input: ServiceNetworkInput,
    ) -> ApiResult<ServiceNetworkRecord> {
        if self.service_networks.iter().any(|n| n.network.name == input.name) {
            return Err(ApiError::Conflict(format!(
                "service network {} already exists",
                input.name
            )));
        }
        let id = self.id("sn");
        let record = ServiceNetworkRecord {
            arn: self.arn(&format!("servicenetwork/{id}")),
            id: id.clone(),
            network: input,
        };
        self.service_networks.insert(id, record.clone());
        self.mutated();
        Ok(record)
    }

    async fn update_service_network(
        &self,
        id: &str,
        input: ServiceNetworkInput,
    ) -> ApiResult<ServiceNetworkRecord> {
        let mut record = self
            .service_networks
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("service network {id}")))?;
        record.network = input;
        self.mutated();
        Ok(record.clone())
    }

    async fn delete_service_network(&self, id: &str) -> ApiResult<()> {
        let in_use = self.vpc_associations.iter().any(|a| a.service_network_id == id)
            || self.associations.iter().any(|a| a.service_network_id == id);
        if in_use {
            return Err(ApiError::Conflict(format!(
                "service network {id} has associations"
            )));
        }
        self.service_networks
            .remove(id)
            .ok_or_else(|| ApiError::NotFound(format!("service network {id}")))?;
        self.mutated();
        Ok(())
    }

    async fn find_vpc_association(
        &self,
        service_network_id: &str,
        vpc_id: &str,
    ) -> ApiResult<Option<VpcAssociationRecord>> {
        Ok(sorted(&self.vpc_associations, |a| {
            a.service_network_id == service_network_id && a.vpc_id == vpc_id
        })
        .into_iter()
        .next())
    }

    async fn create_vpc_association(
        &self,
        service_network_id: &str,
        vpc_id: &str,
        security_group_ids: Vec<String>,
        tags: Tags,
    ) -> ApiResult<VpcAssociationRecord> {
        if !self.service_networks.contains_key(service_network_id) {
            return Err(ApiError::NotFound(format!(
                "service network {service_network_id}"
            )));
        }
        let id = self.id("snva");
        let record = VpcAssociationRecord {
            id: id.clone(),
            service_network_id: service_network_id.to_string(),
            vpc_id: vpc_id.to_string(),
            security_group_ids,
            tags,
        };
        self.vpc_associations.insert(id, record.clone());
        self.mutated();
        Ok(record)
    }

    async fn update_vpc_association(
        &self,
        id: &str,
        security_group_ids: Vec<String>,
    ) -> ApiResult<()> {
        let mut record = self
            .vpc_associations
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("vpc association {id}")))?;
        record.security_group_ids = security_group_ids;
        self.mutated();
        Ok(())
    }

    async fn delete_vpc_association(&self, id: &str) -> ApiResult<()> {
        self.vpc_associations
            .remove(id)
            .ok_or_else(|| ApiError::NotFound(format!("vpc association {id}")))?;
        self.mutated();
        Ok(())
    }

    async fn find_service(&self, name: &str) -> ApiResult<Option<ServiceRecord>> {
        Ok(sorted(&self.services, |s| s.service.name == name)
            .into_iter()
            .next())
    }

    async fn create_service(&self, input: ServiceInput) -> ApiResult<ServiceRecord> {
        if self.services.iter().any(|s| s.service.name == input.name) {
            return Err(ApiError::Conflict(format!(
                "service {} already exists",
                input.name
            )));
        }
        let id = self.id("svc");
        let record = ServiceRecord {
            arn: self.arn(&format!("service/{id}")),
            dns_name: format!("{}-{id}.vpc-lattice-svcs.{}.on.aws", input.name, self.region),
            id: id.clone(),
            service: input,
        };
        self.services.insert(id, record.clone());
        self.mutated();
        Ok(record)
    }

    async fn update_service(&self, id: &str, input: ServiceInput) -> ApiResult<ServiceRecord> {
        let mut record = self
            .services
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("service {id}")))?;
        record.service = input;
        self.mutated();
        Ok(record.clone())
    }

    async fn delete_service(&self, id: &str) -> ApiResult<()> {
        let in_use = self.listeners.iter().any(|l| l.listener.service_id == id)
            || self.associations.iter().any(|a| a.service_id == id);
        if in_use {
            return Err(ApiError::Conflict(format!(
                "service {id} has listeners or associations"
            )));
        }
        self.services
            .remove(id)
            .ok_or_else(|| ApiError::NotFound(format!("service {id}")))?;
        self.mutated();
        Ok(())
    }

    async fn list_service_network_associations(
        &self,
        service_id: &str,
    ) -> ApiResult<Vec<ServiceNetworkAssociationRecord>> {
        Ok(sorted(&self.associations, |a| a.service_id == service_id))
    }

    async fn create_service_network_association(
        &self,
        service_id: &str,
        service_network_id: &str,
        _tags: Tags,
    ) -> ApiResult<ServiceNetworkAssociationRecord> {
        if !self.services.contains_key(service_id) {
            return Err(ApiError::NotFound(format!("service {service_id}")));
        }
        if !self.service_networks.contains_key(service_network_id) {
            return Err(ApiError::NotFound(format!(
                "service network {service_network_id}"
            )));
        }
        let id = self.id("snsa");
        let record = ServiceNetworkAssociationRecord {
            id: id.clone(),
            service_id: service_id.to_string(),
            service_network_id: service_network_id.to_string(),
        };
        self.associations.insert(id, record.clone());
        self.mutated();
        Ok(record)
    }

    async fn delete_service_network_association(&self, id: &str) -> ApiResult<()> {
        self.associations
            .remove(id)
            .ok_or_else(|| ApiError::NotFound(format!("service network association {id}")))?;
        self.mutated();
        Ok(())
    }

    async fn list_listeners(&self, service_id: &str) -> ApiResult<Vec<ListenerRecord>> {
        Ok(sorted(&self.listeners, |l| l.listener.service_id == service_id))
    }

    async fn create_listener(&self, input: ListenerInput) -> ApiResult<ListenerRecord> {
        if !self.services.contains_key(&input.service_id) {
            return Err(ApiError::NotFound(format!("service {}", input.service_id)));
        }
        let clash = self.listeners.iter().any(|l| {
            l.listener.service_id == input.service_id
                && (l.listener.name == input.name || l.listener.port == input.port)
        });
        if clash {
            return Err(ApiError::Conflict(format!(
                "listener {} or port {} already exists",
                input.name, input.port
            )));
        }
        let id = self.id("listener");
        let record = ListenerRecord {
            arn: self.arn(&format!("service/{}/listener/{id}", input.service_id)),
            id: id.clone(),
            listener: input,
        };
        self.listeners.insert(id, record.clone());
        self.mutated();
        Ok(record)
    }

    async fn update_listener(
        &self,
        _service_id: &str,
        listener_id: &str,
        default_action: ActionRecord,
    ) -> ApiResult<()> {
        let mut record = self
            .listeners
            .get_mut(listener_id)
            .ok_or_else(|| ApiError::NotFound(format!("listener {listener_id}")))?;
        record.listener.default_action = default_action;
        self.mutated();
        Ok(())
    }

    async fn delete_listener(&self, _service_id: &str, listener_id: &str) -> ApiResult<()> {
        if self.rules.iter().any(|r| r.rule.listener_id == listener_id) {
            return Err(ApiError::Conflict(format!(
                "listener {listener_id} still has rules"
            )));
        }
        self.listeners
            .remove(listener_id)
            .ok_or_else(|| ApiError::NotFound(format!("listener {listener_id}")))?;
        self.mutated();
        Ok(())
    }

    async fn list_rules(&self, _service_id: &str, listener_id: &str) -> ApiResult<Vec<RuleRecord>> {
        Ok(sorted(&self.rules, |r| r.rule.listener_id == listener_id))
    }

    async fn create_rule(&self, input: RuleInput) -> ApiResult<RuleRecord> {
        if !self.listeners.contains_key(&input.listener_id) {
            return Err(ApiError::NotFound(format!("listener {}", input.listener_id)));
        }
        self.check_priority(&input, None)?;
        let id = self.id("rule");
        let record = RuleRecord {
            arn: self.arn(&format!(
                "service/{}/listener/{}/rule/{id}",
                input.service_id, input.listener_id
            )),
            id: id.clone(),
            rule: input,
        };
        self.rules.insert(id, record.clone());
        self.mutated();
        Ok(record)
    }

    async fn update_rule(&self, rule_id: &str, input: RuleInput) -> ApiResult<RuleRecord> {
        self.check_priority(&input, Some(rule_id))?;
        let mut record = self
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| ApiError::NotFound(format!("rule {rule_id}")))?;
        record.rule = input;
        self.mutated();
        Ok(record.clone())
    }

    async fn delete_rule(
        &self,
        _service_id: &str,
        _listener_id: &str,
        rule_id: &str,
    ) -> ApiResult<()> {
        self.rules
            .remove(rule_id)
            .ok_or_else(|| ApiError::NotFound(format!("rule {rule_id}")))?;
        self.mutated();
        Ok(())
    }

    async fn find_target_group(&self, name: &str) -> ApiResult<Option<TargetGroupRecord>> {
        Ok(sorted(&self.target_groups, |tg| tg.target_group.name == name)
            .into_iter()
            .next())
    }

    async fn list_target_groups(&self) -> ApiResult<Vec<TargetGroupRecord>> {
        Ok(self.target_groups())
    }

    async fn create_target_group(&self, input: TargetGroupInput) -> ApiResult<TargetGroupRecord> {
        if self.target_groups.iter().any(|tg| tg.target_group.name == input.name) {
            return Err(ApiError::Conflict(format!(
                "target group {} already exists",
                input.name
            )));
        }
        let id = self.id("tg");
        let record = TargetGroupRecord {
            arn: self.arn(&format!("targetgroup/{id}")),
            id: id.clone(),
            target_group: input,
        };
        self.target_groups.insert(id, record.clone());
        self.mutated();
        Ok(record)
    }

    async fn update_target_group(
        &self,
        id: &str,
        health_check: Option<HealthCheckConfig>,
    ) -> ApiResult<()> {
        let mut record = self
            .target_groups
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("target group {id}")))?;
        record.target_group.health_check = health_check;
        self.mutated();
        Ok(())
    }

    async fn delete_target_group(&self, id: &str) -> ApiResult<()> {
        let in_use = self
            .listeners
            .iter()
            .any(|l| forwards_to(&l.listener.default_action, id))
            || self.rules.iter().any(|r| forwards_to(&r.rule.action, id));
        if in_use {
            return Err(ApiError::Conflict(format!("target group {id} is in use")));
        }
        if self.targets.get(id).is_some_and(|t| !t.is_empty()) {
            return Err(ApiError::Conflict(format!(
                "target group {id} has registered targets"
            )));
        }
        self.target_groups
            .remove(id)
            .ok_or_else(|| ApiError::NotFound(format!("target group {id}")))?;
        self.targets.remove(id);
        self.mutated();
        Ok(())
    }

    async fn list_targets(&self, target_group_id: &str) -> ApiResult<Vec<TargetRecord>> {
        if !self.target_groups.contains_key(target_group_id) {
            return Err(ApiError::NotFound(format!("target group {target_group_id}")));
        }
        Ok(self.targets(target_group_id))
    }

    async fn register_targets(
        &self,
        target_group_id: &str,
        targets: Vec<TargetRecord>,
    ) -> ApiResult<()> {
        if !self.target_groups.contains_key(target_group_id) {
            return Err(ApiError::NotFound(format!("target group {target_group_id}")));
        }
        self.targets
            .entry(target_group_id.to_string())
            .or_default()
            .extend(targets);
        self.mutated();
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group_id: &str,
        targets: Vec<TargetRecord>,
    ) -> ApiResult<()> {
        if let Some(mut live) = self.targets.get_mut(target_group_id) {
            for target in &targets {
                live.remove(target);
            }
        }
        self.mutated();
        Ok(())
    }

    async fn list_access_log_subscriptions(
        &self,
        resource_arn: &str,
    ) -> ApiResult<Vec<AccessLogSubscriptionRecord>> {
        Ok(sorted(&self.subscriptions, |s| {
            s.subscription.resource_arn == resource_arn
        }))
    }

    async fn create_access_log_subscription(
        &self,
        input: AccessLogSubscriptionInput,
    ) -> ApiResult<AccessLogSubscriptionRecord> {
        let id = self.id("als");
        let record = AccessLogSubscriptionRecord {
            arn: self.arn(&format!("accesslogsubscription/{id}")),
            id: id.clone(),
            subscription: input,
        };
        self.subscriptions.insert(id, record.clone());
        self.mutated();
        Ok(record)
    }

    async fn update_access_log_subscription(
        &self,
        id: &str,
        destination_arn: &str,
    ) -> ApiResult<()> {
        let mut record = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("access log subscription {id}")))?;
        record.subscription.destination_arn = destination_arn.to_string();
        self.mutated();
        Ok(())
    }

    async fn delete_access_log_subscription(&self, id: &str) -> ApiResult<()> {
        self.subscriptions
            .remove(id)
            .ok_or_else(|| ApiError::NotFound(format!("access log subscription {id}")))?;
        self.mutated();
        Ok(())
    }
}
