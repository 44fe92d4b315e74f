//! Custom Resource Definitions read and written by the controller

mod gateway_api;
mod multicluster;
mod policy;

pub use gateway_api::*;
pub use multicluster::*;
pub use policy::*;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// CRDs owned by this controller (Gateway API CRDs are installed upstream)
pub fn owned_crds() -> Vec<CustomResourceDefinition> {
    vec![
        TargetGroupPolicy::crd(),
        VpcAssociationPolicy::crd(),
        AccessLogPolicy::crd(),
        IAMAuthPolicy::crd(),
        ServiceExport::crd(),
        ServiceImport::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_crd_names_are_unique() {
        let mut names: Vec<String> = owned_crds()
            .into_iter()
            .map(|crd| crd.metadata.name.unwrap_or_default())
            .collect();
        let len = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), len);
        assert!(names.contains(&"targetgrouppolicies.application-networking.k8s.aws".to_string()));
    }
}
