use std::collections::BTreeMap;

use extension_api::gcp::{InfrastructureStatus, NetworkStatus, Subnet, SubnetPurpose, VpcStatus};
use extension_core::{CoreError, Result};

use crate::values::{
    TERRAFORMER_OUTPUT_KEY_CLOUD_ROUTER, TERRAFORMER_OUTPUT_KEY_SERVICE_ACCOUNT_EMAIL,
    TERRAFORMER_OUTPUT_KEY_SUBNET_INTERNAL, TERRAFORMER_OUTPUT_KEY_SUBNET_NODES,
    TERRAFORMER_OUTPUT_KEY_VPC_NAME,
};

/// Derive the provider status from Terraformer output variables.
///
/// The internal subnet and cloud router only appear if their outputs are present.
pub fn infrastructure_status_from_outputs(outputs: &BTreeMap<String, String>) -> Result<InfrastructureStatus> {
    let required = |key: &str| {
        outputs
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::VariablesNotFound(vec![key.to_string()]))
    };

    let mut subnets = vec![Subnet {
        name: required(TERRAFORMER_OUTPUT_KEY_SUBNET_NODES)?,
        purpose: SubnetPurpose::Nodes,
    }];
    if let Some(internal) = outputs.get(TERRAFORMER_OUTPUT_KEY_SUBNET_INTERNAL) {
        subnets.push(Subnet {
            name: internal.clone(),
            purpose: SubnetPurpose::Internal,
        });
    }

    Ok(InfrastructureStatus::new(
        NetworkStatus {
            vpc: VpcStatus {
                name: required(TERRAFORMER_OUTPUT_KEY_VPC_NAME)?,
                cloud_router: outputs.get(TERRAFORMER_OUTPUT_KEY_CLOUD_ROUTER).cloned(),
            },
            subnets,
        },
        required(TERRAFORMER_OUTPUT_KEY_SERVICE_ACCOUNT_EMAIL)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use extension_api::gcp::API_VERSION;

    fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_status_with_internal_subnet() {
        let status = infrastructure_status_from_outputs(&outputs(&[
            ("vpc_name", "vpc-name"),
            ("service_account_email", "gardener@cloud"),
            ("subnet_nodes", "nodes-subnet"),
            ("subnet_internal", "internal"),
        ]))
        .unwrap();

        assert_eq!(status.api_version, API_VERSION);
        assert_eq!(status.kind, "InfrastructureStatus");
        assert_eq!(status.networks.vpc.name, "vpc-name");
        assert_eq!(status.networks.vpc.cloud_router, None);
        assert_eq!(
            status.networks.subnets,
            vec![
                Subnet {
                    name: "nodes-subnet".to_string(),
                    purpose: SubnetPurpose::Nodes,
                },
                Subnet {
                    name: "internal".to_string(),
                    purpose: SubnetPurpose::Internal,
                },
            ]
        );
        assert_eq!(status.service_account_email, "gardener@cloud");
    }

    #[test]
    fn test_status_without_internal_subnet() {
        let status = infrastructure_status_from_outputs(&outputs(&[
            ("vpc_name", "vpc-name"),
            ("service_account_email", "gardener@cloud"),
            ("subnet_nodes", "nodes-subnet"),
            ("cloud_router", "router"),
        ]))
        .unwrap();

        assert_eq!(status.networks.subnets.len(), 1);
        assert_eq!(status.networks.subnets[0].purpose, SubnetPurpose::Nodes);
        assert_eq!(status.networks.vpc.cloud_router.as_deref(), Some("router"));
    }

    #[test]
    fn test_status_missing_required_output() {
        let result = infrastructure_status_from_outputs(&outputs(&[
            ("vpc_name", "vpc-name"),
            ("subnet_nodes", "nodes-subnet"),
        ]));
        match result {
            Err(CoreError::VariablesNotFound(keys)) => assert_eq!(keys, vec!["service_account_email"]),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_status_is_deterministic() {
        let outputs = outputs(&[
            ("vpc_name", "vpc-name"),
            ("service_account_email", "gardener@cloud"),
            ("subnet_nodes", "nodes-subnet"),
        ]);
        assert_eq!(
            infrastructure_status_from_outputs(&outputs).unwrap(),
            infrastructure_status_from_outputs(&outputs).unwrap()
        );
    }
}
