use serde::{Deserialize, Serialize};

use super::API_VERSION;

/// Kind of the provider status document
pub const INFRASTRUCTURE_STATUS_KIND: &str = "InfrastructureStatus";

/// InfrastructureStatus is the GCP provider status of an Infrastructure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    pub api_version: String,
    pub kind: String,
    pub networks: NetworkStatus,
    pub service_account_email: String,
}

/// Networks created or attached for the shoot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub vpc: VpcStatus,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_router: Option<String>,
}

/// A subnet and the purpose it serves
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub name: String,
    pub purpose: SubnetPurpose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetPurpose {
    Nodes,
    Internal,
}

impl InfrastructureStatus {
    pub fn new(networks: NetworkStatus, service_account_email: String) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: INFRASTRUCTURE_STATUS_KIND.to_string(),
            networks,
            service_account_email,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_status() {
        let status = InfrastructureStatus::new(
            NetworkStatus {
                vpc: VpcStatus {
                    name: "vpc".to_string(),
                    cloud_router: None,
                },
                subnets: vec![Subnet {
                    name: "nodes".to_string(),
                    purpose: SubnetPurpose::Nodes,
                }],
            },
            "sa@project.iam.gserviceaccount.com".to_string(),
        );

        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({
                "apiVersion": API_VERSION,
                "kind": "InfrastructureStatus",
                "networks": {
                    "vpc": {"name": "vpc"},
                    "subnets": [{"name": "nodes", "purpose": "nodes"}]
                },
                "serviceAccountEmail": "sa@project.iam.gserviceaccount.com"
            })
        );
    }
}
