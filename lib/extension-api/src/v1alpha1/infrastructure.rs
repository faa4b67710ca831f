use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Infrastructure describes the cloud infrastructure a shoot cluster needs
/// (networks, subnets, firewalls, service accounts) on a given provider
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Infrastructure",
    plural = "infrastructures",
    namespaced,
    derive = "Default",
    status = "InfrastructureStatus",
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    /// Provider type (e.g. "gcp")
    #[serde(rename = "type")]
    pub type_: String,

    /// Region the infrastructure lives in
    pub region: String,

    /// Secret holding the cloud provider credentials
    pub secret_ref: SecretReference,

    /// Provider specific configuration, decoded by the provider controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<serde_json::Value>,
}

/// Reference to a Secret
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecretReference {
    /// Name of the Secret
    pub name: String,
    /// Namespace of the Secret (defaults to the namespace of the referencing object)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Status of an Infrastructure
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// Most recent generation observed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last operation performed on the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    /// Last error reported by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    /// Provider specific status, written by the provider controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,
}

/// Describes the last operation performed on a resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Kind of operation
    #[serde(rename = "type")]
    pub type_: LastOperationType,

    /// State of the operation
    pub state: LastOperationState,

    /// Human readable description
    pub description: String,

    /// RFC 3339 timestamp of the last update
    pub last_update_time: String,
}

/// Kind of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LastOperationType {
    Reconcile,
    Delete,
}

/// State of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LastOperationState {
    Processing,
    Succeeded,
    Error,
}

/// Last error reported for a resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LastError {
    /// Error message
    pub description: String,
}

impl Infrastructure {
    /// Namespace of the credentials secret, defaulting to the object's namespace
    pub fn secret_namespace(&self) -> Option<&str> {
        self.spec
            .secret_ref
            .namespace
            .as_deref()
            .or(self.metadata.namespace.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_infrastructure() {
        let infra: Infrastructure = serde_json::from_value(json!({
            "apiVersion": "extensions.gardener.cloud/v1alpha1",
            "kind": "Infrastructure",
            "metadata": {"name": "infra", "namespace": "shoot--foo--bar"},
            "spec": {
                "type": "gcp",
                "region": "europe-west1",
                "secretRef": {"name": "cloudprovider"},
                "providerConfig": {"kind": "InfrastructureConfig"}
            }
        }))
        .unwrap();

        assert_eq!(infra.spec.type_, "gcp");
        assert_eq!(infra.spec.region, "europe-west1");
        assert_eq!(infra.secret_namespace(), Some("shoot--foo--bar"));
        assert!(infra.spec.provider_config.is_some());
        assert!(infra.status.is_none());
    }

    #[test]
    fn test_secret_namespace_override() {
        let mut infra = Infrastructure::new("infra", InfrastructureSpec::default());
        infra.metadata.namespace = Some("shoot".to_string());
        infra.spec.secret_ref.namespace = Some("garden".to_string());

        assert_eq!(infra.secret_namespace(), Some("garden"));
    }
}
