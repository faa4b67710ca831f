use std::time::Duration;

use extension_api::gcp::DecodeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid provider configuration: {0}")]
    ConfigInvalid(String),

    #[error("Credentials unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Terraformer {command} failed: {diagnostic}")]
    ProvisioningFailed { command: String, diagnostic: String },

    #[error("Failed to clean up {artifact} in VPC {vpc}: {reason}")]
    CleanupFailed {
        artifact: &'static str,
        vpc: String,
        reason: String,
    },

    #[error("Terraformer state has no output variables for: {}", .0.join(", "))]
    VariablesNotFound(Vec<String>),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Status update of {0} kept conflicting")]
    ConflictExhausted(String),

    #[error("Chart rendering failed: {0}")]
    ChartRender(String),

    #[error("Cloud API error: {0}")]
    CloudApi(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{operation} {key}: {source}")]
    Operation {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<CoreError>,
    },
}

impl From<DecodeError> for CoreError {
    fn from(e: DecodeError) -> Self {
        CoreError::ConfigInvalid(e.to_string())
    }
}

impl CoreError {
    /// Annotate an error with the operation and object key it surfaced from
    pub fn during(self, operation: &'static str, key: impl Into<String>) -> Self {
        CoreError::Operation {
            operation,
            key: key.into(),
            source: Box::new(self),
        }
    }

    /// The error with all operation annotations stripped
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_variables_not_found(&self) -> bool {
        matches!(self.root(), CoreError::VariablesNotFound(_))
    }

    /// Errors that only go away once the user edits the resource
    pub fn is_permanent(&self) -> bool {
        matches!(self.root(), CoreError::ConfigInvalid(_))
    }

    /// Kubernetes API error with HTTP 409
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), CoreError::KubernetesError(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Short machine readable name used in metrics labels
    pub fn kind(&self) -> &'static str {
        match self.root() {
            CoreError::ConfigInvalid(_) => "config_invalid",
            CoreError::CredentialUnavailable(_) => "credential_unavailable",
            CoreError::ProvisioningFailed { .. } => "provisioning_failed",
            CoreError::CleanupFailed { .. } => "cleanup_failed",
            CoreError::VariablesNotFound(_) => "variables_not_found",
            CoreError::Timeout { .. } => "timeout",
            CoreError::ConflictExhausted(_) => "conflict_exhausted",
            CoreError::ChartRender(_) => "chart_render",
            CoreError::CloudApi(_) => "cloud_api",
            CoreError::KubernetesError(_) => "kubernetes",
            CoreError::SerializationError(_) => "serialization",
            CoreError::Operation { .. } => "operation",
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("status {}", code),
        reason: String::new(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_annotation() {
        let err = CoreError::CredentialUnavailable("secret garden/foo not found".to_string())
            .during("reconcile", "shoot--foo--bar/infra");

        assert_eq!(
            err.to_string(),
            "reconcile shoot--foo--bar/infra: Credentials unavailable: secret garden/foo not found"
        );
        assert!(matches!(err.root(), CoreError::CredentialUnavailable(_)));
        assert_eq!(err.kind(), "credential_unavailable");
    }

    #[test]
    fn test_classification() {
        assert!(CoreError::VariablesNotFound(vec!["vpc_name".to_string()])
            .during("delete", "ns/name")
            .is_variables_not_found());
        assert!(CoreError::ConfigInvalid("bad".to_string()).is_permanent());
        assert!(!CoreError::CloudApi("boom".to_string()).is_permanent());
        assert!(CoreError::from(api_error(409)).is_conflict());
        assert!(!CoreError::from(api_error(500)).is_conflict());
    }

    #[test]
    fn test_decode_error_is_config_invalid() {
        let err: CoreError = DecodeError::Missing.into();
        assert!(matches!(err, CoreError::ConfigInvalid(_)));
    }
}
