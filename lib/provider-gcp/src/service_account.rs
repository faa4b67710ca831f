//! GCP service account credentials

use std::fmt;

use extension_api::gcp::config::validate_project_id;
use extension_core::{CoreError, Result};
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;

/// Data field of the credentials secret holding the service account JSON
pub const SERVICE_ACCOUNT_JSON_FIELD: &str = "serviceaccount.json";

/// A service account key and the project it belongs to
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    pub project_id: String,
    /// The service account key JSON as stored in the secret
    pub raw: String,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    client_email: String,
    #[serde(default)]
    private_key: String,
}

impl ServiceAccount {
    /// Parse a service account key, extracting its project
    ///
    /// The key must carry everything needed to mint access tokens, so a
    /// broken key surfaces here rather than at the first cloud API call.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let raw = std::str::from_utf8(raw).map_err(|e| {
            CoreError::CredentialUnavailable(format!("{} is not UTF-8: {}", SERVICE_ACCOUNT_JSON_FIELD, e))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(raw).map_err(|e| {
            CoreError::CredentialUnavailable(format!("{} is not valid JSON: {}", SERVICE_ACCOUNT_JSON_FIELD, e))
        })?;
        for (field, value) in [
            ("project_id", &key.project_id),
            ("client_email", &key.client_email),
            ("private_key", &key.private_key),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::CredentialUnavailable(format!(
                    "{} has no {}",
                    SERVICE_ACCOUNT_JSON_FIELD, field
                )));
            }
        }
        validate_project_id(&key.project_id).map_err(|e| {
            CoreError::CredentialUnavailable(format!("{}: {}", SERVICE_ACCOUNT_JSON_FIELD, e))
        })?;

        Ok(Self {
            project_id: key.project_id,
            raw: raw.to_string(),
        })
    }

    /// Read the service account from a credentials secret
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret
            .data
            .as_ref()
            .and_then(|data| data.get(SERVICE_ACCOUNT_JSON_FIELD))
            .ok_or_else(|| {
                CoreError::CredentialUnavailable(format!(
                    "secret {}/{} has no field {}",
                    secret.metadata.namespace.as_deref().unwrap_or_default(),
                    secret.metadata.name.as_deref().unwrap_or_default(),
                    SERVICE_ACCOUNT_JSON_FIELD
                ))
            })?;

        Self::from_json(&data.0)
    }
}

// The key material must never end up in logs
impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}
