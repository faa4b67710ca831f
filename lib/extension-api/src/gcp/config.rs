use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::API_VERSION;

/// Kind of the provider config document
pub const INFRASTRUCTURE_CONFIG_KIND: &str = "InfrastructureConfig";

/// Names of GCP resources such as networks and routers (RFC 1035 labels)
const RESOURCE_NAME_PATTERN: &str = r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$";
const REGION_PATTERN: &str = r"^[a-z]+(-[a-z0-9]+)+$";
const PROJECT_ID_PATTERN: &str = r"^[a-z][-a-z0-9]{4,28}[a-z0-9]$";

/// Errors raised while decoding a provider config document
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("providerConfig is missing")]
    Missing,

    #[error("providerConfig is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected providerConfig type {api_version}/{kind}")]
    UnexpectedType { api_version: String, kind: String },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// InfrastructureConfig is the GCP provider configuration of an Infrastructure
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureConfig {
    pub api_version: String,
    pub kind: String,
    pub networks: NetworkConfig,
}

/// Network layout requested for the shoot
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Existing VPC to attach to; a new VPC is created when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcRef>,

    /// CIDR of the worker subnet
    #[serde(alias = "workers")]
    pub worker: String,

    /// CIDR of the optional internal subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<String>,

    #[serde(default, rename = "cloudNAT", skip_serializing_if = "Option::is_none")]
    pub cloud_nat: Option<CloudNat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_logs: Option<FlowLogs>,
}

/// Reference to an existing VPC
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcRef {
    pub name: String,

    /// Existing cloud router inside the VPC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_router: Option<CloudRouterRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRouterRef {
    pub name: String,
}

/// Cloud NAT tuning
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudNat {
    #[serde(default, rename = "minPortsPerVM", skip_serializing_if = "Option::is_none")]
    pub min_ports_per_vm: Option<u32>,
}

/// VPC flow log settings for the worker subnet
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLogs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_interval: Option<AggregationInterval>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_sampling: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FlowLogsMetadata>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationInterval {
    #[serde(rename = "INTERVAL_5_SEC")]
    Interval5Sec,
    #[serde(rename = "INTERVAL_30_SEC")]
    Interval30Sec,
    #[serde(rename = "INTERVAL_1_MIN")]
    Interval1Min,
    #[serde(rename = "INTERVAL_5_MIN")]
    Interval5Min,
    #[serde(rename = "INTERVAL_10_MIN")]
    Interval10Min,
    #[serde(rename = "INTERVAL_15_MIN")]
    Interval15Min,
}

/// Metadata attached to flow log entries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowLogsMetadata {
    IncludeAllMetadata,
    ExcludeAllMetadata,
}

impl InfrastructureConfig {
    /// Decode and validate the opaque provider config of an Infrastructure
    pub fn decode(raw: Option<&serde_json::Value>) -> Result<Self, DecodeError> {
        let raw = raw.ok_or(DecodeError::Missing)?;
        let config: InfrastructureConfig = serde_json::from_value(raw.clone())?;

        if config.api_version != API_VERSION || config.kind != INFRASTRUCTURE_CONFIG_KIND {
            return Err(DecodeError::UnexpectedType {
                api_version: config.api_version,
                kind: config.kind,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Check field level constraints
    pub fn validate(&self) -> Result<(), DecodeError> {
        let networks = &self.networks;

        validate_cidr("networks.worker", &networks.worker)?;
        if let Some(internal) = &networks.internal {
            validate_cidr("networks.internal", internal)?;
        }

        if let Some(vpc) = &networks.vpc {
            validate_resource_name("networks.vpc.name", &vpc.name)?;
            if let Some(router) = &vpc.cloud_router {
                validate_resource_name("networks.vpc.cloudRouter.name", &router.name)?;
            }
        }

        if let Some(sampling) = networks.flow_logs.as_ref().and_then(|f| f.flow_sampling) {
            if !(0.0..=1.0).contains(&sampling) {
                return Err(DecodeError::Invalid {
                    field: "networks.flowLogs.flowSampling",
                    reason: format!("{} is not within [0, 1]", sampling),
                });
            }
        }

        Ok(())
    }
}

/// Check that `cidr` is an IPv4 or IPv6 network in CIDR notation
pub fn validate_cidr(field: &'static str, cidr: &str) -> Result<(), DecodeError> {
    cidr.parse::<IpNetwork>()
        .map(|_| ())
        .map_err(|e| DecodeError::Invalid {
            field,
            reason: format!("invalid CIDR {:?}: {}", cidr, e),
        })
}

pub fn validate_region(region: &str) -> Result<(), DecodeError> {
    validate_pattern("spec.region", REGION_PATTERN, region, "is not a GCP region")
}

pub fn validate_project_id(project_id: &str) -> Result<(), DecodeError> {
    validate_pattern("project_id", PROJECT_ID_PATTERN, project_id, "is not a GCP project ID")
}

fn validate_resource_name(field: &'static str, name: &str) -> Result<(), DecodeError> {
    validate_pattern(field, RESOURCE_NAME_PATTERN, name, "is not a valid GCP resource name")
}

fn validate_pattern(field: &'static str, pattern: &str, value: &str, reason: &str) -> Result<(), DecodeError> {
    if Regex::new(pattern).is_ok_and(|re| re.is_match(value)) {
        return Ok(());
    }
    Err(DecodeError::Invalid {
        field,
        reason: format!("{:?} {}", value, reason),
    })
}
