//! Provider specific documents for GCP
//!
//! These are carried opaquely inside `Infrastructure.spec.providerConfig` and
//! `Infrastructure.status.providerStatus` and decoded by the GCP provider.

pub mod config;
pub mod status;

pub use config::{
    AggregationInterval, CloudNat, CloudRouterRef, DecodeError, FlowLogs, FlowLogsMetadata,
    InfrastructureConfig, NetworkConfig, VpcRef,
};
pub use status::{InfrastructureStatus, NetworkStatus, Subnet, SubnetPurpose, VpcStatus};

/// Full apiVersion of GCP provider documents
pub const API_VERSION: &str = "gcp.provider.extensions.gardener.cloud/v1alpha1";
