//! GCP provider for the Infrastructure extension
//!
//! This library provides:
//! - Service account credentials read from the shoot's cloud provider secret
//! - A client for the GCP compute and IAM REST APIs
//! - Cleanup of Kubernetes created firewall rules and routes
//! - The values and status mapping around the Terraformer chart
//! - The Infrastructure actuator tying these together

pub mod actuator;
pub mod cleanup;
pub mod client;
pub mod service_account;
pub mod status;
pub mod values;

pub use actuator::{Actuator, ActuatorConfig, CHART_NAME};
pub use cleanup::ArtifactCleaner;
pub use client::{CloudError, ComputeClient, ComputeClientFactory, RestComputeClientFactory};
pub use service_account::ServiceAccount;
