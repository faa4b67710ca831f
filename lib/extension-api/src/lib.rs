//! Extension API types and CRDs for the GCP infrastructure controller
//!
//! This library defines:
//! - Infrastructure: the declared infrastructure of a shoot cluster
//! - Cluster: read-only shoot context published by the host
//! - gcp: the provider config and provider status documents carried inside
//!   an Infrastructure

pub mod v1alpha1;
pub mod gcp;

pub use v1alpha1::{Cluster, ClusterContext, Infrastructure, InfrastructureSpec, InfrastructureStatus};
