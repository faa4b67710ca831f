//! API version v1alpha1 for extension resources

pub mod infrastructure;
pub mod cluster;

pub use infrastructure::{
    Infrastructure, InfrastructureSpec, InfrastructureStatus, LastError, LastOperation,
    LastOperationState, LastOperationType, SecretReference,
};
pub use cluster::{Cluster, ClusterContext, ClusterSpec};
