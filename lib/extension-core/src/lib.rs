//! Core building blocks for extension actuators
//!
//! This library provides:
//! - The error taxonomy shared by all actuators
//! - Retry primitives and a small task graph executor
//! - Chart rendering for Terraformer inputs
//! - The Terraformer gateway and its Kubernetes backed implementation
//! - Access to the host's secrets, cluster context and status subresource

pub mod chart;
pub mod error;
pub mod flow;
pub mod host;
pub mod retry;
pub mod terraformer;

pub use chart::{ChartRenderer, RenderedChart, TeraChartRenderer};
pub use error::{CoreError, Result};
pub use flow::{Graph, Task, TaskId};
pub use host::{HostClient, KubeHostClient};
pub use retry::RetryPolicy;
pub use terraformer::{TerraformFiles, Terraformer, TerraformerFactory};
