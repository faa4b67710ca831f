//! Gateway to the Terraformer, the infrastructure-as-code executor.
//!
//! A Terraformer is identified by `(purpose, namespace, name)`. Its inputs
//! (main configuration, variable declarations, variable values) and its state
//! live next to the owning object; `apply` and `destroy` drive the external
//! engine towards them.

mod kubernetes;
mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

pub use self::kubernetes::{KubeTerraformer, KubeTerraformerFactory, TerraformerConfig};
pub use self::state::parse_state_outputs;

/// Purpose of the Terraformer that provisions shoot infrastructure
pub const PURPOSE_INFRA: &str = "infra";

/// Input documents consumed by the engine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TerraformFiles {
    pub main: String,
    pub variables: String,
    pub tfvars: Vec<u8>,
}

/// Operations offered by a Terraformer for one `(purpose, namespace, name)`
#[async_trait]
pub trait Terraformer: Send + Sync {
    /// Whether the inputs and state have ever been initialized
    async fn config_exists(&self) -> Result<bool>;

    /// Seed or update the input documents used by `apply` and `destroy`
    async fn initialize_with(&self, files: TerraformFiles) -> Result<()>;

    /// Drive the engine towards the initialized inputs
    async fn apply(&self) -> Result<()>;

    /// Tear down everything in the state; a no-op without configuration
    async fn destroy(&self) -> Result<()>;

    /// Read output variables from the state.
    ///
    /// Fails with `VariablesNotFound` if the state has no outputs yet or any
    /// of `keys` is missing.
    async fn get_state_output_variables(&self, keys: &[&str]) -> Result<BTreeMap<String, String>>;
}

/// Creates Terraformer handles
pub trait TerraformerFactory: Send + Sync {
    fn new_terraformer(&self, purpose: &str, namespace: &str, name: &str) -> Arc<dyn Terraformer>;
}
