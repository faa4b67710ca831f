//! The GCP infrastructure actuator
//!
//! `reconcile` drives the Terraformer towards the desired infrastructure and
//! publishes the derived provider status. `delete` removes Kubernetes created
//! artifacts from the VPC and then destroys the Terraformer state.

use std::path::PathBuf;
use std::sync::Arc;

use extension_api::gcp::config::{validate_cidr, validate_region};
use extension_api::gcp::{InfrastructureConfig, InfrastructureStatus};
use extension_api::{ClusterContext, Infrastructure};
use extension_core::flow::{Graph, Task};
use extension_core::terraformer::PURPOSE_INFRA;
use extension_core::{
    ChartRenderer, CoreError, HostClient, Result, RetryPolicy, TerraformFiles, Terraformer,
    TerraformerFactory,
};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::cleanup::ArtifactCleaner;
use crate::client::ComputeClientFactory;
use crate::status::infrastructure_status_from_outputs;
use crate::values::{compute_terraformer_values, output_keys, terraform_tfvars, TERRAFORMER_OUTPUT_KEY_VPC_NAME};
use crate::ServiceAccount;

/// Release name the infrastructure chart is rendered with
pub const CHART_NAME: &str = "gcp-infra";

const MAIN_TF: &str = "main.tf";
const VARIABLES_TF: &str = "variables.tf";

/// Settings fixed at startup
#[derive(Clone, Debug)]
pub struct ActuatorConfig {
    /// Directory of the terraform chart
    pub chart_path: PathBuf,
    /// Retry applied to each artifact sweep during deletion
    pub cleanup_retry: RetryPolicy,
}

pub struct Actuator {
    host: Arc<dyn HostClient>,
    renderer: Arc<dyn ChartRenderer>,
    terraformers: Arc<dyn TerraformerFactory>,
    compute: Arc<dyn ComputeClientFactory>,
    config: ActuatorConfig,
}

fn object_key(infra: &Infrastructure) -> String {
    format!("{}/{}", infra.namespace().unwrap_or_default(), infra.name_any())
}

/// Failures of the engine keep their diagnostic, anything else becomes one
fn provisioning_failed(command: &str, e: CoreError) -> CoreError {
    match e {
        e @ (CoreError::ProvisioningFailed { .. } | CoreError::Timeout { .. }) => e,
        other => CoreError::ProvisioningFailed {
            command: command.to_string(),
            diagnostic: other.to_string(),
        },
    }
}

impl Actuator {
    pub fn new(
        host: Arc<dyn HostClient>,
        renderer: Arc<dyn ChartRenderer>,
        terraformers: Arc<dyn TerraformerFactory>,
        compute: Arc<dyn ComputeClientFactory>,
        config: ActuatorConfig,
    ) -> Self {
        Self {
            host,
            renderer,
            terraformers,
            compute,
            config,
        }
    }

    /// Provision the infrastructure and publish its provider status
    pub async fn reconcile(&self, infra: &Infrastructure, cluster: &ClusterContext) -> Result<InfrastructureStatus> {
        self.do_reconcile(infra, cluster)
            .await
            .map_err(|e| e.during("reconcile", object_key(infra)))
    }

    /// Remove Kubernetes artifacts and destroy the infrastructure
    pub async fn delete(&self, infra: &Infrastructure) -> Result<()> {
        self.do_delete(infra)
            .await
            .map_err(|e| e.during("delete", object_key(infra)))
    }

    async fn do_reconcile(&self, infra: &Infrastructure, cluster: &ClusterContext) -> Result<InfrastructureStatus> {
        let namespace = infra.namespace().unwrap_or_default();
        let name = infra.name_any();

        let config = InfrastructureConfig::decode(infra.spec.provider_config.as_ref())?;
        // Everything below ends up inside terraform string literals
        validate_region(&infra.spec.region)?;
        if let Some(pods) = &cluster.pods_cidr {
            validate_cidr("cluster.pods", pods)?;
        }
        if let Some(services) = &cluster.services_cidr {
            validate_cidr("cluster.services", services)?;
        }
        let service_account = self.service_account(infra).await?;

        if let Some(vpc) = &config.networks.vpc {
            let client = self.compute.new_client(&service_account)?;
            if client.get_network(&service_account.project_id, &vpc.name).await?.is_none() {
                return Err(CoreError::ConfigInvalid(format!(
                    "VPC {} does not exist in project {}",
                    vpc.name, service_account.project_id
                )));
            }
        }

        let values = compute_terraformer_values(infra, &service_account, &config, cluster);
        let chart = self
            .renderer
            .render(&self.config.chart_path, CHART_NAME, &namespace, &values)
            .await?;
        let files = TerraformFiles {
            main: chart.file(MAIN_TF)?.to_string(),
            variables: chart.file(VARIABLES_TF)?.to_string(),
            tfvars: terraform_tfvars(&service_account),
        };

        let terraformer = self.terraformers.new_terraformer(PURPOSE_INFRA, &namespace, &name);
        terraformer
            .initialize_with(files)
            .await
            .map_err(|e| provisioning_failed("initialize", e))?;

        info!(namespace = %namespace, name = %name, "Applying infrastructure");
        terraformer.apply().await.map_err(|e| provisioning_failed("apply", e))?;

        let outputs = terraformer.get_state_output_variables(&output_keys(&config)).await?;
        let status = infrastructure_status_from_outputs(&outputs)?;

        self.host
            .update_provider_status(&namespace, &name, serde_json::to_value(&status)?)
            .await?;

        info!(
            namespace = %namespace,
            name = %name,
            vpc = %status.networks.vpc.name,
            "Infrastructure reconciled"
        );
        Ok(status)
    }

    async fn do_delete(&self, infra: &Infrastructure) -> Result<()> {
        let namespace = infra.namespace().unwrap_or_default();
        let name = infra.name_any();

        InfrastructureConfig::decode(infra.spec.provider_config.as_ref())?;
        let service_account = self.service_account(infra).await?;

        let terraformer = self.terraformers.new_terraformer(PURPOSE_INFRA, &namespace, &name);
        if !terraformer.config_exists().await? {
            info!(namespace = %namespace, name = %name, "No Terraformer configuration, nothing to delete");
            return Ok(());
        }

        let vpc_name = match terraformer
            .get_state_output_variables(&[TERRAFORMER_OUTPUT_KEY_VPC_NAME])
            .await
        {
            Ok(outputs) => outputs.get(TERRAFORMER_OUTPUT_KEY_VPC_NAME).cloned(),
            Err(e) if e.is_variables_not_found() => {
                debug!(namespace = %namespace, name = %name, "Terraformer state has no VPC, skipping cleanup");
                None
            }
            Err(e) => return Err(e),
        };

        let client = self.compute.new_client(&service_account)?;
        let cleaner = ArtifactCleaner::new(
            client,
            service_account.project_id.clone(),
            vpc_name.clone().unwrap_or_default(),
        );

        let mut graph = Graph::new(format!("Infrastructure deletion of {}/{}", namespace, name));
        let cleanup = cleaner.add_to(&mut graph, self.config.cleanup_retry, vpc_name.is_some());
        let destroy: &dyn Terraformer = terraformer.as_ref();
        graph.add(
            Task::new("Destroying shoot infrastructure", move || destroy.destroy())
                .depends_on(&cleanup),
        );
        graph.run().await?;

        info!(namespace = %namespace, name = %name, "Infrastructure deleted");
        Ok(())
    }

    async fn service_account(&self, infra: &Infrastructure) -> Result<ServiceAccount> {
        let secret_ref = &infra.spec.secret_ref;
        let namespace = infra.secret_namespace().unwrap_or_default();
        let secret = self
            .host
            .get_secret(namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| {
                CoreError::CredentialUnavailable(format!("secret {}/{} not found", namespace, secret_ref.name))
            })?;
        ServiceAccount::from_secret(&secret)
    }
}
