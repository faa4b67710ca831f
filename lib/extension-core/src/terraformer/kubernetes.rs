//! Terraformer backed by Kubernetes objects and pods
//!
//! Inputs are stored in a ConfigMap (`main.tf`, `variables.tf`) and a Secret
//! (`terraform.tfvars`), the state in a second ConfigMap that only the
//! Terraformer pod writes. `apply` and `destroy` each run one pod to
//! completion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVar, Pod, PodSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parse_state_outputs, TerraformFiles, Terraformer, TerraformerFactory};
use crate::retry::with_deadline;
use crate::{CoreError, Result};

const FIELD_MANAGER: &str = "gcp-infra-controller";

const MAIN_KEY: &str = "main.tf";
const VARIABLES_KEY: &str = "variables.tf";
const TFVARS_KEY: &str = "terraform.tfvars";
const STATE_KEY: &str = "terraform.tfstate";

const LABEL_NAME: &str = "terraformer.gardener.cloud/name";
const LABEL_PURPOSE: &str = "terraformer.gardener.cloud/purpose";

/// Number of log lines attached to a failed run
const DIAGNOSTIC_LOG_LINES: i64 = 50;

/// Terraformer pod settings
#[derive(Clone, Debug)]
pub struct TerraformerConfig {
    /// Terraformer container image
    pub image: String,
    /// Service account the pod runs as; needs access to the three objects
    pub service_account_name: String,
    /// Maximum duration of a single apply or destroy run
    pub pod_timeout: Duration,
    /// Maximum wait for leftover pods to disappear
    pub deletion_timeout: Duration,
    /// Interval between pod status checks
    pub poll_interval: Duration,
}

impl Default for TerraformerConfig {
    fn default() -> Self {
        Self {
            image: "europe-docker.pkg.dev/gardener-project/releases/gardener/terraformer-gcp:v2.28.0"
                .to_string(),
            service_account_name: "terraformer".to_string(),
            pod_timeout: Duration::from_secs(60 * 60),
            deletion_timeout: Duration::from_secs(2 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Names and labels of the objects backing one `(purpose, namespace, name)`
#[derive(Clone, Debug, PartialEq, Eq)]
struct TerraformerObjects {
    namespace: String,
    name: String,
    purpose: String,
}

impl TerraformerObjects {
    fn config_name(&self) -> String {
        format!("{}.{}.tf-config", self.name, self.purpose)
    }

    fn variables_name(&self) -> String {
        format!("{}.{}.tf-vars", self.name, self.purpose)
    }

    fn state_name(&self) -> String {
        format!("{}.{}.tf-state", self.name, self.purpose)
    }

    fn pod_name(&self, command: &str, suffix: &str) -> String {
        format!("{}.{}.tf-{}-{}", self.name, self.purpose, command, suffix)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), self.name.clone()),
            (LABEL_PURPOSE.to_string(), self.purpose.clone()),
        ])
    }

    fn selector(&self) -> String {
        format!("{}={},{}={}", LABEL_NAME, self.name, LABEL_PURPOSE, self.purpose)
    }

    fn meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    fn pod(&self, config: &TerraformerConfig, pod_name: &str, command: &str) -> Pod {
        let env = |name: &str, value: String| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        };

        Pod {
            metadata: self.meta(pod_name.to_string()),
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                service_account_name: Some(config.service_account_name.clone()),
                containers: vec![Container {
                    name: "terraform".to_string(),
                    image: Some(config.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: Some(vec!["/terraformer.sh".to_string(), command.to_string()]),
                    env: Some(vec![
                        env("TF_CONFIGURATION_CONFIG_MAP_NAME", self.config_name()),
                        env("TF_STATE_CONFIG_MAP_NAME", self.state_name()),
                        env("TF_VARIABLES_SECRET_NAME", self.variables_name()),
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Terraformer for one `(purpose, namespace, name)`
pub struct KubeTerraformer {
    client: Client,
    objects: TerraformerObjects,
    config: Arc<TerraformerConfig>,
}

impl KubeTerraformer {
    pub fn new(
        client: Client,
        config: Arc<TerraformerConfig>,
        purpose: &str,
        namespace: &str,
        name: &str,
    ) -> Self {
        Self {
            client,
            objects: TerraformerObjects {
                namespace: namespace.to_string(),
                name: name.to_string(),
                purpose: purpose.to_string(),
            },
            config,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.objects.namespace)
    }

    async fn exists<K>(&self, name: &str) -> Result<bool>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        Ok(self.api::<K>().get_opt(name).await?.is_some())
    }

    async fn delete_ignoring_missing<K>(&self, name: &str) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        match self.api::<K>().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_state(&self) -> Result<()> {
        let api: Api<ConfigMap> = self.api();
        if api.get_opt(&self.objects.state_name()).await?.is_some() {
            return Ok(());
        }

        let state = ConfigMap {
            metadata: self.objects.meta(self.objects.state_name()),
            data: Some(BTreeMap::from([(STATE_KEY.to_string(), String::new())])),
            ..Default::default()
        };
        match api.create(&PostParams::default(), &state).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete leftover pods of earlier runs and wait until they are gone
    async fn cleanup_pods(&self) -> Result<()> {
        let pods: Api<Pod> = self.api();
        let selector = self.objects.selector();
        let lp = ListParams::default().labels(&selector);

        for pod in pods.list(&lp).await?.items {
            if let Some(name) = pod.metadata.name {
                debug!(pod = %name, "Deleting leftover Terraformer pod");
                self.delete_ignoring_missing::<Pod>(&name).await?;
            }
        }

        let poll = self.config.poll_interval;
        with_deadline(
            self.config.deletion_timeout,
            &format!("deletion of Terraformer pods {}", selector),
            async {
                loop {
                    if pods.list(&lp).await?.items.is_empty() {
                        return Ok(());
                    }
                    time::sleep(poll).await;
                }
            },
        )
        .await
    }

    /// Wait for the pod to terminate, returning whether it succeeded
    async fn wait_for_pod(&self, pod_name: &str) -> Result<bool> {
        let pods: Api<Pod> = self.api();
        let poll = self.config.poll_interval;

        with_deadline(
            self.config.pod_timeout,
            &format!("Terraformer pod {}", pod_name),
            async {
                loop {
                    let phase = pods
                        .get(pod_name)
                        .await?
                        .status
                        .and_then(|s| s.phase)
                        .unwrap_or_default();
                    match phase.as_str() {
                        "Succeeded" => return Ok(true),
                        "Failed" => return Ok(false),
                        _ => time::sleep(poll).await,
                    }
                }
            },
        )
        .await
    }

    /// Run one Terraformer pod to completion
    async fn run(&self, command: &str) -> Result<()> {
        self.cleanup_pods().await?;

        let suffix = Uuid::new_v4().simple().to_string();
        let pod_name = self.objects.pod_name(command, &suffix[..5]);

        let pods: Api<Pod> = self.api();
        pods.create(&PostParams::default(), &self.objects.pod(&self.config, &pod_name, command))
            .await?;
        info!(
            namespace = %self.objects.namespace,
            pod = %pod_name,
            command = %command,
            "Started Terraformer pod"
        );

        let outcome = match self.wait_for_pod(&pod_name).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                let lp = LogParams {
                    tail_lines: Some(DIAGNOSTIC_LOG_LINES),
                    ..Default::default()
                };
                let diagnostic = match pods.logs(&pod_name, &lp).await {
                    Ok(logs) => logs,
                    Err(e) => format!("pod {} failed, logs unavailable: {}", pod_name, e),
                };
                Err(CoreError::ProvisioningFailed {
                    command: command.to_string(),
                    diagnostic,
                })
            }
            Err(e) => Err(e),
        };

        let deleted = self.delete_ignoring_missing::<Pod>(&pod_name).await;
        match (outcome, deleted) {
            (Ok(()), deleted) => {
                info!(namespace = %self.objects.namespace, pod = %pod_name, "Terraformer pod succeeded");
                deleted
            }
            (Err(e), Err(delete_err)) => {
                warn!(pod = %pod_name, error = %delete_err, "Failed to delete Terraformer pod");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }
}

#[async_trait]
impl Terraformer for KubeTerraformer {
    async fn config_exists(&self) -> Result<bool> {
        Ok(self.exists::<ConfigMap>(&self.objects.config_name()).await?
            && self.exists::<Secret>(&self.objects.variables_name()).await?
            && self.exists::<ConfigMap>(&self.objects.state_name()).await?)
    }

    async fn initialize_with(&self, files: TerraformFiles) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let config = ConfigMap {
            metadata: self.objects.meta(self.objects.config_name()),
            data: Some(BTreeMap::from([
                (MAIN_KEY.to_string(), files.main),
                (VARIABLES_KEY.to_string(), files.variables),
            ])),
            ..Default::default()
        };
        self.api::<ConfigMap>()
            .patch(&self.objects.config_name(), &params, &Patch::Apply(&config))
            .await?;

        let variables = Secret {
            metadata: self.objects.meta(self.objects.variables_name()),
            data: Some(BTreeMap::from([(
                TFVARS_KEY.to_string(),
                ByteString(files.tfvars),
            )])),
            ..Default::default()
        };
        self.api::<Secret>()
            .patch(&self.objects.variables_name(), &params, &Patch::Apply(&variables))
            .await?;

        self.ensure_state().await?;

        debug!(
            namespace = %self.objects.namespace,
            name = %self.objects.name,
            purpose = %self.objects.purpose,
            "Initialized Terraformer configuration"
        );
        Ok(())
    }

    async fn apply(&self) -> Result<()> {
        self.run("apply").await
    }

    async fn destroy(&self) -> Result<()> {
        if !self.config_exists().await? {
            info!(
                namespace = %self.objects.namespace,
                name = %self.objects.name,
                "No Terraformer configuration, nothing to destroy"
            );
            return Ok(());
        }

        self.run("destroy").await?;

        self.delete_ignoring_missing::<ConfigMap>(&self.objects.config_name()).await?;
        self.delete_ignoring_missing::<Secret>(&self.objects.variables_name()).await?;
        self.delete_ignoring_missing::<ConfigMap>(&self.objects.state_name()).await?;
        Ok(())
    }

    async fn get_state_output_variables(&self, keys: &[&str]) -> Result<BTreeMap<String, String>> {
        let state = self
            .api::<ConfigMap>()
            .get_opt(&self.objects.state_name())
            .await?
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(STATE_KEY))
            .unwrap_or_default();

        parse_state_outputs(&state, keys)
    }
}

/// Creates [`KubeTerraformer`]s sharing one client and configuration
#[derive(Clone)]
pub struct KubeTerraformerFactory {
    client: Client,
    config: Arc<TerraformerConfig>,
}

impl KubeTerraformerFactory {
    pub fn new(client: Client, config: TerraformerConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }
}

impl TerraformerFactory for KubeTerraformerFactory {
    fn new_terraformer(&self, purpose: &str, namespace: &str, name: &str) -> Arc<dyn Terraformer> {
        Arc::new(KubeTerraformer::new(
            self.client.clone(),
            self.config.clone(),
            purpose,
            namespace,
            name,
        ))
    }
}
