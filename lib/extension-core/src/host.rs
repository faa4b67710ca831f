//! Access to the host's object store: credential secrets, cluster context and
//! the Infrastructure status subresource.

use async_trait::async_trait;
use extension_api::v1alpha1::{LastError, LastOperation};
use extension_api::{Cluster, Infrastructure, InfrastructureStatus};
use k8s_openapi::api::core::v1::Secret;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

use crate::retry::retry_on_conflict;
use crate::Result;

/// Default number of attempts for optimistic status updates
pub const DEFAULT_STATUS_UPDATE_ATTEMPTS: u32 = 5;

/// Host operations needed by actuators
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Fetch a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Fetch the cluster scoped Cluster resource
    async fn get_cluster(&self, name: &str) -> Result<Cluster>;

    /// Replace `status.providerStatus` of an Infrastructure
    async fn update_provider_status(
        &self,
        namespace: &str,
        name: &str,
        provider_status: serde_json::Value,
    ) -> Result<()>;

    /// Record the outcome of the last operation on an Infrastructure
    async fn update_last_operation(
        &self,
        namespace: &str,
        name: &str,
        observed_generation: Option<i64>,
        last_operation: LastOperation,
        last_error: Option<LastError>,
    ) -> Result<()>;
}

/// HostClient backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeHostClient {
    client: Client,
    status_update_attempts: u32,
}

impl KubeHostClient {
    pub fn new(client: Client, status_update_attempts: u32) -> Self {
        Self {
            client,
            status_update_attempts,
        }
    }

    /// Read-modify-write the status subresource, refetching on conflict
    async fn mutate_status<F>(&self, namespace: &str, name: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut InfrastructureStatus) + Send + Sync,
    {
        let api: Api<Infrastructure> = Api::namespaced(self.client.clone(), namespace);
        let key = format!("{}/{}", namespace, name);

        retry_on_conflict(self.status_update_attempts, &key, || {
            let api = api.clone();
            let mutate = &mutate;
            async move {
                let mut infra = api.get_status(name).await?;
                let mut status = infra.status.take().unwrap_or_default();
                mutate(&mut status);
                infra.status = Some(status);

                // resourceVersion from the fetched object makes this a guarded write
                let data = serde_json::to_vec(&infra)?;
                api.replace_status(name, &PostParams::default(), data).await?;
                Ok(())
            }
        })
        .await?;

        debug!(key = %key, "Updated Infrastructure status");
        Ok(())
    }
}

#[async_trait]
impl HostClient for KubeHostClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn update_provider_status(
        &self,
        namespace: &str,
        name: &str,
        provider_status: serde_json::Value,
    ) -> Result<()> {
        self.mutate_status(namespace, name, |status| {
            status.provider_status = Some(provider_status.clone());
        })
        .await
    }

    async fn update_last_operation(
        &self,
        namespace: &str,
        name: &str,
        observed_generation: Option<i64>,
        last_operation: LastOperation,
        last_error: Option<LastError>,
    ) -> Result<()> {
        self.mutate_status(namespace, name, |status| {
            if observed_generation.is_some() {
                status.observed_generation = observed_generation;
            }
            status.last_operation = Some(last_operation.clone());
            status.last_error = last_error.clone();
        })
        .await
    }
}
