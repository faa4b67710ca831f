//! Removal of cloud artifacts the Terraformer state does not know about
//!
//! Kubernetes controllers running inside a shoot create firewall rules for
//! load balancers and routes for node pod ranges. They live in the shoot VPC
//! and block its deletion, so they are swept before the state is destroyed.

use std::sync::Arc;

use extension_core::flow::{Graph, Task, TaskId};
use extension_core::{CoreError, Result, RetryPolicy};
use futures::FutureExt;
use tracing::{debug, info};

use crate::client::{CloudError, ComputeClient, Firewall, Route};

/// Name prefix of firewall rules created by the Kubernetes service controller
pub const KUBERNETES_FIREWALL_PREFIX: &str = "k8s";

/// Name prefix of routes created for shoot nodes
pub const SHOOT_ROUTE_PREFIX: &str = "shoot--";

/// Whether a firewall rule was created by Kubernetes inside `vpc_name`.
///
/// `network` is a fully qualified URL, so membership is a suffix match.
pub fn is_kubernetes_firewall(firewall: &Firewall, vpc_name: &str) -> bool {
    firewall.name.starts_with(KUBERNETES_FIREWALL_PREFIX) && firewall.network.ends_with(vpc_name)
}

/// Whether a route belongs to shoot nodes inside `vpc_name`.
///
/// Compares the last path segment of `network`, which also accepts a bare name.
pub fn is_shoot_route(route: &Route, vpc_name: &str) -> bool {
    let network = route.network.rsplit('/').next().unwrap_or_default();
    route.name.starts_with(SHOOT_ROUTE_PREFIX) && network == vpc_name
}

/// Sweeps Kubernetes created artifacts out of one VPC
pub struct ArtifactCleaner {
    client: Arc<dyn ComputeClient>,
    project_id: String,
    vpc_name: String,
}

impl ArtifactCleaner {
    pub fn new(client: Arc<dyn ComputeClient>, project_id: impl Into<String>, vpc_name: impl Into<String>) -> Self {
        Self {
            client,
            project_id: project_id.into(),
            vpc_name: vpc_name.into(),
        }
    }

    fn cleanup_failed(&self, artifact: &'static str, e: impl ToString) -> CoreError {
        CoreError::CleanupFailed {
            artifact,
            vpc: self.vpc_name.clone(),
            reason: e.to_string(),
        }
    }

    /// List all firewall rules and delete the Kubernetes ones in the VPC
    pub async fn sweep_firewalls(&self) -> Result<()> {
        let firewalls = self
            .client
            .list_firewalls(&self.project_id)
            .await
            .map_err(|e| self.cleanup_failed("firewalls", e))?;

        let selected: Vec<_> = firewalls
            .iter()
            .filter(|fw| is_kubernetes_firewall(fw, &self.vpc_name))
            .collect();
        debug!(
            vpc = %self.vpc_name,
            listed = firewalls.len(),
            selected = selected.len(),
            "Selected firewall rules for deletion"
        );

        for firewall in selected {
            match self.client.delete_firewall(&self.project_id, &firewall.name).await {
                Ok(()) => info!(vpc = %self.vpc_name, firewall = %firewall.name, "Deleted firewall rule"),
                Err(CloudError::NotFound(_)) => {
                    debug!(firewall = %firewall.name, "Firewall rule already gone")
                }
                Err(e) => return Err(self.cleanup_failed("firewalls", e)),
            }
        }
        Ok(())
    }

    /// List all routes and delete the shoot node routes in the VPC
    pub async fn sweep_routes(&self) -> Result<()> {
        let routes = self
            .client
            .list_routes(&self.project_id)
            .await
            .map_err(|e| self.cleanup_failed("routes", e))?;

        let selected: Vec<_> = routes
            .iter()
            .filter(|route| is_shoot_route(route, &self.vpc_name))
            .collect();
        debug!(
            vpc = %self.vpc_name,
            listed = routes.len(),
            selected = selected.len(),
            "Selected routes for deletion"
        );

        for route in selected {
            match self.client.delete_route(&self.project_id, &route.name).await {
                Ok(()) => info!(vpc = %self.vpc_name, route = %route.name, "Deleted route"),
                Err(CloudError::NotFound(_)) => debug!(route = %route.name, "Route already gone"),
                Err(e) => return Err(self.cleanup_failed("routes", e)),
            }
        }
        Ok(())
    }

    /// Add both sweeps to `graph` as independent retried tasks
    pub fn add_to<'a>(&'a self, graph: &mut Graph<'a>, retry: RetryPolicy, condition: bool) -> Vec<TaskId> {
        let firewalls = graph.add(
            Task::new("Destroying Kubernetes firewall rules", move || {
                self.sweep_firewalls().boxed()
            })
            .do_if(condition)
            .retry(retry),
        );
        let routes = graph.add(
            Task::new("Destroying Kubernetes routes", move || self.sweep_routes().boxed())
                .do_if(condition)
                .retry(retry),
        );
        vec![firewalls, routes]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockComputeClient;
    use mockall::predicate::eq;
    use std::time::Duration;

    const NETWORK_URL: &str = "https://www.googleapis.com/compute/v1/projects/project/global/networks/vpc";

    fn firewall(name: &str, network: &str) -> Firewall {
        Firewall {
            name: name.to_string(),
            network: network.to_string(),
        }
    }

    fn route(name: &str, network: &str) -> Route {
        Route {
            name: name.to_string(),
            network: network.to_string(),
        }
    }

    #[test]
    fn test_firewall_selection() {
        assert!(is_kubernetes_firewall(&firewall("k8s-fw-abc", NETWORK_URL), "vpc"));
        assert!(is_kubernetes_firewall(&firewall("k8sfw", "vpc"), "vpc"));
        assert!(!is_kubernetes_firewall(&firewall("user-fw", NETWORK_URL), "vpc"));
        assert!(!is_kubernetes_firewall(
            &firewall("k8s-fw-abc", "https://www.googleapis.com/compute/v1/projects/project/global/networks/other"),
            "vpc"
        ));
        assert!(!is_kubernetes_firewall(&firewall("k8s-fw-abc", ""), "vpc"));

        // A plain suffix match, unlike routes
        assert!(is_kubernetes_firewall(
            &firewall("k8s-fw-abc", "https://www.googleapis.com/compute/v1/projects/project/global/networks/my-vpc"),
            "vpc"
        ));
    }

    #[test]
    fn test_route_selection() {
        assert!(is_shoot_route(&route("shoot--foo--bar-abc", "vpc"), "vpc"));
        assert!(is_shoot_route(&route("shoot--foo--bar-abc", NETWORK_URL), "vpc"));
        assert!(!is_shoot_route(&route("custom-route", "vpc"), "vpc"));
        assert!(!is_shoot_route(&route("shoot--foo--bar-abc", "other-vpc"), "vpc"));
        assert!(!is_shoot_route(&route("shoot--foo--bar-abc", ".../my-vpc"), "vpc"));
    }

    #[tokio::test]
    async fn test_sweeps_delete_only_selected_artifacts() {
        let mut client = MockComputeClient::new();
        client.expect_list_firewalls().with(eq("project")).returning(|_| {
            Ok(vec![
                firewall("k8sfw", NETWORK_URL),
                firewall("user-fw", NETWORK_URL),
                firewall("k8s-other", "https://www.googleapis.com/compute/v1/projects/project/global/networks/sibling"),
            ])
        });
        client
            .expect_delete_firewall()
            .with(eq("project"), eq("k8sfw"))
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_list_routes().with(eq("project")).returning(|_| {
            Ok(vec![
                route("shoot--foo--bar-abc", "vpc"),
                route("custom-route", "vpc"),
            ])
        });
        client
            .expect_delete_route()
            .with(eq("project"), eq("shoot--foo--bar-abc"))
            .times(1)
            .returning(|_, _| Ok(()));

        let cleaner = ArtifactCleaner::new(Arc::new(client), "project", "vpc");
        cleaner.sweep_firewalls().await.unwrap();
        cleaner.sweep_routes().await.unwrap();
    }

    #[tokio::test]
    async fn test_not_found_on_delete_is_success() {
        let mut client = MockComputeClient::new();
        client
            .expect_list_firewalls()
            .returning(|_| Ok(vec![firewall("k8s-fw", NETWORK_URL)]));
        client
            .expect_delete_firewall()
            .returning(|_, name| Err(CloudError::NotFound(name.to_string())));

        let cleaner = ArtifactCleaner::new(Arc::new(client), "project", "vpc");
        cleaner.sweep_firewalls().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_list_is_success() {
        let mut client = MockComputeClient::new();
        client.expect_list_routes().returning(|_| Ok(vec![]));
        client.expect_delete_route().never();

        let cleaner = ArtifactCleaner::new(Arc::new(client), "project", "vpc");
        cleaner.sweep_routes().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_error_is_cleanup_failed() {
        let mut client = MockComputeClient::new();
        client
            .expect_list_firewalls()
            .returning(|_| Ok(vec![firewall("k8s-fw", NETWORK_URL)]));
        client.expect_delete_firewall().returning(|_, _| {
            Err(CloudError::Api {
                what: "firewalls k8s-fw".to_string(),
                status: 400,
                message: "resource in use".to_string(),
            })
        });

        let cleaner = ArtifactCleaner::new(Arc::new(client), "project", "vpc");
        match cleaner.sweep_firewalls().await {
            Err(CoreError::CleanupFailed { artifact, vpc, reason }) => {
                assert_eq!(artifact, "firewalls");
                assert_eq!(vpc, "vpc");
                assert!(reason.contains("resource in use"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_graph_retries_sweep_until_success() {
        let mut client = MockComputeClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_list_routes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(CloudError::Api {
                what: "routes".to_string(),
                status: 503,
                message: "backend unavailable".to_string(),
            }));
        client
            .expect_list_routes()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![]));
        client.expect_list_firewalls().times(1).returning(|_| Ok(vec![]));

        let cleaner = ArtifactCleaner::new(Arc::new(client), "project", "vpc");
        let mut graph = Graph::new("cleanup");
        let ids = cleaner.add_to(
            &mut graph,
            RetryPolicy::until_timeout(Duration::from_secs(10), Duration::from_secs(300)),
            true,
        );
        assert_eq!(ids.len(), 2);
        graph.run().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_graph_surfaces_cleanup_failed_after_budget() {
        let mut client = MockComputeClient::new();
        client.expect_list_firewalls().returning(|_| Ok(vec![]));
        client.expect_list_routes().returning(|_| {
            Err(CloudError::Api {
                what: "routes".to_string(),
                status: 403,
                message: "permission denied".to_string(),
            })
        });

        let cleaner = ArtifactCleaner::new(Arc::new(client), "project", "vpc");
        let mut graph = Graph::new("cleanup");
        cleaner.add_to(
            &mut graph,
            RetryPolicy::until_timeout(Duration::from_secs(10), Duration::from_secs(60)),
            true,
        );
        assert!(matches!(
            graph.run().await,
            Err(CoreError::CleanupFailed { artifact: "routes", .. })
        ));
    }

    #[tokio::test]
    async fn test_skipped_sweeps_do_not_touch_cloud() {
        let client = MockComputeClient::new();
        let cleaner = ArtifactCleaner::new(Arc::new(client), "project", "vpc");
        let mut graph = Graph::new("cleanup");
        cleaner.add_to(&mut graph, RetryPolicy::default(), false);
        graph.run().await.unwrap();
    }
}
