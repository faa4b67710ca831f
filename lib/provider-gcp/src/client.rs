//! Client for the GCP compute and IAM REST APIs
//!
//! Only the calls the actuator needs are exposed. Listing calls follow
//! `nextPageToken` until the last page; deletions wait for the resulting
//! global operation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use extension_core::CoreError;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::time;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::ServiceAccount;

const COMPUTE_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";
const IAM_BASE_URL: &str = "https://iam.googleapis.com/v1";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const PAGE_SIZE: &str = "500";

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("GCP API returned {status} for {what}: {message}")]
    Api {
        what: String,
        status: u16,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL {url}: {message}")]
    Url { url: String, message: String },

    #[error("Authentication error: {0}")]
    Auth(#[from] gcp_auth::Error),

    #[error("Operation {name} failed: {message}")]
    Operation { name: String, message: String },

    #[error("Timed out after {after:?} waiting for operation {name}")]
    OperationTimeout { name: String, after: Duration },
}

impl From<CloudError> for CoreError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::OperationTimeout { name, after } => CoreError::Timeout {
                what: format!("operation {}", name),
                after,
            },
            other => CoreError::CloudApi(other.to_string()),
        }
    }
}

/// A firewall rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Firewall {
    pub name: String,
    /// URL of the network the rule is attached to
    #[serde(default)]
    pub network: String,
}

/// A route
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Route {
    pub name: String,
    /// URL of the network the route belongs to
    #[serde(default)]
    pub network: String,
}

/// A VPC network
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub subnetworks: Vec<String>,
}

/// An IAM service account
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountInfo {
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Compute and IAM operations used by the actuator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// All firewall rules of a project
    async fn list_firewalls(&self, project: &str) -> Result<Vec<Firewall>, CloudError>;

    /// Delete a firewall rule and wait for the deletion to finish
    async fn delete_firewall(&self, project: &str, name: &str) -> Result<(), CloudError>;

    /// All routes of a project
    async fn list_routes(&self, project: &str) -> Result<Vec<Route>, CloudError>;

    /// Delete a route and wait for the deletion to finish
    async fn delete_route(&self, project: &str, name: &str) -> Result<(), CloudError>;

    /// A VPC network, `None` if it does not exist
    async fn get_network(&self, project: &str, name: &str) -> Result<Option<Network>, CloudError>;

    /// An IAM service account, `None` if it does not exist
    async fn get_service_account(
        &self,
        project: &str,
        email: &str,
    ) -> Result<Option<ServiceAccountInfo>, CloudError>;
}

/// Creates clients authenticated as a service account
pub trait ComputeClientFactory: Send + Sync {
    fn new_client(&self, service_account: &ServiceAccount) -> Result<Arc<dyn ComputeClient>, CloudError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<OperationErrors>,
}

#[derive(Debug, Deserialize)]
struct OperationErrors {
    #[serde(default)]
    errors: Vec<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn failure(&self) -> Option<String> {
        let errors = &self.error.as_ref()?.errors;
        if errors.is_empty() {
            return None;
        }
        Some(
            errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Extract the message of a Google API error body, falling back to the raw body
fn api_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body.trim().to_string(),
    }
}

/// Append `segments` to `base`, percent-encoding each one
fn resource_url(base: &str, segments: &[&str]) -> Result<Url, CloudError> {
    let invalid = |message: String| CloudError::Url {
        url: base.to_string(),
        message,
    };
    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("cannot be a base".to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn global_url(base: &str, project: &str, collection: &str, name: Option<&str>) -> Result<Url, CloudError> {
    let mut segments = vec!["projects", project, "global", collection];
    segments.extend(name);
    resource_url(base, &segments)
}

fn service_account_url(base: &str, project: &str, email: &str) -> Result<Url, CloudError> {
    resource_url(base, &["projects", project, "serviceAccounts", email])
}

/// Source of OAuth access tokens for API calls
#[async_trait]
pub(crate) trait AccessTokens: Send + Sync {
    async fn access_token(&self) -> Result<String, CloudError>;
}

#[async_trait]
impl AccessTokens for CustomServiceAccount {
    async fn access_token(&self) -> Result<String, CloudError> {
        let token = self.token(&[CLOUD_PLATFORM_SCOPE]).await?;
        Ok(token.as_str().to_string())
    }
}

/// Compute client speaking the public REST API
pub struct RestComputeClient {
    http: reqwest::Client,
    tokens: Box<dyn AccessTokens>,
    compute_base: String,
    iam_base: String,
    operation_timeout: Duration,
    poll_interval: Duration,
}

impl RestComputeClient {
    pub fn new(
        http: reqwest::Client,
        service_account: &ServiceAccount,
        operation_timeout: Duration,
    ) -> Result<Self, CloudError> {
        let credentials = CustomServiceAccount::from_json(&service_account.raw)?;
        Ok(Self::with_endpoints(
            http,
            Box::new(credentials),
            COMPUTE_BASE_URL,
            IAM_BASE_URL,
            operation_timeout,
            Duration::from_secs(2),
        ))
    }

    pub(crate) fn with_endpoints(
        http: reqwest::Client,
        tokens: Box<dyn AccessTokens>,
        compute_base: &str,
        iam_base: &str,
        operation_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            http,
            tokens,
            compute_base: compute_base.to_string(),
            iam_base: iam_base.to_string(),
            operation_timeout,
            poll_interval,
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &Url,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<T, CloudError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .request(method, url.clone())
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                what: what.to_string(),
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn list_all<T: DeserializeOwned>(&self, url: &Url, what: &str) -> Result<Vec<T>, CloudError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("maxResults", PAGE_SIZE)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let page: ListPage<T> = self.request(Method::GET, url, &query, what).await?;
            items.extend(page.items);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(what = %what, count = items.len(), "Listed GCP resources");
        Ok(items)
    }

    async fn delete_global(&self, project: &str, collection: &str, name: &str) -> Result<(), CloudError> {
        let url = global_url(&self.compute_base, project, collection, Some(name))?;
        let what = format!("{} {}", collection, name);
        let operation: Operation = self.request(Method::DELETE, &url, &[], &what).await?;
        self.wait_for_operation(project, operation).await
    }

    async fn wait_for_operation(&self, project: &str, operation: Operation) -> Result<(), CloudError> {
        let name = operation.name.clone();
        let url = global_url(&self.compute_base, project, "operations", Some(name.as_str()))?;

        let wait = async {
            let mut operation = operation;
            loop {
                if operation.status == "DONE" {
                    return match operation.failure() {
                        Some(message) => Err(CloudError::Operation {
                            name: operation.name,
                            message,
                        }),
                        None => Ok(()),
                    };
                }
                time::sleep(self.poll_interval).await;
                operation = self
                    .request(Method::GET, &url, &[], &format!("operation {}", name))
                    .await?;
            }
        };

        let result = time::timeout(self.operation_timeout, wait).await;
        match result {
            Ok(result) => result,
            Err(_) => Err(CloudError::OperationTimeout {
                name,
                after: self.operation_timeout,
            }),
        }
    }
}

#[async_trait]
impl ComputeClient for RestComputeClient {
    async fn list_firewalls(&self, project: &str) -> Result<Vec<Firewall>, CloudError> {
        let url = global_url(&self.compute_base, project, "firewalls", None)?;
        self.list_all(&url, "firewalls").await
    }

    async fn delete_firewall(&self, project: &str, name: &str) -> Result<(), CloudError> {
        self.delete_global(project, "firewalls", name).await
    }

    async fn list_routes(&self, project: &str) -> Result<Vec<Route>, CloudError> {
        let url = global_url(&self.compute_base, project, "routes", None)?;
        self.list_all(&url, "routes").await
    }

    async fn delete_route(&self, project: &str, name: &str) -> Result<(), CloudError> {
        self.delete_global(project, "routes", name).await
    }

    async fn get_network(&self, project: &str, name: &str) -> Result<Option<Network>, CloudError> {
        let url = global_url(&self.compute_base, project, "networks", Some(name))?;
        match self
            .request(Method::GET, &url, &[], &format!("network {}", name))
            .await
        {
            Ok(network) => Ok(Some(network)),
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_service_account(
        &self,
        project: &str,
        email: &str,
    ) -> Result<Option<ServiceAccountInfo>, CloudError> {
        let url = service_account_url(&self.iam_base, project, email)?;
        match self
            .request(Method::GET, &url, &[], &format!("service account {}", email))
            .await
        {
            Ok(account) => Ok(Some(account)),
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Factory for [`RestComputeClient`]s sharing one HTTP connection pool
#[derive(Clone)]
pub struct RestComputeClientFactory {
    http: reqwest::Client,
    operation_timeout: Duration,
}

impl RestComputeClientFactory {
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            operation_timeout,
        }
    }
}

impl ComputeClientFactory for RestComputeClientFactory {
    fn new_client(&self, service_account: &ServiceAccount) -> Result<Arc<dyn ComputeClient>, CloudError> {
        Ok(Arc::new(RestComputeClient::new(
            self.http.clone(),
            service_account,
            self.operation_timeout,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::tokio::TokioIo;
    use tokio::net::TcpListener;

    struct StaticToken;

    #[async_trait]
    impl AccessTokens for StaticToken {
        async fn access_token(&self) -> Result<String, CloudError> {
            Ok("token".to_string())
        }
    }

    type Requests = Arc<Mutex<Vec<String>>>;

    /// Serve `handler(method, path, query)` on a local port and record each request
    async fn serve<F>(handler: F) -> (String, Requests)
    where
        F: Fn(&str, &str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler);
        let requests = Requests::default();
        let recorded = requests.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let method = req.method().to_string();
                        let path = req.uri().path().to_string();
                        let query = req.uri().query().unwrap_or_default().to_string();
                        recorded.lock().unwrap().push(format!("{} {}?{}", method, path, query));

                        let authorized = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            == Some("Bearer token");
                        let (status, body) = if authorized {
                            (*handler)(&method, &path, &query)
                        } else {
                            (401, String::new())
                        };

                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        *response.status_mut() = hyper::StatusCode::from_u16(status).unwrap();
                        async move { Ok::<_, Infallible>(response) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (format!("http://{}", addr), requests)
    }

    fn client(base: &str, operation_timeout: Duration) -> RestComputeClient {
        RestComputeClient::with_endpoints(
            reqwest::Client::new(),
            Box::new(StaticToken),
            base,
            base,
            operation_timeout,
            Duration::from_millis(10),
        )
    }

    fn operation(status: &str) -> String {
        format!(r#"{{"name": "operation-1", "status": "{}"}}"#, status)
    }

    #[tokio::test]
    async fn test_list_follows_page_tokens() {
        let (base, requests) = serve(|_: &str, _: &str, query: &str| {
            if query.contains("pageToken=page-2") {
                (200, r#"{"items": [{"name": "route-3", "network": "vpc"}]}"#.to_string())
            } else {
                (
                    200,
                    r#"{"items": [{"name": "route-1"}, {"name": "route-2"}], "nextPageToken": "page-2"}"#
                        .to_string(),
                )
            }
        })
        .await;

        let routes = client(&base, Duration::from_secs(5)).list_routes("project").await.unwrap();

        let names: Vec<&str> = routes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["route-1", "route-2", "route-3"]);
        assert_eq!(routes[2].network, "vpc");
        assert_eq!(
            *requests.lock().unwrap(),
            vec![
                "GET /projects/project/global/routes?maxResults=500",
                "GET /projects/project/global/routes?maxResults=500&pageToken=page-2",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_resources() {
        let (base, requests) = serve(|_: &str, _: &str, _: &str| {
            (404, r#"{"error": {"code": 404, "message": "The resource was not found"}}"#.to_string())
        })
        .await;
        let client = client(&base, Duration::from_secs(5));

        let err = client.delete_firewall("project", "k8s-fw").await.unwrap_err();
        assert!(matches!(err, CloudError::NotFound(_)));

        assert!(client.get_network("project", "vpc#x").await.unwrap().is_none());
        assert_eq!(
            *requests.lock().unwrap(),
            vec![
                "DELETE /projects/project/global/firewalls/k8s-fw?",
                "GET /projects/project/global/networks/vpc%23x?",
            ]
        );
    }

    #[tokio::test]
    async fn test_api_error() {
        let (base, _) = serve(|_: &str, _: &str, _: &str| {
            (403, r#"{"error": {"code": 403, "message": "Required 'compute.routes.list' permission"}}"#.to_string())
        })
        .await;

        match client(&base, Duration::from_secs(5)).list_routes("project").await {
            Err(CloudError::Api { status, message, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "Required 'compute.routes.list' permission");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_waits_for_operation() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let (base, requests) = serve(move |method: &str, path: &str, _: &str| match (method, path) {
            ("DELETE", "/projects/project/global/routes/shoot--foo--bar-route") => (200, operation("RUNNING")),
            ("GET", "/projects/project/global/operations/operation-1") => {
                let done = counter.fetch_add(1, Ordering::SeqCst) >= 2;
                (200, operation(if done { "DONE" } else { "RUNNING" }))
            }
            _ => (500, String::new()),
        })
        .await;

        client(&base, Duration::from_secs(5))
            .delete_route("project", "shoot--foo--bar-route")
            .await
            .unwrap();

        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(requests.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_operation() {
        let (base, _) = serve(|method: &str, _: &str, _: &str| match method {
            "DELETE" => (200, operation("PENDING")),
            _ => (
                200,
                r#"{"name": "operation-1", "status": "DONE", "error": {"errors": [{"code": "RESOURCE_IN_USE_BY_ANOTHER_RESOURCE", "message": "in use"}]}}"#
                    .to_string(),
            ),
        })
        .await;

        let err = client(&base, Duration::from_secs(5))
            .delete_firewall("project", "k8s-fw")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Operation { .. }));
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let (base, _) = serve(|_: &str, _: &str, _: &str| (200, operation("RUNNING"))).await;

        let err = client(&base, Duration::from_millis(100))
            .delete_firewall("project", "k8s-fw")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::OperationTimeout { .. }));
    }

    #[test]
    fn test_urls() {
        assert_eq!(
            global_url(COMPUTE_BASE_URL, "project", "firewalls", None).unwrap().as_str(),
            "https://compute.googleapis.com/compute/v1/projects/project/global/firewalls"
        );
        assert_eq!(
            global_url(COMPUTE_BASE_URL, "project", "networks", Some("vpc")).unwrap().as_str(),
            "https://compute.googleapis.com/compute/v1/projects/project/global/networks/vpc"
        );
        assert_eq!(
            service_account_url(IAM_BASE_URL, "project", "sa@project.iam.gserviceaccount.com")
                .unwrap()
                .as_str(),
            "https://iam.googleapis.com/v1/projects/project/serviceAccounts/sa@project.iam.gserviceaccount.com"
        );
        assert_eq!(
            global_url("http://127.0.0.1:8080", "project", "routes", None).unwrap().as_str(),
            "http://127.0.0.1:8080/projects/project/global/routes"
        );
    }

    #[test]
    fn test_url_segments_are_encoded() {
        let url = global_url(COMPUTE_BASE_URL, "project", "networks", Some("vpc#\"x/../y?z")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://compute.googleapis.com/compute/v1/projects/project/global/networks/vpc%23%22x%2F..%2Fy%3Fz"
        );
        assert!(url.fragment().is_none());
        assert!(url.query().is_none());
    }

    #[test]
    fn test_parse_list_page() {
        let page: ListPage<Firewall> = serde_json::from_str(
            r#"{
                "kind": "compute#firewallList",
                "items": [
                    {"name": "k8s-fw-a", "network": "https://www.googleapis.com/compute/v1/projects/p/global/networks/vpc"},
                    {"name": "user-fw"}
                ],
                "nextPageToken": "token-2"
            }"#,
        )
        .unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].network, "");
        assert_eq!(page.next_page_token.as_deref(), Some("token-2"));
    }

    #[test]
    fn test_parse_empty_page() {
        let page: ListPage<Route> = serde_json::from_str(r#"{"kind": "compute#routeList"}"#).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_operation_failure() {
        let op: Operation = serde_json::from_str(
            r#"{
                "name": "operation-1",
                "status": "DONE",
                "error": {"errors": [{"code": "RESOURCE_IN_USE_BY_ANOTHER_RESOURCE", "message": "in use"}]}
            }"#,
        )
        .unwrap();
        assert_eq!(
            op.failure().as_deref(),
            Some("RESOURCE_IN_USE_BY_ANOTHER_RESOURCE: in use")
        );

        let op: Operation =
            serde_json::from_str(r#"{"name": "operation-2", "status": "DONE"}"#).unwrap();
        assert!(op.failure().is_none());
    }

    #[test]
    fn test_api_error_message() {
        assert_eq!(
            api_error_message(r#"{"error": {"code": 403, "message": "Required 'compute.firewalls.list' permission"}}"#),
            "Required 'compute.firewalls.list' permission"
        );
        assert_eq!(api_error_message("bad gateway\n"), "bad gateway");
    }

    #[test]
    fn test_error_conversion() {
        let timeout: CoreError = CloudError::OperationTimeout {
            name: "op".to_string(),
            after: Duration::from_secs(120),
        }
        .into();
        assert!(matches!(timeout, CoreError::Timeout { .. }));

        let api: CoreError = CloudError::NotFound("firewalls k8s-fw".to_string()).into();
        assert!(matches!(api, CoreError::CloudApi(_)));
    }
}
