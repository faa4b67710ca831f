//! Values consumed by the Terraformer chart
//!
//! The output keys are a contract between the chart, which emits terraform
//! outputs under these names, and the status deriver, which reads them back.

use extension_api::gcp::InfrastructureConfig;
use extension_api::{ClusterContext, Infrastructure};
use kube::ResourceExt;
use serde_json::{json, Map, Value};

use crate::ServiceAccount;

/// VPC name the chart resolves to the network it creates itself
pub const DEFAULT_VPC_NAME: &str = "${google_compute_network.network.name}";

/// Default minimum number of NAT ports per VM
pub const DEFAULT_MIN_PORTS_PER_VM: u32 = 2048;

pub const TERRAFORMER_OUTPUT_KEY_VPC_NAME: &str = "vpc_name";
pub const TERRAFORMER_OUTPUT_KEY_CLOUD_ROUTER: &str = "cloud_router";
pub const TERRAFORMER_OUTPUT_KEY_SERVICE_ACCOUNT_EMAIL: &str = "service_account_email";
pub const TERRAFORMER_OUTPUT_KEY_SUBNET_NODES: &str = "subnet_nodes";
pub const TERRAFORMER_OUTPUT_KEY_SUBNET_INTERNAL: &str = "subnet_internal";

/// Build the chart values for an Infrastructure
pub fn compute_terraformer_values(
    infra: &Infrastructure,
    service_account: &ServiceAccount,
    config: &InfrastructureConfig,
    cluster: &ClusterContext,
) -> Value {
    let networks_config = &config.networks;
    let create_vpc = networks_config.vpc.is_none();

    let mut vpc = Map::new();
    vpc.insert(
        "name".to_string(),
        json!(networks_config
            .vpc
            .as_ref()
            .map(|v| v.name.as_str())
            .unwrap_or(DEFAULT_VPC_NAME)),
    );
    if let Some(router) = networks_config.vpc.as_ref().and_then(|v| v.cloud_router.as_ref()) {
        vpc.insert("cloudRouter".to_string(), json!({ "name": router.name }));
    }

    let mut networks = Map::new();
    networks.insert("pods".to_string(), json!(cluster.pods_cidr));
    networks.insert("services".to_string(), json!(cluster.services_cidr));
    networks.insert("worker".to_string(), json!(networks_config.worker));
    if let Some(internal) = &networks_config.internal {
        networks.insert("internal".to_string(), json!(internal));
    }
    networks.insert(
        "cloudNAT".to_string(),
        json!({
            "minPortsPerVM": networks_config
                .cloud_nat
                .as_ref()
                .and_then(|nat| nat.min_ports_per_vm)
                .unwrap_or(DEFAULT_MIN_PORTS_PER_VM),
        }),
    );
    if let Some(flow_logs) = &networks_config.flow_logs {
        let mut logs = Map::new();
        if let Some(interval) = &flow_logs.aggregation_interval {
            logs.insert("aggregationInterval".to_string(), json!(interval));
        }
        if let Some(sampling) = flow_logs.flow_sampling {
            logs.insert("flowSampling".to_string(), json!(sampling));
        }
        if let Some(metadata) = &flow_logs.metadata {
            logs.insert("metadata".to_string(), json!(metadata));
        }
        networks.insert("flowLogs".to_string(), Value::Object(logs));
    }

    json!({
        "google": {
            "region": infra.spec.region,
            "project": service_account.project_id,
        },
        "create": {
            "vpc": create_vpc,
        },
        "vpc": vpc,
        "clusterName": infra.namespace().unwrap_or_default(),
        "networks": networks,
        "outputKeys": {
            "vpcName": TERRAFORMER_OUTPUT_KEY_VPC_NAME,
            "cloudRouter": TERRAFORMER_OUTPUT_KEY_CLOUD_ROUTER,
            "serviceAccountEmail": TERRAFORMER_OUTPUT_KEY_SERVICE_ACCOUNT_EMAIL,
            "subnetNodes": TERRAFORMER_OUTPUT_KEY_SUBNET_NODES,
            "subnetInternal": TERRAFORMER_OUTPUT_KEY_SUBNET_INTERNAL,
        },
    })
}

/// Variable values handed to terraform; carries the credential
pub fn terraform_tfvars(service_account: &ServiceAccount) -> Vec<u8> {
    // A JSON string literal is a valid HCL string literal
    let quoted = Value::String(service_account.raw.clone()).to_string();
    format!("SERVICEACCOUNT = {}\n", quoted).into_bytes()
}

/// Output variables the chart emits for `config`
pub fn output_keys(config: &InfrastructureConfig) -> Vec<&'static str> {
    let mut keys = vec![
        TERRAFORMER_OUTPUT_KEY_VPC_NAME,
        TERRAFORMER_OUTPUT_KEY_SERVICE_ACCOUNT_EMAIL,
        TERRAFORMER_OUTPUT_KEY_SUBNET_NODES,
    ];
    let vpc = config.networks.vpc.as_ref();
    if vpc.is_none() || vpc.and_then(|v| v.cloud_router.as_ref()).is_some() {
        keys.push(TERRAFORMER_OUTPUT_KEY_CLOUD_ROUTER);
    }
    if config.networks.internal.is_some() {
        keys.push(TERRAFORMER_OUTPUT_KEY_SUBNET_INTERNAL);
    }
    keys
}
