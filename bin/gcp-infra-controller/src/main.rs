use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use extension_api::Infrastructure;
use extension_core::host::DEFAULT_STATUS_UPDATE_ATTEMPTS;
use extension_core::terraformer::{KubeTerraformerFactory, TerraformerConfig};
use extension_core::{HostClient, KubeHostClient, RetryPolicy, TeraChartRenderer};
use kube::{Client, CustomResourceExt};
use provider_gcp::{Actuator, ActuatorConfig, RestComputeClientFactory};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod infrastructure_controller;
mod metrics;
mod server;

use infrastructure_controller::{Context, ControllerConfig};
use metrics::Metrics;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "gcp-infra-controller")]
#[command(about = "Infrastructure controller for shoot clusters on GCP")]
struct Args {
    #[arg(long, help = "Print the Infrastructure CRD and exit")]
    crd: bool,

    #[arg(long, env = "PROVIDER_TYPE", default_value = "gcp")]
    provider_type: String,

    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 5)]
    max_concurrent_reconciles: u16,

    #[arg(long, env = "CHART_PATH", default_value = "charts/gcp-infra")]
    chart_path: PathBuf,

    #[arg(long, env = "TERRAFORMER_IMAGE")]
    terraformer_image: Option<String>,

    #[arg(long, env = "TERRAFORMER_SERVICE_ACCOUNT", default_value = "terraformer")]
    terraformer_service_account: String,

    #[arg(long, env = "TERRAFORMER_TIMEOUT_SECONDS", default_value_t = 3600)]
    terraformer_timeout_seconds: u64,

    #[arg(long, env = "DELETION_TIMEOUT_SECONDS", default_value_t = 120)]
    deletion_timeout_seconds: u64,

    #[arg(long, env = "CLEANUP_RETRY_INTERVAL_SECONDS", default_value_t = 10)]
    cleanup_retry_interval_seconds: u64,

    #[arg(long, env = "CLEANUP_RETRY_TIMEOUT_SECONDS", default_value_t = 300)]
    cleanup_retry_timeout_seconds: u64,

    #[arg(long, env = "STATUS_UPDATE_ATTEMPTS", default_value_t = DEFAULT_STATUS_UPDATE_ATTEMPTS)]
    status_update_attempts: u32,

    #[arg(long, env = "RECONCILE_TIMEOUT_SECONDS", default_value_t = 3600)]
    reconcile_timeout_seconds: u64,

    #[arg(long, env = "ERROR_REQUEUE_SECONDS", default_value_t = 60)]
    error_requeue_seconds: u64,

    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    #[arg(long, default_value = "info", help = "Log level (trace, debug, info, warn, error)")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.crd {
        println!("{}", serde_json::to_string_pretty(&Infrastructure::crd())?);
        return Ok(());
    }

    init_logging(&args);
    info!("Starting gcp-infra-controller...");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API");

    let mut terraformer_config = TerraformerConfig {
        service_account_name: args.terraformer_service_account.clone(),
        pod_timeout: Duration::from_secs(args.terraformer_timeout_seconds),
        deletion_timeout: Duration::from_secs(args.deletion_timeout_seconds),
        ..Default::default()
    };
    if let Some(image) = &args.terraformer_image {
        terraformer_config.image = image.clone();
    }

    let host: Arc<dyn HostClient> = Arc::new(KubeHostClient::new(client.clone(), args.status_update_attempts));
    let actuator = Actuator::new(
        host.clone(),
        Arc::new(TeraChartRenderer::new()),
        Arc::new(KubeTerraformerFactory::new(client.clone(), terraformer_config)),
        Arc::new(RestComputeClientFactory::new(Duration::from_secs(args.deletion_timeout_seconds))),
        ActuatorConfig {
            chart_path: args.chart_path.clone(),
            cleanup_retry: RetryPolicy::until_timeout(
                Duration::from_secs(args.cleanup_retry_interval_seconds),
                Duration::from_secs(args.cleanup_retry_timeout_seconds),
            ),
        },
    );

    let metrics = Metrics::new()?;
    let ctx = Arc::new(Context {
        client,
        actuator,
        host,
        metrics: metrics.clone(),
        config: ControllerConfig {
            provider_type: args.provider_type.clone(),
            max_concurrent_reconciles: args.max_concurrent_reconciles,
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_seconds),
            error_requeue: Duration::from_secs(args.error_requeue_seconds),
        },
    });

    let metrics_server = server::serve(args.metrics_addr, Arc::new(metrics));

    tokio::select! {
        _ = infrastructure_controller::run(ctx) => info!("Infrastructure controller stopped"),
        result = metrics_server => {
            if let Err(e) = result {
                error!(error = %e, "Metrics server failed");
                return Err(e);
            }
        }
    }

    Ok(())
}
