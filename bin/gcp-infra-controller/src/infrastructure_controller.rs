//! Infrastructure controller
//!
//! Watches Infrastructure resources of the configured provider type, hands
//! them to the actuator and records the outcome in `status.lastOperation`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use extension_api::v1alpha1::{LastError, LastOperation, LastOperationState, LastOperationType};
use extension_api::Infrastructure;
use extension_core::retry::with_deadline;
use extension_core::{CoreError, HostClient};
use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{self, Action, Controller};
use kube_runtime::finalizer::{self, finalizer, Event as FinalizerEvent};
use kube_runtime::watcher;
use provider_gcp::Actuator;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::Metrics;

pub const FINALIZER_NAME: &str = "extensions.gardener.cloud/gcp";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<finalizer::Error<CoreError>>),
}

impl Error {
    fn actuator_error(&self) -> Option<&CoreError> {
        match self {
            Error::Finalizer(e) => match e.as_ref() {
                finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => Some(e),
                _ => None,
            },
        }
    }

    fn is_permanent(&self) -> bool {
        self.actuator_error().is_some_and(CoreError::is_permanent)
    }
}

/// Settings fixed at startup
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Only Infrastructures with this `spec.type` are handled
    pub provider_type: String,
    pub max_concurrent_reconciles: u16,
    /// Deadline for a single reconcile or delete
    pub reconcile_timeout: Duration,
    /// Delay before a failed operation is retried
    pub error_requeue: Duration,
}

pub struct Context {
    pub client: Client,
    pub actuator: Actuator,
    pub host: Arc<dyn HostClient>,
    pub metrics: Metrics,
    pub config: ControllerConfig,
}

pub async fn run(ctx: Arc<Context>) {
    let infrastructures: Api<Infrastructure> = Api::all(ctx.client.clone());
    let config = controller::Config::default().concurrency(ctx.config.max_concurrent_reconciles);

    info!(
        provider_type = %ctx.config.provider_type,
        concurrency = ctx.config.max_concurrent_reconciles,
        "Starting Infrastructure controller"
    );

    Controller::new(infrastructures, watcher::Config::default())
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(object = %obj, "Reconciled Infrastructure"),
                Err(e) => warn!(error = %e, "Infrastructure reconciliation failed"),
            }
        })
        .await;
}

#[instrument(skip(ctx, infra), fields(name = %infra.name_any(), namespace = ?infra.namespace()))]
async fn reconcile(infra: Arc<Infrastructure>, ctx: Arc<Context>) -> Result<Action, Error> {
    if infra.spec.type_ != ctx.config.provider_type {
        return Ok(Action::await_change());
    }

    let namespace = infra.namespace().unwrap_or_default();
    let api: Api<Infrastructure> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, infra, |event| async {
        match event {
            FinalizerEvent::Apply(infra) => apply(infra, &ctx).await,
            FinalizerEvent::Cleanup(infra) => cleanup(infra, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// What to do with an Infrastructure that is not being deleted
#[derive(Debug, PartialEq, Eq)]
enum NextStep {
    Reconcile,
    /// The current generation was already reconciled successfully
    UpToDate,
    /// The last attempt failed recently; wait out the remaining backoff
    Backoff(Duration),
}

/// Status writes trigger watch events; only reconcile when there is work left
fn next_step(infra: &Infrastructure, now: DateTime<Utc>, error_requeue: Duration) -> NextStep {
    let Some(status) = infra.status.as_ref() else {
        return NextStep::Reconcile;
    };
    let Some(last_operation) = status.last_operation.as_ref() else {
        return NextStep::Reconcile;
    };
    if status.observed_generation != infra.metadata.generation
        || last_operation.type_ != LastOperationType::Reconcile
    {
        return NextStep::Reconcile;
    }

    match last_operation.state {
        LastOperationState::Succeeded => NextStep::UpToDate,
        LastOperationState::Processing => NextStep::Reconcile,
        LastOperationState::Error => {
            let updated = DateTime::parse_from_rfc3339(&last_operation.last_update_time)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now);
            let elapsed = (now - updated).to_std().unwrap_or_default();
            match error_requeue.checked_sub(elapsed) {
                Some(remaining) if !remaining.is_zero() => NextStep::Backoff(remaining),
                _ => NextStep::Reconcile,
            }
        }
    }
}

async fn apply(infra: Arc<Infrastructure>, ctx: &Context) -> Result<Action, CoreError> {
    match next_step(&infra, Utc::now(), ctx.config.error_requeue) {
        NextStep::Reconcile => {}
        NextStep::UpToDate => return Ok(Action::await_change()),
        NextStep::Backoff(remaining) => {
            debug!(remaining = ?remaining, "Last reconciliation failed recently, waiting");
            return Ok(Action::requeue(remaining));
        }
    }

    let namespace = infra.namespace().unwrap_or_default();
    let started_at = Instant::now();

    let processing = Outcome::Processing("Reconciling the infrastructure");
    record(ctx, &infra, LastOperationType::Reconcile, processing).await?;

    let result = async {
        let cluster = ctx
            .host
            .get_cluster(&namespace)
            .await
            .map_err(|e| e.during("reconcile", format!("{}/{}", namespace, infra.name_any())))?
            .context();
        with_deadline(
            ctx.config.reconcile_timeout,
            "infrastructure reconciliation",
            ctx.actuator.reconcile(&infra, &cluster),
        )
        .await
    }
    .await;

    match result {
        Ok(status) => {
            info!(vpc = %status.networks.vpc.name, "Infrastructure reconciled");
            ctx.metrics.observe_success("reconcile", started_at.elapsed());
            let succeeded = Outcome::Succeeded("Infrastructure is reconciled");
            record(ctx, &infra, LastOperationType::Reconcile, succeeded).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.metrics.observe_failure("reconcile", e.kind(), started_at.elapsed());
            record_failure(ctx, &infra, LastOperationType::Reconcile, &e).await;
            Err(e)
        }
    }
}

async fn cleanup(infra: Arc<Infrastructure>, ctx: &Context) -> Result<Action, CoreError> {
    let started_at = Instant::now();

    let processing = Outcome::Processing("Deleting the infrastructure");
    record(ctx, &infra, LastOperationType::Delete, processing).await?;

    let result = with_deadline(
        ctx.config.reconcile_timeout,
        "infrastructure deletion",
        ctx.actuator.delete(&infra),
    )
    .await;

    match result {
        Ok(()) => {
            info!("Infrastructure deleted");
            ctx.metrics.observe_success("delete", started_at.elapsed());
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.metrics.observe_failure("delete", e.kind(), started_at.elapsed());
            record_failure(ctx, &infra, LastOperationType::Delete, &e).await;
            Err(e)
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Outcome<'a> {
    Processing(&'a str),
    Succeeded(&'a str),
    Failed(&'a CoreError),
}

/// Write `status.lastOperation` and `status.lastError`
async fn record(
    ctx: &Context,
    infra: &Infrastructure,
    type_: LastOperationType,
    outcome: Outcome<'_>,
) -> Result<(), CoreError> {
    let (last_operation, last_error) = last_operation(type_, outcome, Utc::now());
    ctx.host
        .update_last_operation(
            &infra.namespace().unwrap_or_default(),
            &infra.name_any(),
            infra.metadata.generation,
            last_operation,
            last_error,
        )
        .await
}

/// The operation error takes precedence over a failed status write
async fn record_failure(ctx: &Context, infra: &Infrastructure, type_: LastOperationType, e: &CoreError) {
    if let Err(record_error) = record(ctx, infra, type_, Outcome::Failed(e)).await {
        warn!(error = %record_error, "Failed to record the last error");
    }
}

fn last_operation(
    type_: LastOperationType,
    outcome: Outcome<'_>,
    now: DateTime<Utc>,
) -> (LastOperation, Option<LastError>) {
    let (state, description, last_error) = match outcome {
        Outcome::Processing(description) => (LastOperationState::Processing, description.to_string(), None),
        Outcome::Succeeded(description) => (LastOperationState::Succeeded, description.to_string(), None),
        Outcome::Failed(e) => (
            LastOperationState::Error,
            e.to_string(),
            Some(LastError {
                description: e.to_string(),
            }),
        ),
    };

    (
        LastOperation {
            type_,
            state,
            description,
            last_update_time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        },
        last_error,
    )
}

fn error_policy(infra: Arc<Infrastructure>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_permanent() {
        error!(
            name = %infra.name_any(),
            namespace = ?infra.namespace(),
            error = %error,
            "Infrastructure configuration is invalid, waiting for a change"
        );
        return Action::await_change();
    }

    error!(
        name = %infra.name_any(),
        namespace = ?infra.namespace(),
        error = %error,
        "Infrastructure operation failed, requeueing"
    );
    Action::requeue(ctx.config.error_requeue)
}
