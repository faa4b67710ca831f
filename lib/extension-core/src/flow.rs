//! A small task graph executor.
//!
//! Tasks run as soon as all of their dependencies completed. Tasks whose
//! condition is false are skipped and count as completed. The first failing
//! task cancels every task still in flight and fails the graph.

use std::collections::HashSet;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info};

use crate::retry::{retry_until_timeout, RetryPolicy};
use crate::Result;

/// Identifier of a task inside its graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

type TaskFn<'a> = Box<dyn Fn() -> BoxFuture<'a, Result<()>> + Send + Sync + 'a>;

/// A unit of work in a [`Graph`]
pub struct Task<'a> {
    name: String,
    func: TaskFn<'a>,
    condition: bool,
    retry: Option<RetryPolicy>,
    dependencies: Vec<TaskId>,
}

impl<'a> Task<'a> {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> BoxFuture<'a, Result<()>> + Send + Sync + 'a,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
            condition: true,
            retry: None,
            dependencies: Vec::new(),
        }
    }

    /// Only run the task when `condition` holds
    pub fn do_if(mut self, condition: bool) -> Self {
        self.condition = condition;
        self
    }

    /// Re-run the task on failure according to `policy`
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn depends_on(mut self, dependencies: &[TaskId]) -> Self {
        self.dependencies.extend_from_slice(dependencies);
        self
    }

    async fn execute(&self) -> Result<()> {
        match &self.retry {
            Some(policy) => retry_until_timeout(policy, &self.name, || (self.func)()).await,
            None => (self.func)().await,
        }
    }
}

/// A named set of tasks with dependencies between them
pub struct Graph<'a> {
    name: String,
    tasks: Vec<Task<'a>>,
}

impl<'a> Graph<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Add a task; dependencies must already be part of the graph
    pub fn add(&mut self, task: Task<'a>) -> TaskId {
        self.tasks.push(task);
        TaskId(self.tasks.len() - 1)
    }

    /// Run all tasks, returning the error of the first task that failed
    pub async fn run(self) -> Result<()> {
        let started_at = Instant::now();
        let tasks = self.tasks;
        let mut started: HashSet<usize> = HashSet::new();
        let mut completed: HashSet<usize> = HashSet::new();
        let mut running = FuturesUnordered::new();

        info!(graph = %self.name, tasks = tasks.len(), "Starting flow");

        loop {
            // Skipped tasks complete immediately and may unblock others
            let mut progressed = true;
            while progressed {
                progressed = false;
                for (idx, task) in tasks.iter().enumerate() {
                    if started.contains(&idx)
                        || !task.dependencies.iter().all(|d| completed.contains(&d.0))
                    {
                        continue;
                    }
                    started.insert(idx);

                    if !task.condition {
                        debug!(graph = %self.name, task = %task.name, "Skipping task");
                        completed.insert(idx);
                        progressed = true;
                        continue;
                    }

                    debug!(graph = %self.name, task = %task.name, "Starting task");
                    running.push(async move { (idx, task.execute().await) });
                }
            }

            match running.next().await {
                None => break,
                Some((idx, Ok(()))) => {
                    debug!(graph = %self.name, task = %tasks[idx].name, "Task succeeded");
                    completed.insert(idx);
                }
                Some((idx, Err(e))) => {
                    error!(
                        graph = %self.name,
                        task = %tasks[idx].name,
                        error = %e,
                        "Task failed, cancelling flow"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            graph = %self.name,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Flow finished"
        );
        Ok(())
    }
}
