//! Work execution slot: runs one job and reports its status upstream.
//!
//! The slot never touches the coordinator lock. After the executor returns it
//! publishes the update request; the coordinator learns the job is finished
//! when the service accepts that update. Executor errors and publish failures
//! are fatal and go straight to the shutdown coordinator.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::process::Command;
use tracing::{Instrument, debug, info};

use crate::error::{Error, Result};
use crate::model::{JobDocument, JobId, JobStatus, UpdateJobExecutionRequest};
use crate::registry::JobsClient;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::telemetry::job::{record_state_transition, record_status, start_job_span};
use crate::telemetry::metrics;
use crate::transport::Transport;

/// Performs the local part of a job.
///
/// `Ok(status)` is reported upstream as the job's final status. `Err` is a
/// local failure and stops the agent.
pub trait JobExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        job_id: &JobId,
        document: &JobDocument,
    ) -> impl Future<Output = Result<JobStatus>> + Send;
}

/// Emulates work by sleeping, then succeeds.
#[derive(Debug, Clone)]
pub struct SleepExecutor {
    pub duration: Duration,
}

impl SleepExecutor {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl JobExecutor for SleepExecutor {
    async fn execute(&self, job_id: &JobId, _document: &JobDocument) -> Result<JobStatus> {
        debug!(%job_id, duration_ms = self.duration.as_millis() as u64, "emulating work");
        tokio::time::sleep(self.duration).await;
        Ok(JobStatus::Succeeded)
    }
}

/// Runs `{"operation": "run", "command": "...", "args": [...]}` documents as
/// child processes. Exit status 0 succeeds, anything else fails. Documents
/// it cannot interpret are reported as `REJECTED`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    thing_name: String,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(thing_name: &str) -> Self {
        Self {
            thing_name: thing_name.to_string(),
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Command line extracted from a job document.
#[derive(Debug, PartialEq, Eq)]
struct CommandSpec {
    program: String,
    args: Vec<String>,
}

fn command_spec(document: &JobDocument) -> Option<CommandSpec> {
    if document.get("operation").and_then(|v| v.as_str()) != Some("run") {
        return None;
    }
    let program = document.get("command")?.as_str()?.to_string();
    let args = match document.get("args") {
        None => Vec::new(),
        Some(serde_json::Value::Array(values)) => values
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()?,
        Some(_) => return None,
    };
    Some(CommandSpec { program, args })
}

impl JobExecutor for CommandExecutor {
    async fn execute(&self, job_id: &JobId, document: &JobDocument) -> Result<JobStatus> {
        let Some(spec) = command_spec(document) else {
            info!(%job_id, "job document is not a runnable command, rejecting");
            return Ok(JobStatus::Rejected);
        };

        debug!(%job_id, program = %spec.program, args = ?spec.args, "running job command");
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env("THING_JOBS_JOB_ID", job_id.as_str())
            .env("THING_JOBS_THING", &self.thing_name)
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let status = command.status().await.map_err(|e| Error::Work {
            job_id: job_id.to_string(),
            reason: format!("cannot run {}: {e}", spec.program),
        })?;

        if status.success() {
            Ok(JobStatus::Succeeded)
        } else {
            info!(%job_id, code = status.code().unwrap_or(-1), "job command failed");
            Ok(JobStatus::Failed)
        }
    }
}

/// One active unit of work.
pub struct WorkSlot<T: Transport, E: JobExecutor> {
    client: JobsClient<T>,
    executor: Arc<E>,
    shutdown: ShutdownCoordinator<T>,
}

impl<T: Transport, E: JobExecutor> WorkSlot<T, E> {
    pub fn new(client: JobsClient<T>, executor: Arc<E>, shutdown: ShutdownCoordinator<T>) -> Self {
        Self {
            client,
            executor,
            shutdown,
        }
    }

    /// Execute the job and publish its final status.
    pub async fn run(self, job_id: JobId, document: JobDocument) {
        let span = start_job_span(self.client.thing_name(), &job_id);
        record_state_transition(&span, "starting", "working");
        let result = self
            .execute_and_report(&job_id, &document, &span)
            .instrument(span.clone())
            .await;
        if let Err(e) = result {
            self.shutdown.request_shutdown(ShutdownReason::failed(&e));
        }
    }

    async fn execute_and_report(
        &self,
        job_id: &JobId,
        document: &JobDocument,
        span: &tracing::Span,
    ) -> Result<()> {
        info!("starting local work on job");
        let started = Instant::now();
        let status = self.executor.execute(job_id, document).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        record_status(span, &status.to_string());
        metrics::executions().add(1, &[KeyValue::new("status", status.to_string())]);
        metrics::execution_duration_ms().record(duration_ms as f64, &[]);
        info!(%status, duration_ms, "done working on job");

        let token = self
            .client
            .publish_update_job_execution(job_id, &UpdateJobExecutionRequest::new(status))
            .await?;
        info!(%status, token, "published request to update job status");
        Ok(())
    }
}
