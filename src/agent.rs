//! The jobs agent workflow for one thing.
//!
//! 1. List pending executions (and stop there in CI mode).
//! 2. Subscribe to the next-changed events and the start-next / update
//!    response topics, waiting for every acknowledgement.
//! 3. Ask for the first job; from then on the coordinator is driven by
//!    incoming messages until something requests shutdown.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::model::{GetPendingJobExecutionsResponse, JobExecutionSummary};
use crate::registry::JobsClient;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownReason};
use crate::slot::JobExecutor;
use crate::state::SharedState;
use crate::transport::{ConnectionEvent, Transport};

/// Result of a CI listing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiVerdict {
    JobsPending(usize),
    NoJobs,
    Error(String),
}

impl CiVerdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            CiVerdict::JobsPending(_) => 0,
            CiVerdict::NoJobs | CiVerdict::Error(_) => 1,
        }
    }
}

pub struct JobsAgent<T: Transport, E: JobExecutor> {
    config: AgentConfig,
    client: JobsClient<T>,
    coordinator: Coordinator<T, E>,
    shutdown: ShutdownCoordinator<T>,
}

impl<T: Transport, E: JobExecutor> JobsAgent<T, E> {
    pub fn new(transport: Arc<T>, executor: E, config: AgentConfig) -> Self {
        let state = SharedState::new();
        let client = JobsClient::new(Arc::clone(&transport), &config.thing_name);
        let shutdown = ShutdownCoordinator::new(state.clone(), transport);
        let coordinator = Coordinator::new(
            state,
            client.clone(),
            Arc::new(executor),
            shutdown.clone(),
        );
        coordinator.set_exit_when_idle(config.exit_when_idle);
        Self {
            config,
            client,
            coordinator,
            shutdown,
        }
    }

    pub fn client(&self) -> &JobsClient<T> {
        &self.client
    }

    pub fn coordinator(&self) -> &Coordinator<T, E> {
        &self.coordinator
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator<T> {
        &self.shutdown
    }

    /// Fetch and log the in-progress and queued executions.
    pub async fn list_pending(&self) -> Result<GetPendingJobExecutionsResponse> {
        info!(thing = %self.config.thing_name, "getting pending jobs");
        let pending = self
            .client
            .get_pending_job_executions(self.config.response_timeout)
            .await?;

        for job in &pending.in_progress_jobs {
            info!("In Progress: {}", describe(job));
        }
        for job in &pending.queued_jobs {
            info!("{}", describe(job));
        }
        if pending.is_empty() {
            info!("no pending jobs");
        }
        Ok(pending)
    }

    /// Subscribe to everything the coordinator reacts to. Each subscription
    /// is acknowledged before the next one is issued, and all of them before
    /// the first start-next request goes out.
    pub async fn subscribe(&self) -> Result<()> {
        let c = self.coordinator.clone();
        self.client
            .subscribe_to_next_job_execution_changed_events(move |event| match event {
                Ok(event) => c.on_next_job_execution_changed(event),
                Err(e) => c.fail(&e),
            })
            .await?;

        let c = self.coordinator.clone();
        self.client
            .subscribe_to_start_next_accepted(move |response| match response {
                Ok(response) => c.on_start_accepted(response),
                Err(e) => c.fail(&e),
            })
            .await?;

        let c = self.coordinator.clone();
        self.client
            .subscribe_to_start_next_rejected(move |rejected| match rejected {
                Ok(rejected) => c.on_start_rejected(rejected),
                Err(e) => c.fail(&e),
            })
            .await?;

        let c = self.coordinator.clone();
        self.client
            .subscribe_to_update_accepted(move |response| match response {
                Ok((job_id, response)) => c.on_update_accepted(job_id, response),
                Err(e) => c.fail(&e),
            })
            .await?;

        let c = self.coordinator.clone();
        self.client
            .subscribe_to_update_rejected(move |rejected| match rejected {
                Ok((job_id, rejected)) => c.on_update_rejected(job_id, rejected),
                Err(e) => c.fail(&e),
            })
            .await
    }

    /// Follow connection events and issue the first start-next request.
    pub fn start(&self) {
        self.watch_connection();
        self.coordinator.try_start_next();
    }

    /// List, subscribe, start, then wait for shutdown.
    pub async fn run(&self) -> ShutdownOutcome {
        if let Err(e) = self.prepare().await {
            error!(error = %e, "agent failed to start");
            self.coordinator.fail(&e);
        } else {
            self.start();
        }
        self.shutdown.wait().await
    }

    async fn prepare(&self) -> Result<()> {
        self.list_pending().await?;
        self.subscribe().await
    }

    /// List pending jobs once, then shut down.
    pub async fn run_ci(&self) -> CiVerdict {
        let verdict = match self.list_pending().await {
            Ok(pending) if pending.is_empty() => CiVerdict::NoJobs,
            Ok(pending) => CiVerdict::JobsPending(pending.len()),
            Err(e) => {
                error!(error = %e, "listing pending jobs failed");
                CiVerdict::Error(e.to_string())
            }
        };
        self.shutdown
            .request_shutdown(ShutdownReason::Finished("ci listing done".to_string()));
        self.shutdown.wait().await;
        verdict
    }

    fn watch_connection(&self) {
        let mut events = self.client.transport().connection_events();
        let coordinator = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.wait() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ConnectionEvent::Interrupted { reason }) => {
                        warn!(%reason, "connection interrupted");
                    }
                    Ok(ConnectionEvent::Resumed { session_present }) => {
                        info!(session_present, "connection resumed");
                        coordinator.on_connection_resumed(session_present);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed connection events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

fn describe(job: &JobExecutionSummary) -> String {
    match job.last_updated_at {
        Some(at) => format!("{} @ {}", job.job_id, at.to_rfc3339()),
        None => job.job_id.to_string(),
    }
}
