//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thing_jobs::coordinator::Coordinator;
use thing_jobs::error::{Error, Result};
use thing_jobs::model::{
    JobDocument, JobExecution, JobId, JobStatus, RejectedError, StartNextJobExecutionResponse,
};
use thing_jobs::registry::JobsClient;
use thing_jobs::shutdown::ShutdownCoordinator;
use thing_jobs::slot::JobExecutor;
use thing_jobs::state::SharedState;
use thing_jobs::transport::memory::{JournalEntry, MemoryBroker, MemoryTransport};
use tokio::sync::Semaphore;

pub const THING: &str = "test-thing";
pub const AGENT: &str = "agent";

/// Executor whose jobs block until the test releases them. Tracks how many
/// run at once.
#[derive(Clone)]
pub struct GatedExecutor {
    gate: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<JobId>>>,
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Let `n` blocked (or future) jobs finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> Vec<JobId> {
        self.started.lock().unwrap().clone()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl JobExecutor for GatedExecutor {
    async fn execute(&self, job_id: &JobId, _document: &JobDocument) -> Result<JobStatus> {
        self.started.lock().unwrap().push(job_id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let permit = self.gate.acquire().await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        permit
            .map(|p| p.forget())
            .map_err(|e| Error::Other(e.to_string()))?;
        Ok(JobStatus::Succeeded)
    }
}

/// Executor that always fails locally.
pub struct FailingExecutor;

impl JobExecutor for FailingExecutor {
    async fn execute(&self, job_id: &JobId, _document: &JobDocument) -> Result<JobStatus> {
        Err(Error::Work {
            job_id: job_id.to_string(),
            reason: "disk full".to_string(),
        })
    }
}

/// A coordinator on a memory broker with nobody answering: tests feed the
/// responses by hand.
pub struct Harness {
    pub broker: MemoryBroker,
    pub coordinator: Coordinator<MemoryTransport, GatedExecutor>,
    pub shutdown: ShutdownCoordinator<MemoryTransport>,
    pub executor: GatedExecutor,
    pub client: JobsClient<MemoryTransport>,
}

impl Harness {
    pub fn new() -> Self {
        let broker = MemoryBroker::new();
        let transport = Arc::new(broker.connect(AGENT));
        let state = SharedState::new();
        let client = JobsClient::new(Arc::clone(&transport), THING);
        let shutdown = ShutdownCoordinator::new(state.clone(), transport);
        let executor = GatedExecutor::new();
        let coordinator = Coordinator::new(
            state,
            client.clone(),
            Arc::new(executor.clone()),
            shutdown.clone(),
        );
        Self {
            broker,
            coordinator,
            shutdown,
            executor,
            client,
        }
    }

    /// Answer the newest outstanding start-next request.
    pub fn accept(&self, response: StartNextJobExecutionResponse) {
        answer(&self.coordinator, response);
    }

    /// Reject the newest outstanding start-next request.
    pub fn reject_start(&self, mut rejected: RejectedError) {
        rejected.client_token = self.coordinator.start_tokens().last().cloned();
        self.coordinator.on_start_rejected(rejected);
    }

    /// Start-next requests published so far.
    pub fn start_requests(&self) -> usize {
        published(&self.broker, AGENT, &self.client.topics().start_next())
    }

    /// Update requests published so far for `job_id`.
    pub fn update_requests(&self, job_id: &str) -> usize {
        published(&self.broker, AGENT, &self.client.topics().update(job_id))
    }
}

pub fn published(broker: &MemoryBroker, client: &str, topic: &str) -> usize {
    broker
        .journal()
        .iter()
        .filter(|e| {
            matches!(e, JournalEntry::Published { client_id, topic: t }
                if client_id == client && t == topic)
        })
        .count()
}

pub fn job(job_id: &str) -> StartNextJobExecutionResponse {
    StartNextJobExecutionResponse {
        execution: Some(JobExecution {
            job_id: JobId::from(job_id),
            thing_name: Some(THING.to_string()),
            status: JobStatus::InProgress,
            job_document: Some(JobDocument::new()),
            status_details: None,
            queued_at: None,
            started_at: None,
            last_updated_at: None,
            version_number: Some(2),
            execution_number: Some(1),
        }),
        ..Default::default()
    }
}

pub fn no_job() -> StartNextJobExecutionResponse {
    StartNextJobExecutionResponse::default()
}

/// Deliver `response` as the answer to the newest outstanding start-next
/// request of `coordinator`.
pub fn answer<E: JobExecutor>(
    coordinator: &Coordinator<MemoryTransport, E>,
    mut response: StartNextJobExecutionResponse,
) {
    response.client_token = coordinator.start_tokens().last().cloned();
    coordinator.on_start_accepted(response);
}

/// `response` as the answer to a specific request.
pub fn answering(token: &str, mut response: StartNextJobExecutionResponse) -> StartNextJobExecutionResponse {
    response.client_token = Some(token.to_string());
    response
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub const WAIT: Duration = Duration::from_secs(5);
