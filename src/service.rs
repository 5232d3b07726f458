//! In-process jobs service.
//!
//! Speaks the jobs topics over a [`MemoryBroker`]: answers `get`,
//! `start-next` and `<job>/update` requests for any thing, and publishes
//! `notify-next` whenever a thing's next pending execution changes. Requests
//! are handled one at a time in arrival order. Used by `--simulate` runs and
//! by the integration tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    GetPendingJobExecutionsRequest, GetPendingJobExecutionsResponse, JobDocument, JobExecution,
    JobExecutionState, JobExecutionSummary, JobId, JobStatus, NextJobExecutionChangedEvent,
    RejectedError, StartNextJobExecutionResponse, StartNextPendingJobExecutionRequest,
    UpdateJobExecutionRequest, UpdateJobExecutionResponse,
};
use crate::topics::{JobTopics, ParsedTopic, Response, parse_request_topic};
use crate::transport::memory::{MemoryBroker, MemoryTransport};
use crate::transport::{Message, MessageHandler, QoS, Transport};

const REQUEST_FILTERS: [&str; 3] = [
    "$aws/things/+/jobs/get",
    "$aws/things/+/jobs/start-next",
    "$aws/things/+/jobs/+/update",
];

/// Jobs to seed a simulated service with, loaded from TOML:
///
/// ```toml
/// [[job]]
/// id = "firmware-42"
/// document = { operation = "run", command = "true" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobsFile {
    #[serde(default, rename = "job")]
    pub jobs: Vec<SeedJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedJob {
    pub id: String,
    #[serde(default)]
    pub document: JobDocument,
}

impl JobsFile {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("invalid jobs file: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }
}

/// A job that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    pub thing: String,
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Clone)]
struct StoredJob {
    id: JobId,
    document: JobDocument,
    status: JobStatus,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    last_updated_at: DateTime<Utc>,
    version: i64,
}

impl StoredJob {
    fn summary(&self) -> JobExecutionSummary {
        JobExecutionSummary {
            job_id: self.id.clone(),
            queued_at: Some(self.queued_at),
            started_at: self.started_at,
            last_updated_at: Some(self.last_updated_at),
            version_number: Some(self.version),
            execution_number: Some(1),
        }
    }

    fn execution(&self, thing: &str) -> JobExecution {
        JobExecution {
            job_id: self.id.clone(),
            thing_name: Some(thing.to_string()),
            status: self.status,
            job_document: Some(self.document.clone()),
            status_details: None,
            queued_at: Some(self.queued_at),
            started_at: self.started_at,
            last_updated_at: Some(self.last_updated_at),
            version_number: Some(self.version),
            execution_number: Some(1),
        }
    }
}

#[derive(Default)]
struct ServiceState {
    things: HashMap<String, Vec<StoredJob>>,
    rejections: HashMap<&'static str, VecDeque<RejectedError>>,
    requests: HashMap<&'static str, usize>,
    completed: Vec<CompletedJob>,
}

impl ServiceState {
    /// In-progress executions come first, then queued ones in arrival order.
    fn next_job(&self, thing: &str) -> Option<&StoredJob> {
        let jobs = self.things.get(thing)?;
        jobs.iter()
            .find(|j| j.status == JobStatus::InProgress)
            .or_else(|| jobs.iter().find(|j| j.status == JobStatus::Queued))
    }

    fn next_job_id(&self, thing: &str) -> Option<JobId> {
        self.next_job(thing).map(|j| j.id.clone())
    }

    fn take_rejection(&mut self, operation: &'static str) -> Option<RejectedError> {
        *self.requests.entry(operation).or_default() += 1;
        self.rejections.get_mut(operation)?.pop_front()
    }
}

/// Handle to a running simulated service. Cheap to clone.
#[derive(Clone)]
pub struct SimulatedJobsService {
    transport: Arc<MemoryTransport>,
    state: Arc<Mutex<ServiceState>>,
}

impl SimulatedJobsService {
    /// Connect to `broker`, subscribe to all request topics and start serving.
    pub async fn start(broker: &MemoryBroker) -> Result<Self> {
        let transport = Arc::new(broker.connect("jobs-service"));
        let service = Self {
            transport: Arc::clone(&transport),
            state: Arc::new(Mutex::new(ServiceState::default())),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        for filter in REQUEST_FILTERS {
            let tx = tx.clone();
            let handler: MessageHandler = Arc::new(move |message: Message| {
                let _ = tx.send(message);
            });
            transport.subscribe(filter, QoS::AtLeastOnce, handler).await?;
        }

        let worker = service.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = worker.handle(&message).await {
                    warn!(topic = %message.topic, error = %e, "simulated service failed to answer");
                }
            }
        });

        info!("simulated jobs service running");
        Ok(service)
    }

    /// Start with the jobs of `file` queued for `thing`.
    pub async fn start_seeded(broker: &MemoryBroker, thing: &str, file: &JobsFile) -> Result<Self> {
        let service = Self::start(broker).await?;
        for job in &file.jobs {
            service.add_job(thing, &job.id, job.document.clone()).await?;
        }
        Ok(service)
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a job for `thing`. Publishes `notify-next` if it became the next job.
    pub async fn add_job(&self, thing: &str, job_id: &str, document: JobDocument) -> Result<()> {
        let (before, after) = {
            let mut state = self.lock();
            let before = state.next_job_id(thing);
            let now = Utc::now();
            state.things.entry(thing.to_string()).or_default().push(StoredJob {
                id: JobId::from(job_id),
                document,
                status: JobStatus::Queued,
                queued_at: now,
                started_at: None,
                last_updated_at: now,
                version: 1,
            });
            (before, state.next_job_id(thing))
        };
        debug!(thing, job_id, "job queued");
        if before != after {
            self.publish_next_changed(thing).await?;
        }
        Ok(())
    }

    /// Make the next request of `operation` ("get-pending", "start-next" or
    /// "update") fail with `code`.
    pub fn reject_next(&self, operation: &'static str, code: &str, message: &str) {
        self.lock()
            .rejections
            .entry(operation)
            .or_default()
            .push_back(RejectedError::new(code, message));
    }

    /// Publish the current next pending execution of `thing` (if any).
    pub async fn publish_next_changed(&self, thing: &str) -> Result<()> {
        let execution = self.lock().next_job(thing).map(|j| j.execution(thing));
        let event = NextJobExecutionChangedEvent {
            execution,
            timestamp: Some(Utc::now()),
        };
        self.publish(&JobTopics::new(thing).notify_next(), &event)
            .await
    }

    /// Jobs that reached a terminal status, in completion order.
    pub fn completed(&self) -> Vec<CompletedJob> {
        self.lock().completed.clone()
    }

    /// Jobs of `thing` not yet in a terminal status.
    pub fn pending(&self, thing: &str) -> Vec<JobId> {
        self.lock()
            .things
            .get(thing)
            .map(|jobs| jobs.iter().map(|j| j.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of requests received for `operation`.
    pub fn request_count(&self, operation: &str) -> usize {
        self.lock().requests.get(operation).copied().unwrap_or(0)
    }

    async fn publish<M: serde::Serialize>(&self, topic: &str, payload: &M) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.transport
            .publish(topic, bytes, QoS::AtLeastOnce)
            .await
    }

    async fn handle(&self, message: &Message) -> Result<()> {
        let Some(parsed) = parse_request_topic(&message.topic) else {
            debug!(topic = %message.topic, "ignoring non-request topic");
            return Ok(());
        };
        match parsed {
            ParsedTopic::GetPending { thing } => self.handle_get_pending(&thing, message).await,
            ParsedTopic::StartNext { thing } => self.handle_start_next(&thing, message).await,
            ParsedTopic::Update { thing, job_id } => {
                self.handle_update(&thing, JobId::from(job_id), message)
                    .await
            }
        }
    }

    async fn handle_get_pending(&self, thing: &str, message: &Message) -> Result<()> {
        let topics = JobTopics::new(thing);
        let request: GetPendingJobExecutionsRequest = decode(message)?;

        let answer = {
            let mut state = self.lock();
            match state.take_rejection("get-pending") {
                Some(rejected) => Err(rejected),
                None => {
                    let jobs = state.things.get(thing).map(Vec::as_slice).unwrap_or_default();
                    Ok(GetPendingJobExecutionsResponse {
                        in_progress_jobs: summaries(jobs, JobStatus::InProgress),
                        queued_jobs: summaries(jobs, JobStatus::Queued),
                        timestamp: Some(Utc::now()),
                        client_token: request.client_token.clone(),
                    })
                }
            }
        };

        match answer {
            Ok(response) => {
                self.publish(&topics.get_pending_response(Response::Accepted), &response)
                    .await
            }
            Err(rejected) => {
                self.reject(&topics.get_pending_response(Response::Rejected), rejected, request.client_token)
                    .await
            }
        }
    }

    async fn handle_start_next(&self, thing: &str, message: &Message) -> Result<()> {
        let topics = JobTopics::new(thing);
        let request: StartNextPendingJobExecutionRequest = decode(message)?;

        let answer = {
            let mut state = self.lock();
            match state.take_rejection("start-next") {
                Some(rejected) => Err(rejected),
                None => {
                    let now = Utc::now();
                    let next = state.next_job(thing).map(|j| j.id.clone());
                    let execution = next.and_then(|id| {
                        let job = state
                            .things
                            .get_mut(thing)?
                            .iter_mut()
                            .find(|j| j.id == id)?;
                        if job.status == JobStatus::Queued {
                            job.status = JobStatus::InProgress;
                            job.started_at = Some(now);
                            job.last_updated_at = now;
                            job.version += 1;
                        }
                        Some(job.execution(thing))
                    });
                    Ok(StartNextJobExecutionResponse {
                        execution,
                        timestamp: Some(now),
                        client_token: request.client_token.clone(),
                    })
                }
            }
        };

        match answer {
            Ok(response) => {
                match response.execution {
                    Some(ref execution) => info!(thing, job_id = %execution.job_id, "job started"),
                    None => debug!(thing, "no job to start"),
                }
                self.publish(&topics.start_next_response(Response::Accepted), &response)
                    .await
            }
            Err(rejected) => {
                self.reject(&topics.start_next_response(Response::Rejected), rejected, request.client_token)
                    .await
            }
        }
    }

    async fn handle_update(&self, thing: &str, job_id: JobId, message: &Message) -> Result<()> {
        let topics = JobTopics::new(thing);
        let request: UpdateJobExecutionRequest = decode(message)?;

        let answer = {
            let mut state = self.lock();
            let scripted = state.take_rejection("update");
            let before = state.next_job_id(thing);
            let now = Utc::now();
            let updated = match scripted {
                Some(rejected) => Err(rejected),
                None => update_job(&mut state, thing, &job_id, &request, now),
            };
            updated.map(|execution_state| {
                let changed = state.next_job_id(thing) != before;
                (execution_state, changed)
            })
        };

        match answer {
            Ok((execution_state, next_changed)) => {
                info!(thing, %job_id, status = %execution_state.status, "job updated");
                let response = UpdateJobExecutionResponse {
                    execution_state: Some(execution_state),
                    job_document: None,
                    timestamp: Some(Utc::now()),
                    client_token: request.client_token.clone(),
                };
                self.publish(
                    &topics.update_response(job_id.as_str(), Response::Accepted),
                    &response,
                )
                .await?;
                if next_changed {
                    self.publish_next_changed(thing).await?;
                }
                Ok(())
            }
            Err(rejected) => {
                self.reject(
                    &topics.update_response(job_id.as_str(), Response::Rejected),
                    rejected,
                    request.client_token,
                )
                .await
            }
        }
    }

    async fn reject(&self, topic: &str, mut rejected: RejectedError, client_token: Option<String>) -> Result<()> {
        warn!(%topic, code = %rejected.code, "rejecting request");
        rejected.client_token = client_token;
        self.publish(topic, &rejected).await
    }
}

fn decode<M: DeserializeOwned>(message: &Message) -> Result<M> {
    if message.payload.is_empty() {
        return Ok(serde_json::from_value(Value::Object(Default::default()))?);
    }
    Ok(serde_json::from_slice(&message.payload)?)
}

fn summaries(jobs: &[StoredJob], status: JobStatus) -> Vec<JobExecutionSummary> {
    jobs.iter()
        .filter(|j| j.status == status)
        .map(StoredJob::summary)
        .collect()
}

fn update_job(
    state: &mut ServiceState,
    thing: &str,
    job_id: &JobId,
    request: &UpdateJobExecutionRequest,
    now: DateTime<Utc>,
) -> std::result::Result<JobExecutionState, RejectedError> {
    let not_found = || RejectedError::new("ResourceNotFound", format!("job {job_id} not found"));
    let jobs = state.things.get_mut(thing).ok_or_else(not_found)?;
    let index = jobs.iter().position(|j| &j.id == job_id).ok_or_else(not_found)?;

    let job = &mut jobs[index];
    if let Some(expected) = request.expected_version {
        if expected != job.version {
            return Err(RejectedError::new(
                "VersionMismatch",
                format!("expected version {expected}, current version {}", job.version),
            ));
        }
    }
    job.status = request.status;
    job.last_updated_at = now;
    job.version += 1;
    let execution_state = JobExecutionState {
        status: job.status,
        status_details: request.status_details.clone(),
        version_number: Some(job.version),
    };

    if request.status.is_terminal() {
        let job = jobs.remove(index);
        state.completed.push(CompletedJob {
            thing: thing.to_string(),
            job_id: job.id,
            status: request.status,
        });
    }
    Ok(execution_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_jobs_file() {
        let file = JobsFile::parse(
            r#"
            [[job]]
            id = "a"
            document = { operation = "run", command = "true", args = ["x"] }

            [[job]]
            id = "b"
            "#,
        )
        .unwrap();
        assert_eq!(file.jobs.len(), 2);
        assert_eq!(file.jobs[0].id, "a");
        assert_eq!(file.jobs[0].document["command"], "true");
        assert!(file.jobs[1].document.is_empty());
    }

    #[test]
    fn rejects_malformed_jobs_file() {
        assert!(matches!(JobsFile::parse("[[job]]\nname = 1"), Err(Error::Config(_))));
    }

    #[test]
    fn in_progress_job_is_next_before_queued() {
        let mut state = ServiceState::default();
        let now = Utc::now();
        let job = |id: &str, status| StoredJob {
            id: JobId::from(id),
            document: JobDocument::new(),
            status,
            queued_at: now,
            started_at: None,
            last_updated_at: now,
            version: 1,
        };
        state.things.insert(
            "t1".into(),
            vec![job("q1", JobStatus::Queued), job("p1", JobStatus::InProgress)],
        );
        assert_eq!(state.next_job_id("t1"), Some(JobId::from("p1")));
        assert_eq!(state.next_job_id("t2"), None);
    }

    #[test]
    fn terminal_update_removes_job() {
        let mut state = ServiceState::default();
        let now = Utc::now();
        state.things.insert(
            "t1".into(),
            vec![StoredJob {
                id: JobId::from("j1"),
                document: JobDocument::new(),
                status: JobStatus::InProgress,
                queued_at: now,
                started_at: Some(now),
                last_updated_at: now,
                version: 2,
            }],
        );

        let missing = update_job(
            &mut state,
            "t1",
            &JobId::from("nope"),
            &UpdateJobExecutionRequest::new(JobStatus::Succeeded),
            now,
        );
        assert_eq!(missing.unwrap_err().code, "ResourceNotFound");

        let updated = update_job(
            &mut state,
            "t1",
            &JobId::from("j1"),
            &UpdateJobExecutionRequest::new(JobStatus::Succeeded),
            now,
        )
        .unwrap();
        assert_eq!(updated.status, JobStatus::Succeeded);
        assert_eq!(updated.version_number, Some(3));
        assert!(state.things["t1"].is_empty());
        assert_eq!(state.completed.len(), 1);
    }
}
