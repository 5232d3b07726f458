//! Single-flight job coordinator.
//!
//! At most one job runs at a time, and a work-available signal is never
//! lost: a signal arriving while busy sets `is_retry_pending`, and the next
//! `on_work_finished` replays it with exactly one start-next request. Several
//! signals during one busy window collapse into that single retry.
//!
//! Every decision is taken under the state lock; every action (publishing,
//! spawning a slot, shutting down) happens after the lock is released.
//!
//! ```text
//! Idle --try_start_next--> Starting --accepted(job)--> Working
//!  ^                          |                           |
//!  +------accepted(none)------+                           |
//!  +----update accepted, no retry pending-----------------+
//!             Starting <--update accepted, retry pending--+
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::model::{
    JobExecution, JobId, NextJobExecutionChangedEvent, RejectedError,
    StartNextJobExecutionResponse, StartNextPendingJobExecutionRequest,
    UpdateJobExecutionResponse,
};
use crate::registry::JobsClient;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};
use crate::slot::{JobExecutor, WorkSlot};
use crate::state::{CoordinatorState, Phase, SharedState};
use crate::telemetry::metrics;
use crate::transport::Transport;

/// Counters describing what the coordinator has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Start-next requests issued (including re-issues after a lost session).
    pub start_requests: u64,
    /// Work slots spawned.
    pub slots_spawned: u64,
    /// Work-available signals that found a retry already pending.
    pub events_coalesced: u64,
    /// Jobs whose final status the service accepted.
    pub jobs_finished: u64,
}

#[derive(Default)]
struct StatsCounters {
    start_requests: AtomicU64,
    slots_spawned: AtomicU64,
    events_coalesced: AtomicU64,
    jobs_finished: AtomicU64,
}

struct Inner<T: Transport, E: JobExecutor> {
    state: SharedState,
    client: JobsClient<T>,
    executor: Arc<E>,
    shutdown: ShutdownCoordinator<T>,
    exit_when_idle: AtomicBool,
    stats: StatsCounters,
}

/// Cheap to clone; all clones drive the same state.
pub struct Coordinator<T: Transport, E: JobExecutor> {
    inner: Arc<Inner<T, E>>,
}

impl<T: Transport, E: JobExecutor> Clone for Coordinator<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Clear the working flags and consume the pending retry.
fn finish(state: &mut CoordinatorState) -> bool {
    state.is_working = false;
    state.awaiting_start = false;
    state.start_tokens.clear();
    state.active_job = None;
    std::mem::take(&mut state.is_retry_pending)
}

/// Record a new outstanding start-next request and return its token.
fn issue_start_token(state: &mut CoordinatorState) -> String {
    let token = Uuid::new_v4().to_string();
    state.start_tokens.push(token.clone());
    token
}

/// Claim the outstanding start-next request answered by `token`. A response
/// with no token, or one for an older request, claims nothing.
fn claim_start(state: &mut CoordinatorState, token: Option<&str>) -> bool {
    let outstanding = state.awaiting_start
        && token.is_some_and(|t| state.start_tokens.iter().any(|s| s == t));
    if outstanding {
        state.awaiting_start = false;
        state.start_tokens.clear();
    }
    outstanding
}

impl<T: Transport, E: JobExecutor> Coordinator<T, E> {
    pub fn new(
        state: SharedState,
        client: JobsClient<T>,
        executor: Arc<E>,
        shutdown: ShutdownCoordinator<T>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                client,
                executor,
                shutdown,
                exit_when_idle: AtomicBool::new(false),
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Request a graceful shutdown whenever the service reports no pending job.
    pub fn set_exit_when_idle(&self, enabled: bool) {
        self.inner.exit_when_idle.store(enabled, Ordering::Relaxed);
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.phase()
    }

    pub fn is_retry_pending(&self) -> bool {
        self.inner.state.lock().is_retry_pending
    }

    /// Client tokens of the start-next requests still awaiting an answer.
    pub fn start_tokens(&self) -> Vec<String> {
        self.inner.state.lock().start_tokens.clone()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let s = &self.inner.stats;
        CoordinatorStats {
            start_requests: s.start_requests.load(Ordering::Relaxed),
            slots_spawned: s.slots_spawned.load(Ordering::Relaxed),
            events_coalesced: s.events_coalesced.load(Ordering::Relaxed),
            jobs_finished: s.jobs_finished.load(Ordering::Relaxed),
        }
    }

    // -- signals ------------------------------------------------------------

    /// New or changed work is available. Start now, or remember to retry.
    pub fn on_work_available_event(&self) {
        let start_now = {
            let mut state = self.inner.state.lock();
            if state.is_working {
                if state.is_retry_pending {
                    self.inner.stats.events_coalesced.fetch_add(1, Ordering::Relaxed);
                    metrics::events_coalesced().add(1, &[]);
                }
                state.is_retry_pending = true;
                false
            } else {
                true
            }
        };

        if start_now {
            self.try_start_next();
        } else {
            info!("busy with a job, will try again when it is done");
        }
    }

    /// Issue a start-next request unless one is already in flight or the
    /// agent is shutting down. Returns whether a request was issued.
    pub fn try_start_next(&self) -> bool {
        info!("trying to start the next job");
        let token = {
            let mut state = self.inner.state.lock();
            if state.is_working {
                info!("never mind, already working on a job");
                return false;
            }
            if state.disconnect_called {
                info!("never mind, disconnecting");
                return false;
            }
            state.is_working = true;
            state.is_retry_pending = false;
            state.awaiting_start = true;
            issue_start_token(&mut state)
        };

        self.publish_start_next(token);
        true
    }

    fn publish_start_next(&self, token: String) {
        self.inner.stats.start_requests.fetch_add(1, Ordering::Relaxed);
        metrics::start_requests().add(1, &[]);

        let this = self.clone();
        tokio::spawn(async move {
            let request = StartNextPendingJobExecutionRequest {
                client_token: Some(token),
                ..Default::default()
            };
            match this
                .inner
                .client
                .publish_start_next_pending_job_execution(&request)
                .await
            {
                Ok(token) => info!(token, "published request to start the next job"),
                Err(e) => {
                    error!(error = %e, "failed to publish start-next request");
                    this.fail(&e);
                }
            }
        });
    }

    /// The service answered start-next. Spawns a slot when it carries a job.
    /// Repeats and answers to superseded requests are ignored.
    pub fn on_start_accepted(&self, response: StartNextJobExecutionResponse) {
        let execution = response.execution;
        let disconnecting = {
            let mut state = self.inner.state.lock();
            if !claim_start(&mut state, response.client_token.as_deref()) {
                debug!(
                    token = ?response.client_token,
                    "ignoring start-next response for no outstanding request"
                );
                return;
            }
            if let Some(ref execution) = execution {
                state.active_job = Some(execution.job_id.clone());
            }
            state.disconnect_called
        };

        match execution {
            Some(execution) if disconnecting => {
                info!(job_id = %execution.job_id, "not starting job, disconnecting");
            }
            Some(execution) => {
                info!(
                    job_id = %execution.job_id,
                    job_document = ?execution.job_document,
                    "request to start next job was accepted"
                );
                self.spawn_slot(execution);
            }
            None => {
                info!("request to start next job was accepted, but there are no jobs to be done");
                let retried = self.on_work_finished();
                if !retried && self.inner.exit_when_idle.load(Ordering::Relaxed) {
                    self.inner
                        .shutdown
                        .request_shutdown(ShutdownReason::Finished(
                            "no pending jobs remain".to_string(),
                        ));
                } else if !retried {
                    info!("waiting for further jobs");
                }
            }
        }
    }

    pub fn on_start_rejected(&self, rejected: RejectedError) {
        if !claim_start(&mut self.inner.state.lock(), rejected.client_token.as_deref()) {
            debug!(token = ?rejected.client_token, "ignoring start-next rejection for no outstanding request");
            return;
        }
        metrics::requests_rejected().add(1, &[KeyValue::new("operation", "start-next")]);
        self.fail(&rejected.into_error("start-next"));
    }

    /// The current job is done (or there was none). Clears the working flag
    /// and replays a deferred signal. Returns whether a retry was issued.
    pub fn on_work_finished(&self) -> bool {
        let try_again = finish(&mut self.inner.state.lock());
        if try_again {
            info!("work became available while busy, retrying");
            self.try_start_next()
        } else {
            false
        }
    }

    /// The service accepted a status update. Only the update for the job in
    /// flight finishes it; repeats and strays are ignored. With exit-when-idle
    /// the service is always asked again, so an empty answer ends the run
    /// whatever order the next-changed event arrived in.
    pub fn on_update_accepted(&self, job_id: JobId, response: UpdateJobExecutionResponse) {
        let try_again = {
            let mut state = self.inner.state.lock();
            if state.active_job.as_ref() != Some(&job_id) {
                debug!(%job_id, "ignoring update response for a job not in flight");
                return;
            }
            finish(&mut state)
        };

        self.inner.stats.jobs_finished.fetch_add(1, Ordering::Relaxed);
        info!(
            %job_id,
            status = ?response.execution_state.map(|s| s.status),
            "request to update job was accepted"
        );
        if try_again {
            info!("work became available while busy, retrying");
            self.try_start_next();
        } else if self.inner.exit_when_idle.load(Ordering::Relaxed) {
            info!("checking for remaining jobs before exiting");
            self.try_start_next();
        }
    }

    /// Fatal for the job in flight. Rejections of other requesters' updates,
    /// seen through the wildcard subscription, are ignored.
    pub fn on_update_rejected(&self, job_id: JobId, rejected: RejectedError) {
        if self.inner.state.lock().active_job.as_ref() != Some(&job_id) {
            debug!(%job_id, code = %rejected.code, "ignoring update rejection for a job not in flight");
            return;
        }
        warn!(%job_id, code = %rejected.code, "update rejected");
        metrics::requests_rejected().add(1, &[KeyValue::new("operation", "update")]);
        self.fail(&rejected.into_error("update"));
    }

    /// Next-changed event from the service.
    pub fn on_next_job_execution_changed(&self, event: NextJobExecutionChangedEvent) {
        match event.execution {
            Some(execution) => {
                info!(
                    job_id = %execution.job_id,
                    job_document = ?execution.job_document,
                    "received next job execution changed event"
                );
                self.on_work_available_event();
            }
            None => {
                info!("received next job execution changed event: none");
                if self.inner.exit_when_idle.load(Ordering::Relaxed) && self.phase() == Phase::Idle {
                    self.inner
                        .shutdown
                        .request_shutdown(ShutdownReason::Finished(
                            "no pending jobs remain".to_string(),
                        ));
                } else {
                    info!("waiting for further jobs");
                }
            }
        }
    }

    /// The transport reconnected. Without a session, responses may have been
    /// lost, so re-synchronise with the service through the single-flight path.
    pub fn on_connection_resumed(&self, session_present: bool) {
        if session_present {
            info!("connection resumed with session, nothing to resynchronise");
            return;
        }

        let (phase, reissue) = {
            let mut state = self.inner.state.lock();
            if state.disconnect_called {
                return;
            }
            let phase = state.phase();
            let reissue = match phase {
                Phase::Idle => None,
                Phase::Starting => Some(issue_start_token(&mut state)),
                Phase::Working => {
                    state.is_retry_pending = true;
                    None
                }
            };
            (phase, reissue)
        };

        match phase {
            Phase::Idle => {
                info!("session lost while idle, querying for pending jobs");
                self.try_start_next();
            }
            Phase::Starting => {
                info!("session lost while starting, re-issuing start-next request");
                if let Some(token) = reissue {
                    self.publish_start_next(token);
                }
            }
            Phase::Working => {
                info!("session lost while working, will query again when done");
            }
        }
    }

    /// A fatal condition: funnel it into shutdown.
    pub fn fail(&self, err: &Error) {
        self.inner
            .shutdown
            .request_shutdown(ShutdownReason::failed(err));
    }

    fn spawn_slot(&self, execution: JobExecution) {
        self.inner.stats.slots_spawned.fetch_add(1, Ordering::Relaxed);

        let slot = WorkSlot::new(
            self.inner.client.clone(),
            Arc::clone(&self.inner.executor),
            self.inner.shutdown.clone(),
        );
        let job_id = execution.job_id;
        let document = execution.job_document.unwrap_or_default();
        let this = self.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(slot.run(job_id.clone(), document));
            if let Err(e) = run.await {
                this.fail(&Error::Work {
                    job_id: job_id.to_string(),
                    reason: format!("work slot aborted: {e}"),
                });
            }
        });
    }
}
