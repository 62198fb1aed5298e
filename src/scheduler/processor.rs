use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::admission::AdmissionController;
use super::registry::{HandlerRegistry, JobContext};
use crate::config::SchedulerSettings;
use crate::error::{FailureKind, JobError, StoreError};
use crate::session::SessionClient;
use crate::store::JobStore;
use crate::types::job::{JobId, JobRecord, QueueName};
use crate::types::states::ProcessorState;

/// Pause after a store failure before selecting again.
const STORE_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// What one cycle did with the record it selected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    Succeeded(JobId),
    Retrying(JobId),
    Dropped(JobId),
    /// Another claimant got there first.
    Skipped(JobId),
    /// The queue was stopped before the job reached the remote service. The
    /// record is back in the queue as it was.
    Released(JobId),
}

/// Observable state of a processor.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProcessorStatus {
    pub state: ProcessorState,
    pub active_job: Option<JobId>,
    /// A worker task is driving this processor.
    pub running: bool,
}

/// Drains one named queue, one job at a time.
pub struct QueueProcessor {
    queue: QueueName,
    store: Arc<JobStore>,
    session: Arc<SessionClient>,
    registry: Arc<HandlerRegistry>,
    admission: AdmissionController,
    settings: SchedulerSettings,
    paused: watch::Sender<bool>,
    status: watch::Sender<ProcessorStatus>,
}

impl QueueProcessor {
    pub fn new(
        queue: QueueName,
        store: Arc<JobStore>,
        session: Arc<SessionClient>,
        registry: Arc<HandlerRegistry>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            session,
            admission: AdmissionController::new(registry.clone()),
            registry,
            settings,
            paused: watch::Sender::new(false),
            status: watch::Sender::new(ProcessorStatus::default()),
        }
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn status(&self) -> ProcessorStatus {
        self.status.borrow().clone()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<ProcessorStatus> {
        self.status.subscribe()
    }

    /// Stops dispatching from this queue. Enqueueing keeps working.
    pub fn pause(&self) {
        if self.paused.send_replace(true) {
            return;
        }
        info!(queue = %self.queue, "queue paused");
    }

    pub fn resume(&self) {
        if !self.paused.send_replace(false) {
            return;
        }
        info!(queue = %self.queue, "queue resumed");
    }

    pub(super) fn set_running(&self, running: bool) {
        self.status.send_modify(|s| {
            s.running = running;
            if !running {
                s.state = ProcessorState::Idle;
            }
        });
    }

    fn set_state(&self, state: ProcessorState) {
        self.status.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
    }

    /// The admissible record that should run next.
    fn select(&self) -> Option<JobRecord> {
        if self.is_paused() {
            return None;
        }

        let session = self.session.state();
        let now = Instant::now();
        self.store.peek_next(self.queue, |record| {
            self.admission.admissible(record, false, &session, now)
        })
    }

    /// Selects, dispatches and settles at most one record. `None` means
    /// nothing in the queue is admissible right now.
    pub async fn run_cycle(&self) -> Result<Option<CycleOutcome>, StoreError> {
        self.cycle(&CancellationToken::new()).await
    }

    async fn cycle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<CycleOutcome>, StoreError> {
        self.set_state(ProcessorState::Selecting);

        let Some(record) = self.select() else {
            self.set_state(ProcessorState::Idle);
            return Ok(None);
        };

        if !self.store.mark_running(record.id) {
            debug!(id = record.id, "record claimed elsewhere");
            self.set_state(ProcessorState::Idle);
            return Ok(Some(CycleOutcome::Skipped(record.id)));
        }

        self.status.send_modify(|s| {
            s.active_job = Some(record.id);
            s.state = ProcessorState::Dispatching;
        });

        let span = info_span!(
            "job",
            queue = %self.queue,
            id = record.id,
            job_type = %record.job_type,
            attempt = record.attempt
        );
        let result = self
            .dispatch(&record, cancel)
            .instrument(span.clone())
            .await;

        if matches!(&result, Err(error) if error.is_cancelled()) {
            span.in_scope(|| info!("queue stopping, job handed back"));
            self.store.release(record.id);
            self.status.send_modify(|s| {
                s.active_job = None;
                s.state = ProcessorState::Idle;
            });
            return Ok(Some(CycleOutcome::Released(record.id)));
        }

        let settled = span.in_scope(|| self.settle(&record, result));

        let outcome = match settled {
            Ok(outcome) => outcome,
            Err(error) => {
                self.store.release(record.id);
                self.status.send_modify(|s| {
                    s.active_job = None;
                    s.state = ProcessorState::Idle;
                });
                return Err(error);
            },
        };

        self.status.send_modify(|s| {
            s.active_job = None;
            s.state = match outcome {
                CycleOutcome::Succeeded(_) => ProcessorState::Succeeded,
                CycleOutcome::Retrying(_) => ProcessorState::Retrying,
                CycleOutcome::Dropped(_) => ProcessorState::Dropped,
                CycleOutcome::Skipped(_) | CycleOutcome::Released(_) => {
                    ProcessorState::Idle
                },
            };
        });

        Ok(Some(outcome))
    }

    async fn dispatch(
        &self,
        record: &JobRecord,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let Some(handler) = self.registry.get(&record.job_type) else {
            return Err(JobError::UnknownType(record.job_type.clone()));
        };

        debug!("dispatching");
        handler
            .run(JobContext {
                record,
                session: &self.session,
                cancel,
            })
            .await
    }

    /// Completes, retries or drops `record` according to `result`.
    fn settle(
        &self,
        record: &JobRecord,
        result: Result<(), JobError>,
    ) -> Result<CycleOutcome, StoreError> {
        let error = match result {
            Ok(()) => {
                self.store.complete(record.id)?;
                info!("job succeeded");
                return Ok(CycleOutcome::Succeeded(record.id));
            },
            Err(error) => error,
        };

        let attempt = record.attempt + 1;
        let exhausted = error.counts_towards_limit()
            && self.settings.max_attempts.is_some_and(|max| attempt >= max);

        match error.kind() {
            FailureKind::Permanent => {
                warn!(%error, "job failed permanently, dropping");
                self.store.drop_job(record.id, &error.to_string())?;
                Ok(CycleOutcome::Dropped(record.id))
            },
            _ if exhausted => {
                let message = format!("gave up after {attempt} attempts: {error}");
                warn!(%error, attempt, "job out of attempts, dropping");
                self.store.drop_job(record.id, &message)?;
                Ok(CycleOutcome::Dropped(record.id))
            },
            // Held back by admission until the ban is lifted.
            FailureKind::Banned => {
                warn!(%error, "job hit a ban, keeping it queued");
                self.store.retry(record.id, &error.to_string(), Duration::ZERO)?;
                Ok(CycleOutcome::Retrying(record.id))
            },
            FailureKind::Transient => {
                let delay = self.settings.retry_delay(attempt);
                info!(%error, ?delay, "job will be retried");
                self.store.retry(record.id, &error.to_string(), delay)?;
                Ok(CycleOutcome::Retrying(record.id))
            },
        }
    }

    /// When a wait without new events should end: the next delayed record
    /// becoming eligible or the backoff window closing.
    fn next_wake(&self) -> Option<Instant> {
        let now = Instant::now();
        let backoff = self.session.state().backoff_until.filter(|u| *u > now);
        let delayed = self.store.next_eligible_at(self.queue);

        match (backoff, delayed) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs cycles until `cancel` fires. Parks when nothing is admissible
    /// and wakes on enqueue, session changes, pause changes or the next
    /// timer. A request already on the wire is always allowed to finish; a
    /// job still waiting for the session is handed back.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(queue = %self.queue, "processor started");
        let mut session_rx = self.session.subscribe();
        let mut paused_rx = self.paused.subscribe();

        while !cancel.is_cancelled() {
            let notified = self.store.notified(self.queue);
            tokio::pin!(notified);
            notified.as_mut().enable();
            session_rx.borrow_and_update();
            paused_rx.borrow_and_update();

            match self.cycle(&cancel).await {
                Ok(Some(_)) => {
                    tokio::task::yield_now().await;
                    continue;
                },
                Ok(None) => {},
                Err(error) => {
                    error!(queue = %self.queue, %error, "job store error");
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(STORE_ERROR_PAUSE) => continue,
                    }
                },
            }

            let wake_at = self.next_wake();
            let timer = async {
                match wake_at {
                    Some(at) => sleep_until(at).await,
                    None => pending().await,
                }
            };

            select! {
                _ = cancel.cancelled() => break,
                _ = &mut notified => {},
                _ = session_rx.changed() => {},
                _ = paused_rx.changed() => {},
                _ = timer => {},
            }
        }

        info!(queue = %self.queue, "processor stopped");
    }
}
