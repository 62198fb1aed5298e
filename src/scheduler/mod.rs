//! One processor per named queue, plus the operator controls around them.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SchedulerSettings;
use crate::error::StoreError;
use crate::session::SessionClient;
use crate::store::JobStore;
use crate::types::job::{DroppedJob, JobId, JobRecord, NewJob, QueueName};
use crate::types::states::{JobState, ProcessorState};

pub mod admission;
pub mod processor;
pub mod registry;

pub use admission::{Admission, AdmissionController};
pub use processor::{CycleOutcome, ProcessorStatus, QueueProcessor};
pub use registry::{HandlerRegistry, JobContext, JobHandler};

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A pending record as shown to the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct JobListing {
    #[serde(flatten)]
    pub record: JobRecord,
    pub state: JobState,
    pub admission: Admission,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueSummary {
    pub queue: QueueName,
    pub state: ProcessorState,
    pub running: bool,
    pub paused: bool,
    pub active_job: Option<JobId>,
    pub pending: usize,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub logged_in: bool,
    pub banned: bool,
    pub ban_reason: Option<String>,
    pub network_available: bool,
    pub credentials_rejected: bool,
    pub backoff_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SchedulerSummary {
    pub session: SessionSummary,
    pub queues: Vec<QueueSummary>,
    pub dropped: usize,
}

pub struct Scheduler {
    store: Arc<JobStore>,
    session: Arc<SessionClient>,
    processors: BTreeMap<QueueName, Arc<QueueProcessor>>,
    workers: Mutex<HashMap<QueueName, Worker>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        session: Arc<SessionClient>,
        registry: HandlerRegistry,
        settings: SchedulerSettings,
    ) -> Self {
        let registry = Arc::new(registry);
        let processors = QueueName::ALL
            .into_iter()
            .map(|queue| {
                let processor = QueueProcessor::new(
                    queue,
                    store.clone(),
                    session.clone(),
                    registry.clone(),
                    settings.clone(),
                );
                (queue, Arc::new(processor))
            })
            .collect();

        Self {
            store,
            session,
            processors,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<SessionClient> {
        &self.session
    }

    pub fn processor(&self, queue: QueueName) -> Option<&Arc<QueueProcessor>> {
        self.processors.get(&queue)
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<QueueName, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the worker for `queue`. Returns false if one is already running.
    pub fn start(&self, queue: QueueName) -> bool {
        let Some(processor) = self.processors.get(&queue) else {
            return false;
        };

        let mut workers = self.workers();
        if workers.get(&queue).is_some_and(|w| !w.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        processor.set_running(true);
        let handle = tokio::spawn(processor.clone().run(cancel.clone()));
        workers.insert(queue, Worker { cancel, handle });
        true
    }

    pub fn start_all(&self) {
        for queue in QueueName::ALL {
            self.start(queue);
        }
    }

    /// Stops future cycles of `queue` and waits for the worker to exit. A
    /// request already on the wire finishes first; a job still waiting for
    /// the session goes back to the queue. Queued records are untouched.
    pub async fn stop(&self, queue: QueueName) {
        let worker = self.workers().remove(&queue);
        let Some(worker) = worker else {
            return;
        };

        worker.cancel.cancel();
        if let Err(error) = worker.handle.await {
            warn!(%queue, %error, "queue worker ended abnormally");
        }
        if let Some(processor) = self.processors.get(&queue) {
            processor.set_running(false);
        }
    }

    pub async fn stop_all(&self) {
        for queue in QueueName::ALL {
            self.stop(queue).await;
        }
        info!("all queue workers stopped");
    }

    pub fn pause(&self, queue: QueueName) {
        if let Some(processor) = self.processors.get(&queue) {
            processor.pause();
        }
    }

    pub fn resume(&self, queue: QueueName) {
        if let Some(processor) = self.processors.get(&queue) {
            processor.resume();
        }
    }

    pub fn is_paused(&self, queue: QueueName) -> bool {
        self.processors
            .get(&queue)
            .is_some_and(|p| p.is_paused())
    }

    /// Removes every pending record of `queue`. A job already running is
    /// left to finish.
    pub fn clear(&self, queue: QueueName) -> Result<usize, StoreError> {
        self.store.clear(queue)
    }

    pub fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.store.enqueue(job)
    }

    /// A page of `queue` in selection order. Unless `include_inadmissible`,
    /// only records that could be dispatched right now are listed.
    pub fn list(
        &self,
        queue: QueueName,
        page: usize,
        page_size: usize,
        include_inadmissible: bool,
    ) -> Vec<JobListing> {
        let Some(processor) = self.processors.get(&queue) else {
            return Vec::new();
        };

        let session = self.session.state();
        let paused = processor.is_paused();
        let now = Instant::now();
        let verdict = |record: &JobRecord| {
            processor
                .admission()
                .verdict(record, paused, &session, now)
        };

        self.store
            .list(queue, page.saturating_mul(page_size), page_size, |record| {
                include_inadmissible || verdict(record).is_run()
            })
            .into_iter()
            .map(|record| JobListing {
                state: record.state(),
                admission: verdict(&record),
                record,
            })
            .collect()
    }

    pub fn count_by_type(&self, queue: QueueName) -> BTreeMap<String, usize> {
        self.store.count_by_type(queue)
    }

    pub fn dropped(&self) -> Vec<DroppedJob> {
        self.store.dropped()
    }

    pub fn summary(&self) -> SchedulerSummary {
        let state = self.session.state();
        let now = Instant::now();

        let queues = self
            .processors
            .values()
            .map(|processor| {
                let queue = processor.queue();
                let status = processor.status();
                QueueSummary {
                    queue,
                    state: status.state,
                    running: status.running,
                    paused: processor.is_paused(),
                    active_job: status.active_job,
                    pending: self.store.len(queue),
                    by_type: self.store.count_by_type(queue),
                }
            })
            .collect();

        SchedulerSummary {
            session: SessionSummary {
                logged_in: state.is_logged_in,
                banned: state.is_banned,
                ban_reason: state.ban_reason.clone(),
                network_available: state.is_network_available,
                credentials_rejected: state.credentials_rejected,
                backoff_secs: state.backoff_remaining(now).map(|d| d.as_secs()),
            },
            queues,
            dropped: self.store.dropped().len(),
        }
    }
}
