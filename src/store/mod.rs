//! Durable job records.
//!
//! Every mutation is appended to the write-ahead log before it is applied
//! in memory, so a restart replays exactly what callers were told succeeded.
//! The `running` flag is memory-only: records that were mid-flight when the
//! process died come back as ready.
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::StoreSettings;
use crate::error::StoreError;
use crate::types::job::{DroppedJob, JobId, JobRecord, NewJob, QueueName};
use crate::types::states::JobState;

pub mod wal;

use wal::{Wal, WalOp};

#[derive(Debug)]
struct Inner {
    records: BTreeMap<JobId, JobRecord>,
    next_id: JobId,
    dropped: VecDeque<DroppedJob>,
    dropped_history: usize,
    wal: Option<Wal>,
    appended: u64,
    compact_after: u64,
}

impl Inner {
    fn new(settings: &StoreSettings, wal: Option<Wal>) -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
            dropped: VecDeque::new(),
            dropped_history: settings.dropped_history,
            wal,
            appended: 0,
            compact_after: settings.compact_after.max(1),
        }
    }

    /// Logs `op`, then applies it. Nothing changes if the log write fails.
    fn commit(&mut self, op: WalOp) -> Result<(), StoreError> {
        if let Some(wal) = &mut self.wal {
            wal.append(&op)?;
            self.appended += 1;
        }
        self.apply(op);

        if self.wal.is_some() && self.appended >= self.compact_after {
            if let Err(error) = self.compact() {
                warn!(%error, "log compaction failed, carrying on with the old log");
            }
        }

        Ok(())
    }

    fn apply(&mut self, op: WalOp) {
        match op {
            WalOp::Checkpoint { next_id } => {
                self.next_id = self.next_id.max(next_id);
            },
            WalOp::Enqueue { record } => {
                self.next_id = self.next_id.max(record.id + 1);
                self.records.insert(record.id, record);
            },
            WalOp::Retry {
                id,
                attempt,
                last_error,
                retry_after,
            } => {
                if let Some(record) = self.records.get_mut(&id) {
                    record.attempt = attempt;
                    record.last_error = Some(last_error);
                    record.retry_after = Some(retry_after);
                    record.state = JobState::Ready;
                }
            },
            WalOp::Complete { id } => {
                self.records.remove(&id);
            },
            WalOp::Drop { id, error, at } => {
                if let Some(mut record) = self.records.remove(&id) {
                    record.last_error = Some(error.clone());
                    record.state = JobState::Ready;
                    self.dropped.push_back(DroppedJob {
                        record,
                        error,
                        dropped_at: at,
                    });
                    while self.dropped.len() > self.dropped_history {
                        self.dropped.pop_front();
                    }
                }
            },
            WalOp::Clear { ids, .. } => {
                for id in ids {
                    self.records.remove(&id);
                }
            },
        }
    }

    /// Rewrites the log to the minimum that reproduces the current state.
    fn compact(&mut self) -> Result<(), StoreError> {
        let Some(wal) = &mut self.wal else {
            return Ok(());
        };

        let mut ops = Vec::with_capacity(1 + self.dropped.len() * 2 + self.records.len());
        ops.push(WalOp::Checkpoint {
            next_id: self.next_id,
        });
        for dropped in &self.dropped {
            ops.push(WalOp::Enqueue {
                record: dropped.record.clone(),
            });
            ops.push(WalOp::Drop {
                id: dropped.record.id,
                error: dropped.error.clone(),
                at: dropped.dropped_at,
            });
        }
        for record in self.records.values() {
            ops.push(WalOp::Enqueue {
                record: record.clone(),
            });
        }

        wal.rewrite(&ops)?;
        info!(
            live = self.records.len(),
            dropped = self.dropped.len(),
            "compacted the job log"
        );
        self.appended = 0;
        Ok(())
    }

    fn get_mut(&mut self, id: JobId) -> Result<&mut JobRecord, StoreError> {
        self.records.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

/// The set of live job records across all queues.
#[derive(Debug)]
pub struct JobStore {
    inner: Mutex<Inner>,
    notify: [Notify; 3],
}

impl JobStore {
    /// Opens the store described by `settings`, replaying its log. Without a
    /// `wal_dir` the store lives in memory only.
    pub fn open(settings: &StoreSettings) -> Result<Self, StoreError> {
        let Some(dir) = &settings.wal_dir else {
            info!("no wal_dir configured, jobs will not survive a restart");
            return Ok(Self::with_inner(Inner::new(settings, None)));
        };

        let (wal, ops) = Wal::open(dir, settings.fsync)?;
        let mut inner = Inner::new(settings, Some(wal));
        let replayed = ops.len() as u64;
        for op in ops {
            inner.apply(op);
        }
        // Replayed entries count towards the next compaction.
        inner.appended = replayed;

        let now = Instant::now();
        for record in inner.records.values_mut() {
            record.restore_state(now);
        }

        info!(
            dir = %dir.display(),
            replayed,
            jobs = inner.records.len(),
            next_id = inner.next_id,
            "job store opened"
        );

        Ok(Self::with_inner(inner))
    }

    pub fn in_memory() -> Self {
        Self::with_inner(Inner::new(&StoreSettings::default(), None))
    }

    fn with_inner(inner: Inner) -> Self {
        Self {
            inner: Mutex::new(inner),
            notify: [Notify::new(), Notify::new(), Notify::new()],
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a new record and returns its id. If the job carries a dedupe
    /// key matching a live record, that record's id is returned instead.
    pub fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        let queue = job.queue;
        let id = {
            let mut inner = self.lock();

            if let Some(key) = &job.dedupe_key {
                let existing = inner
                    .records
                    .values()
                    .find(|r| r.dedupe_key.as_ref() == Some(key));
                if let Some(existing) = existing {
                    debug!(id = existing.id, key, "duplicate job, not enqueued");
                    return Ok(existing.id);
                }
            }

            let id = inner.next_id;
            let record = JobRecord::from_new(id, job);
            debug!(id, %queue, job_type = %record.job_type, priority = record.priority, "enqueued");
            inner.commit(WalOp::Enqueue { record })?;
            id
        };

        self.wake(queue);
        Ok(id)
    }

    /// The eligible record of `queue` that should run next and satisfies
    /// `pred`, without claiming it.
    pub fn peek_next<F>(&self, queue: QueueName, mut pred: F) -> Option<JobRecord>
    where
        F: FnMut(&JobRecord) -> bool,
    {
        let now = Instant::now();
        self.lock()
            .records
            .values()
            .filter(|r| r.queue == queue && r.is_eligible(now) && pred(r))
            .min_by_key(|r| r.order_key())
            .cloned()
    }

    /// Claims a record for execution. Returns false if it's gone or already
    /// claimed.
    pub fn mark_running(&self, id: JobId) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.records.get_mut(&id) {
            Some(record) if record.is_eligible(now) => {
                record.state = JobState::Running { since: now };
                true
            },
            _ => false,
        }
    }

    /// Gives up a claim without recording an outcome.
    pub fn release(&self, id: JobId) {
        if let Some(record) = self.lock().records.get_mut(&id) {
            if record.is_running() {
                record.state = JobState::Ready;
            }
        }
    }

    /// Removes a record after success.
    pub fn complete(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.get_mut(id)?;
        inner.commit(WalOp::Complete { id })
    }

    /// Counts a failed attempt and makes the record eligible again after
    /// `delay`.
    pub fn retry(
        &self,
        id: JobId,
        error: &str,
        delay: Duration,
    ) -> Result<JobRecord, StoreError> {
        let record = {
            let mut inner = self.lock();
            let attempt = inner.get_mut(id)?.attempt + 1;
            let retry_after = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            inner.commit(WalOp::Retry {
                id,
                attempt,
                last_error: error.to_owned(),
                retry_after,
            })?;

            let record = inner.get_mut(id)?;
            record.state = if delay.is_zero() {
                JobState::Ready
            } else {
                JobState::Delayed {
                    until: Instant::now() + delay,
                }
            };
            record.clone()
        };

        self.wake(record.queue);
        Ok(record)
    }

    /// Removes a record after a permanent failure, keeping a report of it.
    pub fn drop_job(&self, id: JobId, error: &str) -> Result<DroppedJob, StoreError> {
        let mut inner = self.lock();
        let mut record = inner.get_mut(id)?.clone();
        let at = Utc::now();

        inner.commit(WalOp::Drop {
            id,
            error: error.to_owned(),
            at,
        })?;

        record.last_error = Some(error.to_owned());
        record.state = JobState::Ready;
        Ok(DroppedJob {
            record,
            error: error.to_owned(),
            dropped_at: at,
        })
    }

    /// Removes every record of `queue` that isn't running. Returns how many
    /// were removed.
    pub fn clear(&self, queue: QueueName) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let ids: Vec<JobId> = inner
            .records
            .values()
            .filter(|r| r.queue == queue && !r.is_running())
            .map(|r| r.id)
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }

        let count = ids.len();
        inner.commit(WalOp::Clear { queue, ids })?;
        info!(%queue, count, "queue cleared");
        Ok(count)
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.lock().records.get(&id).cloned()
    }

    /// Number of live records in `queue`, running ones included.
    pub fn len(&self, queue: QueueName) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.queue == queue)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn count_by_type(&self, queue: QueueName) -> BTreeMap<String, usize> {
        let inner = self.lock();
        let mut counts = BTreeMap::new();
        for record in inner.records.values().filter(|r| r.queue == queue) {
            *counts.entry(record.job_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// A page of `queue`'s records in selection order, filtered by `pred`.
    pub fn list<F>(
        &self,
        queue: QueueName,
        offset: usize,
        limit: usize,
        mut pred: F,
    ) -> Vec<JobRecord>
    where
        F: FnMut(&JobRecord) -> bool,
    {
        let inner = self.lock();
        let mut records: Vec<&JobRecord> = inner
            .records
            .values()
            .filter(|r| r.queue == queue && pred(r))
            .collect();
        records.sort_by_key(|r| r.order_key());

        records
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Reports of dropped records, oldest first.
    pub fn dropped(&self) -> Vec<DroppedJob> {
        self.lock().dropped.iter().cloned().collect()
    }

    /// The earliest future instant a delayed record of `queue` becomes
    /// eligible. Records whose delay has passed are eligible now and only
    /// wait on admission, which has its own wake-ups.
    pub fn next_eligible_at(&self, queue: QueueName) -> Option<Instant> {
        let now = Instant::now();
        self.lock()
            .records
            .values()
            .filter(|r| r.queue == queue)
            .filter_map(|r| match r.state {
                JobState::Delayed { until } if until > now => Some(until),
                _ => None,
            })
            .min()
    }

    /// Completes when a record is added to `queue` or becomes eligible
    /// again. Create it before peeking so no wake-up is missed in between.
    pub fn notified(&self, queue: QueueName) -> Notified<'_> {
        self.notify[queue.index()].notified()
    }

    /// Forces a log compaction now.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.lock().compact()
    }

    fn wake(&self, queue: QueueName) {
        self.notify[queue.index()].notify_waiters();
    }
}
