use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::states::JobState;

pub type JobId = u64;

/// Priority given to records whose producer doesn't ask for one. Lower runs
/// first.
pub const DEFAULT_PRIORITY: u32 = 10;

/// The named queues. Each one is drained by its own processor.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    General,
    Hasher,
    Image,
}

impl QueueName {
    pub const ALL: [QueueName; 3] =
        [QueueName::General, QueueName::Hasher, QueueName::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::General => "general",
            QueueName::Hasher => "hasher",
            QueueName::Image => "image",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            QueueName::General => 0,
            QueueName::Hasher => 1,
            QueueName::Image => 2,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job body needs from the outside world before it may be dispatched.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Requirements {
    pub network: bool,
    pub session: bool,
}

impl Requirements {
    /// Purely local work: hashing, file moves, database updates.
    pub const LOCAL: Requirements = Requirements {
        network: false,
        session: false,
    };
    /// Talks to the remote service without logging in.
    pub const NETWORK: Requirements = Requirements {
        network: true,
        session: false,
    };
    /// Talks to the remote service inside an authenticated session.
    pub const SESSION: Requirements = Requirements {
        network: true,
        session: true,
    };

    pub fn needs_network(&self) -> bool {
        self.network || self.session
    }
}

/// The producer-supplied part of a job record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewJob {
    pub queue: QueueName,
    pub job_type: String,
    pub payload: String,
    pub priority: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
}

impl NewJob {
    pub fn new(
        queue: QueueName,
        job_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            job_type: job_type.into(),
            payload: payload.into(),
            priority: DEFAULT_PRIORITY,
            created_at: None,
            dedupe_key: None,
        }
    }

    pub fn with_priority(self, priority: u32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_created_at(self, created_at: DateTime<Utc>) -> Self {
        Self {
            created_at: Some(created_at),
            ..self
        }
    }

    /// Enqueueing a job whose key matches a pending record is a no-op that
    /// returns the existing record's id.
    pub fn with_dedupe_key(self, key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            ..self
        }
    }
}

/// A persisted unit of background work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: QueueName,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: String,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    pub attempt: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    /// Wall-clock time before which a retried record isn't eligible. Kept so
    /// the delay survives a restart.
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) state: JobState,
}

impl JobRecord {
    pub(crate) fn from_new(id: JobId, job: NewJob) -> Self {
        Self {
            id,
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            priority: job.priority,
            created_at: job.created_at.unwrap_or_else(Utc::now),
            attempt: 0,
            last_error: None,
            dedupe_key: job.dedupe_key,
            retry_after: None,
            state: JobState::Ready,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, JobState::Running { .. })
    }

    /// True when the record may be selected at `now`, ignoring admission.
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.state {
            JobState::Ready => true,
            JobState::Delayed { until } => until <= now,
            JobState::Running { .. } => false,
        }
    }

    /// Selection order within a queue: priority, then creation time, then
    /// insertion order.
    pub(crate) fn order_key(&self) -> (u32, DateTime<Utc>, JobId) {
        (self.priority, self.created_at, self.id)
    }

    /// Rebuilds the in-memory delay from the persisted wall-clock time.
    pub(crate) fn restore_state(&mut self, now: Instant) {
        self.state = match self.retry_after {
            Some(after) => match (after - Utc::now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => JobState::Delayed {
                    until: now + remaining,
                },
                _ => JobState::Ready,
            },
            None => JobState::Ready,
        };
    }
}

/// A record removed after a permanent failure, kept for operator visibility.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DroppedJob {
    pub record: JobRecord,
    pub error: String,
    pub dropped_at: DateTime<Utc>,
}
