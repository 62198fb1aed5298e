use serde::Serialize;
use tokio::time::Instant;

/// In-memory scheduling state of a job record. Never persisted: a record that
/// was running when the process died is replayed as ready.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum JobState {
    #[default]
    Ready,
    Delayed {
        until: Instant,
    },
    Running {
        since: Instant,
    },
}

// This impl is used to allow job listings to be serialised for reporting.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use JobState::*;

        serializer.serialize_str(match self {
            Ready => "ready",
            Delayed { until: _ } => "delayed",
            Running { since: _ } => "running",
        })
    }
}

/// Where a queue processor is in its cycle.
///
/// `Idle → Selecting → Dispatching → (Succeeded | Retrying | Dropped) → Idle`
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    #[default]
    Idle,
    Selecting,
    Dispatching,
    Succeeded,
    Retrying,
    Dropped,
}
