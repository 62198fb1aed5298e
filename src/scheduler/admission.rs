use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;

use super::registry::HandlerRegistry;
use crate::session::SessionState;
use crate::types::job::{JobRecord, Requirements};

/// Why a record may or may not be dispatched right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Run,
    Paused,
    Banned,
    NetworkUnavailable,
    BackingOff {
        #[serde(skip)]
        until: Instant,
    },
    /// Session jobs wait for an operator to fix the credentials.
    CredentialsRejected,
}

impl Admission {
    pub fn is_run(&self) -> bool {
        matches!(self, Admission::Run)
    }
}

/// Decides, per record and per selection cycle, whether it may run given the
/// queue's pause flag and the live session state.
#[derive(Clone, Debug)]
pub struct AdmissionController {
    registry: Arc<HandlerRegistry>,
}

impl AdmissionController {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn verdict(
        &self,
        record: &JobRecord,
        paused: bool,
        session: &SessionState,
        now: Instant,
    ) -> Admission {
        if paused {
            return Admission::Paused;
        }
        verdict_for(self.registry.requirements(&record.job_type), session, now)
    }

    pub fn admissible(
        &self,
        record: &JobRecord,
        paused: bool,
        session: &SessionState,
        now: Instant,
    ) -> bool {
        self.verdict(record, paused, session, now).is_run()
    }
}

/// Local work always runs. Network work waits out bans, backoff windows and
/// outages; session work additionally waits for usable credentials.
pub fn verdict_for(
    requirements: Requirements,
    session: &SessionState,
    now: Instant,
) -> Admission {
    if !requirements.needs_network() {
        return Admission::Run;
    }

    if session.is_banned {
        return Admission::Banned;
    }

    if let Some(until) = session.backoff_until.filter(|until| now < *until) {
        return Admission::BackingOff { until };
    }

    if !session.is_network_available {
        return Admission::NetworkUnavailable;
    }

    if requirements.session && session.credentials_rejected {
        return Admission::CredentialsRejected;
    }

    Admission::Run
}
