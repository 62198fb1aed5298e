//! Backoff windows and bans.
//!
//! A backoff expires by itself; a ban stays until an operator clears it or
//! the configured [`UnbanPolicy`] allows it to be lifted.
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::state::SessionState;

impl SessionState {
    /// Opens (or extends) the cooldown window. A shorter request never
    /// shrinks the current wait. Returns whether the window moved.
    pub fn start_backoff(
        &mut self,
        now: Instant,
        duration: Duration,
        reason: &str,
    ) -> bool {
        let until = now + duration;

        match self.backoff_until {
            Some(current) if current >= until => {
                info!(
                    reason,
                    remaining = ?current.saturating_duration_since(now),
                    "already backing off for longer"
                );
                false
            },
            _ => {
                warn!(reason, ?duration, "backing off");
                self.backoff_until = Some(until);
                self.backoff_reason = Some(reason.to_owned());
                true
            },
        }
    }

    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Time left in the current backoff window.
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// Marks the client banned. The session is gone with it.
    pub fn ban(&mut self, now: Instant, reason: &str) {
        if !self.is_banned {
            warn!(reason, "banned by the remote service");
            self.banned_at = Some(now);
        }
        self.is_banned = true;
        self.ban_reason = Some(reason.to_owned());
        self.invalid_session = false;
        self.clear_session();
    }

    pub fn lift_ban(&mut self) {
        if self.is_banned {
            info!(reason = ?self.ban_reason, "ban lifted");
        }
        self.is_banned = false;
        self.banned_at = None;
        self.ban_reason = None;
    }
}

/// Decides when a ban may be lifted without operator action.
pub trait UnbanPolicy: Send + Sync + fmt::Debug {
    fn may_lift(&self, banned_at: Instant, now: Instant) -> bool;
}

/// Lifts a ban once it has lasted `after`.
#[derive(Clone, Copy, Debug)]
pub struct CooldownUnban {
    pub after: Duration,
}

impl UnbanPolicy for CooldownUnban {
    fn may_lift(&self, banned_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(banned_at) >= self.after
    }
}

/// Bans only end by operator action.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualUnban;

impl UnbanPolicy for ManualUnban {
    fn may_lift(&self, _banned_at: Instant, _now: Instant) -> bool {
        false
    }
}

/// The policy matching `session.ban_cooldown_secs`.
pub fn policy_for(cooldown: Option<Duration>) -> Box<dyn UnbanPolicy> {
    match cooldown {
        Some(after) => Box::new(CooldownUnban { after }),
        None => Box::new(ManualUnban),
    }
}
