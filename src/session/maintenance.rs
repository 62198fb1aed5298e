//! Periodic housekeeping of the session: keep-alive pings, idle logout,
//! connectivity probes and lifting bans.
use std::sync::Arc;

use tokio::select;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::UnbanPolicy;
use super::client::SessionClient;

impl SessionClient {
    /// One maintenance pass. Does nothing while a request is in flight.
    pub async fn maintain(&self, unban: &dyn UnbanPolicy) {
        let now = Instant::now();
        let state = self.state();

        if state.is_banned {
            if let Some(banned_at) = state.banned_at {
                if !state.is_backing_off(now) && unban.may_lift(banned_at, now) {
                    info!(?unban, "ban cooldown elapsed");
                    self.clear_ban();
                }
            }
            return;
        }

        if state.is_backing_off(now) {
            return;
        }

        let Some(mut conn) = self.try_connection() else {
            trace!("request in flight, skipping maintenance");
            return;
        };

        if !state.is_network_available {
            match self.ping_locked(conn.as_mut()).await {
                Ok(_) => info!("connectivity probe succeeded"),
                Err(error) => debug!(%error, "connectivity probe failed"),
            }
            return;
        }

        if !state.is_logged_in {
            return;
        }

        let idle_since = state.last_non_ping_request.unwrap_or(now);
        if now.saturating_duration_since(idle_since) >= self.settings().idle_logout() {
            info!("session idle, logging out");
            if let Err(error) = self.logout_locked(conn.as_mut()).await {
                debug!(%error, "idle logout failed");
            }
            return;
        }

        let quiet_since = state.last_request.unwrap_or(now);
        if now.saturating_duration_since(quiet_since) >= self.settings().ping_interval() {
            trace!("keep-alive ping");
            if let Err(error) = self.ping_locked(conn.as_mut()).await {
                warn!(%error, "keep-alive ping failed");
            }
        }
    }
}

/// Runs [`SessionClient::maintain`] every `maintenance_tick` until
/// cancelled.
pub async fn run_maintenance(
    client: Arc<SessionClient>,
    unban: Box<dyn UnbanPolicy>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(client.settings().maintenance_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticker.tick() => client.maintain(unban.as_ref()).await,
            _ = cancel.cancelled() => break,
        }
    }

    debug!("session maintenance stopped");
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::*;
    use crate::session::backoff::{CooldownUnban, ManualUnban};
    use crate::session::testing::Script;
    use crate::types::protocol::Command;

    #[tokio::test(start_paused = true)]
    async fn test_pings_when_quiet() {
        let script = Script::new();
        let client = script.client();
        client.send(Command::new("FILE"), true).await.unwrap();

        tokio::time::advance(Duration::from_secs(44)).await;
        client.maintain(&ManualUnban).await;
        assert_eq!(script.sent_actions(), vec!["AUTH", "FILE"]);

        tokio::time::advance(Duration::from_secs(1)).await;
        client.maintain(&ManualUnban).await;
        assert_eq!(script.sent_actions(), vec!["AUTH", "FILE", "PING"]);
        assert!(client.state().is_logged_in);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logs_out_when_idle() {
        let script = Script::new();
        let client = script.client();
        client.send(Command::new("FILE"), true).await.unwrap();

        // Pings keep the socket alive but don't count as activity.
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(45)).await;
            client.maintain(&ManualUnban).await;
        }
        assert!(client.state().is_logged_in);

        tokio::time::advance(Duration::from_secs(30)).await;
        client.maintain(&ManualUnban).await;

        assert!(!client.state().is_logged_in);
        assert_eq!(script.sent_actions().last().map(String::as_str), Some("LOGOUT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_traffic_when_logged_out() {
        let script = Script::new();
        let client = script.client();

        tokio::time::advance(Duration::from_secs(600)).await;
        client.maintain(&ManualUnban).await;
        assert!(script.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_network_when_unavailable() {
        let script = Script::new();
        script.on_error("PING", io::ErrorKind::ConnectionRefused);
        let client = script.client();

        assert!(client.ping().await.is_err());
        assert!(!client.state().is_network_available);

        client.maintain(&ManualUnban).await;
        assert!(client.state().is_network_available);
        assert_eq!(script.sent_actions(), vec!["PING", "PING"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifts_ban_after_cooldown() {
        let script = Script::new();
        script.on("PING", "555 BANNED");
        let client = script.client();
        let policy = CooldownUnban {
            after: Duration::from_secs(90 * 60),
        };

        assert!(client.ping().await.is_err());
        assert!(client.state().is_banned);

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        client.maintain(&policy).await;
        assert!(client.state().is_banned);
        client.maintain(&ManualUnban).await;
        assert!(client.state().is_banned);

        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        client.maintain(&policy).await;
        assert!(!client.state().is_banned);

        // Lifting the ban sends nothing by itself.
        assert_eq!(script.sent_actions(), vec!["PING"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_maintenance_stops_on_cancel() {
        let script = Script::new();
        let client = Arc::new(script.client());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_maintenance(
            client.clone(),
            Box::new(ManualUnban),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
