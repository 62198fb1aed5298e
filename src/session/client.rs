use std::future::Future;
use std::io;
use std::sync::{Mutex as StdMutex, PoisonError};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::select;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::state::SessionState;
use super::transport::Transport;
use crate::config::{Credentials, SessionSettings};
use crate::error::{AuthError, ProtocolError};
use crate::types::protocol::{CodeClass, Command, Response, ReturnCode};
use crate::types::serialisable::WireSerialisable;
use crate::util::bytes_to_human_str;

/// Owns the one session to the remote service.
///
/// Requests are serialised: whoever holds the connection lock is the only
/// request in flight, process-wide. Every reply is run through the ban and
/// backoff rules before the caller sees it, and the resulting
/// [`SessionState`] is published to subscribers.
pub struct SessionClient {
    conn: Mutex<Box<dyn Transport>>,
    state: watch::Sender<SessionState>,
    credentials: StdMutex<Credentials>,
    settings: SessionSettings,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl SessionClient {
    pub fn new(
        transport: impl Transport + 'static,
        credentials: Credentials,
        settings: SessionSettings,
    ) -> Self {
        let limiter = settings
            .request_interval()
            .and_then(Quota::with_period)
            .map(RateLimiter::direct);

        Self {
            conn: Mutex::new(Box::new(transport)),
            state: watch::Sender::new(SessionState::default()),
            credentials: StdMutex::new(credentials),
            settings,
            limiter,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// A snapshot of the current session state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Notified on every ban, backoff, login or network change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Logs in, unless already logged in.
    #[instrument(skip_all, err)]
    pub async fn login(&self) -> Result<(), AuthError> {
        let mut conn = self.conn.lock().await;
        if self.state.borrow().is_logged_in {
            return Ok(());
        }
        self.login_locked(conn.as_mut(), None).await
    }

    /// Sends a command and decodes the reply.
    ///
    /// With `needs_auth`, logs in first when there's no session and appends
    /// the session id. A reply saying the session is invalid triggers one
    /// re-login and one resubmission; a second rejection is returned as
    /// [`ProtocolError::InvalidSession`].
    pub async fn send(
        &self,
        command: Command,
        needs_auth: bool,
    ) -> Result<Response, ProtocolError> {
        self.send_with(command, needs_auth, None).await
    }

    /// Like [`send`](Self::send), but gives up with
    /// [`ProtocolError::Cancelled`] if `cancel` fires while waiting for the
    /// connection or for pacing. A request already on the wire completes.
    pub async fn send_until(
        &self,
        command: Command,
        needs_auth: bool,
        cancel: &CancellationToken,
    ) -> Result<Response, ProtocolError> {
        self.send_with(command, needs_auth, Some(cancel)).await
    }

    #[instrument(skip_all, fields(command = %command, needs_auth = needs_auth))]
    async fn send_with(
        &self,
        command: Command,
        needs_auth: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, ProtocolError> {
        let mut guard = unless_cancelled(cancel, self.conn.lock()).await?;
        let conn = guard.as_mut();
        let with_session = needs_auth && !command.is_sessionless();

        if with_session && !self.state.borrow().is_logged_in {
            self.login_locked(conn, cancel).await?;
        }

        match self.dispatch(conn, &command, with_session, cancel).await {
            Err(ProtocolError::InvalidSession { code }) if with_session => {
                info!(%code, "session rejected, logging in again");
                self.login_locked(conn, cancel).await?;
                self.dispatch(conn, &command, true, cancel).await
            },
            result => result,
        }
    }

    pub async fn ping(&self) -> Result<Response, ProtocolError> {
        self.send(Command::ping(), false).await
    }

    /// Best-effort logout. The local session is forgotten whatever the
    /// server answers.
    pub async fn logout(&self) -> Result<(), ProtocolError> {
        let mut conn = self.conn.lock().await;
        self.logout_locked(conn.as_mut()).await
    }

    /// Operator action: lift a ban now.
    pub fn clear_ban(&self) {
        self.state.send_modify(SessionState::lift_ban);
    }

    /// Operator action: replace the credentials. Clears the rejected flag so
    /// session jobs become admissible again.
    pub fn set_credentials(&self, credentials: Credentials) {
        *self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = credentials;

        self.state.send_modify(|s| {
            s.credentials_rejected = false;
            s.invalid_session = false;
            s.clear_session();
        });
    }

    pub fn set_network_available(&self, available: bool) {
        self.state.send_if_modified(|s| {
            if s.is_network_available == available {
                return false;
            }
            if available {
                info!("network available");
            } else {
                warn!("network unavailable");
            }
            s.is_network_available = available;
            true
        });
    }

    /// The connection, unless a request is in flight.
    pub(super) fn try_connection(
        &self,
    ) -> Option<MutexGuard<'_, Box<dyn Transport>>> {
        self.conn.try_lock().ok()
    }

    pub(super) async fn ping_locked(
        &self,
        conn: &mut dyn Transport,
    ) -> Result<Response, ProtocolError> {
        self.dispatch(conn, &Command::ping(), false, None).await
    }

    pub(super) async fn logout_locked(
        &self,
        conn: &mut dyn Transport,
    ) -> Result<(), ProtocolError> {
        let session = self.state.borrow().session_id.clone();

        let result = match session {
            Some(session) => self
                .dispatch(conn, &Command::logout().param("s", session), false, None)
                .await
                .map(|_| ()),
            None => Ok(()),
        };

        if let Err(error) = &result {
            debug!(%error, "logout not acknowledged");
        }

        self.state.send_modify(|s| {
            s.invalid_session = false;
            s.clear_session();
        });
        info!("logged out");

        result
    }

    async fn login_locked(
        &self,
        conn: &mut dyn Transport,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), AuthError> {
        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if !credentials.is_complete() {
            self.state.send_modify(|s| s.credentials_rejected = true);
            return Err(AuthError::MissingCredentials);
        }

        debug!(user = %credentials.username, "logging in");
        let command = Command::auth(
            &credentials.username,
            &credentials.password,
            &self.settings.client,
            self.settings.client_version,
        );

        let response = match self.dispatch(conn, &command, false, cancel).await {
            Ok(response) => response,
            Err(ProtocolError::Rejected {
                code: ReturnCode::LOGIN_FAILED,
                ..
            }) => {
                error!("login failed: invalid credentials");
                self.state.send_modify(|s| {
                    s.credentials_rejected = true;
                    s.clear_session();
                });
                return Err(AuthError::BadCredentials);
            },
            Err(ProtocolError::Rejected {
                code: ReturnCode::CLIENT_VERSION_OUTDATED,
                status,
            }) => return Err(AuthError::ClientOutdated { status }),
            Err(ProtocolError::Banned { reason }) => {
                return Err(AuthError::Banned { reason })
            },
            Err(ProtocolError::ServerBusy { code, status }) => {
                return Err(AuthError::ServerBusy { code, status })
            },
            Err(e) => return Err(AuthError::Request(Box::new(e))),
        };

        let session_id = match response.code {
            ReturnCode::LOGIN_ACCEPTED | ReturnCode::LOGIN_ACCEPTED_NEW_VERSION => {
                response.session_id().map(str::to_owned)
            },
            _ => None,
        };
        let Some(session_id) = session_id else {
            return Err(AuthError::Unexpected {
                code: response.code,
                status: response.status,
            });
        };

        if response.code == ReturnCode::LOGIN_ACCEPTED_NEW_VERSION {
            warn!("a newer client version is available");
        }

        self.state.send_modify(|s| {
            s.session_id = Some(session_id);
            s.is_logged_in = true;
            s.invalid_session = false;
            s.credentials_rejected = false;
        });
        info!("logged in");

        Ok(())
    }

    /// Frames, paces, sends and decodes one request. Must be called with
    /// the connection lock held.
    async fn dispatch(
        &self,
        conn: &mut dyn Transport,
        command: &Command,
        with_session: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, ProtocolError> {
        self.check_gate(Instant::now())?;

        let mut framed = command.clone();
        if with_session {
            let session = self.state.borrow().session_id.clone();
            if let Some(session) = session {
                framed = framed.param("s", session);
            }
        }

        if let Some(limiter) = &self.limiter {
            unless_cancelled(cancel, limiter.until_ready()).await?;
        }

        self.touch(command.is_ping());
        let started = Instant::now();

        let reply = match conn.exchange(&framed.serialise_wire()).await {
            Ok(reply) => reply,
            Err(error) if error.kind() == io::ErrorKind::TimedOut => {
                warn!(command = %framed, "request timed out");
                return Err(ProtocolError::Timeout);
            },
            Err(error) => {
                warn!(%error, command = %framed, "request failed");
                self.set_network_available(false);
                return Err(error.into());
            },
        };
        self.set_network_available(true);

        // Banned clients get an empty or all-zero datagram.
        if reply.iter().all(|b| *b == 0) {
            let reason = "empty reply".to_owned();
            self.state.send_modify(|s| s.ban(Instant::now(), &reason));
            return Err(ProtocolError::Banned { reason });
        }

        let response = Response::try_from(&reply[..]).map_err(|error| {
            let raw = bytes_to_human_str(&reply);
            warn!(%error, raw, "unparseable reply");
            ProtocolError::Unparseable { error, raw }
        })?;

        debug!(
            code = %response.code,
            status = %response.status,
            elapsed = ?started.elapsed(),
            "reply"
        );

        self.interpret(response)
    }

    /// Maps a decoded status to session state changes and a typed outcome.
    fn interpret(&self, response: Response) -> Result<Response, ProtocolError> {
        let code = response.code;

        match code.class() {
            CodeClass::Success => Ok(response),
            CodeClass::InvalidSession => {
                self.state.send_modify(|s| {
                    s.invalid_session = true;
                    s.clear_session();
                });
                Err(ProtocolError::InvalidSession { code })
            },
            CodeClass::Banned => {
                let reason = format!("{code} {}", response.status);
                self.state.send_modify(|s| s.ban(Instant::now(), &reason));
                Err(ProtocolError::Banned { reason })
            },
            CodeClass::Backoff => {
                let reason = format!("{code} {}", response.status);
                let duration = self.settings.busy_backoff();
                self.state.send_if_modified(|s| {
                    s.start_backoff(Instant::now(), duration, &reason)
                });
                Err(ProtocolError::ServerBusy {
                    code,
                    status: response.status,
                })
            },
            CodeClass::UnknownCommand => Err(ProtocolError::UnknownCommand {
                status: response.status,
            }),
            CodeClass::Rejected => Err(ProtocolError::Rejected {
                code,
                status: response.status,
            }),
        }
    }

    /// Refuses to send while banned or backing off.
    fn check_gate(&self, now: Instant) -> Result<(), ProtocolError> {
        let state = self.state.borrow();

        if state.is_banned {
            return Err(ProtocolError::Banned {
                reason: state.ban_reason.clone().unwrap_or_default(),
            });
        }

        if let Some(remaining) = state.backoff_remaining(now) {
            return Err(ProtocolError::BackingOff {
                remaining,
                reason: state.backoff_reason.clone().unwrap_or_default(),
            });
        }

        Ok(())
    }

    // Timestamps only; not worth waking subscribers for.
    fn touch(&self, is_ping: bool) {
        let now = Instant::now();
        self.state.send_if_modified(|s| {
            s.last_request = Some(now);
            if !is_ping {
                s.last_non_ping_request = Some(now);
            }
            false
        });
    }
}

/// Awaits `fut`, unless `cancel` fires first.
async fn unless_cancelled<F: Future>(
    cancel: Option<&CancellationToken>,
    fut: F,
) -> Result<F::Output, ProtocolError> {
    let Some(cancel) = cancel else {
        return Ok(fut.await);
    };

    select! {
        biased;
        _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
        output = fut => Ok(output),
    }
}
