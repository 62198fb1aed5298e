use tokio::time::Instant;

/// Process-wide view of the session. Written only by the session client,
/// read by admission checks.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub is_logged_in: bool,
    pub is_banned: bool,
    pub banned_at: Option<Instant>,
    pub ban_reason: Option<String>,
    pub is_network_available: bool,
    /// The last reply said our session id is no longer valid.
    pub invalid_session: bool,
    /// The service refused our credentials, or none are configured.
    pub credentials_rejected: bool,
    /// No request is dispatched before this instant.
    pub backoff_until: Option<Instant>,
    pub backoff_reason: Option<String>,
    pub last_request: Option<Instant>,
    pub last_non_ping_request: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            session_id: None,
            is_logged_in: false,
            is_banned: false,
            banned_at: None,
            ban_reason: None,
            is_network_available: true,
            invalid_session: false,
            credentials_rejected: false,
            backoff_until: None,
            backoff_reason: None,
            last_request: None,
            last_non_ping_request: None,
        }
    }
}

impl SessionState {
    pub(crate) fn clear_session(&mut self) {
        self.session_id = None;
        self.is_logged_in = false;
    }
}
