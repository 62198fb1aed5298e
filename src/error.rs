use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::parser::ParsingError;
use crate::types::job::JobId;
use crate::types::protocol::ReturnCode;

/// How the scheduler should treat a failure, decided without reading message
/// text.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// Try again later; the record stays queued.
    Transient,
    /// Every network-requiring job is blocked until the ban is lifted. The
    /// record stays queued.
    Banned,
    /// Retrying cannot help; the record is dropped.
    Permanent,
}

/// Failures of a request to the remote service.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("banned by the remote service: {reason}")]
    Banned { reason: String },
    #[error("backing off for another {remaining:?}: {reason}")]
    BackingOff { remaining: Duration, reason: String },
    #[error("session rejected again after logging in ({code})")]
    InvalidSession { code: ReturnCode },
    #[error("server asked us to back off: {code} {status}")]
    ServerBusy { code: ReturnCode, status: String },
    #[error("unknown command: {status}")]
    UnknownCommand { status: String },
    #[error("request rejected: {code} {status}")]
    Rejected { code: ReturnCode, status: String },
    #[error("unparseable response ({error}): {raw}")]
    Unparseable { error: ParsingError, raw: String },
    #[error("login failed: {0}")]
    Login(#[from] AuthError),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// Given up before anything was sent.
    #[error("cancelled while waiting for the session")]
    Cancelled,
}

impl ProtocolError {
    pub fn kind(&self) -> FailureKind {
        use ProtocolError::*;

        match self {
            Banned { .. } => FailureKind::Banned,
            BackingOff { .. } | InvalidSession { .. } | ServerBusy { .. } => {
                FailureKind::Transient
            },
            UnknownCommand { .. } | Rejected { .. } | Unparseable { .. } => {
                FailureKind::Permanent
            },
            Login(e) => e.kind(),
            Timeout | Io(_) | Cancelled => FailureKind::Transient,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            ProtocolError::Cancelled => true,
            ProtocolError::Login(AuthError::Request(e)) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Failures of `AUTH`.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no username or password configured")]
    MissingCredentials,
    #[error("invalid credentials")]
    BadCredentials,
    #[error("client version rejected: {status}")]
    ClientOutdated { status: String },
    #[error("banned: {reason}")]
    Banned { reason: String },
    #[error("server busy: {code} {status}")]
    ServerBusy { code: ReturnCode, status: String },
    #[error("unexpected login reply: {code} {status}")]
    Unexpected { code: ReturnCode, status: String },
    #[error(transparent)]
    Request(Box<ProtocolError>),
}

impl AuthError {
    pub fn kind(&self) -> FailureKind {
        use AuthError::*;

        match self {
            // Session jobs are held back until an operator fixes the
            // credentials, so these don't burn the record.
            MissingCredentials | BadCredentials => FailureKind::Transient,
            ClientOutdated { .. } | Unexpected { .. } => FailureKind::Permanent,
            Banned { .. } => FailureKind::Banned,
            ServerBusy { .. } => FailureKind::Transient,
            Request(e) => e.kind(),
        }
    }
}

/// Failures of the job record store. Fatal to the operation that hit them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no such job: {0}")]
    NotFound(JobId),
}

/// What a job body reports back to its queue processor.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job asks to be tried again later.
    #[error("{0}")]
    Retryable(String),
    /// Bad input, not found on the remote, or anything else retrying won't fix.
    #[error("{0}")]
    Permanent(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no handler registered for job type {0:?}")]
    UnknownType(String),
    #[error("bad payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Retryable(_) => FailureKind::Transient,
            JobError::Protocol(e) => e.kind(),
            JobError::Permanent(_)
            | JobError::UnknownType(_)
            | JobError::Payload(_) => FailureKind::Permanent,
        }
    }

    /// Only job-declared retries count towards the attempt limit; waiting
    /// out server conditions never exhausts a record.
    pub fn counts_towards_limit(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }

    /// The worker was stopped before the job reached the remote service.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Protocol(e) if e.is_cancelled())
    }
}

/// Failures loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
