use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, ProtocolError};
use crate::session::SessionClient;
use crate::types::job::{JobRecord, Requirements};
use crate::types::protocol::{Command, Response};

/// What a job body gets to work with.
pub struct JobContext<'a> {
    pub record: &'a JobRecord,
    pub session: &'a SessionClient,
    /// Fires when the queue is being stopped.
    pub cancel: &'a CancellationToken,
}

impl JobContext<'_> {
    /// Sends through the session client. Stopping the queue while this
    /// still waits for its turn hands the record back untouched.
    pub async fn send(
        &self,
        command: Command,
        needs_auth: bool,
    ) -> Result<Response, ProtocolError> {
        self.session.send_until(command, needs_auth, self.cancel).await
    }
}

/// The body of one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Checked by admission before every dispatch.
    fn requirements(&self) -> Requirements;

    async fn run(&self, ctx: JobContext<'_>) -> Result<(), JobError>;
}

/// Maps job type tags to their handlers. Filled in at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, replacing any earlier one.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Requirements of `job_type`. Unknown types need nothing, so they get
    /// dispatched and dropped promptly rather than lingering.
    pub fn requirements(&self, job_type: &str) -> Requirements {
        self.handlers
            .get(job_type)
            .map(|h| h.requirements())
            .unwrap_or(Requirements::LOCAL)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
