//! Built-in job bodies.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::JobError;
use crate::scheduler::{JobContext, JobHandler};
use crate::types::job::{NewJob, QueueName, Requirements};
use crate::types::protocol::Command;

pub const UDP_COMMAND: &str = "udp-command";

fn default_needs_auth() -> bool {
    true
}

/// Payload of a `udp-command` job: one request to the remote service.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UdpCommandPayload {
    pub action: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default = "default_needs_auth")]
    pub needs_auth: bool,
}

impl UdpCommandPayload {
    pub fn command(&self) -> Command {
        self.params
            .iter()
            .fold(Command::new(&self.action), |cmd, (k, v)| cmd.param(k, v))
    }

    /// A job sending this command. Identical commands queued twice collapse
    /// into one record.
    pub fn into_job(self, queue: QueueName) -> Result<NewJob, serde_json::Error> {
        let key = format!("{UDP_COMMAND}:{}", self.command());
        let payload = serde_json::to_string(&self)?;
        Ok(NewJob::new(queue, UDP_COMMAND, payload).with_dedupe_key(key))
    }
}

/// Sends the payload's command through the session client.
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpCommandHandler;

#[async_trait]
impl JobHandler for UdpCommandHandler {
    fn requirements(&self) -> Requirements {
        Requirements::SESSION
    }

    async fn run(&self, ctx: JobContext<'_>) -> Result<(), JobError> {
        let payload: UdpCommandPayload = serde_json::from_str(&ctx.record.payload)?;
        let command = payload.command();

        let response = ctx.send(command, payload.needs_auth).await?;
        info!(
            action = %payload.action,
            code = %response.code,
            status = %response.status,
            lines = response.body.len(),
            "command answered"
        );

        Ok(())
    }
}
