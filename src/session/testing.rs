//! A scripted stand-in for the remote service.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::client::SessionClient;
use super::transport::Transport;
use crate::config::{Credentials, SessionSettings};
use crate::types::protocol::{Command, AUTH, LOGOUT, PING, UPTIME};

enum Reply {
    Raw(Vec<u8>),
    Error(io::ErrorKind),
}

#[derive(Default)]
struct Inner {
    replies: HashMap<String, VecDeque<Reply>>,
    sent: Vec<(Instant, Command)>,
    sessions: u32,
    in_flight: usize,
    max_in_flight: usize,
}

/// Replies queued per action are used first. Anything unscripted gets a
/// plausible success: logins are accepted with `sess1`, `sess2`, ...
#[derive(Clone, Default)]
pub(crate) struct Script {
    inner: Arc<Mutex<Inner>>,
    latency: Duration,
}

impl Script {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn on(&self, action: &str, reply: &str) -> &Self {
        self.push(action, Reply::Raw(format!("{reply}\n").into_bytes()))
    }

    pub(crate) fn on_raw(&self, action: &str, reply: &[u8]) -> &Self {
        self.push(action, Reply::Raw(reply.to_vec()))
    }

    pub(crate) fn on_error(&self, action: &str, kind: io::ErrorKind) -> &Self {
        self.push(action, Reply::Error(kind))
    }

    pub(crate) fn sent(&self) -> Vec<Command> {
        self.lock().sent.iter().map(|(_, c)| c.clone()).collect()
    }

    pub(crate) fn sent_actions(&self) -> Vec<String> {
        self.lock()
            .sent
            .iter()
            .map(|(_, c)| c.action().to_owned())
            .collect()
    }

    pub(crate) fn sent_at(&self) -> Vec<(Instant, String)> {
        self.lock()
            .sent
            .iter()
            .map(|(at, c)| (*at, c.action().to_owned()))
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub(crate) fn transport(&self) -> ScriptedTransport {
        ScriptedTransport {
            script: self.clone(),
        }
    }

    pub(crate) fn client(&self) -> SessionClient {
        self.client_with(Credentials::new("alice", "secret"))
    }

    pub(crate) fn client_with(&self, credentials: Credentials) -> SessionClient {
        SessionClient::new(self.transport(), credentials, test_settings())
    }

    fn push(&self, action: &str, reply: Reply) -> &Self {
        self.lock()
            .replies
            .entry(action.to_owned())
            .or_default()
            .push_back(reply);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

/// Unpaced, so paused-clock tests only see the waits they ask for.
pub(crate) fn test_settings() -> SessionSettings {
    SessionSettings {
        request_interval_ms: None,
        ..Default::default()
    }
}

pub(crate) struct ScriptedTransport {
    script: Script,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exchange(&mut self, request: &[u8]) -> io::Result<Bytes> {
        let command = Command::try_from(request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        {
            let mut inner = self.script.lock();
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }

        if !self.script.latency.is_zero() {
            tokio::time::sleep(self.script.latency).await;
        }

        let mut inner = self.script.lock();
        inner.in_flight -= 1;
        inner.sent.push((Instant::now(), command.clone()));

        let scripted = inner
            .replies
            .get_mut(command.action())
            .and_then(VecDeque::pop_front);

        let reply = match scripted {
            Some(Reply::Raw(reply)) => reply,
            Some(Reply::Error(kind)) => return Err(io::Error::from(kind)),
            None => default_reply(&mut inner, &command),
        };

        Ok(Bytes::from(reply))
    }
}

fn default_reply(inner: &mut Inner, command: &Command) -> Vec<u8> {
    let reply = match command.action() {
        AUTH => {
            inner.sessions += 1;
            format!("200 sess{} LOGIN ACCEPTED\n", inner.sessions)
        },
        PING => "300 PONG\n".to_owned(),
        LOGOUT => "203 LOGGED OUT\n".to_owned(),
        UPTIME => "208 UPTIME\n1000\n".to_owned(),
        other => format!("220 {other}\n1|2|3\n"),
    };
    reply.into_bytes()
}
