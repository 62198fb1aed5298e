mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use enrichd::config::Config;
use enrichd::jobs::{UdpCommandHandler, UDP_COMMAND};
use enrichd::scheduler::{HandlerRegistry, Scheduler};
use enrichd::session::backoff::policy_for;
use enrichd::session::maintenance::run_maintenance;
use enrichd::session::{SessionClient, UdpTransport};
use enrichd::store::JobStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, cancel).await {
        error!(error = format!("{error:#}"), "encountered runtime error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(wal_dir) = &args.wal_dir {
        config.store.wal_dir = Some(wal_dir.clone());
    }
    if let Some(username) = &args.username {
        config.credentials.username = username.clone();
    }
    if let Some(password) = &args.password {
        config.credentials.password = password.clone();
    }

    if !config.credentials.is_complete() {
        warn!("no credentials configured, session jobs will be held back");
    }

    Ok(config)
}

async fn begin(args: Args, cancel: CancellationToken) -> Result<()> {
    let config = load_config(&args)?;

    let store = Arc::new(JobStore::open(&config.store).context("opening the job store")?);

    let remote = &config.remote;
    let transport = UdpTransport::connect(
        remote.local_port,
        &remote.host,
        remote.port,
        remote.request_timeout(),
    )
    .await
    .with_context(|| format!("connecting to {}:{}", remote.host, remote.port))?;

    let session = Arc::new(SessionClient::new(
        transport,
        config.credentials.clone(),
        config.session.clone(),
    ));

    // Probe once so admission starts from a known network state.
    match session.ping().await {
        Ok(_) => info!("remote service reachable"),
        Err(error) => warn!(%error, "remote service not reachable yet"),
    }

    let mut registry = HandlerRegistry::new();
    registry.register(UDP_COMMAND, UdpCommandHandler);
    info!(?registry, "job handlers registered");

    let scheduler = Scheduler::new(
        store.clone(),
        session.clone(),
        registry,
        config.scheduler.clone(),
    );
    scheduler.start_all();

    let maintenance = tokio::spawn(run_maintenance(
        session.clone(),
        policy_for(config.session.ban_cooldown()),
        cancel.clone(),
    ));

    info!("running");
    cancel.cancelled().await;
    info!("shutting down");

    scheduler.stop_all().await;
    if let Err(error) = maintenance.await {
        warn!(%error, "session maintenance ended abnormally");
    }
    if session.state().is_logged_in {
        if let Err(error) = session.logout().await {
            warn!(%error, "logout failed");
        }
    }

    let summary = serde_yaml::to_string(&scheduler.summary())
        .context("rendering the final summary")?;
    info!(summary, "final state");

    Ok(())
}
