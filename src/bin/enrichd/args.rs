use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Enables write-ahead logging and sets the directory to store WAL files
    /// in. Overrides `store.wal_dir`.
    #[arg(short = 'b', long)]
    pub(crate) wal_dir: Option<PathBuf>,
    /// Remote service username. Overrides `credentials.username`.
    #[arg(short, long, env = "ENRICHD_USERNAME")]
    pub(crate) username: Option<String>,
    /// Remote service password. Overrides `credentials.password`.
    #[arg(short, long, env = "ENRICHD_PASSWORD", hide_env_values = true)]
    pub(crate) password: Option<String>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}
