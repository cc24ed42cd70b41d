use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Job scheduler for PostgreSQL databases.
///
/// Runs the tasks stored in each database's scheduling schema when they
/// become due.
#[derive(Debug, Parser)]
#[command(name = "pgsched", version, about, disable_version_flag = true)]
pub struct Cli {
    /// Run as a daemon: write the PID file and log without colours
    #[arg(short, long)]
    pub daemon: bool,

    /// Configuration file [default: /etc/pgsched/pgsched.toml]
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,

    /// Write an example configuration to FILE and exit
    #[arg(short = 'C', long, value_name = "FILE")]
    pub example_config: Option<PathBuf>,

    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,
}
