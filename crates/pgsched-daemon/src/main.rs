use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pgsched_core::{config::EXAMPLE_CONFIG, PgschedConfig};
use pgsched_scheduler::{launch, DatabaseSeeker, DispatcherSettings, DispatcherStats, PgConnector};
use tokio::{sync::watch, task::JoinError, task::JoinSet};
use tracing::{error, info, warn};

mod cli;
mod pidfile;

use cli::Cli;
use pidfile::PidFile;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // usage errors exit 2, --help / -v exit 0
    let cli = Cli::parse();

    if let Some(path) = cli.example_config.as_deref() {
        return match std::fs::write(path, EXAMPLE_CONFIG) {
            Ok(()) => {
                println!("example configuration written to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("pgsched: cannot write {}: {e}", path.display());
                ExitCode::FAILURE
            }
        };
    }

    let config = match PgschedConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pgsched: [{}] {e}", e.code());
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.daemon.log_filter.as_str().into()),
        )
        .with_ansi(!cli.daemon)
        .init();

    match run(&cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("pgsched stopped: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, config: PgschedConfig) -> anyhow::Result<()> {
    let _pid_file = if cli.daemon {
        Some(PidFile::acquire(&config.daemon.pid_file).context("cannot start in daemon mode")?)
    } else {
        None
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        schema = %config.database.schema,
        max_conn = config.scheduler.max_conn,
        "pgsched starting"
    );

    let connector = Arc::new(
        PgConnector::new(
            &config.database.url,
            &config.database.schema,
            config.scheduler.retry_interval(),
        )
        .context("invalid database.url")?,
    );
    let mut seeker = DatabaseSeeker::new(
        connector,
        config.database.bootstrap.clone(),
        config.database.exclude.clone(),
        config.scheduler.seek_timeout(),
        DispatcherSettings::from_config(&config),
    );

    let dispatchers = match config.database.target.as_deref() {
        Some(target) => vec![seeker
            .promote(target)
            .await
            .with_context(|| format!("cannot schedule database {target}"))?],
        None => seeker
            .discover()
            .await
            .context("database discovery failed")?,
    };
    if dispatchers.is_empty() {
        warn!(
            bootstrap = %config.database.bootstrap,
            "no database hosts the scheduling schema, idling until stopped"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut running = launch(dispatchers, &shutdown_rx);

    let mut crashed = false;
    tokio::select! {
        _ = shutdown_signal() => info!("shutdown requested"),
        e = first_crash(&mut running) => {
            error!(error = %e, "dispatcher crashed");
            crashed = true;
        }
    }

    // signal dispatchers to stop
    let _ = shutdown_tx.send(true);
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((database, stats)) => log_stats(&database, &stats),
            Err(e) => {
                error!(error = %e, "dispatcher crashed");
                crashed = true;
            }
        }
    }

    if crashed {
        anyhow::bail!("a dispatcher terminated abnormally");
    }
    info!("pgsched stopped");
    Ok(())
}

/// Resolve with the first dispatcher that panicked. Never resolves while all
/// of them are healthy.
async fn first_crash(running: &mut JoinSet<(String, DispatcherStats)>) -> JoinError {
    loop {
        match running.join_next().await {
            Some(Err(e)) => return e,
            Some(Ok((database, stats))) => {
                warn!(database = %database, "dispatcher returned before shutdown");
                log_stats(&database, &stats);
            }
            None => std::future::pending::<()>().await,
        }
    }
}

fn log_stats(database: &str, stats: &DispatcherStats) {
    info!(
        database,
        polls = stats.polls,
        dispatched = stats.dispatched,
        succeeded = stats.succeeded,
        failed = stats.failed,
        errored = stats.errored,
        store_errors = stats.store_errors,
        "dispatcher finished"
    );
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
