use anyhow::{Context, Result};
use clap::Parser;
use nanny_core::{LoopDriver, NannyMetrics};
use nanny_daemon::cli::Cli;
use nanny_daemon::config::{ConfigError, NannyConfig};
use nanny_daemon::server::{self, ServerState};
use nanny_daemon::{app, init_logging};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            tracing::error!("{:#}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!("startup failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = NannyConfig::load(cli.config.as_deref(), &cli.run)?;
    let nanny = cli.command.name();
    tracing::info!("{} nanny starting", nanny);

    let metrics = Arc::new(
        NannyMetrics::new(&config.metric_prefix(nanny)).context("registering metrics")?,
    );
    let wired = app::wire(cli.command, &config, metrics.clone()).await?;
    let mut driver = LoopDriver::new(
        wired.nanny,
        wired.repairers,
        metrics.clone(),
        config.driver_config(cli.run.once),
    );
    let cancel = driver.cancel_token();

    let port = config.common.metrics_port;
    let state = ServerState {
        metrics,
        status: driver.status(),
    };
    let server = async move {
        if port == 0 {
            std::future::pending::<std::io::Result<()>>().await
        } else {
            server::serve(port, state).await
        }
    };

    let mut run = tokio::spawn(async move { driver.run().await });
    tokio::select! {
        res = &mut run => {
            let cycles = res.context("driver task")?;
            tracing::info!("{} nanny finished after {} cycles", nanny, cycles);
        }
        res = server => {
            cancel.cancel();
            let _ = run.await;
            res.context("metrics endpoint")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested, finishing current cycle");
            cancel.cancel();
            run.await.context("driver task")?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
