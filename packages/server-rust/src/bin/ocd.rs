//! `ocd` -- the Open Cluster Daemon entry point (spec §6, §9).
//!
//! Grounded on `original_source/server/ocd.c`'s `main()`: parse args,
//! load local conninfo, optionally daemonize, install a signal handler
//! that starts a graceful shutdown, and run the event loop. Exit code
//! `1` on any configuration error, matching the original's `exit(1)`
//! calls on a missing/unparseable conninfo file.

use std::process::ExitCode;

use opencluster_server::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = ServerConfig::parse_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.tracing_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config.daemonize {
        // Daemonizing (fork + detach from the controlling terminal) is a
        // process-lifecycle concern handled by the supervisor in most
        // modern deployments; `ocd.c`'s `daemonize()` is not reproduced
        // here, matching spec §1's scoping of the daemonization/PID-file
        // logic out of the bucket-management subsystem. The flag is
        // still accepted so existing conninfo/launch scripts don't fail
        // to parse.
        tracing::warn!("-d/--daemonize is accepted for CLI compatibility but this build always runs in the foreground");
    }

    if let Some(pid_file) = &config.pid_file {
        if let Err(e) = std::fs::write(pid_file, std::process::id().to_string()) {
            tracing::error!(path = %pid_file.display(), error = %e, "failed to write pidfile");
            return ExitCode::FAILURE;
        }
    }

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    rt.block_on(async_main(config))
}

async fn async_main(config: ServerConfig) -> ExitCode {
    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
        shutdown_server.shutdown();
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal server error");
            ExitCode::FAILURE
        }
    }
}
