// printwatch: telemetry ingest and fan-out daemon.
//
// Wires together the UDP ingest pipeline, the archive writer, and the
// HTTP/WebSocket server, with a watch-channel shutdown cascade.

use clap::{Arg, Command};
use printwatch::config::{self, Config};
use printwatch::http::AppState;
use printwatch::{build_router, pipeline};
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::info;

fn validate_port_value(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("printwatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Telemetry ingest, fan-out, and per-print archival for networked 3-D printers")
        .arg(
            Arg::new("config")
                .help("Path to a TOML config file")
                .long("config")
                .value_name("path")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("serve")
                .about("Run the ingest pipeline and the dashboard server")
                .arg(
                    Arg::new("udp_port")
                        .help("UDP port to listen for telemetry datagrams on")
                        .value_parser(validate_port_value)
                        .index(1),
                )
                .arg(
                    Arg::new("http_port")
                        .help("HTTP port for the dashboard and archive API")
                        .value_parser(validate_port_value)
                        .index(2),
                ),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = match config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    match matches.subcommand() {
        Some(("serve", serve_matches)) => {
            if let Some(port) = serve_matches.get_one::<u16>("udp_port") {
                config.udp_port = *port;
            }
            if let Some(port) = serve_matches.get_one::<u16>("http_port") {
                config.http_port = *port;
            }
            serve(config).await;
        }
        _ => unreachable!("subcommand is required"),
    }
}

async fn serve(config: Config) {
    info!(version = env!("CARGO_PKG_VERSION"), "printwatch starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pipeline = match pipeline::start(&config, shutdown_rx).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };
    info!(addr = %pipeline.udp_addr, "telemetry ingest listening");

    let state = AppState {
        hub: pipeline.hub.clone(),
        stats: pipeline.stats.clone(),
        archive_root: config.archive.root.clone(),
        subscriber_capacity: config.pipeline.subscriber_capacity,
    };
    let router = build_router(state);

    let http_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = match tokio::net::TcpListener::bind(&http_addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: failed to bind http listener on {}: {}", http_addr, e);
            std::process::exit(1);
        }
    };
    info!(addr = %http_addr, "http server listening");

    // On SIGINT/SIGTERM, start the cascade before the HTTP server begins
    // draining: stop the UDP reader, let decode drain and close the hub, so
    // live WebSocket subscribers observe the close and their connections
    // end. Axum's graceful shutdown waits on exactly those connections.
    let graceful = async move {
        shutdown_signal().await;
        shutdown_tx.send(true).ok();
    };
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(graceful)
        .await
    {
        eprintln!("FATAL: http server error: {}", e);
        std::process::exit(1);
    }

    // Give the archive writer a moment to flush its remaining appends.
    sleep(Duration::from_millis(200)).await;
    info!("printwatch shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
