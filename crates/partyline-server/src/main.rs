//! Partyline server binary.
//!
//! Wires the XMPP core to its operational surface: TOML config,
//! tracing, the admin HTTP API, and signal-driven shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use partyline_xmpp::{XmppServer, XmppServerConfig};

mod config;
mod routes;
mod telemetry;

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "partyline-server", version, about = "XMPP presence server with HTTP admin API")]
struct Args {
    /// Path to the TOML config file (created with defaults if missing)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load_or_create(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    telemetry::init(config.log_debug);

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    info!("Partyline server starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let server = Arc::new(XmppServer::new(XmppServerConfig {
        fallback_domain: config.host.domain.clone(),
        muc_label: config.options.muc_name.clone(),
        cert_path: config.certs.cert.clone(),
        key_path: config.certs.key.clone(),
        ca_path: config.certs.ca_bundle.clone(),
    }));

    let xmpp_addr = config.xmpp_addr()?;
    let xmpp_listener = TcpListener::bind(xmpp_addr)
        .await
        .with_context(|| format!("binding XMPP listener on {}", xmpp_addr))?;

    let admin_addr = config.admin_addr()?;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("binding admin listener on {}", admin_addr))?;
    info!(addr = %admin_addr, "Admin API listening");

    let xmpp_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(xmpp_listener).await {
                error!(error = %e, "XMPP server stopped with error");
            }
        })
    };

    let admin_app = routes::create_router(server.router());
    let shutdown_token = server.shutdown_token();
    let admin_task = tokio::spawn(async move {
        let result = axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Admin API stopped with error");
        }
    });

    wait_for_signal().await?;

    info!("Shutting down");
    server.shutdown().await;

    let _ = xmpp_task.await;
    let _ = admin_task.await;

    info!("Goodbye");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        _ = interrupt.recv() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }

    Ok(())
}
