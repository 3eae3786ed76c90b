//! tnnlr CLI
//!
//! A command-line tool for exposing a local HTTP(S) server through a tnnlr
//! rendezvous service.
//!
//! # Usage
//!
//! ```bash
//! tnnlr --port 8080 --url https://tunnel.example.com/api/tunnels
//! ```
//!
//! This requests an endpoint from the control plane, then keeps a pool of
//! tunnel connections open so that requests to the assigned public URL are
//! proxied to `localhost:8080`.
//!
//! # Options
//!
//! - `--port`: local port to forward traffic to (required)
//! - `--url`: control-plane URL (required)
//! - `--api-key`: bearer token for the control plane (or `TNNLR_API_KEY`)
//! - `--local-host`: forward to a host other than `localhost`; also
//!   rewrites the HTTP `Host:` header of forwarded requests
//! - `--url-file`: persist the assigned public URL to a file
//! - `--max-connections`, `--retry`, `--retry-delay`: pool size and
//!   endpoint-acquisition retry behavior
//! - `--local-https`, `--allow-invalid-cert`, `--local-cert`,
//!   `--local-key`, `--local-ca`: TLS on the local leg
//!
//! # Example
//!
//! ```bash
//! # Forward to a name-based virtual host over HTTPS, trusting its dev CA
//! export TNNLR_API_KEY=tok3n
//! tnnlr --port 8443 --url https://tunnel.example.com/api/tunnels \
//!     --local-host app.internal --local-https --local-ca dev-ca.pem
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tnnlr::{endpoint, LocalConnectConfig, TunnelConfig, TunnelPool};
use tracing::{info, warn, Level};

/// How long running sessions get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// tnnlr CLI - Expose a local server through a pool of TCP tunnels
#[derive(Parser, Debug)]
#[command(name = "tnnlr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The local port to forward traffic to.
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Control-plane URL used to request a tunnel endpoint.
    #[arg(short, long)]
    url: String,

    /// API key sent as a bearer token to the control plane.
    ///
    /// Can also be provided via the TNNLR_API_KEY environment variable.
    #[arg(long, env = "TNNLR_API_KEY")]
    api_key: Option<String>,

    /// Hostname to forward traffic to.
    ///
    /// Anything other than `localhost` or `127.0.0.1` is also substituted
    /// into the first HTTP `Host:` header of each forwarded request.
    #[arg(long, default_value = "localhost")]
    local_host: String,

    /// Write the assigned public URL to this file.
    #[arg(long)]
    url_file: Option<PathBuf>,

    /// Maximum number of tunnel connections to keep open.
    ///
    /// The effective pool size is capped by the endpoint's own limit.
    #[arg(long, default_value_t = 10)]
    max_connections: usize,

    /// Attempts when requesting an endpoint from the control plane.
    #[arg(long, default_value_t = 3)]
    retry: u32,

    /// Seconds to wait between endpoint requests.
    #[arg(long, default_value_t = 5.0)]
    retry_delay: f64,

    /// Use HTTPS for the local leg.
    #[arg(long)]
    local_https: bool,

    /// Skip certificate verification on the local HTTPS leg.
    #[arg(long)]
    allow_invalid_cert: bool,

    /// PEM file with the client certificate to present to the local server.
    #[arg(long, requires = "local_key")]
    local_cert: Option<PathBuf>,

    /// PEM file with the client key for the local HTTPS leg.
    #[arg(long, requires = "local_cert")]
    local_key: Option<PathBuf>,

    /// PEM file with extra CA certificates to trust on the local leg.
    #[arg(long)]
    local_ca: Option<PathBuf>,

    /// Enable verbose logging.
    ///
    /// Shows session phase transitions and per-connection details.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap exits with 2 on its own; the agent contract is exit 1.
            let _ = err.print();
            std::process::exit(1);
        }
    };

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let retry_delay = Duration::from_secs_f64(args.retry_delay.max(0.0));
    let endpoint = endpoint::acquire(
        &args.url,
        args.api_key.as_deref(),
        args.max_connections,
        args.retry,
        retry_delay,
    )
    .await
    .context("Failed to acquire a tunnel endpoint")?;

    if let Some(path) = &args.url_file {
        std::fs::write(path, format!("{}\n", endpoint.url))
            .with_context(|| format!("Failed to write URL file {}", path.display()))?;
    }

    let mut local = LocalConnectConfig::new(args.local_host.clone(), args.port)
        .with_https(args.local_https)
        .with_allow_invalid_cert(args.allow_invalid_cert);
    if let (Some(cert), Some(key)) = (args.local_cert.clone(), args.local_key.clone()) {
        local = local.with_client_cert(cert, key);
    }
    if let Some(ca) = args.local_ca.clone() {
        local = local.with_trust_ca(ca);
    }

    let remote_host = endpoint
        .remote_host(&args.url)
        .context("Endpoint record is unusable")?;
    let mut config = TunnelConfig::new(remote_host, endpoint.port, local);
    if let Some(key) = endpoint.secret_key.clone() {
        config = config.with_secret_key(key);
    }

    // Log the method/path of requests entering the tunnel.
    let (request_tx, request_rx) = flume::unbounded();
    config = config.with_request_observer(request_tx);
    tokio::spawn(async move {
        while let Ok(request) = request_rx.recv_async().await {
            info!(method = %request.method, path = %request.path, "request");
        }
    });

    let count = endpoint.max_conn_count.max(1).min(args.max_connections.max(1));
    info!(
        "Tunnel active! Requests to {} will be forwarded to {}:{} over {} connections",
        endpoint.url, args.local_host, args.port, count
    );

    let pool = TunnelPool::new(config, count);
    let runner = pool.clone();
    let mut run_handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        _ = &mut run_handle => {
            warn!("tunnel pool exited unexpectedly");
        }
        signal = shutdown_signal() => {
            info!(signal, "shutdown requested; granting {} s grace", SHUTDOWN_GRACE.as_secs());
            pool.shutdown();
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut run_handle).await.is_err() {
                warn!("grace period expired; exiting anyway");
            }
        }
    }

    Ok(())
}

/// Resolves with the name of the received shutdown signal.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
