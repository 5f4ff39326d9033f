//! poly-hooks - Webhook server
//!
//! Receives engagement callbacks from Meta, LinkedIn and Google Business,
//! verifies their signatures and reconciles them against published posts.

use anyhow::Context;
use clap::Parser;
use libpolycast::logging::{LogFormat, LoggingConfig};
use libpolycast::service::PolycastService;
use libpolycast::webhooks::{build_router, AppState, WebhookIngestor};
use libpolycast::{Config, Platform, PolycastError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "poly-hooks")]
#[command(version)]
#[command(about = "Webhook server for Polycast")]
#[command(long_about = "\
poly-hooks - Webhook server for Polycast

DESCRIPTION:
    poly-hooks accepts platform callbacks and applies the engagement
    changes they carry (reactions, comments, shares, metric snapshots,
    post removal) to the posts Polycast published.

    Every delivery must carry a valid HMAC-SHA256 signature made with the
    platform's webhook secret. Redeliveries are acknowledged without
    being applied twice.

ENDPOINTS:
    POST /webhooks/meta              X-Hub-Signature-256: sha256=<hex>
    POST /webhooks/linkedin          X-LI-Signature: hmacsha256=<hex>
    POST /webhooks/google_business   X-Goog-Signature: sha256=<hex>
    GET  /webhooks/meta              Meta subscription verification
    GET  /health

CONFIGURATION:
    [webhooks]
    bind = \"127.0.0.1:8787\"

    [platforms.meta]
    webhook_secret = \"...\"
    verify_token = \"...\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Address to listen on (overrides config)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log output format: text, json or pretty
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.log_format, cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("poly-hooks failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<PolycastError>()
            .map(PolycastError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let bind = cli.bind.unwrap_or_else(|| config.webhooks.bind.clone());
    let secrets = config.webhook_secrets();
    let verify_token = config.platform(Platform::Meta).verify_token.clone();

    for platform in Platform::ALL {
        if !secrets.contains_key(&platform) {
            warn!(
                platform = %platform,
                "No webhook secret configured, deliveries will be rejected"
            );
        }
    }

    let service = PolycastService::from_config(config).await?;
    let ingestor = WebhookIngestor::new(
        service.database().clone(),
        secrets,
        service.events().clone(),
    );
    let app = build_router(AppState::new(ingestor, verify_token));

    let listener = TcpListener::bind(bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound address")?;
    info!(addr = %local_addr, "poly-hooks listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("webhook server exited unexpectedly")?;

    info!("poly-hooks stopped");
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            if let Some(sig) = signals.next().await {
                info!(signal = sig, "Received shutdown signal, draining connections...");
            }
        }
        Err(e) => {
            warn!("Signal setup failed ({}), falling back to Ctrl-C", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C, draining connections...");
}
