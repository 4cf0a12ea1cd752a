use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use whale_feed::api::LedgerClient;
use whale_feed::auth::{EnvTokenSource, StaticToken, TokenSource};
use whale_feed::client::FeedClient;
use whale_feed::config::{AppConfig, CONFIG_PATH};
use whale_feed::reporter;
use whale_feed::types::{ExitSummary, FeedEvent};
use whale_feed::{COMPACT_MAX_RECORDS, TOKEN_ENV_VAR};

#[derive(Parser)]
#[command(name = "whale-feed", about = "Stream normalized whale signals as JSON lines")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Feed bearer token (overrides the environment and config)
    #[arg(long)]
    token: Option<String>,

    /// WebSocket endpoint override
    #[arg(long)]
    ws_url: Option<String>,

    /// Maximum records kept in the store
    #[arg(long, conflicts_with = "compact")]
    max_records: Option<usize>,

    /// Use the compact record bound
    #[arg(long)]
    compact: bool,

    /// Base64-encoded, already-signed subscription payment to submit before connecting
    #[arg(long, conflicts_with = "await_payment")]
    payment_tx: Option<String>,

    /// Signature of a submitted subscription payment to wait for before connecting
    #[arg(long)]
    await_payment: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config, then apply CLI overrides
    let mut config = AppConfig::load_or_default(&args.config)?;
    if let Some(url) = args.ws_url {
        config.feed.ws_url = url;
    }
    if let Some(max_records) = args.max_records {
        config.feed.max_records = max_records;
    }
    if args.compact {
        config.feed.max_records = COMPACT_MAX_RECORDS;
    }
    config.feed.validate()?;

    let token = match args.token {
        Some(token) => StaticToken(token).get_token(),
        None => EnvTokenSource::new(&config.auth).get_token(),
    }
    .with_context(|| {
        format!("no feed token: pass --token, set {TOKEN_ENV_VAR}, or add [auth].token to the config")
    })?;

    // Gate on subscription payment when asked to
    let payment = match (args.payment_tx, args.await_payment) {
        (Some(encoded), _) => {
            let ledger = LedgerClient::new(&config.ledger.rpc_url)?;
            let signature = ledger
                .send_transaction(&encoded)
                .await
                .context("failed to submit subscription payment")?;
            Some((ledger, signature))
        }
        (None, Some(signature)) => Some((LedgerClient::new(&config.ledger.rpc_url)?, signature)),
        (None, None) => None,
    };
    if let Some((ledger, signature)) = payment {
        info!("Waiting for payment {signature} to confirm...");
        ledger
            .wait_for_confirmation(
                &signature,
                config.ledger.confirmation_timeout(),
                config.ledger.confirmation_poll(),
            )
            .await
            .context("subscription payment not confirmed")?;
    }

    info!(
        "Starting whale-feed: url={} max_records={}",
        config.feed.ws_url, config.feed.max_records
    );

    let client = FeedClient::new(config.feed.clone());
    client.on_new_record(|record| reporter::report_event(&FeedEvent::new_record(record)));
    client.on_update(|record| reporter::report_event(&FeedEvent::update(record)));
    client.on_error(|error| {
        if error.is_terminal() {
            warn!("Feed error, session will not reconnect: {error}");
        } else {
            warn!("Feed error: {error}");
        }
        reporter::report_event(&FeedEvent::error(error));
    });

    let mut state = client.subscribe_state();
    client.connect(&token);

    info!("Streaming. Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = state.wait_for(|s| !s.is_active()) => {
            warn!("Feed session ended");
        }
    }

    client.close(false).await;

    let stats = client.stats();
    let summary = ExitSummary {
        frames_received: stats.frames_received,
        new_records: stats.new_records,
        updates: stats.updates,
        errors: stats.errors,
        records: client.snapshot().to_vec(),
    };
    reporter::report_exit_summary(&summary);

    Ok(())
}
