//! setup-account: first-time setup for the whale-feed client.
//!
//! Validates the wallet key by producing a signed login proof, optionally
//! checks the ledger balance of the paying account, and writes the key and
//! feed token into `config.toml` (created with defaults if missing).
//!
//! By default, reads secrets interactively (hidden input) to avoid leaking
//! them into shell history. Use the flags only for scripted/CI use.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use whale_feed::api::{LAMPORTS_PER_SOL, LedgerClient};
use whale_feed::auth::{LocalKeyWallet, WalletProvider};
use whale_feed::config::{AppConfig, CONFIG_PATH};

#[derive(Parser)]
#[command(
    name = "setup-account",
    about = "Validate wallet and token, then save them to config.toml"
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Hex-encoded wallet private key (with or without 0x prefix).
    /// If omitted, reads interactively with hidden input (recommended).
    #[arg(long)]
    private_key: Option<String>,

    /// Feed bearer token. If omitted, reads interactively; leave blank to skip.
    #[arg(long)]
    token: Option<String>,

    /// Ledger account that pays for the subscription; its balance is checked
    #[arg(long)]
    payer_address: Option<String>,
}

fn prompt_secret(prompt: &str) -> Result<String> {
    let value = rpassword::prompt_password(prompt).context("failed to read input")?;
    Ok(value.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_path();

    let mut app_config = AppConfig::load_or_default(config_path)?;

    println!("=== whale-feed Account Setup ===\n");

    // ── Step 1: Read private key ───────────────────────────────────
    let private_key = match cli.private_key {
        Some(key) => key.trim().to_string(),
        None => prompt_secret("Enter wallet private key (hex): ")?,
    };
    if private_key.is_empty() {
        bail!("private key cannot be empty");
    }

    // ── Step 2: Validate wallet ────────────────────────────────────
    println!("Validating wallet...");
    let mut wallet = LocalKeyWallet::from_hex(&private_key)
        .context("invalid private key (expected 32 hex-encoded bytes, with or without 0x prefix)")?;
    let proof = wallet.connect()?;
    println!("  Public key: {}", proof.public_key);
    println!("  Login proof signed at {}", proof.timestamp);
    wallet.disconnect();
    println!();

    // ── Step 3: Read feed token ────────────────────────────────────
    let token = match cli.token {
        Some(token) => token.trim().to_string(),
        None => prompt_secret("Enter feed token (blank to keep current): ")?,
    };

    // ── Step 4: Check payer balance ────────────────────────────────
    let mut balance_sol = None;
    if let Some(address) = &cli.payer_address {
        println!("Checking balance of {address}...");
        let ledger = LedgerClient::new(&app_config.ledger.rpc_url)?;
        let lamports = ledger
            .get_balance(address)
            .await
            .context("failed to fetch balance")?;
        let sol = lamports as f64 / LAMPORTS_PER_SOL as f64;
        println!("  Balance: {sol:.4} SOL");
        if lamports == 0 {
            println!("  WARNING: Balance is empty; the subscription payment will fail");
        }
        balance_sol = Some(sol);
        println!();
    }

    // ── Step 5: Update config ──────────────────────────────────────
    println!("Updating {}...", config_path.display());
    app_config.auth.private_key = Some(private_key);
    if !token.is_empty() {
        app_config.auth.token = Some(token);
    }
    app_config.save(config_path)?;
    println!("  Config updated successfully");
    println!();

    // ── Summary ────────────────────────────────────────────────────
    println!("=== Setup Complete ===");
    println!();
    println!("Wallet: {}", proof.public_key);
    if let Some(sol) = balance_sol {
        println!("Payer balance: {sol:.4} SOL");
    }
    println!(
        "Token:  {}",
        if app_config.auth.token.is_some() { "configured" } else { "missing" }
    );
    println!();
    println!("Next steps:");
    println!("  cargo run --bin whale-feed");

    Ok(())
}
