use anyhow::{Context, Result, bail};
use chrono::Utc;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use tracing::debug;

use crate::TOKEN_ENV_VAR;
use crate::config::AuthConfig;

/// Supplies the bearer token used to open the feed.
pub trait TokenSource {
    fn get_token(&self) -> Option<String>;
}

/// Token taken from the environment first, then from `[auth].token`.
#[derive(Debug, Clone, Default)]
pub struct EnvTokenSource {
    fallback: Option<String>,
}

impl EnvTokenSource {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            fallback: config.token.clone(),
        }
    }
}

impl TokenSource for EnvTokenSource {
    fn get_token(&self) -> Option<String> {
        std::env::var(TOKEN_ENV_VAR)
            .ok()
            .or_else(|| self.fallback.clone())
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }
}

/// A token given directly, e.g. from the command line.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn get_token(&self) -> Option<String> {
        let token = self.0.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}

/// Proof of wallet ownership, sent to the signal service to obtain a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletProof {
    /// Hex-encoded compressed SEC1 public key.
    pub public_key: String,
    /// Hex-encoded signature over [`proof_message`].
    pub signature: String,
    pub timestamp: i64,
}

/// The message signed during [`WalletProvider::connect`].
pub fn proof_message(timestamp: i64) -> String {
    format!("whale-feed login {timestamp}")
}

pub trait WalletProvider {
    /// Unlock the wallet and sign a timestamped login message.
    fn connect(&mut self) -> Result<WalletProof>;
    /// Sign arbitrary bytes, returning a hex signature.
    fn sign_message(&self, message: &[u8]) -> Result<String>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
}

/// Wallet backed by a hex-encoded secp256k1 private key held in memory.
pub struct LocalKeyWallet {
    key: SigningKey,
    connected: bool,
}

impl LocalKeyWallet {
    /// Parse a hex private key, with or without `0x` prefix.
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let trimmed = private_key.trim();
        let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(hex_str).context("private key is not valid hex")?;
        if bytes.len() != 32 {
            bail!("private key must be 32 bytes, got {}", bytes.len());
        }
        let key = SigningKey::from_slice(&bytes).context("invalid secp256k1 private key")?;
        Ok(Self {
            key,
            connected: false,
        })
    }

    pub fn public_key(&self) -> String {
        hex::encode(self.key.verifying_key().to_sec1_bytes())
    }

    fn sign(&self, message: &[u8]) -> String {
        let signature: Signature = self.key.sign(message);
        hex::encode(signature.to_bytes())
    }
}

impl WalletProvider for LocalKeyWallet {
    fn connect(&mut self) -> Result<WalletProof> {
        let timestamp = Utc::now().timestamp();
        let signature = self.sign(proof_message(timestamp).as_bytes());
        self.connected = true;
        debug!(public_key = %self.public_key(), "wallet connected");
        Ok(WalletProof {
            public_key: self.public_key(),
            signature,
            timestamp,
        })
    }

    fn sign_message(&self, message: &[u8]) -> Result<String> {
        if !self.connected {
            bail!("wallet is not connected");
        }
        Ok(self.sign(message))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
