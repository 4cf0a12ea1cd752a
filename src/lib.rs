pub mod api;
pub mod auth;
pub mod classifier;
pub mod client;
pub mod config;
pub mod error;
pub mod normalizer;
pub mod reporter;
pub mod store;
pub mod subscribers;
pub mod types;

/// Default whale-signal WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://signals.whalefeed.io/ws";

/// Default ledger JSON-RPC endpoint used for payment gating.
pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";

/// Environment variable consulted for the feed bearer token.
pub const TOKEN_ENV_VAR: &str = "WHALE_FEED_TOKEN";

/// Record bound used by the compact dashboard layout.
pub const COMPACT_MAX_RECORDS: usize = 8;

/// Record bound used by the full dashboard layout (default).
pub const DEFAULT_MAX_RECORDS: usize = 16;
