use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display name used when a frame carries none.
pub const DEFAULT_NAME: &str = "Unknown";

/// Display symbol used when a frame carries none.
pub const DEFAULT_SYMBOL: &str = "???";

/// Placeholder for formatted values that are not known yet.
pub const NOT_AVAILABLE: &str = "N/A";

/// Maximum number of trades kept on a record.
pub const MAX_TOP_TRADES: usize = 5;

/// Maximum number of unknown scalar fields carried in the extension bag.
pub const MAX_EXTRA_FIELDS: usize = 16;

/// One of the largest recent buys on a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopTrade {
    /// Wallet that signed the trade.
    pub actor: String,
    /// Formatted amount, e.g. `"9 SOL"`.
    pub amount: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLinks {
    pub telegram: Option<String>,
    pub twitter: Option<String>,
    pub website: Option<String>,
}

impl SocialLinks {
    pub fn is_empty(&self) -> bool {
        self.telegram.is_none() && self.twitter.is_none() && self.website.is_none()
    }
}

/// Formatted holder-concentration metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingPercentages {
    pub top10: String,
    pub dev_holds: String,
    pub insiders: String,
    pub first70: String,
}

impl Default for HoldingPercentages {
    fn default() -> Self {
        Self {
            top10: NOT_AVAILABLE.to_string(),
            dev_holds: NOT_AVAILABLE.to_string(),
            insiders: NOT_AVAILABLE.to_string(),
            first70: NOT_AVAILABLE.to_string(),
        }
    }
}

/// A token card as shown to a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayRecord {
    /// Token identifier, unique within the store.
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub image: String,
    /// Creation time in epoch seconds; `0` when unknown.
    pub created_at_epoch: i64,
    /// Human-readable age derived from `created_at_epoch`.
    pub token_age: String,
    pub price: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub market_cap: String,
    pub holdings: HoldingPercentages,
    pub socials: SocialLinks,
    pub top_trades: Vec<TopTrade>,
    /// Unknown scalar fields forwarded by the server, bounded by [`MAX_EXTRA_FIELDS`].
    pub extra: BTreeMap<String, String>,
    #[serde(skip, default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    #[serde(skip, default = "Utc::now")]
    pub last_updated_at: DateTime<Utc>,
}

impl DisplayRecord {
    /// A record with every field at its default, as synthesized for an unseen id.
    pub fn placeholder(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            name: DEFAULT_NAME.to_string(),
            symbol: DEFAULT_SYMBOL.to_string(),
            image: String::new(),
            created_at_epoch: 0,
            token_age: NOT_AVAILABLE.to_string(),
            price: None,
            circulating_supply: None,
            market_cap: NOT_AVAILABLE.to_string(),
            holdings: HoldingPercentages::default(),
            socials: SocialLinks::default(),
            top_trades: Vec::new(),
            extra: BTreeMap::new(),
            received_at: now,
            last_updated_at: now,
        }
    }
}

/// Raw holder metrics carried by an update, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HoldingsPatch {
    pub top10: Option<f64>,
    pub dev_holds: Option<f64>,
    pub insiders: Option<f64>,
    pub first70: Option<f64>,
}

/// Partial record decoded from a frame. `None` means "leave the stored value alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub image: Option<String>,
    pub created_at_epoch: Option<i64>,
    pub price: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub holdings: HoldingsPatch,
    pub socials: SocialLinks,
    /// Replaces the stored trades when present.
    pub top_trades: Option<Vec<TopTrade>>,
    pub extra: BTreeMap<String, String>,
}

/// Lifecycle of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    /// Whether a session task is alive for this state.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// A single line of feed output, emitted by the reporter.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    NewRecord { timestamp: String, record: DisplayRecord },
    Update { timestamp: String, record: DisplayRecord },
    Error { timestamp: String, message: String },
}

/// Printed once at shutdown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitSummary {
    pub frames_received: u64,
    pub new_records: u64,
    pub updates: u64,
    pub errors: u64,
    pub records: Vec<DisplayRecord>,
}
