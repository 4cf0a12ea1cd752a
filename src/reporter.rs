use chrono::Utc;

use crate::error::FeedError;
use crate::types::{DisplayRecord, ExitSummary, FeedEvent};

/// Emit a feed event as a single JSON line to stdout.
pub fn report_event(event: &FeedEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{json}");
    }
}

/// Emit the exit summary as pretty-printed JSON to stdout.
pub fn report_exit_summary(summary: &ExitSummary) {
    if let Ok(json) = serde_json::to_string_pretty(summary) {
        println!("{json}");
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

impl FeedEvent {
    pub fn new_record(record: &DisplayRecord) -> Self {
        FeedEvent::NewRecord {
            timestamp: timestamp(),
            record: record.clone(),
        }
    }

    pub fn update(record: &DisplayRecord) -> Self {
        FeedEvent::Update {
            timestamp: timestamp(),
            record: record.clone(),
        }
    }

    pub fn error(error: &FeedError) -> Self {
        FeedEvent::Error {
            timestamp: timestamp(),
            message: error.to_string(),
        }
    }
}
