use serde_json::Value;

use crate::error::FeedError;

/// Ids that mark a frame as server chatter rather than a token.
const CONTROL_IDS: &[&str] = &["system", "ping", "pong", "info"];

const NEW_TAGS: &[&str] = &["new_signal", "new", "signal"];
const UPDATE_TAGS: &[&str] = &["update", "signal_update", "token_update"];
const ACK_TAGS: &[&str] = &["auth_success", "connected", "authenticated"];
const CONTROL_TAGS: &[&str] = &["ping", "pong", "system", "info"];

/// Routing decision for one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A full signal for a token.
    New { id: String },
    /// A partial update for a token.
    Update { id: String },
    /// Handshake acknowledgement from the server.
    ControlAck { message: Option<String> },
    /// Server-reported failure, forwarded to error subscribers.
    ServerError { message: String },
    /// Keep-alive or informational chatter.
    Control,
    /// Missing, empty or reserved token id.
    Dropped,
    /// Anything the pipeline has no route for.
    Unroutable,
}

/// Decode a text frame. Bare `ping`/`pong` strings are accepted as JSON strings.
pub fn parse_frame(text: &str) -> Result<Value, FeedError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("ping") || trimmed.eq_ignore_ascii_case("pong") {
        return Ok(Value::String(trimmed.to_ascii_lowercase()));
    }
    serde_json::from_str(trimmed).map_err(|e| FeedError::Protocol(format!("invalid JSON frame: {e}")))
}

/// Classify a decoded frame.
///
/// Explicit `type` tags take precedence over structural heuristics. When a frame
/// without a tag looks like both a new signal and an update, `has_record` decides:
/// an id already in the store makes it an update.
pub fn classify(frame: &Value, has_record: impl Fn(&str) -> bool) -> Classification {
    let object = match frame {
        Value::Object(object) => object,
        Value::String(text) if is_control_word(text) => return Classification::Control,
        _ => return Classification::Unroutable,
    };

    if let Some(tag) = object.get("type").and_then(Value::as_str) {
        let tag = tag.trim().to_ascii_lowercase();
        if ACK_TAGS.contains(&tag.as_str()) {
            return Classification::ControlAck {
                message: object.get("message").and_then(Value::as_str).map(str::to_string),
            };
        }
        if tag == "error" {
            return Classification::ServerError {
                message: error_message(frame),
            };
        }
        if CONTROL_TAGS.contains(&tag.as_str()) {
            return Classification::Control;
        }
        if NEW_TAGS.contains(&tag.as_str()) {
            return match routable_id(frame) {
                Some(id) => Classification::New { id },
                None => Classification::Dropped,
            };
        }
        if UPDATE_TAGS.contains(&tag.as_str()) {
            return match routable_id(frame) {
                Some(id) => Classification::Update { id },
                None => Classification::Dropped,
            };
        }
        // Unknown tags fall through to the heuristics.
    }

    let Some(id) = routable_id(frame) else {
        return Classification::Dropped;
    };

    let looks_new = object.contains_key("name") && object.contains_key("symbol");
    let looks_update = object.get("market").is_some_and(Value::is_object)
        || object.get("holdings").is_some_and(Value::is_object);

    match (looks_new, looks_update) {
        (true, true) if has_record(&id) => Classification::Update { id },
        (true, _) => Classification::New { id },
        (false, true) => Classification::Update { id },
        (false, false) => Classification::Unroutable,
    }
}

/// The frame's token id, unless missing, empty, non-string or reserved.
pub fn routable_id(frame: &Value) -> Option<String> {
    let id = frame.get("token")?.as_str()?.trim();
    if id.is_empty() || is_control_word(id) {
        return None;
    }
    Some(id.to_string())
}

fn is_control_word(text: &str) -> bool {
    let text = text.trim();
    CONTROL_IDS.iter().any(|word| text.eq_ignore_ascii_case(word))
}

fn error_message(frame: &Value) -> String {
    ["message", "error"]
        .iter()
        .filter_map(|key| frame.get(*key))
        .find_map(|value| match value {
            Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
            Value::Null | Value::String(_) => None,
            other => Some(other.to_string()),
        })
        .unwrap_or_else(|| "unknown server error".to_string())
}
