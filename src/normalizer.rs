use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Map, Value};

use crate::classifier::routable_id;
use crate::error::FeedError;
use crate::types::{
    DEFAULT_NAME, DEFAULT_SYMBOL, DisplayRecord, MAX_EXTRA_FIELDS, MAX_TOP_TRADES, NOT_AVAILABLE,
    RecordPatch, SocialLinks, TopTrade,
};

/// Top-level keys with a typed home; everything else may land in the extension bag.
const KNOWN_KEYS: &[&str] = &[
    "token",
    "type",
    "message",
    "name",
    "symbol",
    "logo",
    "image",
    "tokenCreatedAt",
    "market",
    "holdings",
    "socials",
    "telegram",
    "twitter",
    "website",
    "trades",
];

// ── Numeric parsing ────────────────────────────────────────────────

/// Parse a JSON number or numeric string, rejecting NaN and infinities.
pub fn parse_f64_lossy(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub fn parse_i64_lossy(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
        .or_else(|| value.as_str().and_then(|text| text.trim().parse::<i64>().ok()))
}

fn non_empty_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(_) => non_empty_text(Some(value)),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

// ── Formatting ─────────────────────────────────────────────────────

/// Format a holder percentage.
///
/// Tiny non-zero values render as `~0%` instead of a misleading `0.00%`; values
/// under 0.01 keep four decimals so they stay distinguishable.
pub fn format_percentage(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude == 0.0 {
        "0.00%".to_string()
    } else if magnitude < 0.0001 {
        "~0%".to_string()
    } else if magnitude < 0.01 {
        format!("{value:.4}%")
    } else {
        format!("{value:.2}%")
    }
}

/// Market cap as `price × supply`, formatted like `$1,234.56`.
pub fn format_market_cap(price: f64, supply: f64) -> Option<String> {
    let price = Decimal::from_f64(price)?;
    let supply = Decimal::from_f64(supply)?;
    price.checked_mul(supply).map(format_usd)
}

fn format_usd(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let text = format!("{:.2}", rounded.abs());
    let (whole, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (idx, digit) in whole.chars().enumerate() {
        if idx > 0 && (whole.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() {
        "-"
    } else {
        ""
    };
    format!("{sign}${grouped}.{cents}")
}

/// Human-readable age of a token created at `created_at_epoch`.
pub fn format_age(created_at_epoch: i64, now_epoch: i64) -> String {
    if created_at_epoch <= 0 {
        return NOT_AVAILABLE.to_string();
    }
    let elapsed = now_epoch - created_at_epoch;
    if elapsed < 0 {
        return "just now".to_string();
    }

    let days = elapsed / 86_400;
    let hours = (elapsed % 86_400) / 3_600;
    let minutes = (elapsed % 3_600) / 60;
    let seconds = elapsed % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{seconds}s")
    }
}

/// Sort trades by SOL amount (largest first) and keep the top five.
///
/// Trades whose amount does not parse sort after every parsed one.
pub fn rank_trades(trades: &[Value]) -> Vec<TopTrade> {
    let mut ranked: Vec<(Option<f64>, TopTrade)> = trades
        .iter()
        .filter_map(Value::as_object)
        .map(|trade| {
            let raw = trade.get("amtSol");
            let amount = raw.and_then(parse_f64_lossy);
            let amount_text = match raw {
                Some(Value::Number(number)) => number.to_string(),
                Some(value) => non_empty_text(Some(value)).unwrap_or_else(|| "?".to_string()),
                None => "?".to_string(),
            };
            let actor =
                non_empty_text(trade.get("signer")).unwrap_or_else(|| DEFAULT_NAME.to_string());
            (
                amount,
                TopTrade {
                    actor,
                    amount: format!("{amount_text} SOL"),
                },
            )
        })
        .collect();

    ranked.sort_by(|a, b| match (a.0, b.0) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    ranked
        .into_iter()
        .take(MAX_TOP_TRADES)
        .map(|(_, trade)| trade)
        .collect()
}

// ── Frame → patch ──────────────────────────────────────────────────

fn sub_object<'a>(
    object: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, FeedError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(inner)) => Ok(Some(inner)),
        Some(other) => Err(FeedError::Normalization(format!(
            "`{key}` is not an object: {other}"
        ))),
    }
}

/// Decode every field a frame carries into a patch. Absent, empty and invalid
/// values stay `None` so they never overwrite stored data.
pub fn build_patch(frame: &Value) -> Result<RecordPatch, FeedError> {
    let object = frame
        .as_object()
        .ok_or_else(|| FeedError::Normalization("frame is not an object".to_string()))?;

    let mut patch = RecordPatch {
        name: non_empty_text(object.get("name")),
        symbol: non_empty_text(object.get("symbol")),
        image: non_empty_text(object.get("logo")).or_else(|| non_empty_text(object.get("image"))),
        created_at_epoch: object
            .get("tokenCreatedAt")
            .and_then(parse_i64_lossy)
            .filter(|epoch| *epoch > 0),
        ..RecordPatch::default()
    };

    if let Some(market) = sub_object(object, "market")? {
        patch.price = market.get("price").and_then(parse_f64_lossy);
        patch.circulating_supply = market.get("circulatingSupply").and_then(parse_f64_lossy);
    }

    if let Some(holdings) = sub_object(object, "holdings")? {
        patch.holdings.top10 = holdings.get("top10").and_then(parse_f64_lossy);
        patch.holdings.dev_holds = holdings.get("devHolds").and_then(parse_f64_lossy);
        patch.holdings.insiders = holdings.get("insidersHolds").and_then(parse_f64_lossy);
        patch.holdings.first70 = holdings.get("first70").and_then(parse_f64_lossy);
    }

    // Flat links win over the nested `socials` object.
    let nested = sub_object(object, "socials")?;
    let nested_link = |key: &str| nested.and_then(|socials| non_empty_text(socials.get(key)));
    patch.socials = SocialLinks {
        telegram: non_empty_text(object.get("telegram")).or_else(|| nested_link("tg")),
        twitter: non_empty_text(object.get("twitter")).or_else(|| nested_link("x")),
        website: non_empty_text(object.get("website")).or_else(|| nested_link("web")),
    };

    match object.get("trades") {
        None | Some(Value::Null) => {}
        Some(Value::Array(trades)) => {
            let ranked = rank_trades(trades);
            if !ranked.is_empty() {
                patch.top_trades = Some(ranked);
            }
        }
        Some(other) => {
            return Err(FeedError::Normalization(format!(
                "`trades` is not an array: {other}"
            )));
        }
    }

    for (key, value) in object {
        if KNOWN_KEYS.contains(&key.as_str()) {
            continue;
        }
        if patch.extra.len() >= MAX_EXTRA_FIELDS {
            break;
        }
        if let Some(text) = scalar_text(value) {
            patch.extra.insert(key.clone(), text);
        }
    }

    Ok(patch)
}

// ── Merging ────────────────────────────────────────────────────────

fn merge_text(slot: &mut Option<String>, incoming: &Option<String>) {
    if let Some(value) = incoming {
        *slot = Some(value.clone());
    }
}

fn set_created_at(record: &mut DisplayRecord, created_at_epoch: i64, now: DateTime<Utc>) {
    if created_at_epoch > 0 && created_at_epoch != record.created_at_epoch {
        record.created_at_epoch = created_at_epoch;
        record.token_age = format_age(created_at_epoch, now.timestamp());
    }
}

fn recompute_market_cap(record: &mut DisplayRecord) {
    if let (Some(price), Some(supply)) = (record.price, record.circulating_supply) {
        if let Some(cap) = format_market_cap(price, supply) {
            record.market_cap = cap;
        }
    }
}

fn merge_extra<'a>(
    record: &mut DisplayRecord,
    incoming: impl IntoIterator<Item = (&'a String, &'a String)>,
) {
    for (key, value) in incoming {
        if record.extra.contains_key(key) || record.extra.len() < MAX_EXTRA_FIELDS {
            record.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Apply a patch in place. Only present values are written, so a record never
/// regresses to a default.
pub fn apply_patch(record: &mut DisplayRecord, patch: &RecordPatch, now: DateTime<Utc>) {
    if let Some(name) = &patch.name {
        record.name = name.clone();
    }
    if let Some(symbol) = &patch.symbol {
        record.symbol = symbol.clone();
    }
    if let Some(image) = &patch.image {
        record.image = image.clone();
    }
    if let Some(created_at_epoch) = patch.created_at_epoch {
        set_created_at(record, created_at_epoch, now);
    }

    if let Some(price) = patch.price {
        record.price = Some(price);
    }
    if let Some(supply) = patch.circulating_supply {
        record.circulating_supply = Some(supply);
    }
    recompute_market_cap(record);

    let holdings = &patch.holdings;
    if let Some(value) = holdings.top10 {
        record.holdings.top10 = format_percentage(value);
    }
    if let Some(value) = holdings.dev_holds {
        record.holdings.dev_holds = format_percentage(value);
    }
    if let Some(value) = holdings.insiders {
        record.holdings.insiders = format_percentage(value);
    }
    if let Some(value) = holdings.first70 {
        record.holdings.first70 = format_percentage(value);
    }

    merge_text(&mut record.socials.telegram, &patch.socials.telegram);
    merge_text(&mut record.socials.twitter, &patch.socials.twitter);
    merge_text(&mut record.socials.website, &patch.socials.website);

    if let Some(trades) = &patch.top_trades {
        if !trades.is_empty() {
            record.top_trades = trades.clone();
        }
    }

    merge_extra(record, &patch.extra);
    record.last_updated_at = now;
}

/// Merge a fully normalized record into a stored one. Fields still at their
/// defaults in `incoming` are ignored.
pub fn merge_record(existing: &mut DisplayRecord, incoming: &DisplayRecord, now: DateTime<Utc>) {
    if !incoming.name.is_empty() && incoming.name != DEFAULT_NAME {
        existing.name = incoming.name.clone();
    }
    if !incoming.symbol.is_empty() && incoming.symbol != DEFAULT_SYMBOL {
        existing.symbol = incoming.symbol.clone();
    }
    if !incoming.image.is_empty() {
        existing.image = incoming.image.clone();
    }
    set_created_at(existing, incoming.created_at_epoch, now);

    if incoming.price.is_some() {
        existing.price = incoming.price;
    }
    if incoming.circulating_supply.is_some() {
        existing.circulating_supply = incoming.circulating_supply;
    }
    if incoming.market_cap != NOT_AVAILABLE {
        existing.market_cap = incoming.market_cap.clone();
    }
    recompute_market_cap(existing);

    let pairs = [
        (&mut existing.holdings.top10, &incoming.holdings.top10),
        (&mut existing.holdings.dev_holds, &incoming.holdings.dev_holds),
        (&mut existing.holdings.insiders, &incoming.holdings.insiders),
        (&mut existing.holdings.first70, &incoming.holdings.first70),
    ];
    for (slot, value) in pairs {
        if value.as_str() != NOT_AVAILABLE {
            *slot = value.clone();
        }
    }

    merge_text(&mut existing.socials.telegram, &incoming.socials.telegram);
    merge_text(&mut existing.socials.twitter, &incoming.socials.twitter);
    merge_text(&mut existing.socials.website, &incoming.socials.website);

    if !incoming.top_trades.is_empty() {
        existing.top_trades = incoming.top_trades.clone();
    }

    merge_extra(existing, &incoming.extra);
    existing.last_updated_at = now;
}

/// Build a record for an id the store has not seen, starting from defaults.
pub fn synthesize(id: &str, patch: &RecordPatch, now: DateTime<Utc>) -> DisplayRecord {
    let mut record = DisplayRecord::placeholder(id, now);
    apply_patch(&mut record, patch, now);
    record
}

/// Convert a new-signal frame into a complete record.
pub fn normalize_new(frame: &Value, now: DateTime<Utc>) -> Result<DisplayRecord, FeedError> {
    let id = routable_id(frame)
        .ok_or_else(|| FeedError::Normalization("frame has no routable token id".to_string()))?;
    let patch = build_patch(frame)?;
    Ok(synthesize(&id, &patch, now))
}
