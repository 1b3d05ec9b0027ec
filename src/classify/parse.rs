//! Lenient parsing of model output into validated verdicts.
//!
//! Malformed output is never an error here: anything unusable degrades to an
//! empty verdict list (with the failure context logged) and individual
//! invalid items are dropped rather than trusted.

use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{TriageVerdict, UrgencyLevel, VerdictTarget};

/// Fallback reason for items the model left blank.
const DEFAULT_REASON: &str = "Model triage";
/// Score assumed when the model omits or mangles the field.
const DEFAULT_SCORE: u8 = 50;

/// Parse response text into verdicts. Returns an empty vec (never errors)
/// when the payload is unusable.
pub fn parse_verdicts(text: &str) -> Vec<TriageVerdict> {
    let raw = text.trim();
    if raw.is_empty() {
        debug!("Empty classification response");
        return Vec::new();
    }

    let payload = match parse_payload(raw) {
        Some(payload) => payload,
        None => {
            warn!(
                preview = %raw.chars().take(240).collect::<String>(),
                "Classification response is not parseable JSON"
            );
            return Vec::new();
        }
    };

    let Some(items) = payload.get("items").and_then(Value::as_array) else {
        warn!("Classification response has no items array");
        return Vec::new();
    };

    items.iter().filter_map(validate_item).collect()
}

/// Whole-text JSON parse, falling back to the first-`{`-to-last-`}` slice.
fn parse_payload(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

/// Validate one candidate item, or drop it.
fn validate_item(item: &Value) -> Option<TriageVerdict> {
    let level_raw = item.get("level").and_then(Value::as_str).unwrap_or("");
    let Some(level) = UrgencyLevel::parse_lenient(level_raw) else {
        debug!(level = %level_raw, "Dropping verdict with unknown level");
        return None;
    };

    let identity = item
        .get("identity")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let index = item
        .get("i")
        .or_else(|| item.get("index"))
        .and_then(Value::as_u64)
        .map(|i| i as usize);

    if identity.is_empty() && index.is_none() {
        debug!("Dropping verdict with neither identity nor index");
        return None;
    }

    let score = match item.get("score") {
        Some(value) => value
            .as_f64()
            .map(|s| s.clamp(0.0, 100.0).round() as u8)
            .unwrap_or(DEFAULT_SCORE),
        None => DEFAULT_SCORE,
    };

    let reason = item
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REASON)
        .to_string();

    Some(TriageVerdict {
        target: VerdictTarget { identity, index },
        level,
        score,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_items() {
        let verdicts = parse_verdicts(
            r#"{"items":[{"identity":"f:1","level":"critical","score":95,"reason":"outage"}]}"#,
        );
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].target.identity, "f:1");
        assert_eq!(verdicts[0].level, UrgencyLevel::Critical);
        assert_eq!(verdicts[0].score, 95);
        assert_eq!(verdicts[0].reason, "outage");
    }

    #[test]
    fn recovers_json_embedded_in_prose() {
        let verdicts = parse_verdicts(
            "Here you go:\n{\"items\":[{\"identity\":\"f:2\",\"level\":\"fyi\"}]}\nHope that helps!",
        );
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].level, UrgencyLevel::Fyi);
    }

    #[test]
    fn unusable_payload_yields_zero_verdicts() {
        assert!(parse_verdicts("").is_empty());
        assert!(parse_verdicts("no json here").is_empty());
        assert!(parse_verdicts("{broken").is_empty());
        assert!(parse_verdicts(r#"{"answer":"yes"}"#).is_empty());
    }

    #[test]
    fn drops_items_with_unknown_levels() {
        let verdicts = parse_verdicts(
            r#"{"items":[
                {"identity":"f:1","level":"urgent","score":90},
                {"identity":"f:2","level":"HIGH","score":70}
            ]}"#,
        );
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].target.identity, "f:2");
        assert_eq!(verdicts[0].level, UrgencyLevel::High);
    }

    #[test]
    fn drops_items_with_no_identity_and_no_index() {
        let verdicts = parse_verdicts(
            r#"{"items":[
                {"level":"high","score":70},
                {"i":1,"level":"low"}
            ]}"#,
        );
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].target.index, Some(1));
        assert!(verdicts[0].target.identity.is_empty());
    }

    #[test]
    fn score_is_clamped_and_defaulted() {
        let verdicts = parse_verdicts(
            r#"{"items":[
                {"identity":"f:1","level":"high","score":500},
                {"identity":"f:2","level":"high","score":"abc"},
                {"identity":"f:3","level":"high"},
                {"identity":"f:4","level":"high","score":-20}
            ]}"#,
        );
        assert_eq!(verdicts[0].score, 100);
        assert_eq!(verdicts[1].score, 50);
        assert_eq!(verdicts[2].score, 50);
        assert_eq!(verdicts[3].score, 0);
    }

    #[test]
    fn blank_reason_gets_placeholder() {
        let verdicts = parse_verdicts(
            r#"{"items":[{"identity":"f:1","level":"low","reason":"   "}]}"#,
        );
        assert_eq!(verdicts[0].reason, "Model triage");
    }

    #[test]
    fn accepts_index_under_either_key() {
        let verdicts = parse_verdicts(
            r#"{"items":[{"i":0,"level":"low"},{"index":3,"level":"high"}]}"#,
        );
        assert_eq!(verdicts[0].target.index, Some(0));
        assert_eq!(verdicts[1].target.index, Some(3));
    }
}
