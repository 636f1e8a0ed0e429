//! Tolerant parsing of LLM responses into decision objects.
//!
//! Parse path: strict JSON first, then brace-balanced substring extraction
//! (respecting quoted strings and escapes), then the NO_CHANGE fallback.
//! The raw response is always preserved in the thought spool regardless.

use serde_json::Value;

/// Extract the first top-level JSON object from free-form text. Returns
/// None for malformed input; never panics.
pub fn extract_json(response: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(response) {
        if value.is_object() {
            return Some(value);
        }
    }

    let bytes = response.as_bytes();
    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for i in start..bytes.len() {
        let c = bytes[i] as char;
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&response[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    NoChange,
    CreateCandidate,
    CancelCandidate,
    PromoteCandidate,
    MarketAnalysisUpdate,
    TradeAnalysisUpdate,
    /// Anything unrecognized; treated as NO_CHANGE downstream but logged
    /// with the original string.
    Unknown,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::NoChange => "NO_CHANGE",
            DecisionKind::CreateCandidate => "CREATE_CANDIDATE",
            DecisionKind::CancelCandidate => "CANCEL_CANDIDATE",
            DecisionKind::PromoteCandidate => "PROMOTE_CANDIDATE",
            DecisionKind::MarketAnalysisUpdate => "MARKET_ANALYSIS_UPDATE",
            DecisionKind::TradeAnalysisUpdate => "TRADE_ANALYSIS_UPDATE",
            DecisionKind::Unknown => "UNKNOWN",
        }
    }
}

/// How fund positions are handled on promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionHandling {
    Keep,
    CloseAll,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub kind: DecisionKind,
    pub raw_kind: String,
    pub reasoning: String,
    pub specific_changes: String,
    pub slot: Option<u32>,
    pub replace_slot: Option<u32>,
    pub evaluation_duration_days: Option<i64>,
    pub position_handling: PositionHandling,
    pub cross_reference_findings: String,
    pub market_observations: String,
    /// The parsed JSON, kept for the audit log.
    pub parsed: Value,
}

impl Decision {
    pub fn no_change(reasoning: &str) -> Self {
        Self {
            kind: DecisionKind::NoChange,
            raw_kind: "NO_CHANGE".to_string(),
            reasoning: reasoning.to_string(),
            specific_changes: String::new(),
            slot: None,
            replace_slot: None,
            evaluation_duration_days: None,
            position_handling: PositionHandling::Keep,
            cross_reference_findings: String::new(),
            market_observations: String::new(),
            parsed: serde_json::json!({"decision": "NO_CHANGE", "reasoning": reasoning}),
        }
    }

    /// Lenient conversion: missing or oddly-typed fields degrade to
    /// defaults rather than failing the cycle.
    pub fn from_value(value: Value) -> Self {
        let raw_kind = value
            .get("decision")
            .and_then(Value::as_str)
            .unwrap_or("NO_CHANGE")
            .trim()
            .to_uppercase();
        let kind = match raw_kind.as_str() {
            "NO_CHANGE" => DecisionKind::NoChange,
            "CREATE_CANDIDATE" => DecisionKind::CreateCandidate,
            "CANCEL_CANDIDATE" => DecisionKind::CancelCandidate,
            "PROMOTE_CANDIDATE" => DecisionKind::PromoteCandidate,
            "MARKET_ANALYSIS_UPDATE" => DecisionKind::MarketAnalysisUpdate,
            "TRADE_ANALYSIS_UPDATE" => DecisionKind::TradeAnalysisUpdate,
            _ => DecisionKind::Unknown,
        };

        let text = |key: &str| -> String {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        let position_handling = match value
            .get("position_handling")
            .and_then(Value::as_str)
            .unwrap_or("keep")
        {
            "close_all" => PositionHandling::CloseAll,
            _ => PositionHandling::Keep,
        };

        Self {
            kind,
            raw_kind,
            reasoning: text("reasoning"),
            specific_changes: text("specific_changes"),
            slot: lenient_u32(value.get("slot")),
            replace_slot: lenient_u32(value.get("replace_slot")),
            evaluation_duration_days: value
                .get("evaluation_duration_days")
                .and_then(lenient_i64),
            position_handling,
            cross_reference_findings: text("cross_reference_findings"),
            market_observations: text("market_observations"),
            parsed: value,
        }
    }
}

/// Models love returning numbers as strings; accept both.
fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_u32(value: Option<&Value>) -> Option<u32> {
    value.and_then(lenient_i64).and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_json_parses() {
        let parsed = extract_json(r#"{"decision": "NO_CHANGE"}"#).unwrap();
        assert_eq!(parsed["decision"], json!("NO_CHANGE"));
    }

    #[test]
    fn json_wrapped_in_prose_is_extracted() {
        let text = "Here is my decision:\n{\"decision\": \"CREATE_CANDIDATE\", \"slot\": 2}\nThanks!";
        let parsed = extract_json(text).unwrap();
        assert_eq!(parsed["slot"], json!(2));
    }

    #[test]
    fn nested_braces_and_strings_are_respected() {
        let text = r#"noise {"a": {"b": "contains } brace"}, "c": "esc \" quote {"} trailing"#;
        let parsed = extract_json(text).unwrap();
        assert_eq!(parsed["a"]["b"], json!("contains } brace"));
    }

    #[test]
    fn malformed_input_returns_none_without_panicking() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{unbalanced").is_none());
        assert!(extract_json("").is_none());
    }

    #[test]
    fn decision_parses_leniently() {
        let decision = Decision::from_value(json!({
            "decision": " promote_candidate ",
            "slot": "2",
            "position_handling": "close_all",
            "reasoning": "it won",
        }));
        assert_eq!(decision.kind, DecisionKind::PromoteCandidate);
        assert_eq!(decision.slot, Some(2));
        assert_eq!(decision.position_handling, PositionHandling::CloseAll);
    }

    #[test]
    fn unknown_decisions_are_flagged_not_fatal() {
        let decision = Decision::from_value(json!({"decision": "YOLO"}));
        assert_eq!(decision.kind, DecisionKind::Unknown);
        assert_eq!(decision.raw_kind, "YOLO");
    }

    #[test]
    fn missing_fields_default() {
        let decision = Decision::from_value(json!({}));
        assert_eq!(decision.kind, DecisionKind::NoChange);
        assert!(decision.slot.is_none());
        assert_eq!(decision.position_handling, PositionHandling::Keep);
    }
}
