//! Pulls a structured signal out of free-form model output.
//!
//! Models wrap JSON in markdown fences, prepend prose, or answer with bare
//! JSON. Each [`ExtractionStrategy`] proposes a candidate substring; the first
//! candidate that parses and passes validation wins.

use analysis_core::SignalAction;
use serde::{Deserialize, Serialize};

use crate::SignalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionStrategy {
    /// Contents of a ```json (or bare ```) fenced block
    FencedBlock,
    /// First balanced `{...}` substring
    BraceMatched,
    /// The whole response, trimmed
    WholeResponse,
}

impl ExtractionStrategy {
    pub const PIPELINE: [ExtractionStrategy; 3] = [
        ExtractionStrategy::FencedBlock,
        ExtractionStrategy::BraceMatched,
        ExtractionStrategy::WholeResponse,
    ];

    fn candidate<'a>(&self, raw: &'a str) -> Option<&'a str> {
        match self {
            ExtractionStrategy::FencedBlock => fenced_block(raw),
            ExtractionStrategy::BraceMatched => first_balanced_object(raw),
            ExtractionStrategy::WholeResponse => Some(raw.trim()),
        }
    }
}

/// Take-profit may come back as a single number or a ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TakeProfit {
    Single(f64),
    Ladder(Vec<f64>),
}

impl TakeProfit {
    pub fn levels(&self) -> Vec<f64> {
        match self {
            TakeProfit::Single(v) => vec![*v],
            TakeProfit::Ladder(v) => v.clone(),
        }
    }
}

/// Schema the model is asked to answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiSignalPayload {
    pub action: String,
    pub confidence: f64,
    #[serde(default, alias = "entry")]
    pub entry_price: Option<f64>,
    #[serde(default, alias = "stop")]
    pub stop_loss: Option<f64>,
    #[serde(default, alias = "take_profit_levels", alias = "targets")]
    pub take_profit: Option<TakeProfit>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub position_size_usd: Option<f64>,
    #[serde(default, alias = "reason")]
    pub reasoning: Option<String>,
}

impl AiSignalPayload {
    pub fn signal_action(&self) -> Option<SignalAction> {
        SignalAction::parse(&self.action)
    }

    /// Schema-level checks. Out-of-range values are rejected, never clamped.
    pub fn check(&self) -> Result<SignalAction, String> {
        let action = self
            .signal_action()
            .ok_or_else(|| format!("unknown action '{}'", self.action))?;
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if let Some(leverage) = self.leverage {
            if !(1.0..=12.0).contains(&leverage) {
                return Err(format!("leverage {leverage} outside [1, 12]"));
            }
        }
        let prices = [self.entry_price, self.stop_loss, self.position_size_usd];
        if prices.iter().flatten().any(|v| !v.is_finite() || *v < 0.0) {
            return Err("negative or non-finite price field".to_string());
        }
        Ok(action)
    }
}

/// Run the extraction pipeline over `raw`.
pub fn extract_signal_payload(raw: &str) -> Result<(AiSignalPayload, ExtractionStrategy), SignalError> {
    let mut failures = Vec::new();

    for strategy in ExtractionStrategy::PIPELINE {
        let Some(candidate) = strategy.candidate(raw) else {
            failures.push(format!("{strategy:?}: no candidate"));
            continue;
        };
        match serde_json::from_str::<AiSignalPayload>(candidate) {
            Ok(payload) => match payload.check() {
                Ok(_) => return Ok((payload, strategy)),
                Err(e) => failures.push(format!("{strategy:?}: {e}")),
            },
            Err(e) => failures.push(format!("{strategy:?}: {e}")),
        }
    }

    Err(SignalError::Extraction(failures.join("; ")))
}

fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after_ticks = &raw[open + 3..];
    // Skip an info string such as `json` up to the end of the line
    let body_start = after_ticks.find('\n').map(|i| i + 1).unwrap_or(0);
    let info = after_ticks[..body_start].trim();
    if !info.is_empty() && !info.eq_ignore_ascii_case("json") {
        return None;
    }
    let body = &after_ticks[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn first_balanced_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in raw[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
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
                    return Some(&raw[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"action": "long", "confidence": 0.72, "entry_price": 100.0, "stop_loss": 97.5, "take_profit": [103.0, 105.0, 108.0], "leverage": 4, "reasoning": "breakout {confirmed}"}"#;

    #[test]
    fn fenced_json_block() {
        let raw = format!("```json\n{PAYLOAD}\n```");
        let (payload, strategy) = extract_signal_payload(&raw).unwrap();
        assert_eq!(strategy, ExtractionStrategy::FencedBlock);
        assert_eq!(payload.signal_action(), Some(SignalAction::Long));
        assert_eq!(payload.confidence, 0.72);
        assert_eq!(payload.take_profit.unwrap().levels(), vec![103.0, 105.0, 108.0]);
    }

    #[test]
    fn prose_around_object_uses_brace_matching() {
        let raw = format!("Sure! Here is my analysis:\n{PAYLOAD}\nLet me know if you need more.");
        let (payload, strategy) = extract_signal_payload(&raw).unwrap();
        assert_eq!(strategy, ExtractionStrategy::BraceMatched);
        assert_eq!(payload.reasoning.as_deref(), Some("breakout {confirmed}"));
    }

    #[test]
    fn bare_json_is_found_by_brace_matching_first() {
        let (_, strategy) = extract_signal_payload(PAYLOAD).unwrap();
        assert_eq!(strategy, ExtractionStrategy::BraceMatched);
    }

    #[test]
    fn invalid_fenced_block_falls_through() {
        let raw = format!(
            "```json\n{{\"action\": \"moon\", \"confidence\": 0.9}}\n```\nActually: {PAYLOAD}"
        );
        // the fenced block and the first balanced object are both the bad one
        let err = extract_signal_payload(&raw).unwrap_err();
        assert!(matches!(err, SignalError::Extraction(_)));
    }

    #[test]
    fn aliases_and_single_target() {
        let raw = r#"{"action": "SELL", "confidence": 0.5, "stop": 110, "targets": 90, "reason": "weak"}"#;
        let (payload, _) = extract_signal_payload(raw).unwrap();
        assert_eq!(payload.signal_action(), Some(SignalAction::Short));
        assert_eq!(payload.stop_loss, Some(110.0));
        assert_eq!(payload.take_profit.unwrap().levels(), vec![90.0]);
    }

    #[test]
    fn out_of_range_confidence_rejected() {
        let raw = r#"{"action": "long", "confidence": 85}"#;
        assert!(extract_signal_payload(raw).is_err());
    }

    #[test]
    fn prose_only_fails() {
        let err = extract_signal_payload("I think the market looks bullish today.").unwrap_err();
        match err {
            SignalError::Extraction(msg) => {
                assert!(msg.contains("FencedBlock"));
                assert!(msg.contains("WholeResponse"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unbalanced_braces_have_no_candidate() {
        assert_eq!(first_balanced_object("{\"a\": {"), None);
        assert_eq!(first_balanced_object("x {\"a\": \"}\"} y"), Some("{\"a\": \"}\"}"));
    }
}
