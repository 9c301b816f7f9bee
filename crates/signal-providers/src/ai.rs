use std::fmt::Write as _;
use std::sync::Arc;

use agent_ports::{PortResult, TextCompletionProvider};
use analysis_core::{Side, SignalAction, SignalSource, TradingSignal, MIN_LEVERAGE};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::extract::{extract_signal_payload, AiSignalPayload};
use crate::{MarketContext, SignalError, SignalProvider, TechnicalProvider};

pub const DEFAULT_TEMPERATURE: f64 = 0.3;
pub const DEFAULT_MAX_TOKENS: u32 = 800;

/// Default stop distance when the model omits one, percent of entry
const DEFAULT_STOP_PCT: f64 = 2.0;

/// Asks a text-completion model for a decision and fails closed to the
/// rule-based strategy whenever the answer cannot be used.
pub struct AiTextProvider {
    llm: Arc<dyn TextCompletionProvider>,
    fallback: TechnicalProvider,
    temperature: f64,
    max_tokens: u32,
}

impl AiTextProvider {
    pub fn new(llm: Arc<dyn TextCompletionProvider>) -> Self {
        Self {
            llm,
            fallback: TechnicalProvider::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_sampling(mut self, temperature: f64, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_fallback(mut self, fallback: TechnicalProvider) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn build_prompt(ctx: &MarketContext) -> String {
        let ind = &ctx.indicators;
        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "You are a disciplined crypto futures trader. Decide the next action for {}.",
            ctx.symbol
        );
        let _ = writeln!(prompt, "\nMarket:");
        let _ = writeln!(prompt, "- price: {:.6}", ind.price);
        let _ = writeln!(prompt, "- regime: {}", ctx.regime);
        let _ = writeln!(prompt, "- RSI(14): {:.2}", ind.rsi);
        let _ = writeln!(
            prompt,
            "- MACD: {:.6} signal {:.6} histogram {:.6}",
            ind.macd.value, ind.macd.signal, ind.macd.histogram
        );
        let _ = writeln!(
            prompt,
            "- Bollinger(20,2): upper {:.6} middle {:.6} lower {:.6} width {:.4}",
            ind.bollinger.upper, ind.bollinger.middle, ind.bollinger.lower, ind.bollinger.width
        );
        let _ = writeln!(
            prompt,
            "- EMA 9/21/50/200: {:.6} / {:.6} / {:.6} / {:.6}",
            ind.ema.ema9, ind.ema.ema21, ind.ema.ema50, ind.ema.ema200
        );
        let _ = writeln!(
            prompt,
            "- volume ratio {:.2}, momentum {:+.2}%, volatility {:.2}%",
            ind.volume_ratio, ind.momentum, ind.volatility_pct
        );
        let _ = writeln!(prompt, "\nAccount balance: ${:.2}", ctx.balance);
        match &ctx.position {
            Some(p) => {
                let _ = writeln!(
                    prompt,
                    "Open position: {} from {:.6} ({:+.2}%), opened {}",
                    p.side,
                    p.entry_price,
                    p.unrealized_pnl_pct(ind.price),
                    p.opened_at.to_rfc3339()
                );
            }
            None => {
                let _ = writeln!(prompt, "Open position: none");
            }
        }
        prompt.push_str(
            "\nRespond with a single JSON object and nothing else:\n\
             {\"action\": \"long|short|close|hold\", \"confidence\": 0.0-1.0, \
             \"entry_price\": number, \"stop_loss\": number, \"take_profit\": [number, number, number], \
             \"leverage\": 1-12, \"reasoning\": \"short explanation\"}\n",
        );
        prompt
    }

    async fn complete_with_retry(&self, prompt: &str) -> PortResult<String> {
        match self.llm.complete(prompt, self.temperature, self.max_tokens).await {
            Err(e) if e.is_unavailable() => {
                warn!("{} unavailable ({}), retrying once", self.llm.name(), e);
                self.llm.complete(prompt, self.temperature, self.max_tokens).await
            }
            other => other,
        }
    }

    fn fall_back(&self, ctx: &MarketContext, why: &str) -> TradingSignal {
        warn!("{}: AI signal unusable ({}), using technical fallback", ctx.symbol, why);
        let mut signal = self.fallback.evaluate(ctx);
        signal.reasoning = format!("AI fallback ({}): {}", why, signal.reasoning);
        signal
    }

    /// Turn a validated payload into a full signal for `ctx`.
    pub fn to_signal(ctx: &MarketContext, payload: &AiSignalPayload) -> Result<TradingSignal, SignalError> {
        let action = payload.check().map_err(SignalError::InvalidSignal)?;
        let price = ctx.price();
        let reasoning = payload
            .reasoning
            .clone()
            .unwrap_or_else(|| "no reasoning given".to_string());

        let side = match action {
            SignalAction::Hold => {
                let mut s = TradingSignal::hold(&ctx.symbol, price, SignalSource::AiText, reasoning);
                s.confidence = payload.confidence;
                return Ok(s.with_context(ctx.regime, ctx.indicators));
            }
            SignalAction::Close => {
                return Ok(TradingSignal::close(
                    &ctx.symbol,
                    price,
                    payload.confidence,
                    SignalSource::AiText,
                    reasoning,
                )
                .with_context(ctx.regime, ctx.indicators))
            }
            SignalAction::Long => Side::Long,
            SignalAction::Short => Side::Short,
        };

        let sign = side.sign();
        let entry = payload.entry_price.filter(|p| *p > 0.0).unwrap_or(price);
        let stop_loss = payload
            .stop_loss
            .filter(|s| *s > 0.0)
            .unwrap_or(entry * (1.0 - sign * DEFAULT_STOP_PCT / 100.0));
        let risk = (entry - stop_loss) * sign;
        if risk <= 0.0 {
            return Err(SignalError::InvalidSignal(format!(
                "stop {stop_loss} on the wrong side of {side} entry {entry}"
            )));
        }

        let take_profit_levels = match &payload.take_profit {
            Some(tp) if !tp.levels().is_empty() => tp.levels(),
            _ => [2.0, 3.0, 4.0].iter().map(|m| entry + sign * m * risk).collect(),
        };
        if take_profit_levels.iter().any(|tp| (tp - entry) * sign <= 0.0) {
            return Err(SignalError::InvalidSignal(format!(
                "take profit {take_profit_levels:?} not beyond {side} entry {entry}"
            )));
        }

        let mut signal = TradingSignal {
            symbol: ctx.symbol.clone(),
            action,
            confidence: payload.confidence,
            entry_price: entry,
            stop_loss,
            take_profit_levels,
            position_size_usd: payload.position_size_usd.unwrap_or(0.0),
            leverage: payload.leverage.unwrap_or(MIN_LEVERAGE),
            risk_reward_ratio: 0.0,
            reasoning,
            regime: Some(ctx.regime),
            indicators: Some(ctx.indicators),
            source: SignalSource::AiText,
        };
        if let Some(target) = signal.primary_target() {
            signal.risk_reward_ratio = (target - entry).abs() / risk;
        }
        signal.validate()?;
        Ok(signal)
    }
}

#[async_trait]
impl SignalProvider for AiTextProvider {
    fn name(&self) -> &str {
        "ai_text"
    }

    fn source(&self) -> SignalSource {
        SignalSource::AiText
    }

    async fn analyze(&self, ctx: &MarketContext) -> Result<TradingSignal, SignalError> {
        let prompt = Self::build_prompt(ctx);

        let raw = match self.complete_with_retry(&prompt).await {
            Ok(raw) => raw,
            Err(e) => return Ok(self.fall_back(ctx, &format!("provider unavailable: {e}"))),
        };

        let (payload, strategy) = match extract_signal_payload(&raw) {
            Ok(found) => found,
            Err(e) => return Ok(self.fall_back(ctx, &e.to_string())),
        };

        match Self::to_signal(ctx, &payload) {
            Ok(signal) => {
                info!(
                    symbol = %ctx.symbol,
                    action = %signal.action,
                    confidence = signal.confidence,
                    strategy = ?strategy,
                    "AI signal extracted"
                );
                Ok(signal)
            }
            Err(e) => Ok(self.fall_back(ctx, &e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use agent_ports::memory::ScriptedCompletion;
    use agent_ports::PortError;
    use analysis_core::RegimeKind;

    fn provider(responses: Vec<PortResult<String>>) -> (AiTextProvider, Arc<ScriptedCompletion>) {
        let llm = Arc::new(ScriptedCompletion::new(responses));
        (AiTextProvider::new(llm.clone()), llm)
    }

    fn ctx() -> MarketContext {
        context(indicators(100.0), regime(RegimeKind::Ranging, 0.5), 100.0, None)
    }

    #[tokio::test]
    async fn fenced_payload_is_used_directly() {
        let raw = "```json\n{\"action\": \"long\", \"confidence\": 0.8, \"entry_price\": 100.0, \
                   \"stop_loss\": 98.0, \"take_profit\": [103.0, 105.0, 107.0], \"leverage\": 5}\n```";
        let (ai, _) = provider(vec![Ok(raw.to_string())]);

        let signal = ai.analyze(&ctx()).await.unwrap();
        assert_eq!(signal.source, SignalSource::AiText);
        assert_eq!(signal.action, SignalAction::Long);
        assert_eq!(signal.confidence, 0.8);
        assert_eq!(signal.stop_loss, 98.0);
        assert_eq!(signal.take_profit_levels, vec![103.0, 105.0, 107.0]);
        assert!((signal.risk_reward_ratio - 2.5).abs() < 1e-9);
        assert_eq!(signal.leverage, 5.0);
    }

    #[tokio::test]
    async fn prose_only_falls_back_to_technical() {
        let (ai, _) = provider(vec![Ok("The market is uncertain, I'd wait.".to_string())]);

        let signal = ai.analyze(&ctx()).await.unwrap();
        assert_eq!(signal.source, SignalSource::Technical);
        assert!(signal.reasoning.starts_with("AI fallback"));
        assert!(signal.validate().is_ok());
    }

    #[tokio::test]
    async fn retries_once_when_unavailable() {
        let (ai, llm) = provider(vec![
            Err(PortError::Unavailable("timeout".into())),
            Ok(r#"{"action": "hold", "confidence": 0.4}"#.to_string()),
        ]);

        let signal = ai.analyze(&ctx()).await.unwrap();
        assert_eq!(signal.source, SignalSource::AiText);
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(llm.prompts().await.len(), 2);
    }

    #[tokio::test]
    async fn second_outage_falls_back() {
        let (ai, llm) = provider(vec![
            Err(PortError::Unavailable("timeout".into())),
            Err(PortError::Unavailable("timeout".into())),
        ]);
        let signal = ai.analyze(&ctx()).await.unwrap();
        assert_eq!(signal.source, SignalSource::Technical);
        assert_eq!(llm.prompts().await.len(), 2);
    }

    #[tokio::test]
    async fn stop_on_wrong_side_falls_back() {
        let raw = r#"{"action": "long", "confidence": 0.9, "stop_loss": 105.0}"#;
        let (ai, _) = provider(vec![Ok(raw.to_string())]);
        let signal = ai.analyze(&ctx()).await.unwrap();
        assert_eq!(signal.source, SignalSource::Technical);
    }

    #[test]
    fn default_levels_derived_from_stop() {
        let payload = AiSignalPayload {
            action: "short".into(),
            confidence: 0.6,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            leverage: None,
            position_size_usd: None,
            reasoning: None,
        };
        let signal = AiTextProvider::to_signal(&ctx(), &payload).unwrap();
        assert_eq!(signal.action, SignalAction::Short);
        assert!((signal.stop_loss - 102.0).abs() < 1e-9);
        assert!((signal.take_profit_levels[0] - 96.0).abs() < 1e-9);
        assert!((signal.risk_reward_ratio - 3.0).abs() < 1e-9);
    }

    #[test]
    fn prompt_mentions_position_and_schema() {
        let c = context(
            indicators(100.0),
            regime(RegimeKind::Ranging, 0.5),
            100.0,
            Some(position(analysis_core::Side::Short, 110.0)),
        );
        let prompt = AiTextProvider::build_prompt(&c);
        assert!(prompt.contains("Open position: short"));
        assert!(prompt.contains("\"action\""));
    }
}
