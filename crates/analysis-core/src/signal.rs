use serde::{Deserialize, Serialize};

use crate::{AnalysisError, MarketRegime, Side, TechnicalIndicators};

pub const MIN_LEVERAGE: f64 = 1.0;
pub const MAX_LEVERAGE: f64 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Long,
    Short,
    Close,
    Hold,
}

impl SignalAction {
    /// Parse the loose action vocabulary used by text-generated signals.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(SignalAction::Long),
            "short" | "sell" => Some(SignalAction::Short),
            "close" | "exit" => Some(SignalAction::Close),
            "hold" | "wait" => Some(SignalAction::Hold),
            _ => None,
        }
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            SignalAction::Long => Some(Side::Long),
            SignalAction::Short => Some(Side::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalAction::Long => "LONG",
            SignalAction::Short => "SHORT",
            SignalAction::Close => "CLOSE",
            SignalAction::Hold => "HOLD",
        };
        f.write_str(s)
    }
}

/// Which engine produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Technical,
    Expert,
    Ultra,
    AiText,
    Arbitrator,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalSource::Technical => "technical",
            SignalSource::Expert => "expert",
            SignalSource::Ultra => "ultra",
            SignalSource::AiText => "ai_text",
            SignalSource::Arbitrator => "arbitrator",
        };
        f.write_str(s)
    }
}

/// Unified trading recommendation. Produced fresh every cycle and superseded,
/// never mutated after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_levels: Vec<f64>,
    /// Collateral suggested by the provider; 0 means "let the sizer decide"
    pub position_size_usd: f64,
    pub leverage: f64,
    pub risk_reward_ratio: f64,
    pub reasoning: String,
    pub regime: Option<MarketRegime>,
    pub indicators: Option<TechnicalIndicators>,
    pub source: SignalSource,
}

impl TradingSignal {
    pub fn hold(
        symbol: impl Into<String>,
        price: f64,
        source: SignalSource,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            action: SignalAction::Hold,
            confidence: 0.0,
            entry_price: price,
            stop_loss: 0.0,
            take_profit_levels: Vec::new(),
            position_size_usd: 0.0,
            leverage: MIN_LEVERAGE,
            risk_reward_ratio: 0.0,
            reasoning: reasoning.into(),
            regime: None,
            indicators: None,
            source,
        }
    }

    pub fn close(
        symbol: impl Into<String>,
        price: f64,
        confidence: f64,
        source: SignalSource,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            action: SignalAction::Close,
            confidence,
            ..Self::hold(symbol, price, source, reasoning)
        }
    }

    pub fn with_context(mut self, regime: MarketRegime, indicators: TechnicalIndicators) -> Self {
        self.regime = Some(regime);
        self.indicators = Some(indicators);
        self
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.action, SignalAction::Long | SignalAction::Short)
    }

    /// Second take-profit rung, or the first if only one is set.
    pub fn primary_target(&self) -> Option<f64> {
        self.take_profit_levels
            .get(1)
            .or_else(|| self.take_profit_levels.first())
            .copied()
    }

    /// Check the invariants every signal must hold before it may reach
    /// arbitration.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(AnalysisError::InvalidSignal(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if !self.leverage.is_finite() || !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&self.leverage) {
            return Err(AnalysisError::InvalidSignal(format!(
                "leverage {} outside [{}, {}]",
                self.leverage, MIN_LEVERAGE, MAX_LEVERAGE
            )));
        }
        let numbers = [
            self.entry_price,
            self.stop_loss,
            self.position_size_usd,
            self.risk_reward_ratio,
        ];
        if numbers
            .iter()
            .chain(self.take_profit_levels.iter())
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(AnalysisError::InvalidSignal(
                "prices, size and risk/reward must be finite and non-negative".to_string(),
            ));
        }
        if self.is_entry() && self.entry_price <= 0.0 {
            return Err(AnalysisError::InvalidSignal(format!(
                "{} signal without an entry price",
                self.action
            )));
        }
        Ok(())
    }
}
