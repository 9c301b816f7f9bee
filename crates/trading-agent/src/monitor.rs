//! Exit rules for open positions, evaluated once per cycle before any new
//! signal is generated.

use std::fmt;

use analysis_core::{MarketRegime, OpenPosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    pub excellent_profit_pct: f64,
    pub great_profit_pct: f64,
    /// Negative: close once the loss reaches this
    pub tight_stop_pct: f64,
    pub time_exit_hours: f64,
    pub time_exit_min_profit_pct: f64,
    pub max_holding_hours: f64,
    pub reversal_min_strength: f64,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            excellent_profit_pct: 8.0,
            great_profit_pct: 5.0,
            tight_stop_pct: -2.5,
            time_exit_hours: 24.0,
            time_exit_min_profit_pct: 3.0,
            max_holding_hours: 48.0,
            reversal_min_strength: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    ExcellentProfit,
    StopLoss,
    TakeProfit,
    GreatProfit,
    TightStop,
    TimeProfit,
    MaxHoldingTime,
    RegimeReversal,
    /// A provider asked to close
    SignalClose,
    /// The arbitrated signal points the other way
    SignalReversal,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ExcellentProfit => "excellent profit",
            ExitReason::StopLoss => "stop loss",
            ExitReason::TakeProfit => "take profit",
            ExitReason::GreatProfit => "great profit",
            ExitReason::TightStop => "tight stop",
            ExitReason::TimeProfit => "time-based profit",
            ExitReason::MaxHoldingTime => "max holding time",
            ExitReason::RegimeReversal => "regime reversal",
            ExitReason::SignalClose => "signal close",
            ExitReason::SignalReversal => "signal reversal",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionMonitor {
    rules: ExitRules,
}

impl PositionMonitor {
    pub fn new(rules: ExitRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ExitRules {
        &self.rules
    }

    /// First matching exit rule, if any. The excellent-profit tier is checked
    /// ahead of the hard stop/target levels so a large winner is always
    /// booked under that reason.
    pub fn evaluate(
        &self,
        position: &OpenPosition,
        price: f64,
        regime: Option<&MarketRegime>,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        let r = &self.rules;
        let pnl_pct = position.unrealized_pnl_pct(price);
        let held = position.held_hours(now);

        if pnl_pct >= r.excellent_profit_pct {
            return Some(ExitReason::ExcellentProfit);
        }
        if position.stop_loss_hit(price) {
            return Some(ExitReason::StopLoss);
        }
        if position.take_profit_hit(price) {
            return Some(ExitReason::TakeProfit);
        }
        if pnl_pct >= r.great_profit_pct {
            return Some(ExitReason::GreatProfit);
        }
        if pnl_pct <= r.tight_stop_pct {
            return Some(ExitReason::TightStop);
        }
        if held >= r.time_exit_hours && pnl_pct >= r.time_exit_min_profit_pct {
            return Some(ExitReason::TimeProfit);
        }
        if held >= r.max_holding_hours {
            return Some(ExitReason::MaxHoldingTime);
        }
        if let Some(regime) = regime {
            if regime.opposes(position.side) && regime.strength > r.reversal_min_strength {
                return Some(ExitReason::RegimeReversal);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{RegimeKind, Side};
    use chrono::Duration;

    fn position(side: Side, hours_ago: i64) -> OpenPosition {
        let now = Utc::now();
        OpenPosition {
            id: "p1".into(),
            agent_id: "a1".into(),
            symbol: "ETH".into(),
            side,
            entry_price: 100.0,
            quantity: 1.0,
            collateral_usd: 25.0,
            leverage: 4.0,
            stop_loss: if side == Side::Long { 97.0 } else { 103.0 },
            take_profit: if side == Side::Long { 106.0 } else { 94.0 },
            opened_at: now - Duration::hours(hours_ago),
        }
    }

    fn regime(kind: RegimeKind, strength: f64) -> MarketRegime {
        MarketRegime {
            kind,
            strength,
            confidence: 0.9,
        }
    }

    #[test]
    fn large_winner_is_excellent_profit_before_target() {
        let monitor = PositionMonitor::default();
        // +9% is also through the 106 target
        let reason = monitor.evaluate(&position(Side::Long, 1), 109.0, None, Utc::now());
        assert_eq!(reason, Some(ExitReason::ExcellentProfit));
        assert_eq!(reason.unwrap().to_string(), "excellent profit");

        let reason = monitor.evaluate(&position(Side::Short, 1), 91.0, None, Utc::now());
        assert_eq!(reason, Some(ExitReason::ExcellentProfit));
    }

    #[test]
    fn hard_levels_come_next() {
        let monitor = PositionMonitor::default();
        assert_eq!(
            monitor.evaluate(&position(Side::Long, 1), 96.5, None, Utc::now()),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            monitor.evaluate(&position(Side::Long, 1), 106.5, None, Utc::now()),
            Some(ExitReason::TakeProfit)
        );
    }

    #[test]
    fn profit_tiers_and_tight_stop_without_levels() {
        let monitor = PositionMonitor::default();
        let mut p = position(Side::Long, 1);
        p.stop_loss = 0.0;
        p.take_profit = 0.0;

        assert_eq!(monitor.evaluate(&p, 105.5, None, Utc::now()), Some(ExitReason::GreatProfit));
        assert_eq!(monitor.evaluate(&p, 97.4, None, Utc::now()), Some(ExitReason::TightStop));
        assert_eq!(monitor.evaluate(&p, 101.0, None, Utc::now()), None);
    }

    #[test]
    fn time_rules() {
        let monitor = PositionMonitor::default();
        // 25h with +3.5%
        assert_eq!(
            monitor.evaluate(&position(Side::Long, 25), 103.5, None, Utc::now()),
            Some(ExitReason::TimeProfit)
        );
        // 25h with +1% stays open
        assert_eq!(monitor.evaluate(&position(Side::Long, 25), 101.0, None, Utc::now()), None);
        // 49h closes at any P&L
        assert_eq!(
            monitor.evaluate(&position(Side::Long, 49), 99.0, None, Utc::now()),
            Some(ExitReason::MaxHoldingTime)
        );
    }

    #[test]
    fn strong_opposing_regime_closes() {
        let monitor = PositionMonitor::default();
        let p = position(Side::Long, 2);
        let strong = regime(RegimeKind::TrendingDown, 0.8);
        let weak = regime(RegimeKind::TrendingDown, 0.6);
        let aligned = regime(RegimeKind::TrendingUp, 0.9);

        assert_eq!(
            monitor.evaluate(&p, 100.5, Some(&strong), Utc::now()),
            Some(ExitReason::RegimeReversal)
        );
        assert_eq!(monitor.evaluate(&p, 100.5, Some(&weak), Utc::now()), None);
        assert_eq!(monitor.evaluate(&p, 100.5, Some(&aligned), Utc::now()), None);
    }
}
