use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use risk_manager::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use signal_arbitrator::ArbitrationThresholds;

use crate::monitor::ExitRules;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Scheduling
    pub cycle_interval_seconds: u64,      // 300 (5 minutes)
    pub agent_pacing_ms: u64,             // 1500
    pub max_concurrent_agents: usize,     // 1 = sequential
    pub history_lookback: usize,          // 250 points
    pub min_agent_balance: f64,           // $3
    pub metrics_log_interval_cycles: u64, // full metrics dump every N cycles

    // Arbitration floors
    pub thresholds: ArbitrationThresholds,

    // Initial circuit breaker config
    pub breaker: CircuitBreakerConfig,

    // Position monitor
    pub exit_rules: ExitRules,

    // AI text provider
    pub llm_api_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_temperature: f64,
    pub llm_max_tokens: u32,

    // Collaborators
    pub price_feed_url: String,
    pub database_url: String,
    pub discord_webhook_url: String,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; every key is optional.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let breaker_defaults = CircuitBreakerConfig::default();
        let exit_defaults = ExitRules::default();
        let floor_defaults = ArbitrationThresholds::default();

        let config = Self {
            cycle_interval_seconds: parse_or(&lookup, "CYCLE_INTERVAL_SECONDS", 300)?,
            agent_pacing_ms: parse_or(&lookup, "AGENT_PACING_MS", 1500)?,
            max_concurrent_agents: parse_or(&lookup, "MAX_CONCURRENT_AGENTS", 1)?,
            history_lookback: parse_or(&lookup, "HISTORY_LOOKBACK", 250)?,
            min_agent_balance: parse_or(&lookup, "MIN_AGENT_BALANCE", 3.0)?,
            metrics_log_interval_cycles: parse_or(&lookup, "METRICS_LOG_INTERVAL_CYCLES", 12)?,

            thresholds: ArbitrationThresholds {
                ultra: parse_or(&lookup, "ULTRA_MIN_CONFIDENCE", floor_defaults.ultra)?,
                expert: parse_or(&lookup, "EXPERT_MIN_CONFIDENCE", floor_defaults.expert)?,
                technical: parse_or(&lookup, "TECHNICAL_MIN_CONFIDENCE", floor_defaults.technical)?,
                ai: parse_or(&lookup, "AI_MIN_CONFIDENCE", floor_defaults.ai)?,
            },

            breaker: CircuitBreakerConfig {
                max_trade_usd: parse_or(&lookup, "MAX_TRADE_USD", breaker_defaults.max_trade_usd)?,
                max_daily_loss_percent: parse_or(
                    &lookup,
                    "MAX_DAILY_LOSS_PERCENT",
                    breaker_defaults.max_daily_loss_percent,
                )?,
                max_drawdown_percent: parse_or(
                    &lookup,
                    "MAX_DRAWDOWN_PERCENT",
                    breaker_defaults.max_drawdown_percent,
                )?,
                max_open_positions: parse_or(
                    &lookup,
                    "MAX_OPEN_POSITIONS",
                    breaker_defaults.max_open_positions,
                )?,
                min_balance_usd: parse_or(&lookup, "MIN_BALANCE_USD", breaker_defaults.min_balance_usd)?,
                max_consecutive_losses: parse_or(
                    &lookup,
                    "MAX_CONSECUTIVE_LOSSES",
                    breaker_defaults.max_consecutive_losses,
                )?,
                ..breaker_defaults
            },

            exit_rules: ExitRules {
                excellent_profit_pct: parse_or(
                    &lookup,
                    "EXCELLENT_PROFIT_PERCENT",
                    exit_defaults.excellent_profit_pct,
                )?,
                great_profit_pct: parse_or(&lookup, "GREAT_PROFIT_PERCENT", exit_defaults.great_profit_pct)?,
                tight_stop_pct: parse_or(&lookup, "TIGHT_STOP_PERCENT", exit_defaults.tight_stop_pct)?,
                time_exit_hours: parse_or(&lookup, "TIME_EXIT_HOURS", exit_defaults.time_exit_hours)?,
                time_exit_min_profit_pct: parse_or(
                    &lookup,
                    "TIME_EXIT_MIN_PROFIT_PERCENT",
                    exit_defaults.time_exit_min_profit_pct,
                )?,
                max_holding_hours: parse_or(&lookup, "MAX_HOLDING_HOURS", exit_defaults.max_holding_hours)?,
                reversal_min_strength: parse_or(
                    &lookup,
                    "REVERSAL_MIN_STRENGTH",
                    exit_defaults.reversal_min_strength,
                )?,
            },

            llm_api_url: lookup("LLM_API_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            llm_api_key: lookup("LLM_API_KEY").unwrap_or_default(),
            llm_model: lookup("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            llm_temperature: parse_or(&lookup, "LLM_TEMPERATURE", signal_providers::ai::DEFAULT_TEMPERATURE)?,
            llm_max_tokens: parse_or(&lookup, "LLM_MAX_TOKENS", signal_providers::ai::DEFAULT_MAX_TOKENS)?,

            price_feed_url: lookup("PRICE_FEED_URL").unwrap_or_else(|| "http://localhost:8090".to_string()),
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite:agents.db".to_string()),
            discord_webhook_url: lookup("DISCORD_WEBHOOK_URL").unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cycle_interval_seconds == 0 {
            bail!("CYCLE_INTERVAL_SECONDS must be at least 1");
        }
        if self.max_concurrent_agents == 0 {
            bail!("MAX_CONCURRENT_AGENTS must be at least 1");
        }
        if self.history_lookback < technical_analysis::IndicatorEngine::MIN_HISTORY {
            bail!(
                "HISTORY_LOOKBACK must be at least {} (got {})",
                technical_analysis::IndicatorEngine::MIN_HISTORY,
                self.history_lookback
            );
        }
        if self.min_agent_balance < 0.0 {
            bail!("MIN_AGENT_BALANCE must be non-negative");
        }

        let t = &self.thresholds;
        for (name, value) in [
            ("ULTRA_MIN_CONFIDENCE", t.ultra),
            ("EXPERT_MIN_CONFIDENCE", t.expert),
            ("TECHNICAL_MIN_CONFIDENCE", t.technical),
            ("AI_MIN_CONFIDENCE", t.ai),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be between 0 and 1 (got {})", name, value);
            }
        }

        let b = &self.breaker;
        if b.max_trade_usd <= 0.0 {
            bail!("MAX_TRADE_USD must be positive");
        }
        if b.max_daily_loss_percent <= 0.0 || b.max_daily_loss_percent > 100.0 {
            bail!("MAX_DAILY_LOSS_PERCENT must be in (0, 100]");
        }
        if b.max_drawdown_percent <= 0.0 || b.max_drawdown_percent > 100.0 {
            bail!("MAX_DRAWDOWN_PERCENT must be in (0, 100]");
        }
        if b.max_open_positions == 0 {
            bail!("MAX_OPEN_POSITIONS must be at least 1");
        }

        let e = &self.exit_rules;
        if e.great_profit_pct > e.excellent_profit_pct {
            bail!("GREAT_PROFIT_PERCENT must not exceed EXCELLENT_PROFIT_PERCENT");
        }
        if e.tight_stop_pct >= 0.0 {
            bail!("TIGHT_STOP_PERCENT must be negative");
        }
        if e.time_exit_hours > e.max_holding_hours {
            bail!("TIME_EXIT_HOURS must not exceed MAX_HOLDING_HOURS");
        }

        if !(0.0..=2.0).contains(&self.llm_temperature) {
            bail!("LLM_TEMPERATURE must be between 0 and 2");
        }
        if !self.database_url.starts_with("sqlite:") {
            bail!("DATABASE_URL must be a sqlite: URL");
        }

        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn agent_pacing(&self) -> Duration {
        Duration::from_millis(self.agent_pacing_ms)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AgentConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let c = config(&[]).unwrap();
        assert_eq!(c.cycle_interval_seconds, 300);
        assert_eq!(c.max_concurrent_agents, 1);
        assert_eq!(c.history_lookback, 250);
        assert_eq!(c.thresholds, ArbitrationThresholds::default());
        assert_eq!(c.breaker.max_open_positions, 3);
        assert_eq!(c.breaker.max_consecutive_losses, 5);
        assert_eq!(c.exit_rules.max_holding_hours, 48.0);
        assert_eq!(c.database_url, "sqlite:agents.db");
        assert!(c.discord_webhook_url.is_empty());
    }

    #[test]
    fn overrides_are_parsed() {
        let c = config(&[
            ("CYCLE_INTERVAL_SECONDS", "900"),
            ("MAX_CONCURRENT_AGENTS", "4"),
            ("ULTRA_MIN_CONFIDENCE", "0.5"),
            ("MAX_DAILY_LOSS_PERCENT", "30"),
            ("TIGHT_STOP_PERCENT", "-3.5"),
        ])
        .unwrap();
        assert_eq!(c.cycle_interval(), Duration::from_secs(900));
        assert_eq!(c.max_concurrent_agents, 4);
        assert_eq!(c.thresholds.ultra, 0.5);
        assert_eq!(c.breaker.max_daily_loss_percent, 30.0);
        assert_eq!(c.exit_rules.tight_stop_pct, -3.5);
    }

    #[test]
    fn garbage_values_are_reported_with_the_key() {
        let err = config(&[("AGENT_PACING_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("AGENT_PACING_MS"));
    }

    #[test]
    fn validation_rejects_inconsistent_values() {
        assert!(config(&[("EXPERT_MIN_CONFIDENCE", "1.5")]).is_err());
        assert!(config(&[("HISTORY_LOOKBACK", "50")]).is_err());
        assert!(config(&[("TIGHT_STOP_PERCENT", "2")]).is_err());
        assert!(config(&[("MAX_CONCURRENT_AGENTS", "0")]).is_err());
        assert!(config(&[("DATABASE_URL", "postgres://x")]).is_err());
    }
}
