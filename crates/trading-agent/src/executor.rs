use std::sync::Arc;

use agent_ports::{notify_quietly, AlertSink, ExecutionClient, MarketOrder, OrderSide, Persistence};
use analysis_core::{AgentRecord, ClosedTrade, OpenPosition, TradingSignal};
use chrono::Utc;
use kelly_position_sizer::PositionSize;
use risk_manager::RiskRegistry;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::error::{TradingError, TradingResult};

/// Places orders and keeps persistence, agent balance and risk state in step
/// with what the venue actually filled.
pub struct TradeExecutor {
    execution: Arc<dyn ExecutionClient>,
    store: Arc<dyn Persistence>,
    registry: Arc<RiskRegistry>,
    alerts: Arc<dyn AlertSink>,
}

impl TradeExecutor {
    pub fn new(
        execution: Arc<dyn ExecutionClient>,
        store: Arc<dyn Persistence>,
        registry: Arc<RiskRegistry>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            execution,
            store,
            registry,
            alerts,
        }
    }

    pub fn is_paper(&self) -> bool {
        self.execution.is_paper()
    }

    /// Open a position for `signal`. The position is only recorded once the
    /// venue returns a valid fill; collateral is then moved out of the agent's
    /// balance.
    pub async fn open_position(
        &self,
        agent: &mut AgentRecord,
        signal: &TradingSignal,
        size: &PositionSize,
    ) -> TradingResult<OpenPosition> {
        let side = signal
            .action
            .side()
            .ok_or_else(|| TradingError::Sizing(format!("{} is not an entry", signal.action)))?;

        let quantity = Decimal::from_f64(size.quantity)
            .map(|q| q.round_dp(8))
            .filter(|q| *q > Decimal::ZERO)
            .ok_or_else(|| TradingError::Sizing(format!("unusable quantity {}", size.quantity)))?;

        let order = MarketOrder {
            symbol: signal.symbol.clone(),
            side: OrderSide::opening(side),
            quantity,
        };

        tracing::info!(
            "Executing {} {} - {} units @ ~${:.4} (${:.2} at {:.0}x)",
            signal.action,
            signal.symbol,
            quantity,
            signal.entry_price,
            size.collateral_usd,
            size.leverage
        );

        let fill = match self
            .execution
            .place_market_order(order)
            .await
            .and_then(|fill| fill.validated())
        {
            Ok(fill) => fill,
            Err(e) => {
                tracing::error!("Order for {} ({}) failed: {}", signal.symbol, agent.name, e);
                notify_quietly(
                    self.alerts.as_ref(),
                    &format!(
                        "**Execution failed** {} {} for {}: {}",
                        signal.action, signal.symbol, agent.name, e
                    ),
                )
                .await;
                return Err(e.into());
            }
        };

        let entry_price = fill.price_f64();
        let filled_qty = fill.qty_f64();
        // Never lock up more than the risk check approved, even on slippage
        let filled_collateral = entry_price * filled_qty / size.leverage;
        let collateral = filled_collateral.min(size.collateral_usd);
        if filled_collateral > collateral {
            tracing::warn!(
                "{} filled at ${:.4} vs ~${:.4}: collateral capped at ${:.2} (fill implies ${:.2})",
                signal.symbol,
                entry_price,
                signal.entry_price,
                collateral,
                filled_collateral
            );
        }

        let position = OpenPosition {
            id: OpenPosition::new_id(),
            agent_id: agent.id.clone(),
            symbol: signal.symbol.clone(),
            side,
            entry_price,
            quantity: filled_qty,
            collateral_usd: collateral,
            leverage: size.leverage,
            stop_loss: signal.stop_loss,
            take_profit: signal.primary_target().unwrap_or_default(),
            opened_at: Utc::now(),
        };

        if let Err(e) = self.store.record_trade(&position, signal).await {
            tracing::error!(
                "Order {} filled but the position could not be recorded: {}",
                fill.order_id,
                e
            );
            notify_quietly(
                self.alerts.as_ref(),
                &format!(
                    "**Unrecorded fill** order {} {} {} for {}: {}",
                    fill.order_id, side, signal.symbol, agent.name, e
                ),
            )
            .await;
            return Err(e.into());
        }

        agent.balance -= collateral;
        self.store.save_agent(agent).await?;

        tracing::info!(
            "Opened {} {} for {}: {} @ ${:.4}, collateral ${:.2}, order {}",
            side,
            position.symbol,
            agent.name,
            filled_qty,
            entry_price,
            collateral,
            fill.order_id
        );

        Ok(position)
    }

    /// Close `position` at market. Collateral plus realized P&L returns to the
    /// agent and the result feeds the agent's risk state.
    pub async fn close_position(
        &self,
        agent: &mut AgentRecord,
        position: OpenPosition,
        reason: &str,
    ) -> TradingResult<ClosedTrade> {
        let quantity = Decimal::from_f64(position.quantity)
            .filter(|q| *q > Decimal::ZERO)
            .ok_or_else(|| {
                TradingError::InvalidExecutionResult(format!(
                    "position {} has quantity {}",
                    position.id, position.quantity
                ))
            })?;

        let order = MarketOrder {
            symbol: position.symbol.clone(),
            side: OrderSide::closing(position.side),
            quantity,
        };

        let fill = match self
            .execution
            .place_market_order(order)
            .await
            .and_then(|fill| fill.validated())
        {
            Ok(fill) => fill,
            Err(e) => {
                tracing::error!(
                    "Close of {} {} for {} failed: {}",
                    position.side,
                    position.symbol,
                    agent.name,
                    e
                );
                notify_quietly(
                    self.alerts.as_ref(),
                    &format!(
                        "**Close failed** {} {} for {} ({}): {}",
                        position.side, position.symbol, agent.name, reason, e
                    ),
                )
                .await;
                return Err(e.into());
            }
        };

        let collateral = position.collateral_usd;
        let trade = position.into_closed(fill.price_f64(), Utc::now(), reason);
        if let Err(e) = self.store.update_trade_on_close(&trade).await {
            tracing::error!(
                "Close order {} filled but trade {} could not be updated: {}",
                fill.order_id,
                trade.id,
                e
            );
            notify_quietly(
                self.alerts.as_ref(),
                &format!(
                    "**Unrecorded close** order {} {} {} for {} ({}): {}\n_Position is flat at the venue but still open in the store._",
                    fill.order_id, trade.side, trade.symbol, agent.name, reason, e
                ),
            )
            .await;
            return Err(e.into());
        }

        agent.balance = (agent.balance + collateral + trade.realized_pnl).max(0.0);
        self.store.save_agent(agent).await?;

        self.registry
            .record_trade_result(&agent.id, trade.realized_pnl, trade.closed_at)
            .await;

        tracing::info!(
            "Closed {} {} for {} ({}): exit ${:.4}, P&L ${:+.2}, balance ${:.2}",
            trade.side,
            trade.symbol,
            agent.name,
            reason,
            trade.exit_price,
            trade.realized_pnl,
            agent.balance
        );

        Ok(trade)
    }
}
