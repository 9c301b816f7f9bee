//! In-process collaborators for tests and dry runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use analysis_core::{AgentRecord, ClosedTrade, OpenPosition, PriceSeries, TradingSignal};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};

use crate::*;

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    agents: HashMap<String, AgentRecord>,
    open: HashMap<String, OpenPosition>,
    closed: Vec<ClosedTrade>,
    signals: HashMap<String, TradingSignal>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_agents(agents: Vec<AgentRecord>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().await;
            for agent in agents {
                inner.agents.insert(agent.id.clone(), agent);
            }
        }
        store
    }

    pub async fn insert_open_position(&self, position: OpenPosition) {
        self.inner.write().await.open.insert(position.id.clone(), position);
    }

    pub async fn insert_closed_trade(&self, trade: ClosedTrade) {
        self.inner.write().await.closed.push(trade);
    }

    pub async fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.inner.read().await.closed.clone()
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn load_agent(&self, agent_id: &str) -> PortResult<Option<AgentRecord>> {
        Ok(self.inner.read().await.agents.get(agent_id).cloned())
    }

    async fn load_agents(&self) -> PortResult<Vec<AgentRecord>> {
        let mut agents: Vec<AgentRecord> = self.inner.read().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn save_agent(&self, agent: &AgentRecord) -> PortResult<()> {
        self.inner
            .write()
            .await
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn load_open_positions(&self, agent_id: Option<&str>) -> PortResult<Vec<OpenPosition>> {
        let inner = self.inner.read().await;
        let mut positions: Vec<OpenPosition> = inner
            .open
            .values()
            .filter(|p| agent_id.map_or(true, |id| p.agent_id == id))
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at);
        Ok(positions)
    }

    async fn record_trade(&self, position: &OpenPosition, signal: &TradingSignal) -> PortResult<()> {
        let mut inner = self.inner.write().await;
        inner.open.insert(position.id.clone(), position.clone());
        inner.signals.insert(position.id.clone(), signal.clone());
        Ok(())
    }

    async fn update_trade_on_close(&self, trade: &ClosedTrade) -> PortResult<()> {
        let mut inner = self.inner.write().await;
        if inner.open.remove(&trade.id).is_none() {
            return Err(PortError::NotFound(format!("open trade {}", trade.id)));
        }
        inner.closed.push(trade.clone());
        Ok(())
    }

    async fn load_recent_closed_trades(&self, agent_id: &str, limit: usize) -> PortResult<Vec<ClosedTrade>> {
        let inner = self.inner.read().await;
        let mut trades: Vec<ClosedTrade> = inner
            .closed
            .iter()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        trades.truncate(limit);
        Ok(trades)
    }

    async fn load_trade_signal(&self, position_id: &str) -> PortResult<Option<TradingSignal>> {
        Ok(self.inner.read().await.signals.get(position_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Price feed
// ---------------------------------------------------------------------------

/// Serves fixed series per symbol. Symbols can be marked unavailable to
/// exercise outage handling.
#[derive(Default)]
pub struct StaticPriceFeed {
    series: DashMap<String, PriceSeries>,
    prices: DashMap<String, f64>,
    unavailable: DashMap<String, ()>,
    /// Remaining calls that fail before the symbol recovers
    failing_calls: DashMap<String, usize>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_series(&self, series: PriceSeries) {
        self.series.insert(series.symbol().to_string(), series);
    }

    /// Override the current price without touching the history
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_string(), price);
    }

    pub fn set_unavailable(&self, symbol: &str, unavailable: bool) {
        if unavailable {
            self.unavailable.insert(symbol.to_string(), ());
        } else {
            self.unavailable.remove(symbol);
        }
    }

    /// Make the next `calls` requests for `symbol` fail as unavailable
    pub fn fail_next(&self, symbol: &str, calls: usize) {
        self.failing_calls.insert(symbol.to_string(), calls);
    }

    fn check(&self, symbol: &str) -> PortResult<()> {
        if self.unavailable.contains_key(symbol) {
            return Err(PortError::Unavailable(format!("price feed down for {symbol}")));
        }
        if let Some(mut remaining) = self.failing_calls.get_mut(symbol) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PortError::Unavailable(format!("price feed blip for {symbol}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    async fn get_history(&self, symbol: &str, lookback: usize) -> PortResult<PriceSeries> {
        self.check(symbol)?;
        let series = self
            .series
            .get(symbol)
            .ok_or_else(|| PortError::NotFound(symbol.to_string()))?;
        let points = series.points();
        let start = points.len().saturating_sub(lookback);
        PriceSeries::new(symbol, points[start..].to_vec()).map_err(|e| PortError::Other(e.to_string()))
    }

    async fn get_current_price(&self, symbol: &str) -> PortResult<f64> {
        self.check(symbol)?;
        if let Some(price) = self.prices.get(symbol) {
            return Ok(*price);
        }
        self.series
            .get(symbol)
            .and_then(|s| s.last_price())
            .ok_or_else(|| PortError::NotFound(symbol.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Fills every order at the feed's current price unless a fill has been
/// scripted for the next order.
pub struct StaticExecutionClient {
    feed: Arc<StaticPriceFeed>,
    scripted: Mutex<VecDeque<PortResult<OrderFill>>>,
    orders: Mutex<Vec<MarketOrder>>,
}

impl StaticExecutionClient {
    pub fn new(feed: Arc<StaticPriceFeed>) -> Self {
        Self {
            feed,
            scripted: Mutex::new(VecDeque::new()),
            orders: Mutex::new(Vec::new()),
        }
    }

    pub async fn script(&self, result: PortResult<OrderFill>) {
        self.scripted.lock().await.push_back(result);
    }

    pub async fn orders(&self) -> Vec<MarketOrder> {
        self.orders.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionClient for StaticExecutionClient {
    async fn place_market_order(&self, order: MarketOrder) -> PortResult<OrderFill> {
        let count = {
            let mut orders = self.orders.lock().await;
            orders.push(order.clone());
            orders.len()
        };
        if let Some(result) = self.scripted.lock().await.pop_front() {
            return result;
        }
        let price = self.feed.get_current_price(&order.symbol).await?;
        Ok(OrderFill {
            order_id: format!("static-{count}"),
            executed_qty: order.quantity,
            executed_price: Decimal::from_f64(price).unwrap_or_default(),
            status: "filled".to_string(),
        })
    }

    fn is_paper(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Text completion
// ---------------------------------------------------------------------------

/// Replays queued responses, then reports the provider as unavailable.
#[derive(Default)]
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<PortResult<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<PortResult<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl TextCompletionProvider for ScriptedCompletion {
    async fn complete(&self, prompt: &str, _temperature: f64, _max_tokens: u32) -> PortResult<String> {
        self.prompts.lock().await.push(prompt.to_string());
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(PortError::Unavailable("no scripted response left".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingAlertSink {
    messages: Mutex<Vec<String>>,
    fail_for: Mutex<HashSet<String>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }

    /// Make delivery fail for messages containing `needle`
    pub async fn fail_when_contains(&self, needle: &str) {
        self.fail_for.lock().await.insert(needle.to_string());
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, message: &str) -> PortResult<()> {
        if self.fail_for.lock().await.iter().any(|n| message.contains(n.as_str())) {
            return Err(PortError::Unavailable("alert sink rejected message".to_string()));
        }
        self.messages.lock().await.push(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{PricePoint, Side, SignalSource};
    use chrono::{Duration, Utc};

    fn series(symbol: &str, n: usize) -> PriceSeries {
        let start = Utc::now() - Duration::hours(n as i64);
        let points = (0..n)
            .map(|i| PricePoint {
                timestamp: start + Duration::hours(i as i64),
                price: 100.0 + i as f64,
                volume: 1.0,
            })
            .collect();
        PriceSeries::new(symbol, points).unwrap()
    }

    fn position(id: &str, agent: &str) -> OpenPosition {
        OpenPosition {
            id: id.into(),
            agent_id: agent.into(),
            symbol: "BTC".into(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 1.0,
            collateral_usd: 25.0,
            leverage: 4.0,
            stop_loss: 95.0,
            take_profit: 110.0,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn feed_trims_history_and_reports_outages() {
        let feed = StaticPriceFeed::new();
        feed.set_series(series("BTC", 10));

        let h = feed.get_history("BTC", 3).await.unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h.last_price(), Some(109.0));

        assert!(matches!(
            feed.get_history("ETH", 3).await,
            Err(PortError::NotFound(_))
        ));

        feed.set_unavailable("BTC", true);
        assert!(feed.get_current_price("BTC").await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn feed_recovers_after_scripted_failures() {
        let feed = StaticPriceFeed::new();
        feed.set_series(series("BTC", 10));
        feed.fail_next("BTC", 2);

        assert!(feed.get_current_price("BTC").await.unwrap_err().is_unavailable());
        assert!(feed.get_history("BTC", 5).await.unwrap_err().is_unavailable());
        assert_eq!(feed.get_current_price("BTC").await.unwrap(), 109.0);
    }

    #[tokio::test]
    async fn store_moves_trade_from_open_to_closed() {
        let store = InMemoryStore::new();
        let pos = position("t1", "a1");
        let signal = TradingSignal::hold("BTC", 100.0, SignalSource::Technical, "x");
        store.record_trade(&pos, &signal).await.unwrap();
        assert_eq!(store.load_open_positions(Some("a1")).await.unwrap().len(), 1);
        assert!(store.load_open_positions(Some("a2")).await.unwrap().is_empty());

        let closed = pos.into_closed(105.0, Utc::now(), "take profit");
        store.update_trade_on_close(&closed).await.unwrap();
        assert!(store.load_open_positions(None).await.unwrap().is_empty());
        assert_eq!(store.load_recent_closed_trades("a1", 20).await.unwrap().len(), 1);
        assert_eq!(store.load_trade_signal("t1").await.unwrap(), Some(signal));

        assert!(store.update_trade_on_close(&closed).await.is_err());
    }

    #[tokio::test]
    async fn scripted_completion_runs_dry() {
        let llm = ScriptedCompletion::new(vec![Ok("hello".into())]);
        assert_eq!(llm.complete("p", 0.3, 10).await.unwrap(), "hello");
        assert!(llm.complete("p", 0.3, 10).await.unwrap_err().is_unavailable());
        assert_eq!(llm.prompts().await.len(), 2);
    }
}
