use std::str::FromStr;

use agent_ports::{Persistence, PortError, PortResult};
use analysis_core::{AgentRecord, ClosedTrade, OpenPosition, Side, TradingSignal};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// SQLite-backed agent and trade storage.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    name: String,
    symbol: String,
    balance: f64,
    is_active: bool,
    use_pooled_balance: bool,
}

impl AgentRow {
    fn into_record(self) -> AgentRecord {
        AgentRecord {
            id: self.id,
            name: self.name,
            symbol: self.symbol,
            balance: self.balance,
            is_active: self.is_active,
            use_pooled_balance: self.use_pooled_balance,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    id: String,
    agent_id: String,
    symbol: String,
    side: String,
    entry_price: f64,
    quantity: f64,
    collateral_usd: f64,
    leverage: f64,
    stop_loss: f64,
    take_profit: f64,
    opened_at: DateTime<Utc>,
    exit_price: Option<f64>,
    realized_pnl: Option<f64>,
    closed_at: Option<DateTime<Utc>>,
    exit_reason: Option<String>,
}

impl TradeRow {
    fn side(&self) -> PortResult<Side> {
        Side::parse(&self.side)
            .ok_or_else(|| PortError::Storage(format!("trade {} has side '{}'", self.id, self.side)))
    }

    fn into_open(self) -> PortResult<OpenPosition> {
        let side = self.side()?;
        Ok(OpenPosition {
            id: self.id,
            agent_id: self.agent_id,
            symbol: self.symbol,
            side,
            entry_price: self.entry_price,
            quantity: self.quantity,
            collateral_usd: self.collateral_usd,
            leverage: self.leverage,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            opened_at: self.opened_at,
        })
    }

    fn into_closed(self) -> PortResult<ClosedTrade> {
        let side = self.side()?;
        let closed_at = self
            .closed_at
            .ok_or_else(|| PortError::Storage(format!("closed trade {} has no close time", self.id)))?;
        Ok(ClosedTrade {
            id: self.id,
            agent_id: self.agent_id,
            symbol: self.symbol,
            side,
            entry_price: self.entry_price,
            exit_price: self.exit_price.unwrap_or_default(),
            quantity: self.quantity,
            collateral_usd: self.collateral_usd,
            realized_pnl: self.realized_pnl.unwrap_or_default(),
            opened_at: self.opened_at,
            closed_at,
            exit_reason: self.exit_reason.unwrap_or_default(),
        })
    }
}

const TRADE_COLUMNS: &str = "id, agent_id, symbol, side, entry_price, quantity, collateral_usd, \
     leverage, stop_loss, take_profit, opened_at, exit_price, realized_pnl, closed_at, exit_reason";

fn storage(e: sqlx::Error) -> PortError {
    PortError::Storage(e.to_string())
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to :memory: is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                balance REAL NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                use_pooled_balance INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                collateral_usd REAL NOT NULL,
                leverage REAL NOT NULL,
                stop_loss REAL NOT NULL DEFAULT 0,
                take_profit REAL NOT NULL DEFAULT 0,
                opened_at TEXT NOT NULL,
                signal_json TEXT,
                status TEXT NOT NULL DEFAULT 'open',
                exit_price REAL,
                realized_pnl REAL,
                closed_at TEXT,
                exit_reason TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_agent_status ON trades (agent_id, status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn load_agent(&self, agent_id: &str) -> PortResult<Option<AgentRecord>> {
        let row: Option<AgentRow> = sqlx::query_as(
            "SELECT id, name, symbol, balance, is_active, use_pooled_balance FROM agents WHERE id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(AgentRow::into_record))
    }

    async fn load_agents(&self) -> PortResult<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT id, name, symbol, balance, is_active, use_pooled_balance FROM agents ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(AgentRow::into_record).collect())
    }

    async fn save_agent(&self, agent: &AgentRecord) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO agents (id, name, symbol, balance, is_active, use_pooled_balance, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                symbol = excluded.symbol,
                balance = excluded.balance,
                is_active = excluded.is_active,
                use_pooled_balance = excluded.use_pooled_balance,
                updated_at = excluded.updated_at",
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.symbol)
        .bind(agent.balance)
        .bind(agent.is_active)
        .bind(agent.use_pooled_balance)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn load_open_positions(&self, agent_id: Option<&str>) -> PortResult<Vec<OpenPosition>> {
        let sql = match agent_id {
            Some(_) => format!(
                "SELECT {TRADE_COLUMNS} FROM trades WHERE status = 'open' AND agent_id = ? ORDER BY opened_at"
            ),
            None => format!("SELECT {TRADE_COLUMNS} FROM trades WHERE status = 'open' ORDER BY opened_at"),
        };
        let mut query = sqlx::query_as::<_, TradeRow>(&sql);
        if let Some(id) = agent_id {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(storage)?;

        rows.into_iter().map(TradeRow::into_open).collect()
    }

    async fn record_trade(&self, position: &OpenPosition, signal: &TradingSignal) -> PortResult<()> {
        let signal_json =
            serde_json::to_string(signal).map_err(|e| PortError::Storage(e.to_string()))?;

        sqlx::query(
            "INSERT INTO trades (id, agent_id, symbol, side, entry_price, quantity, collateral_usd,
                leverage, stop_loss, take_profit, opened_at, signal_json, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'open')",
        )
        .bind(&position.id)
        .bind(&position.agent_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.collateral_usd)
        .bind(position.leverage)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.opened_at)
        .bind(signal_json)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn update_trade_on_close(&self, trade: &ClosedTrade) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE trades SET status = 'closed', exit_price = ?, realized_pnl = ?,
                closed_at = ?, exit_reason = ?
             WHERE id = ? AND status = 'open'",
        )
        .bind(trade.exit_price)
        .bind(trade.realized_pnl)
        .bind(trade.closed_at)
        .bind(&trade.exit_reason)
        .bind(&trade.id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("open trade {}", trade.id)));
        }
        Ok(())
    }

    async fn load_recent_closed_trades(&self, agent_id: &str, limit: usize) -> PortResult<Vec<ClosedTrade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades
             WHERE status = 'closed' AND agent_id = ?
             ORDER BY closed_at DESC LIMIT ?"
        ))
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(TradeRow::into_closed).collect()
    }

    async fn load_trade_signal(&self, position_id: &str) -> PortResult<Option<TradingSignal>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT signal_json FROM trades WHERE id = ?")
                .bind(position_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;

        match raw.flatten() {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| PortError::Storage(format!("trade {} signal: {}", position_id, e))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{SignalAction, SignalSource};
    use chrono::{Duration, TimeZone};

    async fn store() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn agent(id: &str) -> AgentRecord {
        AgentRecord {
            id: id.into(),
            name: format!("agent {id}"),
            symbol: "BTCUSDT".into(),
            balance: 100.0,
            is_active: true,
            use_pooled_balance: false,
        }
    }

    fn position(id: &str, opened_at: DateTime<Utc>) -> OpenPosition {
        OpenPosition {
            id: id.into(),
            agent_id: "a1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Short,
            entry_price: 100.0,
            quantity: 0.5,
            collateral_usd: 25.0,
            leverage: 2.0,
            stop_loss: 104.0,
            take_profit: 92.0,
            opened_at,
        }
    }

    fn signal() -> TradingSignal {
        TradingSignal {
            action: SignalAction::Short,
            confidence: 0.81,
            stop_loss: 104.0,
            take_profit_levels: vec![92.0, 88.0],
            leverage: 2.0,
            risk_reward_ratio: 2.0,
            ..TradingSignal::hold("BTCUSDT", 100.0, SignalSource::Expert, "bearish stack")
        }
    }

    #[tokio::test]
    async fn test_db_creation() {
        let store = store().await;
        assert!(store.ping().await.is_ok());
        // Schema creation is idempotent
        assert!(store.init_schema().await.is_ok());
    }

    #[tokio::test]
    async fn agents_upsert_and_load() {
        let store = store().await;
        store.save_agent(&agent("b")).await.unwrap();
        store.save_agent(&agent("a")).await.unwrap();

        let mut updated = agent("a");
        updated.balance = 42.5;
        updated.is_active = false;
        store.save_agent(&updated).await.unwrap();

        let agents = store.load_agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0], updated);
        assert_eq!(store.load_agent("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn open_then_close_trade() {
        let store = store().await;
        let opened = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let pos = position("t1", opened);
        store.record_trade(&pos, &signal()).await.unwrap();

        let open = store.load_open_positions(Some("a1")).await.unwrap();
        assert_eq!(open, vec![pos.clone()]);
        assert!(store.load_open_positions(Some("a2")).await.unwrap().is_empty());

        let closed = pos.into_closed(90.0, opened + Duration::hours(3), "take profit");
        store.update_trade_on_close(&closed).await.unwrap();

        assert!(store.load_open_positions(None).await.unwrap().is_empty());
        let recent = store.load_recent_closed_trades("a1", 10).await.unwrap();
        assert_eq!(recent, vec![closed.clone()]);

        // A second close finds no open row
        assert!(matches!(
            store.update_trade_on_close(&closed).await,
            Err(PortError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn recent_closed_trades_newest_first_and_limited() {
        let store = store().await;
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        for i in 0..4 {
            let pos = position(&format!("t{i}"), base + Duration::hours(i));
            store.record_trade(&pos, &signal()).await.unwrap();
            let closed = pos.into_closed(101.0, base + Duration::hours(i + 1), "signal close");
            store.update_trade_on_close(&closed).await.unwrap();
        }

        let recent = store.load_recent_closed_trades("a1", 2).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t2"]);
    }

    #[tokio::test]
    async fn stored_signal_reads_back_equal() {
        let store = store().await;
        let sig = signal();
        store
            .record_trade(&position("t1", Utc::now()), &sig)
            .await
            .unwrap();

        assert_eq!(store.load_trade_signal("t1").await.unwrap(), Some(sig));
        assert_eq!(store.load_trade_signal("nope").await.unwrap(), None);
    }
}
