use std::sync::Arc;
use std::time::Duration;

use agent_ports::{
    ExecutionClient, MarketOrder, OrderFill, PortError, PortResult, PriceFeed,
    TextCompletionProvider,
};
use analysis_core::{PricePoint, PriceSeries};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Map a non-success HTTP status onto the port taxonomy. Rate limits and
/// server errors are transient; anything else is reported as-is.
fn status_error(service: &str, status: StatusCode, body: &str) -> PortError {
    if status == StatusCode::NOT_FOUND {
        PortError::NotFound(format!("{}: {}", service, body))
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PortError::Unavailable(format!("{} HTTP {}", service, status))
    } else {
        PortError::Other(format!("{} HTTP {}: {}", service, status, body))
    }
}

// ---------------------------------------------------------------------------
// Price feed
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PriceResponse {
    price: f64,
}

/// Price feed backed by a small HTTP service exposing
/// `/history/{symbol}?lookback=N` and `/price/{symbol}`.
pub struct HttpPriceFeed {
    client: Client,
    base_url: String,
}

impl HttpPriceFeed {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> PortResult<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| PortError::Unavailable(format!("price feed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("price feed", status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| PortError::Other(format!("price feed payload: {}", e)))
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn get_history(&self, symbol: &str, lookback: usize) -> PortResult<PriceSeries> {
        let url = format!("{}/history/{}", self.base_url, symbol);
        let points: Vec<PricePoint> = self
            .get_json(&url, &[("lookback", lookback.to_string())])
            .await?;
        tracing::debug!("{}: fetched {} history points", symbol, points.len());
        PriceSeries::new(symbol, points).map_err(|e| PortError::Other(e.to_string()))
    }

    async fn get_current_price(&self, symbol: &str) -> PortResult<f64> {
        let url = format!("{}/price/{}", self.base_url, symbol);
        let body: PriceResponse = self.get_json(&url, &[]).await?;
        if !body.price.is_finite() || body.price <= 0.0 {
            return Err(PortError::Other(format!("{}: bad price {}", symbol, body.price)));
        }
        Ok(body.price)
    }
}

// ---------------------------------------------------------------------------
// Text completion
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You are a disciplined trading analyst. \
    Reply with a single JSON object describing your recommendation.";

/// OpenAI-compatible chat-completions client.
pub struct OpenAiCompletion {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompletion {
    pub fn new(api_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[async_trait]
impl TextCompletionProvider for OpenAiCompletion {
    async fn complete(&self, prompt: &str, temperature: f64, max_tokens: u32) -> PortResult<String> {
        if !self.is_configured() {
            return Err(PortError::Unavailable("LLM_API_KEY not set".to_string()));
        }

        let request_body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "max_tokens": max_tokens,
            "temperature": temperature
        });

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| PortError::Unavailable(format!("llm: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(PortError::Unavailable("llm: authentication failed".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("llm", status, &body));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PortError::Other(format!("llm payload: {}", e)))?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PortError::Other("llm: missing content in response".to_string()))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Simulated venue: every market order fills in full at the feed's current
/// price.
pub struct PaperExecutionClient {
    feed: Arc<dyn PriceFeed>,
}

impl PaperExecutionClient {
    pub fn new(feed: Arc<dyn PriceFeed>) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl ExecutionClient for PaperExecutionClient {
    async fn place_market_order(&self, order: MarketOrder) -> PortResult<OrderFill> {
        let price = self.feed.get_current_price(&order.symbol).await?;
        let executed_price = Decimal::from_f64(price)
            .map(|p| p.round_dp(8))
            .ok_or_else(|| {
                PortError::InvalidExecutionResult(format!("{}: unrepresentable price {}", order.symbol, price))
            })?;

        let fill = OrderFill {
            order_id: format!("paper-{}", Uuid::new_v4()),
            executed_qty: order.quantity,
            executed_price,
            status: "filled".to_string(),
        };
        tracing::info!(
            "[paper] {:?} {} {} @ {}",
            order.side,
            fill.executed_qty,
            order.symbol,
            fill.executed_price
        );
        Ok(fill)
    }

    fn is_paper(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_ports::memory::StaticPriceFeed;
    use agent_ports::OrderSide;
    use rust_decimal_macros::dec;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error("feed", StatusCode::NOT_FOUND, ""),
            PortError::NotFound(_)
        ));
        assert!(status_error("feed", StatusCode::BAD_GATEWAY, "").is_unavailable());
        assert!(status_error("feed", StatusCode::TOO_MANY_REQUESTS, "").is_unavailable());
        assert!(matches!(
            status_error("feed", StatusCode::BAD_REQUEST, "nope"),
            PortError::Other(_)
        ));
    }

    #[tokio::test]
    async fn completion_without_key_is_unavailable() {
        let llm = OpenAiCompletion::new("http://127.0.0.1:9/v1/chat/completions", "", "gpt-4o-mini")
            .unwrap();
        assert_eq!(llm.name(), "gpt-4o-mini");
        let err = llm.complete("hi", 0.3, 10).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn paper_fill_uses_current_price() {
        let feed = Arc::new(StaticPriceFeed::new());
        feed.set_price("ETHUSDT", 2500.5);
        let client = PaperExecutionClient::new(feed);

        let order = MarketOrder {
            symbol: "ETHUSDT".into(),
            side: OrderSide::Buy,
            quantity: dec!(0.25),
        };
        let fill = client.place_market_order(order).await.unwrap().validated().unwrap();
        assert_eq!(fill.executed_qty, dec!(0.25));
        assert_eq!(fill.executed_price, dec!(2500.5));
        assert!(client.is_paper());
    }

    #[tokio::test]
    async fn paper_fill_fails_when_feed_is_down() {
        let feed = Arc::new(StaticPriceFeed::new());
        feed.set_price("ETHUSDT", 2500.0);
        feed.set_unavailable("ETHUSDT", true);
        let client = PaperExecutionClient::new(feed);

        let err = client
            .place_market_order(MarketOrder::buy("ETHUSDT", dec!(1)))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
