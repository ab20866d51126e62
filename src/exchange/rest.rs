//! Bybit V5 REST client
//!
//! Endpoints documented at: https://bybit-exchange.github.io/docs/v5/intro

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, Url,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::signing::{self, HEADER_API_KEY, HEADER_RECV_WINDOW, HEADER_SIGN, HEADER_TIMESTAMP};
use super::types::{
    decode_klines, ClosedPnlDto, Envelope, ListResult, OrderCreatedDto, PositionDto, TickerDto,
    WalletAccountDto,
};
use super::{Exchange, ExchangeError, MarketOrder};
use crate::config::ExchangeConfig;
use crate::types::{Candle, ClosedTrade, ExchangePosition, Symbol, Ticker};

const CATEGORY: &str = "linear";
const SETTLE_COIN: &str = "USDT";
/// "leverage not modified" is not a failure
const RET_LEVERAGE_UNCHANGED: i64 = 110043;

/// REST client for Bybit linear perpetuals
pub struct BybitRestClient {
    client: Client,
    base_url: String,
    recv_window: u64,
    api_key: Option<String>,
    api_secret: Option<String>,
}

impl BybitRestClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        recv_window: u64,
        api_key: Option<String>,
        api_secret: Option<String>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            recv_window,
            api_key,
            api_secret,
        })
    }

    /// Build from config, taking credentials from `BYBIT_API_KEY` / `BYBIT_API_SECRET`
    pub fn from_config(cfg: &ExchangeConfig) -> Result<Self> {
        Self::new(
            &cfg.base_url,
            Duration::from_millis(cfg.request_timeout_ms),
            cfg.recv_window_ms,
            Self::resolve_env(&["BYBIT_API_KEY"]),
            Self::resolve_env(&["BYBIT_API_SECRET"]),
        )
    }

    fn resolve_env(var_names: &[&str]) -> Option<String> {
        var_names
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.trim().is_empty())
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, ExchangeError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ExchangeError::Transport(format!("bad url: {e}")))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn auth_headers(&self, params: &str) -> Result<HeaderMap, ExchangeError> {
        let (api_key, api_secret) = match (&self.api_key, &self.api_secret) {
            (Some(k), Some(s)) => (k, s),
            _ => return Err(ExchangeError::MissingCredentials),
        };
        let timestamp = Utc::now().timestamp_millis();
        let signature = signing::sign(api_secret, timestamp, api_key, self.recv_window, params)?;

        let header = |v: String| {
            HeaderValue::from_str(&v).map_err(|e| ExchangeError::Transport(e.to_string()))
        };
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_API_KEY, header(api_key.clone())?);
        headers.insert(HEADER_SIGN, header(signature)?);
        headers.insert(HEADER_TIMESTAMP, header(timestamp.to_string())?);
        headers.insert(HEADER_RECV_WINDOW, header(self.recv_window.to_string())?);
        Ok(headers)
    }

    async fn decode(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<Envelope, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::Transport(format!("{path}: HTTP {status}")));
        }
        serde_json::from_str::<Envelope>(&body)
            .map_err(|e| ExchangeError::Malformed(format!("{path}: {e}")))
    }

    fn result<T: DeserializeOwned>(path: &str, envelope: Envelope) -> Result<T, ExchangeError> {
        if envelope.ret_code != 0 {
            return Err(ExchangeError::Rejected {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }
        serde_json::from_value(envelope.result)
            .map_err(|e| ExchangeError::Malformed(format!("{path}: {e}")))
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = self.url(path, params)?;
        let response = self.client.get(url).send().await?;
        let envelope = self.decode(path, response).await?;
        Self::result(path, envelope)
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = self.url(path, params)?;
        // The signature must cover the exact query string that goes on the wire
        let headers = self.auth_headers(url.query().unwrap_or(""))?;
        let response = self.client.get(url).headers(headers).send().await?;
        let envelope = self.decode(path, response).await?;
        Self::result(path, envelope)
    }

    async fn signed_post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<Envelope, ExchangeError> {
        let url = self.url(path, &[])?;
        let body = body.to_string();
        let headers = self.auth_headers(&body)?;
        debug!(path, body = %body, "signed POST");
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        self.decode(path, response).await
    }

    async fn post_expect_ok(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(), ExchangeError> {
        let envelope = self.signed_post(path, body).await?;
        Self::result::<serde_json::Value>(path, envelope).map(|_| ())
    }
}

#[async_trait]
impl Exchange for BybitRestClient {
    async fn tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        let result: ListResult<TickerDto> = self
            .public_get("/v5/market/tickers", &[("category", CATEGORY.to_string())])
            .await?;
        Ok(result
            .list
            .into_iter()
            .filter_map(TickerDto::into_ticker)
            .collect())
    }

    async fn klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let result: ListResult<Vec<String>> = self
            .public_get(
                "/v5/market/kline",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        decode_klines(result.list)
            .ok_or_else(|| ExchangeError::Malformed(format!("kline rows for {symbol}")))
    }

    async fn wallet_balance(&self) -> Result<f64, ExchangeError> {
        let result: ListResult<WalletAccountDto> = self
            .signed_get(
                "/v5/account/wallet-balance",
                &[
                    ("accountType", "UNIFIED".to_string()),
                    ("coin", SETTLE_COIN.to_string()),
                ],
            )
            .await?;
        result
            .list
            .into_iter()
            .flat_map(|account| account.coin)
            .find(|c| c.coin == SETTLE_COIN)
            .and_then(|c| c.wallet_balance.trim().parse::<f64>().ok())
            .ok_or_else(|| ExchangeError::Malformed("no USDT wallet balance".to_string()))
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let result: ListResult<PositionDto> = self
            .signed_get(
                "/v5/position/list",
                &[
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", SETTLE_COIN.to_string()),
                ],
            )
            .await?;
        Ok(result
            .list
            .into_iter()
            .filter_map(PositionDto::into_position)
            .collect())
    }

    async fn position(&self, symbol: &Symbol) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let result: ListResult<PositionDto> = self
            .signed_get(
                "/v5/position/list",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                ],
            )
            .await?;
        Ok(result
            .list
            .into_iter()
            .filter_map(PositionDto::into_position)
            .collect())
    }

    async fn closed_pnl(
        &self,
        limit: usize,
        start_time: Option<i64>,
    ) -> Result<Vec<ClosedTrade>, ExchangeError> {
        let mut params = vec![
            ("category", CATEGORY.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(start) = start_time {
            params.push(("startTime", start.to_string()));
        }
        let result: ListResult<ClosedPnlDto> =
            self.signed_get("/v5/position/closed-pnl", &params).await?;
        // Venue returns newest-first
        let mut trades: Vec<ClosedTrade> = result
            .list
            .into_iter()
            .map(ClosedPnlDto::into_closed_trade)
            .collect();
        trades.reverse();
        Ok(trades)
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.as_str(),
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        let envelope = self.signed_post("/v5/position/set-leverage", &body).await?;
        if envelope.ret_code == RET_LEVERAGE_UNCHANGED {
            return Ok(());
        }
        Self::result::<serde_json::Value>("/v5/position/set-leverage", envelope).map(|_| ())
    }

    async fn place_market_order(&self, order: &MarketOrder) -> Result<String, ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": order.symbol.as_str(),
            "side": order.order_side(),
            "orderType": "Market",
            "qty": order.qty.normalize().to_string(),
            "reduceOnly": order.reduce_only,
            "orderLinkId": uuid::Uuid::new_v4().simple().to_string(),
        });
        let envelope = self.signed_post("/v5/order/create", &body).await?;
        let created: OrderCreatedDto = Self::result("/v5/order/create", envelope)?;
        if created.order_id.is_empty() {
            warn!(symbol = %order.symbol, "order accepted without an order id");
        }
        Ok(created.order_id)
    }

    async fn set_stop_loss(&self, symbol: &Symbol, price: Decimal) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.as_str(),
            "stopLoss": price.normalize().to_string(),
            "positionIdx": 0,
        });
        self.post_expect_ok("/v5/position/trading-stop", &body).await
    }

    async fn set_trailing_stop(
        &self,
        symbol: &Symbol,
        activation: Decimal,
        distance: Decimal,
    ) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol.as_str(),
            "activePrice": activation.normalize().to_string(),
            "trailingStop": distance.normalize().to_string(),
            "positionIdx": 0,
        });
        self.post_expect_ok("/v5/position/trading-stop", &body).await
    }

    async fn cancel_all_orders(&self) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "settleCoin": SETTLE_COIN,
        });
        self.post_expect_ok("/v5/order/cancel-all", &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(with_keys: bool) -> BybitRestClient {
        let (k, s) = if with_keys {
            (Some("key".to_string()), Some("secret".to_string()))
        } else {
            (None, None)
        };
        BybitRestClient::new("https://api.bybit.com/", Duration::from_secs(5), 5000, k, s).unwrap()
    }

    #[test]
    fn query_string_is_built_in_parameter_order() {
        let c = client(true);
        let url = c
            .url(
                "/v5/position/list",
                &[
                    ("category", "linear".to_string()),
                    ("settleCoin", "USDT".to_string()),
                ],
            )
            .unwrap();
        assert_eq!(url.query(), Some("category=linear&settleCoin=USDT"));
        assert_eq!(url.path(), "/v5/position/list");
    }

    #[test]
    fn private_calls_need_credentials() {
        let c = client(false);
        assert!(matches!(
            c.auth_headers("category=linear"),
            Err(ExchangeError::MissingCredentials)
        ));

        let headers = client(true).auth_headers("category=linear").unwrap();
        assert_eq!(headers.get(HEADER_API_KEY).unwrap(), "key");
        assert_eq!(headers.get(HEADER_RECV_WINDOW).unwrap(), "5000");
        assert_eq!(headers.get(HEADER_SIGN).unwrap().len(), 64);
    }

    #[test]
    fn non_zero_ret_code_is_rejection() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"retCode":10001,"retMsg":"params error","result":{}}"#)
                .unwrap();
        let err = BybitRestClient::result::<serde_json::Value>("/x", envelope).unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { code: 10001, .. }));
    }
}
