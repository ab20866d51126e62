//! Market mood indicator (Fear & Greed index)
//!
//! Used only to modulate position size, never to gate entries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Extreme fear below this reading
pub const EXTREME_FEAR: u32 = 20;
/// Extreme greed above this reading
pub const EXTREME_GREED: u32 = 75;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodIndex {
    /// 0 (extreme fear) to 100 (extreme greed)
    pub value: u32,
    pub label: String,
}

impl Default for MoodIndex {
    fn default() -> Self {
        Self {
            value: 50,
            label: "Neutral".to_string(),
        }
    }
}

impl MoodIndex {
    /// Size up into fear, down into greed
    pub fn sentiment_multiplier(&self) -> f64 {
        if self.value < EXTREME_FEAR {
            1.25
        } else if self.value > EXTREME_GREED {
            0.75
        } else {
            1.0
        }
    }
}

#[derive(Debug, Deserialize)]
struct FngResponse {
    data: Vec<FngEntry>,
}

#[derive(Debug, Deserialize)]
struct FngEntry {
    value: String,
    value_classification: String,
}

/// Anything that can produce a mood reading
#[async_trait]
pub trait MoodSource: Send + Sync {
    async fn fetch(&self) -> Result<MoodIndex>;
}

/// alternative.me Fear & Greed client
pub struct MoodClient {
    client: Client,
    url: String,
}

#[async_trait]
impl MoodSource for MoodClient {
    async fn fetch(&self) -> Result<MoodIndex> {
        self.fetch_index().await
    }
}

impl MoodClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn fetch_index(&self) -> Result<MoodIndex> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Fear & Greed request failed")?
            .error_for_status()?
            .text()
            .await?;
        parse_mood(&body)
    }
}

fn parse_mood(body: &str) -> Result<MoodIndex> {
    let parsed: FngResponse = serde_json::from_str(body).context("Bad Fear & Greed payload")?;
    let entry = parsed
        .data
        .into_iter()
        .next()
        .context("Fear & Greed payload has no data")?;
    Ok(MoodIndex {
        value: entry
            .value
            .trim()
            .parse()
            .context("Fear & Greed value is not a number")?,
        label: entry.value_classification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_bands() {
        let at = |value| MoodIndex {
            value,
            label: String::new(),
        };
        assert_eq!(at(10).sentiment_multiplier(), 1.25);
        assert_eq!(at(20).sentiment_multiplier(), 1.0);
        assert_eq!(at(50).sentiment_multiplier(), 1.0);
        assert_eq!(at(75).sentiment_multiplier(), 1.0);
        assert_eq!(at(90).sentiment_multiplier(), 0.75);
        assert_eq!(MoodIndex::default().sentiment_multiplier(), 1.0);
    }

    #[test]
    fn parses_api_payload() {
        let body = r#"{"name":"Fear and Greed Index","data":[{"value":"18","value_classification":"Extreme Fear","timestamp":"1700000000"}]}"#;
        let mood = parse_mood(body).unwrap();
        assert_eq!(mood.value, 18);
        assert_eq!(mood.label, "Extreme Fear");
    }

    #[test]
    fn empty_payload_is_error() {
        assert!(parse_mood(r#"{"data":[]}"#).is_err());
        assert!(parse_mood("not json").is_err());
    }
}
