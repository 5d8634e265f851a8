//! Upstream fetch collaborators
//!
//! `PriceSource` and `RateSource` are the only seams between the engine and
//! the network. Implementations absorb every transport, status and parse
//! failure and report it as `None`; nothing raises past `fetch`.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, ORIGIN, REFERER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::SourceError;
use crate::history::RawPriceQuote;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const TREASURY_ORIGIN: &str = "https://treasury.id";
const FINANCE_CONSENT_COOKIE: &str = "CONSENT=YES+cb.20231208-04-p0.en+FX+410";
const QUOTE_PRICE_PATTERN: &str =
    r#"<div[^>]*class="[^"]*YMlKec fxKbKc[^"]*"[^>]*>\s*([^<]+?)\s*</div>"#;

/// Source of gold buy/sell quotes.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self) -> Option<RawPriceQuote>;
}

/// Source of the USD-IDR quote text.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> Option<String>;
}

/// Pooled HTTP client shared by both sources.
pub fn build_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(6))
        .pool_max_idle_per_host(50)
        .pool_idle_timeout(Duration::from_secs(120))
        .build()
}

/// Numbers and strings are both accepted for rate fields.
fn field_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Pull the quote fields out of a gold-rate API body. Missing fields are left
/// empty for the history store to reject; only a non-object body fails.
pub fn parse_price_payload(body: &Value) -> Option<RawPriceQuote> {
    let body = body.as_object()?;
    let data = body.get("data");
    Some(RawPriceQuote {
        buying_rate: field_text(data.and_then(|d| d.get("buying_rate"))),
        selling_rate: field_text(data.and_then(|d| d.get("selling_rate"))),
        updated_at: field_text(data.and_then(|d| d.get("updated_at"))),
    })
}

/// Gold-rate API client.
pub struct TreasuryPriceSource {
    client: Client,
    url: String,
}

impl TreasuryPriceSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    async fn fetch_quote(&self) -> Result<RawPriceQuote, SourceError> {
        let resp = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(ORIGIN, TREASURY_ORIGIN)
            .header(REFERER, format!("{}/", TREASURY_ORIGIN))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(SourceError::Status(resp.status().as_u16()));
        }

        let body: Value = resp.json().await?;
        parse_price_payload(&body).ok_or_else(|| SourceError::Parse("body is not an object".into()))
    }
}

#[async_trait]
impl PriceSource for TreasuryPriceSource {
    async fn fetch(&self) -> Option<RawPriceQuote> {
        match self.fetch_quote().await {
            Ok(quote) => Some(quote),
            Err(e) => {
                debug!(error = %e, "Price fetch failed");
                None
            }
        }
    }
}

/// Finance quote page scraper for USD-IDR.
pub struct FinanceRateSource {
    client: Client,
    url: String,
    pattern: Regex,
}

impl FinanceRateSource {
    pub fn new(client: Client, url: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            client,
            url: url.into(),
            pattern: Regex::new(QUOTE_PRICE_PATTERN)?,
        })
    }

    /// Price text of the first quote element in `html`.
    pub fn extract_price(&self, html: &str) -> Option<String> {
        self.pattern
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    async fn fetch_price(&self) -> Result<String, SourceError> {
        let resp = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .header(COOKIE, FINANCE_CONSENT_COOKIE)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(SourceError::Status(resp.status().as_u16()));
        }

        let html = resp.text().await?;
        self.extract_price(&html)
            .ok_or_else(|| SourceError::Parse("quote element not found".into()))
    }
}

#[async_trait]
impl RateSource for FinanceRateSource {
    async fn fetch(&self) -> Option<String> {
        match self.fetch_price().await {
            Ok(price) => Some(price),
            Err(e) => {
                debug!(error = %e, "Rate fetch failed");
                None
            }
        }
    }
}
