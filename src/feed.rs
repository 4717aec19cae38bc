use crate::http::build_client;
use crate::models::RawListing;
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use serde_with::{NoneAsEmptyString, serde_as};
use thiserror::Error;

/// Category label the feed uses for grocery food items. Everything else is
/// dropped before the client returns.
const FOOD_CATEGORY_LABEL: &str = "Food Items";

static BASE_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("FEED_BASE_URL")
        .unwrap_or_else(|_| "https://backflipp.wishabi.com/flipp".to_string())
});

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected payload: {0}")]
    Format(String),
}

/// Promotional-listing source for a (zip code, merchant) pair.
#[async_trait]
pub trait Feed: Send + Sync {
    async fn fetch(&self, zip_code: &str, merchant: &str) -> Result<Vec<RawListing>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct FeedClient {
    base_url: String,
    http: Client,
}

impl FeedClient {
    pub fn from_env() -> Self {
        Self {
            base_url: BASE_URL.trim_end_matches('/').to_string(),
            http: build_client(),
        }
    }
}

#[async_trait]
impl Feed for FeedClient {
    async fn fetch(&self, zip_code: &str, merchant: &str) -> Result<Vec<RawListing>, FeedError> {
        let url = format!(
            "{}/items/search?locale=en&postal_code={}&q={}",
            self.base_url,
            urlencoding::encode(zip_code),
            urlencoding::encode(merchant),
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FeedError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(FeedError::Request(format!("HTTP {}", response.status())));
        }

        let envelope: FeedEnvelope = response
            .json()
            .await
            .map_err(|err| FeedError::Format(err.to_string()))?;

        food_listings(envelope)
    }
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    #[serde(default)]
    items: Vec<FeedItem>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct FeedItem {
    #[serde(rename = "_L2", default)]
    category_label: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    current_price: Option<f32>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    post_price_text: Option<String>,
    #[serde(default)]
    valid_from: Option<String>,
    #[serde(default)]
    valid_to: Option<String>,
}

/// Keeps only food items and converts them into `RawListing`s. Items
/// without a name are dropped; a food item with an unparseable validity
/// window fails the whole batch.
fn food_listings(envelope: FeedEnvelope) -> Result<Vec<RawListing>, FeedError> {
    let mut listings = Vec::new();
    for item in envelope.items {
        if item.category_label.as_deref() != Some(FOOD_CATEGORY_LABEL) {
            continue;
        }
        let Some(name) = item.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
            continue;
        };
        listings.push(RawListing {
            name: name.to_string(),
            current_price: item.current_price,
            sale_text: item.post_price_text.clone(),
            valid_from: parse_feed_date(item.valid_from.as_deref(), "valid_from")?,
            valid_to: parse_feed_date(item.valid_to.as_deref(), "valid_to")?,
        });
    }
    Ok(listings)
}

/// The feed emits either a bare ISO date or a full timestamp; only the
/// date part matters for the validity window.
fn parse_feed_date(raw: Option<&str>, field: &str) -> Result<NaiveDate, FeedError> {
    let raw = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| FeedError::Format(format!("missing {field}")))?;
    let date_part = if raw.len() >= 10 { &raw[..10] } else { raw };
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|_| FeedError::Format(format!("invalid {field}: {raw}")))
}
