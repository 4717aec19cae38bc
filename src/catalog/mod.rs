use crate::models::{NewAd, NewIngredient, StoreFeedKey, Translation};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
}

/// Read side of the store table used by discovery.
#[async_trait]
pub trait StoreDirectory: Send + Sync {
    /// Stores whose latest ad's validity window ended before `today`,
    /// plus stores that have never had an ad. Full set or error.
    async fn expired_ad_stores(&self, today: NaiveDate) -> Result<Vec<StoreFeedKey>, CatalogError>;

    /// Feed lookup key for a single store, for on-demand runs.
    async fn feed_key(&self, store_id: i64) -> Result<Option<StoreFeedKey>, CatalogError>;
}

/// Raw feed name -> ingredient id cache. Not a source of truth; the
/// ingredient registry is authoritative.
#[async_trait]
pub trait TranslationCache: Send + Sync {
    async fn lookup(&self, raw_name: &str) -> Result<Option<i64>, CatalogError>;

    /// Append-mostly bulk insert; re-inserting the same logical mapping
    /// must be tolerated so a retried stage can re-issue its writes.
    async fn insert_many(&self, translations: &[Translation]) -> Result<(), CatalogError>;
}

#[async_trait]
pub trait IngredientRegistry: Send + Sync {
    /// Full canonical-name -> id index, used for exact-name reuse.
    async fn name_index(&self) -> Result<HashMap<String, i64>, CatalogError>;

    /// Atomic check-then-create on the unique canonical name; concurrent
    /// callers racing on the same name all receive the same id. Returns
    /// the id and whether this call created the row.
    async fn create_or_fetch(
        &self,
        ingredient: &NewIngredient,
    ) -> Result<(i64, bool), CatalogError>;
}

#[async_trait]
pub trait AdStore: Send + Sync {
    /// Persists the ad and all line items as one atomic unit, keyed by
    /// the run id: a replayed commit returns the existing ad id instead
    /// of writing a duplicate.
    async fn commit(&self, ad: &NewAd) -> Result<i64, CatalogError>;
}

/// The four contracts bundled for the pipeline; implementations share one
/// backing store.
#[derive(Clone)]
pub struct Catalog {
    pub stores: Arc<dyn StoreDirectory>,
    pub translations: Arc<dyn TranslationCache>,
    pub ingredients: Arc<dyn IngredientRegistry>,
    pub ads: Arc<dyn AdStore>,
}

/// Store locations end in the five-digit zip the feed is keyed by.
pub(crate) fn zip_from_location(location: &str) -> String {
    let trimmed = location.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= 5 {
        return trimmed.to_string();
    }
    chars[chars.len() - 5..].iter().collect()
}
