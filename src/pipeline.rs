use crate::catalog::{
    AdStore, Catalog, CatalogError, IngredientRegistry, StoreDirectory, TranslationCache,
};
use crate::classifier::{Classify, ClassifierError};
use crate::feed::{Feed, FeedError};
use crate::models::{
    AdLineItem, NewAd, NewIngredient, RawListing, StoreFeedKey, Translation,
};
use chrono::NaiveDate;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// The pipeline's external collaborators, bundled so the coordinator can
/// clone them into concurrent per-store runs.
#[derive(Clone)]
pub struct Pipeline {
    pub feed: Arc<dyn Feed>,
    pub classifier: Arc<dyn Classify>,
    pub catalog: Catalog,
}

impl Pipeline {
    pub fn new(feed: Arc<dyn Feed>, classifier: Arc<dyn Classify>, catalog: Catalog) -> Self {
        Self {
            feed,
            classifier,
            catalog,
        }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// Network or database hiccup; safe to retry.
    Transient,
    /// Feed or classifier payload failed strict parsing; retried a bounded
    /// number of times, then surfaced.
    UpstreamFormat,
    /// An invariant would be violated. Never retried.
    DataIntegrity,
    /// Bad caller input (unknown store id, malformed request).
    InvalidInput,
}

impl PipelineError {
    pub fn transient(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Transient,
        }
    }

    pub fn upstream_format(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::UpstreamFormat,
        }
    }

    pub fn data_integrity(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::DataIntegrity,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            PipelineErrorKind::Transient | PipelineErrorKind::UpstreamFormat
        )
    }

    fn from_catalog(stage: &'static str, err: CatalogError) -> Self {
        match err {
            CatalogError::Unavailable(message) => Self::transient(stage, message),
            CatalogError::Integrity(message) => Self::data_integrity(stage, message),
        }
    }

    fn from_feed(stage: &'static str, err: FeedError) -> Self {
        match err {
            FeedError::Request(message) => Self::transient(stage, message),
            FeedError::Format(message) => Self::upstream_format(stage, message),
        }
    }

    fn from_classifier(stage: &'static str, err: ClassifierError) -> Self {
        match err {
            ClassifierError::Llm(message) => Self::transient(stage, message),
            ClassifierError::Parse(message) => Self::upstream_format(stage, message),
        }
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// Result of the resolution stage: cache hits become line items, misses
/// carry their listing forward for classification.
#[derive(Debug, Default)]
pub struct ResolutionSplit {
    pub resolved: Vec<AdLineItem>,
    pub unresolved: Vec<RawListing>,
}

/// Keys a listing batch by raw name; the first occurrence wins, so one
/// lookup covers every duplicate and no ad ends up with two line items
/// for the same feed name.
fn dedupe_by_name(listings: &[RawListing]) -> Vec<RawListing> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for listing in listings {
        if seen.insert(listing.name.clone()) {
            unique.push(listing.clone());
        }
    }
    unique
}

pub mod stages {
    use super::*;

    pub async fn discover_stores(
        directory: &Arc<dyn StoreDirectory>,
        today: NaiveDate,
    ) -> Result<StageOutcome<Vec<StoreFeedKey>>, PipelineError> {
        let keys = directory
            .expired_ad_stores(today)
            .await
            .map_err(|err| PipelineError::from_catalog("discover_stores", err))?;
        let preview: Vec<i64> = keys.iter().take(8).map(|key| key.store_id).collect();
        Ok(StageOutcome::new(
            keys.clone(),
            json!({
                "count": keys.len(),
                "store_ids": preview,
                "as_of": today,
            }),
        ))
    }

    pub async fn fetch_listings(
        feed: &Arc<dyn Feed>,
        key: &StoreFeedKey,
    ) -> Result<StageOutcome<Vec<RawListing>>, PipelineError> {
        let listings = feed
            .fetch(&key.zip_code, &key.merchant)
            .await
            .map_err(|err| PipelineError::from_feed("fetch_listings", err))?;
        let preview: Vec<&str> = listings
            .iter()
            .take(3)
            .map(|listing| listing.name.as_str())
            .collect();
        Ok(StageOutcome::new(
            listings.clone(),
            json!({
                "count": listings.len(),
                "preview": preview,
                "zip_code": key.zip_code,
                "merchant": key.merchant,
            }),
        ))
    }

    pub async fn resolve_translations(
        cache: &Arc<dyn TranslationCache>,
        listings: &[RawListing],
    ) -> Result<StageOutcome<ResolutionSplit>, PipelineError> {
        let mut split = ResolutionSplit::default();
        for listing in dedupe_by_name(listings) {
            match cache
                .lookup(&listing.name)
                .await
                .map_err(|err| PipelineError::from_catalog("resolve_translations", err))?
            {
                Some(ingredient_id) => split.resolved.push(AdLineItem {
                    ingredient_id,
                    name: listing.name,
                    price: listing.current_price,
                    sale: listing.sale_text,
                }),
                None => split.unresolved.push(listing),
            }
        }
        let output = json!({
            "resolved": split.resolved.len(),
            "unresolved": split.unresolved.len(),
        });
        Ok(StageOutcome::new(split, output))
    }

    /// Resolves the unresolved set via the classifier: reuse an indexed
    /// ingredient when the canonical name already exists, otherwise
    /// profile + create-or-fetch it. One translation is written per raw
    /// name processed, existing ingredient or not, so the next sweep is a
    /// cache hit.
    pub async fn classify_unresolved(
        classifier: &Arc<dyn Classify>,
        registry: &Arc<dyn IngredientRegistry>,
        cache: &Arc<dyn TranslationCache>,
        unresolved: &[RawListing],
    ) -> Result<StageOutcome<Vec<AdLineItem>>, PipelineError> {
        let mut index = registry
            .name_index()
            .await
            .map_err(|err| PipelineError::from_catalog("classify_unresolved", err))?;

        let raw_names: Vec<String> = unresolved
            .iter()
            .map(|listing| listing.name.clone())
            .collect();
        let canonical_by_raw = classifier
            .simplify_names(&raw_names)
            .await
            .map_err(|err| PipelineError::from_classifier("classify_unresolved", err))?;

        let mut line_items = Vec::new();
        let mut translations = Vec::new();
        let mut created = 0usize;
        let mut skipped: Vec<&str> = Vec::new();

        for listing in unresolved {
            let Some(canonical) = canonical_by_raw
                .get(&listing.name)
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
            else {
                // Soft miss: the model skipped this one. Leave it
                // untranslated; the next sweep tries again.
                skipped.push(&listing.name);
                continue;
            };

            let ingredient_id = match index.get(canonical) {
                Some(id) => *id,
                None => {
                    let profile = classifier
                        .profile(canonical)
                        .await
                        .map_err(|err| PipelineError::from_classifier("classify_unresolved", err))?;
                    let (id, was_created) = registry
                        .create_or_fetch(&NewIngredient {
                            name: canonical.to_string(),
                            category: profile.category,
                            season: profile.season,
                        })
                        .await
                        .map_err(|err| PipelineError::from_catalog("classify_unresolved", err))?;
                    if was_created {
                        created += 1;
                    }
                    index.insert(canonical.to_string(), id);
                    id
                }
            };

            translations.push(Translation {
                name: listing.name.clone(),
                ingredient_id,
            });
            line_items.push(AdLineItem {
                ingredient_id,
                name: listing.name.clone(),
                price: listing.current_price,
                sale: listing.sale_text.clone(),
            });
        }

        cache
            .insert_many(&translations)
            .await
            .map_err(|err| PipelineError::from_catalog("classify_unresolved", err))?;

        let output = json!({
            "classified": line_items.len(),
            "created_ingredients": created,
            "skipped": skipped,
        });
        Ok(StageOutcome::new(line_items, output))
    }

    pub async fn commit_ad(
        ads: &Arc<dyn AdStore>,
        ad: &NewAd,
    ) -> Result<StageOutcome<i64>, PipelineError> {
        let ad_id = ads
            .commit(ad)
            .await
            .map_err(|err| PipelineError::from_catalog("commit_ad", err))?;
        Ok(StageOutcome::new(
            ad_id,
            json!({
                "ad_id": ad_id,
                "store_id": ad.store_id,
                "line_items": ad.line_items.len(),
                "sale_start": ad.sale_start,
                "sale_end": ad.sale_end,
            }),
        ))
    }
}

#[cfg(test)]
pub(crate) mod harness {
    use super::*;
    use crate::classifier::IngredientProfile;
    use crate::models::FoodCategory;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn listing(name: &str, price: f32, sale: Option<&str>) -> RawListing {
        RawListing {
            name: name.to_string(),
            current_price: Some(price),
            sale_text: sale.map(str::to_string),
            valid_from: day(2026, 8, 5),
            valid_to: day(2026, 8, 11),
        }
    }

    /// Scripted feed: listings keyed by merchant, an optional number of
    /// leading transient failures, and merchants that always fail.
    #[derive(Default)]
    pub struct StubFeed {
        pub by_merchant: std::sync::Mutex<HashMap<String, Vec<RawListing>>>,
        pub down_merchants: std::sync::Mutex<std::collections::HashSet<String>>,
        pub failures_remaining: AtomicUsize,
        pub calls: AtomicUsize,
    }

    impl StubFeed {
        pub fn with(merchant: &str, listings: Vec<RawListing>) -> Arc<Self> {
            let stub = Self::default();
            stub.by_merchant
                .lock()
                .unwrap()
                .insert(merchant.to_string(), listings);
            Arc::new(stub)
        }

        pub fn failing_times(self: Arc<Self>, failures: usize) -> Arc<Self> {
            self.failures_remaining.store(failures, Ordering::SeqCst);
            self
        }

        pub fn down_for(self: Arc<Self>, merchant: &str) -> Arc<Self> {
            self.down_merchants
                .lock()
                .unwrap()
                .insert(merchant.to_string());
            self
        }
    }

    #[async_trait]
    impl Feed for StubFeed {
        async fn fetch(
            &self,
            _zip_code: &str,
            merchant: &str,
        ) -> Result<Vec<RawListing>, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down_merchants.lock().unwrap().contains(merchant) {
                return Err(FeedError::Request("connection refused".into()));
            }
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FeedError::Request("connection reset".into()));
            }
            Ok(self
                .by_merchant
                .lock()
                .unwrap()
                .get(merchant)
                .cloned()
                .unwrap_or_default())
        }
    }

    /// Scripted classifier: canonical names and profiles come from fixed
    /// maps; call counts let tests assert the cache short-circuits.
    #[derive(Default)]
    pub struct StubClassifier {
        pub canonical: HashMap<String, String>,
        pub profiles: HashMap<String, IngredientProfile>,
        pub batch_calls: AtomicUsize,
        pub profile_calls: AtomicUsize,
        pub batch_failures_remaining: AtomicUsize,
    }

    impl StubClassifier {
        pub fn mapping(pairs: &[(&str, &str)]) -> Self {
            Self {
                canonical: pairs
                    .iter()
                    .map(|(raw, canonical)| (raw.to_string(), canonical.to_string()))
                    .collect(),
                ..Self::default()
            }
        }

        pub fn with_profile(mut self, name: &str, category: FoodCategory, season: Option<Vec<i32>>) -> Self {
            self.profiles
                .insert(name.to_string(), IngredientProfile { category, season });
            self
        }
    }

    #[async_trait]
    impl Classify for StubClassifier {
        async fn simplify_names(
            &self,
            raw_names: &[String],
        ) -> Result<HashMap<String, String>, ClassifierError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .batch_failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ClassifierError::Parse("mangled payload".into()));
            }
            Ok(raw_names
                .iter()
                .filter_map(|raw| {
                    self.canonical
                        .get(raw)
                        .map(|canonical| (raw.clone(), canonical.clone()))
                })
                .collect())
        }

        async fn profile(
            &self,
            canonical_name: &str,
        ) -> Result<IngredientProfile, ClassifierError> {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .profiles
                .get(canonical_name)
                .cloned()
                .unwrap_or(IngredientProfile {
                    category: FoodCategory::Other,
                    season: None,
                }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::harness::*;
    use super::*;
    use crate::catalog::memory::MemoryCatalog;
    use crate::models::FoodCategory;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    #[tokio::test]
    async fn resolution_splits_hits_from_misses_and_dedupes_names() {
        let catalog = MemoryCatalog::new();
        let pepper = catalog
            .seed_ingredient("bell peppers", FoodCategory::Vegetable, None)
            .await;
        catalog
            .seed_translation("Fresh Green Bell Pepper", pepper)
            .await;

        let listings = vec![
            listing("Fresh Green Bell Pepper", 1.99, None),
            listing("Chicken Breast", 4.5, Some("2 for $8")),
            listing("Fresh Green Bell Pepper", 2.49, None),
        ];
        let cache: Arc<dyn TranslationCache> = catalog.clone();
        let out = stages::resolve_translations(&cache, &listings)
            .await
            .unwrap();

        assert_eq!(out.value.resolved.len(), 1);
        assert_eq!(out.value.resolved[0].ingredient_id, pepper);
        // first occurrence wins
        assert_eq!(out.value.resolved[0].price, Some(1.99));
        assert_eq!(out.value.unresolved.len(), 1);
        assert_eq!(out.value.unresolved[0].name, "Chicken Breast");
    }

    #[tokio::test]
    async fn classification_reuses_existing_ingredients_and_creates_new_ones() {
        let catalog = MemoryCatalog::new();
        let chicken = catalog
            .seed_ingredient("chicken breast", FoodCategory::Meat, None)
            .await;

        let classifier = Arc::new(
            StubClassifier::mapping(&[
                ("Fresh Green Bell Pepper", "bell peppers"),
                ("Family Pack Chicken Breast", "chicken breast"),
            ])
            .with_profile("bell peppers", FoodCategory::Vegetable, Some(vec![6, 7, 8, 9])),
        );
        let unresolved = vec![
            listing("Fresh Green Bell Pepper", 1.99, None),
            listing("Family Pack Chicken Breast", 4.5, Some("2 for $8")),
        ];

        let classify: Arc<dyn Classify> = classifier.clone();
        let registry: Arc<dyn IngredientRegistry> = catalog.clone();
        let cache: Arc<dyn TranslationCache> = catalog.clone();
        let out = stages::classify_unresolved(&classify, &registry, &cache, &unresolved)
            .await
            .unwrap();

        assert_eq!(out.value.len(), 2);
        let chicken_item = out
            .value
            .iter()
            .find(|item| item.name == "Family Pack Chicken Breast")
            .unwrap();
        assert_eq!(chicken_item.ingredient_id, chicken);

        // only the novel canonical name was profiled
        assert_eq!(classifier.profile_calls.load(Ordering::SeqCst), 1);
        let ingredients = catalog.ingredients().await;
        assert_eq!(ingredients.len(), 2);
        let peppers = ingredients
            .iter()
            .find(|ingredient| ingredient.name == "bell peppers")
            .unwrap();
        assert_eq!(peppers.category, FoodCategory::Vegetable);
        assert_eq!(peppers.season, Some(vec![6, 7, 8, 9]));

        // a translation is written even for the reused ingredient
        assert_eq!(catalog.translations().await.len(), 2);
    }

    #[tokio::test]
    async fn same_canonical_name_in_one_batch_creates_one_ingredient() {
        let catalog = MemoryCatalog::new();
        let classifier = Arc::new(StubClassifier::mapping(&[
            ("Green Peppers and Cucumbers", "vegetables"),
            ("Mixed Garden Vegetables", "vegetables"),
        ]));
        let unresolved = vec![
            listing("Green Peppers and Cucumbers", 3.0, None),
            listing("Mixed Garden Vegetables", 4.0, None),
        ];

        let classify: Arc<dyn Classify> = classifier.clone();
        let registry: Arc<dyn IngredientRegistry> = catalog.clone();
        let cache: Arc<dyn TranslationCache> = catalog.clone();
        let out = stages::classify_unresolved(&classify, &registry, &cache, &unresolved)
            .await
            .unwrap();

        assert_eq!(out.value.len(), 2);
        assert_eq!(out.value[0].ingredient_id, out.value[1].ingredient_id);
        assert_eq!(catalog.ingredients().await.len(), 1);
        assert_eq!(classifier.profile_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_batches_share_one_ingredient_row() {
        let catalog = MemoryCatalog::new();
        let mut handles = Vec::new();
        for raw in ["Fresh Avocados", "Large Hass Avocados"] {
            let classifier: Arc<dyn Classify> =
                Arc::new(StubClassifier::mapping(&[(raw, "avocados")]));
            let registry: Arc<dyn IngredientRegistry> = catalog.clone();
            let cache: Arc<dyn TranslationCache> = catalog.clone();
            let unresolved = vec![listing(raw, 0.99, None)];
            handles.push(tokio::spawn(async move {
                stages::classify_unresolved(&classifier, &registry, &cache, &unresolved)
                    .await
                    .unwrap()
                    .value
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            let items = handle.await.unwrap();
            ids.push(items[0].ingredient_id);
        }
        assert_eq!(ids[0], ids[1]);
        assert_eq!(catalog.ingredients().await.len(), 1);
    }

    #[tokio::test]
    async fn soft_miss_skips_the_name_without_failing_the_batch() {
        let catalog = MemoryCatalog::new();
        let classifier = Arc::new(StubClassifier::mapping(&[(
            "Fresh Green Bell Pepper",
            "bell peppers",
        )]));
        let unresolved = vec![
            listing("Fresh Green Bell Pepper", 1.99, None),
            listing("Limited Time Mystery Box", 9.99, None),
        ];

        let classify: Arc<dyn Classify> = classifier.clone();
        let registry: Arc<dyn IngredientRegistry> = catalog.clone();
        let cache: Arc<dyn TranslationCache> = catalog.clone();
        let out = stages::classify_unresolved(&classify, &registry, &cache, &unresolved)
            .await
            .unwrap();

        assert_eq!(out.value.len(), 1);
        assert_eq!(out.value[0].name, "Fresh Green Bell Pepper");
        assert_eq!(catalog.translations().await.len(), 1);
        assert_eq!(out.output["skipped"], json!(["Limited Time Mystery Box"]));
    }

    #[tokio::test]
    async fn classifier_failure_persists_nothing_and_is_retryable() {
        let catalog = MemoryCatalog::new();
        let classifier = StubClassifier::mapping(&[("Fresh Avocados", "avocados")]);
        classifier.batch_failures_remaining.store(1, Ordering::SeqCst);
        let classify: Arc<dyn Classify> = Arc::new(classifier);
        let registry: Arc<dyn IngredientRegistry> = catalog.clone();
        let cache: Arc<dyn TranslationCache> = catalog.clone();
        let unresolved = vec![listing("Fresh Avocados", 0.99, None)];

        let err = stages::classify_unresolved(&classify, &registry, &cache, &unresolved)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "classify_unresolved");
        assert_eq!(err.kind(), PipelineErrorKind::UpstreamFormat);
        assert!(err.is_retryable());
        assert!(catalog.translations().await.is_empty());
        assert!(catalog.ingredients().await.is_empty());
    }

    #[tokio::test]
    async fn commit_stage_reports_the_ad_shape() {
        let catalog = MemoryCatalog::new();
        let salmon = catalog
            .seed_ingredient("salmon", FoodCategory::Seafood, None)
            .await;
        let ads: Arc<dyn AdStore> = catalog.clone();
        let ad = NewAd {
            run_id: Uuid::new_v4(),
            store_id: 4,
            sale_start: day(2026, 8, 5),
            sale_end: day(2026, 8, 11),
            line_items: vec![AdLineItem {
                ingredient_id: salmon,
                name: "Atlantic Salmon Fillet".into(),
                price: Some(9.99),
                sale: None,
            }],
        };
        let out = stages::commit_ad(&ads, &ad).await.unwrap();
        assert_eq!(out.output["line_items"], json!(1));
        assert_eq!(catalog.ads().await[0].id, out.value);
    }
}
