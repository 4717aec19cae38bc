//! In-process catalog used by tests and by databaseless demo runs. The
//! whole state sits behind one lock, which makes `create_or_fetch` and
//! `commit` atomic the same way the Postgres constraints do.

use super::{
    AdStore, Catalog, CatalogError, IngredientRegistry, StoreDirectory, TranslationCache,
    zip_from_location,
};
use crate::models::{
    AdLineItem, FoodCategory, Ingredient, NewAd, NewIngredient, StoreFeedKey, Translation,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredAd {
    pub id: i64,
    pub run_id: Uuid,
    pub store_id: i64,
    pub sale_start: NaiveDate,
    pub sale_end: NaiveDate,
    pub line_items: Vec<AdLineItem>,
}

#[derive(Debug, Clone)]
struct StoreRecord {
    id: i64,
    location: String,
    merchant: String,
}

#[derive(Default)]
struct State {
    stores: Vec<StoreRecord>,
    ads: Vec<StoredAd>,
    ingredients: Vec<Ingredient>,
    translations: Vec<Translation>,
    next_ingredient_id: i64,
    next_ad_id: i64,
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
}

impl MemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn catalog(self: &Arc<Self>) -> Catalog {
        Catalog {
            stores: self.clone(),
            translations: self.clone(),
            ingredients: self.clone(),
            ads: self.clone(),
        }
    }

    pub async fn add_store(&self, id: i64, location: &str, merchant: &str) {
        self.state.lock().await.stores.push(StoreRecord {
            id,
            location: location.to_string(),
            merchant: merchant.to_string(),
        });
    }

    pub async fn seed_ingredient(
        &self,
        name: &str,
        category: FoodCategory,
        season: Option<Vec<i32>>,
    ) -> i64 {
        let mut state = self.state.lock().await;
        state.next_ingredient_id += 1;
        let id = state.next_ingredient_id;
        state.ingredients.push(Ingredient {
            id,
            name: name.to_string(),
            category,
            season,
        });
        id
    }

    pub async fn seed_translation(&self, name: &str, ingredient_id: i64) {
        self.state.lock().await.translations.push(Translation {
            name: name.to_string(),
            ingredient_id,
        });
    }

    pub async fn seed_ad(&self, store_id: i64, sale_start: NaiveDate, sale_end: NaiveDate) {
        let mut state = self.state.lock().await;
        state.next_ad_id += 1;
        let id = state.next_ad_id;
        state.ads.push(StoredAd {
            id,
            run_id: Uuid::new_v4(),
            store_id,
            sale_start,
            sale_end,
            line_items: Vec::new(),
        });
    }

    pub async fn ads(&self) -> Vec<StoredAd> {
        self.state.lock().await.ads.clone()
    }

    pub async fn ingredients(&self) -> Vec<Ingredient> {
        self.state.lock().await.ingredients.clone()
    }

    pub async fn translations(&self) -> Vec<Translation> {
        self.state.lock().await.translations.clone()
    }
}

#[async_trait]
impl StoreDirectory for MemoryCatalog {
    async fn expired_ad_stores(&self, today: NaiveDate) -> Result<Vec<StoreFeedKey>, CatalogError> {
        let state = self.state.lock().await;
        let mut keys = Vec::new();
        for store in &state.stores {
            let latest_end = state
                .ads
                .iter()
                .filter(|ad| ad.store_id == store.id)
                .map(|ad| ad.sale_end)
                .max();
            if latest_end.is_none_or(|end| end < today) {
                keys.push(StoreFeedKey {
                    store_id: store.id,
                    zip_code: zip_from_location(&store.location),
                    merchant: store.merchant.clone(),
                });
            }
        }
        Ok(keys)
    }

    async fn feed_key(&self, store_id: i64) -> Result<Option<StoreFeedKey>, CatalogError> {
        let state = self.state.lock().await;
        Ok(state
            .stores
            .iter()
            .find(|store| store.id == store_id)
            .map(|store| StoreFeedKey {
                store_id: store.id,
                zip_code: zip_from_location(&store.location),
                merchant: store.merchant.clone(),
            }))
    }
}

#[async_trait]
impl TranslationCache for MemoryCatalog {
    async fn lookup(&self, raw_name: &str) -> Result<Option<i64>, CatalogError> {
        let state = self.state.lock().await;
        Ok(state
            .translations
            .iter()
            .find(|translation| translation.name == raw_name)
            .map(|translation| translation.ingredient_id))
    }

    async fn insert_many(&self, translations: &[Translation]) -> Result<(), CatalogError> {
        let mut state = self.state.lock().await;
        for translation in translations {
            if !state.translations.contains(translation) {
                state.translations.push(translation.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IngredientRegistry for MemoryCatalog {
    async fn name_index(&self) -> Result<HashMap<String, i64>, CatalogError> {
        let state = self.state.lock().await;
        Ok(state
            .ingredients
            .iter()
            .map(|ingredient| (ingredient.name.clone(), ingredient.id))
            .collect())
    }

    async fn create_or_fetch(
        &self,
        ingredient: &NewIngredient,
    ) -> Result<(i64, bool), CatalogError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .ingredients
            .iter()
            .find(|candidate| candidate.name == ingredient.name)
        {
            return Ok((existing.id, false));
        }
        state.next_ingredient_id += 1;
        let id = state.next_ingredient_id;
        state.ingredients.push(Ingredient {
            id,
            name: ingredient.name.clone(),
            category: ingredient.category,
            season: ingredient.season.clone(),
        });
        Ok((id, true))
    }
}

#[async_trait]
impl AdStore for MemoryCatalog {
    async fn commit(&self, ad: &NewAd) -> Result<i64, CatalogError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.ads.iter().find(|stored| stored.run_id == ad.run_id) {
            return Ok(existing.id);
        }
        for item in &ad.line_items {
            if !state
                .ingredients
                .iter()
                .any(|ingredient| ingredient.id == item.ingredient_id)
            {
                return Err(CatalogError::Integrity(format!(
                    "line item `{}` references missing ingredient {}",
                    item.name, item.ingredient_id
                )));
            }
        }
        state.next_ad_id += 1;
        let id = state.next_ad_id;
        state.ads.push(StoredAd {
            id,
            run_id: ad.run_id,
            store_id: ad.store_id,
            sale_start: ad.sale_start,
            sale_end: ad.sale_end,
            line_items: ad.line_items.clone(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn discovery_returns_expired_and_never_advertised_stores() {
        let catalog = MemoryCatalog::new();
        catalog.add_store(1, "10 Elm St, Boston 02139", "marketbasket").await;
        catalog.add_store(2, "8 Oak Ave, Boston 02140", "shaws").await;
        catalog.add_store(3, "1 Pine Rd, Boston 02141", "wegmans").await;
        // store 1: expired ad, store 2: still-current ad, store 3: no ad
        catalog.seed_ad(1, day(2026, 7, 20), day(2026, 7, 27)).await;
        catalog.seed_ad(2, day(2026, 8, 1), day(2026, 8, 9)).await;

        let keys = catalog.expired_ad_stores(day(2026, 8, 6)).await.unwrap();
        let ids: Vec<i64> = keys.iter().map(|key| key.store_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(keys[0].zip_code, "02139");
        assert_eq!(keys[0].merchant, "marketbasket");
    }

    #[tokio::test]
    async fn discovery_treats_window_ending_today_as_current() {
        let catalog = MemoryCatalog::new();
        catalog.add_store(1, "10 Elm St, Boston 02139", "marketbasket").await;
        catalog.seed_ad(1, day(2026, 7, 30), day(2026, 8, 6)).await;
        let keys = catalog.expired_ad_stores(day(2026, 8, 6)).await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn create_or_fetch_is_atomic_across_tasks() {
        let catalog = MemoryCatalog::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = catalog.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .create_or_fetch(&NewIngredient {
                        name: "bell peppers".into(),
                        category: FoodCategory::Vegetable,
                        season: Some(vec![6, 7, 8, 9]),
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut created = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let (id, was_created) = handle.await.unwrap();
            ids.push(id);
            if was_created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(catalog.ingredients().await.len(), 1);
    }

    #[tokio::test]
    async fn commit_is_idempotent_per_run() {
        let catalog = MemoryCatalog::new();
        let ingredient_id = catalog
            .seed_ingredient("chicken breast", FoodCategory::Meat, None)
            .await;
        let ad = NewAd {
            run_id: Uuid::new_v4(),
            store_id: 1,
            sale_start: day(2026, 8, 5),
            sale_end: day(2026, 8, 11),
            line_items: vec![AdLineItem {
                ingredient_id,
                name: "Chicken Breast".into(),
                price: Some(4.5),
                sale: None,
            }],
        };
        let first = catalog.commit(&ad).await.unwrap();
        let second = catalog.commit(&ad).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(catalog.ads().await.len(), 1);
    }

    #[tokio::test]
    async fn commit_rejects_dangling_ingredient_references() {
        let catalog = MemoryCatalog::new();
        let ad = NewAd {
            run_id: Uuid::new_v4(),
            store_id: 1,
            sale_start: day(2026, 8, 5),
            sale_end: day(2026, 8, 11),
            line_items: vec![AdLineItem {
                ingredient_id: 99,
                name: "Ghost Item".into(),
                price: None,
                sale: None,
            }],
        };
        let err = catalog.commit(&ad).await.unwrap_err();
        assert!(matches!(err, CatalogError::Integrity(_)));
        assert!(catalog.ads().await.is_empty());
    }

    #[tokio::test]
    async fn translation_reinsertion_is_a_noop() {
        let catalog = MemoryCatalog::new();
        let translations = vec![Translation {
            name: "Fresh Green Bell Pepper".into(),
            ingredient_id: 1,
        }];
        catalog.insert_many(&translations).await.unwrap();
        catalog.insert_many(&translations).await.unwrap();
        assert_eq!(catalog.translations().await.len(), 1);
        assert_eq!(
            catalog.lookup("Fresh Green Bell Pepper").await.unwrap(),
            Some(1)
        );
        assert_eq!(catalog.lookup("Unknown").await.unwrap(), None);
    }
}
