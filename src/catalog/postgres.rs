//! Postgres-backed catalog. Assumed tables (schema management lives with
//! the migration tooling, not here):
//!
//! - `store (id bigserial, name text, location text, flipp_merchant text)`
//! - `ad (id bigserial, run_id uuid unique, store_id bigint, sale_start date, sale_end date)`
//! - `ad_ingredient (ad_id bigint, ingredient_id bigint, name text, price real, sale text)`
//! - `ingredient (id bigserial, name text unique, category text, season int[])`
//! - `translation (name text, ingredient_id bigint)`

use super::{
    AdStore, Catalog, CatalogError, IngredientRegistry, StoreDirectory, TranslationCache,
    zip_from_location,
};
use crate::models::{NewAd, NewIngredient, StoreFeedKey, Translation};
use async_trait::async_trait;
use chrono::NaiveDate;
use eyre::Result;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    let max_connections = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(8);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;
    info!(target = "larder.catalog", "connected to postgres");
    Ok(pool)
}

#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn into_catalog(self) -> Catalog {
        let shared = Arc::new(self);
        Catalog {
            stores: shared.clone(),
            translations: shared.clone(),
            ingredients: shared.clone(),
            ads: shared,
        }
    }
}

fn unavailable(err: sqlx::Error) -> CatalogError {
    CatalogError::Unavailable(err.to_string())
}

#[async_trait]
impl StoreDirectory for PgCatalog {
    async fn expired_ad_stores(&self, today: NaiveDate) -> Result<Vec<StoreFeedKey>, CatalogError> {
        let rows = sqlx::query(
            "SELECT s.id, s.location, s.flipp_merchant \
             FROM store s LEFT JOIN ad a ON a.store_id = s.id \
             GROUP BY s.id, s.location, s.flipp_merchant \
             HAVING max(a.sale_end) IS NULL OR max(a.sale_end) < $1",
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(|row| StoreFeedKey {
                store_id: row.get("id"),
                zip_code: zip_from_location(row.get("location")),
                merchant: row.get("flipp_merchant"),
            })
            .collect())
    }

    async fn feed_key(&self, store_id: i64) -> Result<Option<StoreFeedKey>, CatalogError> {
        let row = sqlx::query("SELECT id, location, flipp_merchant FROM store WHERE id = $1")
            .bind(store_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(row.map(|row| StoreFeedKey {
            store_id: row.get("id"),
            zip_code: zip_from_location(row.get("location")),
            merchant: row.get("flipp_merchant"),
        }))
    }
}

#[async_trait]
impl TranslationCache for PgCatalog {
    async fn lookup(&self, raw_name: &str) -> Result<Option<i64>, CatalogError> {
        sqlx::query_scalar("SELECT ingredient_id FROM translation WHERE name = $1 LIMIT 1")
            .bind(raw_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)
    }

    async fn insert_many(&self, translations: &[Translation]) -> Result<(), CatalogError> {
        if translations.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = translations.iter().map(|t| t.name.as_str()).collect();
        let ids: Vec<i64> = translations.iter().map(|t| t.ingredient_id).collect();
        sqlx::query(
            "INSERT INTO translation (name, ingredient_id) \
             SELECT * FROM UNNEST($1::text[], $2::bigint[]) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&names)
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl IngredientRegistry for PgCatalog {
    async fn name_index(&self) -> Result<HashMap<String, i64>, CatalogError> {
        let rows = sqlx::query("SELECT id, name FROM ingredient")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("name"), row.get::<i64, _>("id")))
            .collect())
    }

    async fn create_or_fetch(
        &self,
        ingredient: &NewIngredient,
    ) -> Result<(i64, bool), CatalogError> {
        // The no-op DO UPDATE makes RETURNING yield a row on both paths;
        // xmax = 0 distinguishes a fresh insert from a lost race.
        let row = sqlx::query(
            "INSERT INTO ingredient (name, category, season) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING id, (xmax = 0) AS created",
        )
        .bind(&ingredient.name)
        .bind(ingredient.category.as_str())
        .bind(&ingredient.season)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok((row.get("id"), row.get("created")))
    }
}

#[async_trait]
impl AdStore for PgCatalog {
    async fn commit(&self, ad: &NewAd) -> Result<i64, CatalogError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM ad WHERE run_id = $1")
            .bind(ad.run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;
        if let Some(ad_id) = existing {
            return Ok(ad_id);
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO ad (run_id, store_id, sale_start, sale_end) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(ad.run_id)
        .bind(ad.store_id)
        .bind(ad.sale_start)
        .bind(ad.sale_end)
        .fetch_one(&mut *tx)
        .await;

        let ad_id = match inserted {
            Ok(ad_id) => ad_id,
            // A sibling process replayed the same run first; its ad wins.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                drop(tx);
                return sqlx::query_scalar("SELECT id FROM ad WHERE run_id = $1")
                    .bind(ad.run_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(unavailable);
            }
            Err(err) => return Err(unavailable(err)),
        };

        if !ad.line_items.is_empty() {
            let ad_ids: Vec<i64> = ad.line_items.iter().map(|_| ad_id).collect();
            let ingredient_ids: Vec<i64> =
                ad.line_items.iter().map(|item| item.ingredient_id).collect();
            let names: Vec<&str> = ad.line_items.iter().map(|item| item.name.as_str()).collect();
            let prices: Vec<Option<f32>> = ad.line_items.iter().map(|item| item.price).collect();
            let sales: Vec<Option<String>> =
                ad.line_items.iter().map(|item| item.sale.clone()).collect();
            sqlx::query(
                "INSERT INTO ad_ingredient (ad_id, ingredient_id, name, price, sale) \
                 SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::text[], $4::real[], $5::text[])",
            )
            .bind(&ad_ids)
            .bind(&ingredient_ids)
            .bind(&names)
            .bind(&prices)
            .bind(&sales)
            .execute(&mut *tx)
            .await
            .map_err(|err| match err {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    CatalogError::Integrity(format!("line item references missing row: {db}"))
                }
                other => unavailable(other),
            })?;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(ad_id)
    }
}
