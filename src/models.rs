use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Feed lookup key for one store, as emitted by store discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFeedKey {
    pub store_id: i64,
    pub zip_code: String,
    pub merchant: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub id: i64,
    pub name: String,
    pub category: FoodCategory,
    pub season: Option<Vec<i32>>,
}

/// An ingredient about to be created; the registry assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIngredient {
    pub name: String,
    pub category: FoodCategory,
    pub season: Option<Vec<i32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub name: String,
    pub ingredient_id: i64,
}

/// Transient feed item. Never persisted; either becomes an `AdLineItem`
/// or is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct RawListing {
    pub name: String,
    pub current_price: Option<f32>,
    pub sale_text: Option<String>,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdLineItem {
    pub ingredient_id: i64,
    pub name: String,
    pub price: Option<f32>,
    pub sale: Option<String>,
}

/// A fully assembled ad ready for the commit stage. `run_id` keys the
/// commit: retrying the same run must not produce a second ad row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAd {
    pub run_id: Uuid,
    pub store_id: i64,
    pub sale_start: NaiveDate,
    pub sale_end: NaiveDate,
    pub line_items: Vec<AdLineItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FoodCategory {
    Fruit,
    Vegetable,
    Meat,
    Seafood,
    Dairy,
    Grain,
    #[serde(rename = "Condiments/Spices")]
    CondimentsSpices,
    Bakery,
    Baking,
    Frozen,
    Snack,
    Deli,
    #[serde(rename = "Canned Goods")]
    CannedGoods,
    Beverage,
    Other,
}

impl FoodCategory {
    pub const ALL: [FoodCategory; 15] = [
        FoodCategory::Fruit,
        FoodCategory::Vegetable,
        FoodCategory::Meat,
        FoodCategory::Seafood,
        FoodCategory::Dairy,
        FoodCategory::Grain,
        FoodCategory::CondimentsSpices,
        FoodCategory::Bakery,
        FoodCategory::Baking,
        FoodCategory::Frozen,
        FoodCategory::Snack,
        FoodCategory::Deli,
        FoodCategory::CannedGoods,
        FoodCategory::Beverage,
        FoodCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FoodCategory::Fruit => "Fruit",
            FoodCategory::Vegetable => "Vegetable",
            FoodCategory::Meat => "Meat",
            FoodCategory::Seafood => "Seafood",
            FoodCategory::Dairy => "Dairy",
            FoodCategory::Grain => "Grain",
            FoodCategory::CondimentsSpices => "Condiments/Spices",
            FoodCategory::Bakery => "Bakery",
            FoodCategory::Baking => "Baking",
            FoodCategory::Frozen => "Frozen",
            FoodCategory::Snack => "Snack",
            FoodCategory::Deli => "Deli",
            FoodCategory::CannedGoods => "Canned Goods",
            FoodCategory::Beverage => "Beverage",
            FoodCategory::Other => "Other",
        }
    }

    /// Lenient mapping from classifier output. Leading case is normalized,
    /// `Condiment`/`Spice` fold into the combined bucket, anything
    /// unrecognized falls back to `Other`.
    pub fn parse(input: &str) -> FoodCategory {
        let trimmed = input.trim();
        let mut chars = trimmed.chars();
        let normalized = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => return FoodCategory::Other,
        };
        if matches!(normalized.as_str(), "Condiment" | "Spice" | "Spices") {
            return FoodCategory::CondimentsSpices;
        }
        FoodCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .unwrap_or(FoodCategory::Other)
    }
}

impl std::fmt::Display for FoodCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-store run state machine. `Classifying` is skipped when everything
/// resolved from the translation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Discovering,
    Fetching,
    Resolving,
    Classifying,
    Committing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub store_id: i64,
    pub run_id: Uuid,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_id: Option<i64>,
    pub line_items: usize,
    pub committed: bool,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResponse {
    pub sweep_id: String,
    pub discovered: usize,
    pub processed: usize,
    pub failed: usize,
    /// Sweep-level stages (discovery); per-store stages live on the runs.
    pub stages: Vec<StageReport>,
    pub runs: Vec<RunReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parse_normalizes_leading_case() {
        assert_eq!(FoodCategory::parse("vegetable"), FoodCategory::Vegetable);
        assert_eq!(FoodCategory::parse("Meat"), FoodCategory::Meat);
        assert_eq!(FoodCategory::parse("  dairy "), FoodCategory::Dairy);
    }

    #[test]
    fn category_parse_folds_condiment_and_spice() {
        assert_eq!(
            FoodCategory::parse("condiment"),
            FoodCategory::CondimentsSpices
        );
        assert_eq!(FoodCategory::parse("Spice"), FoodCategory::CondimentsSpices);
        assert_eq!(
            FoodCategory::parse("Condiments/Spices"),
            FoodCategory::CondimentsSpices
        );
    }

    #[test]
    fn category_parse_falls_back_to_other() {
        assert_eq!(FoodCategory::parse(""), FoodCategory::Other);
        assert_eq!(FoodCategory::parse("household"), FoodCategory::Other);
    }

    #[test]
    fn category_serializes_to_catalog_labels() {
        let json = serde_json::to_string(&FoodCategory::CannedGoods).unwrap();
        assert_eq!(json, "\"Canned Goods\"");
        let back: FoodCategory = serde_json::from_str("\"Condiments/Spices\"").unwrap();
        assert_eq!(back, FoodCategory::CondimentsSpices);
    }
}
