use crate::llm::{LlmClient, LlmMessage};
use crate::models::FoodCategory;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

const SIMPLIFY_PROMPT: &str = r#"
Given a list of grocery ad item names, return a simple ingredient name for each.
The ingredient name has to be a food. For example: Fresh Green Bell Pepper -> bell peppers,
Fresh Antibiotic Free Family Pack Thin Sliced Chicken Breast -> chicken breast.
Respond with a single JSON object mapping each original input name to its simple
ingredient name, e.g. {"Fresh Green Bell Pepper": "bell peppers"}. Do not return
anything other than the JSON. If an item name covers two or more foods
(Green Peppers and Cucumbers, Salmon and Ocean Perch), generalize it (vegetables,
fish). Fruits and vegetables must be plural (fresh avocados -> avocados).
"#;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("llm request failed: {0}")]
    Llm(String),
    #[error("unparseable classifier payload: {0}")]
    Parse(String),
}

/// Category and seasonality inferred for one canonical ingredient name.
#[derive(Debug, Clone, PartialEq)]
pub struct IngredientProfile {
    pub category: FoodCategory,
    pub season: Option<Vec<i32>>,
}

/// AI-assisted name classification. Both calls are best-effort: the
/// response is untrusted output that gets strict parsing and fallbacks.
#[async_trait]
pub trait Classify: Send + Sync {
    /// Maps each raw ad name to a canonical simplified ingredient name.
    /// Names the model skipped are simply absent from the result.
    async fn simplify_names(
        &self,
        raw_names: &[String],
    ) -> Result<HashMap<String, String>, ClassifierError>;

    /// Infers a food category (and season, when the model provides one)
    /// for a single canonical name.
    async fn profile(&self, canonical_name: &str) -> Result<IngredientProfile, ClassifierError>;
}

pub struct LlmClassifier {
    llm: LlmClient,
}

impl LlmClassifier {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Classify for LlmClassifier {
    async fn simplify_names(
        &self,
        raw_names: &[String],
    ) -> Result<HashMap<String, String>, ClassifierError> {
        let joined = raw_names.join(", ");
        let messages = vec![
            LlmMessage::system(SIMPLIFY_PROMPT),
            LlmMessage::user(joined),
        ];
        let response = self
            .llm
            .chat(&messages)
            .await
            .map_err(|err| ClassifierError::Llm(err.to_string()))?;
        parse_name_map(&response.text)
    }

    async fn profile(&self, canonical_name: &str) -> Result<IngredientProfile, ClassifierError> {
        let categories = FoodCategory::ALL
            .iter()
            .map(|category| category.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "Given the name of an ingredient, return only a JSON object with a \
             \"type\" chosen from: {categories}. If the type is Fruit or Vegetable, \
             also provide \"season\" as an array of month numbers (1-12), e.g. \
             brussel sprouts -> {{\"type\": \"Vegetable\", \"season\": [9, 10, 11]}}."
        );
        let messages = vec![LlmMessage::system(prompt), LlmMessage::user(canonical_name)];
        let response = self
            .llm
            .chat(&messages)
            .await
            .map_err(|err| ClassifierError::Llm(err.to_string()))?;
        parse_profile(&response.text)
    }
}

/// The model wraps JSON in markdown fences more often than not; strip them
/// (and any stray backticks) before parsing.
fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.replace('`', "");
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n").replace('`', "")
}

fn parse_name_map(raw: &str) -> Result<HashMap<String, String>, ClassifierError> {
    let cleaned = strip_markdown_fence(raw);
    let parsed: HashMap<String, String> = serde_json::from_str(&cleaned)
        .map_err(|err| ClassifierError::Parse(format!("name map: {err}")))?;
    Ok(parsed
        .into_iter()
        .filter_map(|(raw_name, canonical)| {
            let canonical = canonical.trim().to_lowercase();
            (!canonical.is_empty()).then(|| (raw_name, canonical))
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(rename = "type", default)]
    category: String,
    #[serde(default)]
    season: Option<Vec<i32>>,
}

fn parse_profile(raw: &str) -> Result<IngredientProfile, ClassifierError> {
    let cleaned = strip_markdown_fence(raw);
    let parsed: RawProfile = serde_json::from_str(&cleaned)
        .map_err(|err| ClassifierError::Parse(format!("profile: {err}")))?;
    let season = parsed.season.map(|months| {
        months
            .into_iter()
            .filter(|month| (1..=12).contains(month))
            .collect::<Vec<_>>()
    });
    Ok(IngredientProfile {
        category: FoodCategory::parse(&parsed.category),
        season: season.filter(|months| !months.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_stripping_handles_json_blocks() {
        let fenced = "```json\n{\"a\": \"b\"}\n```";
        assert_eq!(strip_markdown_fence(fenced), "{\"a\": \"b\"}");
        let bare = "  {\"a\": \"b\"}  ";
        assert_eq!(strip_markdown_fence(bare), "{\"a\": \"b\"}");
        let stray = "{\"a\": `\"b\"`}";
        assert_eq!(strip_markdown_fence(stray), "{\"a\": \"b\"}");
    }

    #[test]
    fn name_map_parses_and_drops_empty_values() {
        let raw = "```json\n{\"Fresh Green Bell Pepper\": \"Bell Peppers\", \"Mystery Item\": \"\"}\n```";
        let map = parse_name_map(raw).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["Fresh Green Bell Pepper"], "bell peppers");
    }

    #[test]
    fn name_map_rejects_prose() {
        let err = parse_name_map("Sure! Here are your ingredients.").unwrap_err();
        assert!(matches!(err, ClassifierError::Parse(_)));
    }

    #[test]
    fn profile_parses_category_and_season() {
        let raw = "```json\n{\"type\": \"Vegetable\", \"season\": [6, 7, 8, 9]}\n```";
        let profile = parse_profile(raw).unwrap();
        assert_eq!(profile.category, FoodCategory::Vegetable);
        assert_eq!(profile.season, Some(vec![6, 7, 8, 9]));
    }

    #[test]
    fn profile_defaults_unknown_category_to_other() {
        let profile = parse_profile("{\"season\": null}").unwrap();
        assert_eq!(profile.category, FoodCategory::Other);
        assert_eq!(profile.season, None);
    }

    #[test]
    fn profile_discards_out_of_range_months() {
        let profile = parse_profile("{\"type\": \"Fruit\", \"season\": [0, 5, 13]}").unwrap();
        assert_eq!(profile.season, Some(vec![5]));
        let profile = parse_profile("{\"type\": \"Fruit\", \"season\": [0, 13]}").unwrap();
        assert_eq!(profile.season, None);
    }
}
