//! Nutrition analysis — free text in, structured estimate out.
//!
//! DESIGN
//! ======
//! The model is asked for a JSON object matching `NutritionAnalysis` and
//! decides between saving and one of the reject actions itself. This module
//! only parses that reply and applies a numeric sanity check; whether to
//! save is up to the meal flow.
//!
//! ERROR HANDLING
//! ==============
//! Transport or provider failures and unparseable replies surface as
//! `LlmError`. The caller decides how to present them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::meals::MealNutrition;
use crate::llm::{LlmChat, LlmError};

const MAX_CALORIES_KCAL: i32 = 10_000;
const MAX_MACRO_G: f64 = 1_000.0;

const SYSTEM_PROMPT: &str = "\
You are a nutrition analysis assistant. Analyze the food described and return a JSON object \
with keys: action, meal_name, calories_kcal, protein_g, carbs_g, fat_g, weight_g, volume_ml, \
caffeine_mg, likely_ingredients (array of {name, amount, calories_kcal}), user_message, confidence.

Rules:
1. If the input is clearly food or drink, estimate nutrition and set action=\"save\".
2. If the input has no calories (e.g. water, supplements), set action=\"reject_no_calories\" \
with a brief user_message explaining why.
3. If the input is not food at all, set action=\"reject_not_food\" with user_message.
4. If the food description lacks sufficient detail for a reasonable estimate, \
set action=\"reject_insufficient_detail\" with user_message.
5. If you cannot recognize what was sent, set action=\"reject_unrecognized\" without user_message.
6. Prefer rejection over guessing when uncertain.
7. All numeric values must be non-negative. calories_kcal is an integer.
8. If the user provides explicit numbers (kcal, macros, weight, volume), pass them through \
unchanged. Still generate meal_name and likely_ingredients.
9. Always generate likely_ingredients when action=\"save\".
10. confidence is 0.0 to 1.0 reflecting your certainty.
";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisAction {
    Save,
    RejectNoCalories,
    RejectNotFood,
    RejectInsufficientDetail,
    RejectUnrecognized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub calories_kcal: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionAnalysis {
    pub action: AnalysisAction,
    #[serde(default)]
    pub meal_name: Option<String>,
    #[serde(default)]
    pub calories_kcal: Option<i32>,
    #[serde(default)]
    pub protein_g: Option<f64>,
    #[serde(default)]
    pub carbs_g: Option<f64>,
    #[serde(default)]
    pub fat_g: Option<f64>,
    #[serde(default)]
    pub weight_g: Option<f64>,
    #[serde(default)]
    pub volume_ml: Option<f64>,
    #[serde(default)]
    pub caffeine_mg: Option<f64>,
    #[serde(default)]
    pub likely_ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

impl NutritionAnalysis {
    #[must_use]
    pub fn unrecognized() -> Self {
        Self {
            action: AnalysisAction::RejectUnrecognized,
            meal_name: None,
            calories_kcal: None,
            protein_g: None,
            carbs_g: None,
            fat_g: None,
            weight_g: None,
            volume_ml: None,
            caffeine_mg: None,
            likely_ingredients: Vec::new(),
            user_message: None,
            confidence: 0.0,
        }
    }

    /// Columns persisted for a saved meal. Missing values become zero.
    #[must_use]
    pub fn to_nutrition(&self) -> MealNutrition {
        MealNutrition {
            meal_name: self.meal_name.clone().unwrap_or_else(|| "Unknown".to_string()),
            calories_kcal: self.calories_kcal.unwrap_or(0),
            protein_g: self.protein_g.unwrap_or(0.0),
            carbs_g: self.carbs_g.unwrap_or(0.0),
            fat_g: self.fat_g.unwrap_or(0.0),
        }
    }
}

// =============================================================================
// ANALYZER
// =============================================================================

#[async_trait::async_trait]
pub trait NutritionAnalyzer: Send + Sync {
    /// # Errors
    ///
    /// Returns an [`LlmError`] if the provider call fails or its reply is not
    /// a valid analysis.
    async fn analyze_text(&self, text: &str) -> Result<NutritionAnalysis, LlmError>;
}

pub struct LlmNutritionAnalyzer {
    llm: Arc<dyn LlmChat>,
    max_tokens: u32,
}

impl LlmNutritionAnalyzer {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmChat>, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }
}

#[async_trait::async_trait]
impl NutritionAnalyzer for LlmNutritionAnalyzer {
    async fn analyze_text(&self, text: &str) -> Result<NutritionAnalysis, LlmError> {
        let response = self.llm.complete_json(self.max_tokens, SYSTEM_PROMPT, text).await?;
        debug!(
            model = %response.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "nutrition analysis completed"
        );
        parse_analysis(&response.text).inspect_err(|e| warn!(error = %e, "nutrition reply rejected"))
    }
}

/// Parse a model reply, tolerating a surrounding markdown code fence.
pub(crate) fn parse_analysis(raw: &str) -> Result<NutritionAnalysis, LlmError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| LlmError::ApiParse(format!("nutrition analysis: {e}")))
}

// =============================================================================
// SANITY CHECK
// =============================================================================

/// Reject physically implausible numbers. Returns the reason on failure.
#[must_use]
pub fn sanity_check(analysis: &NutritionAnalysis) -> Option<String> {
    let kcal = analysis.calories_kcal.unwrap_or(0);
    if kcal < 0 {
        return Some(format!("negative calories: {kcal}"));
    }
    if kcal > MAX_CALORIES_KCAL {
        return Some(format!("calories above {MAX_CALORIES_KCAL}: {kcal}"));
    }

    let amounts = [
        ("protein_g", analysis.protein_g),
        ("carbs_g", analysis.carbs_g),
        ("fat_g", analysis.fat_g),
        ("weight_g", analysis.weight_g),
        ("volume_ml", analysis.volume_ml),
        ("caffeine_mg", analysis.caffeine_mg),
    ];
    for (field, value) in amounts {
        let Some(v) = value else { continue };
        if !v.is_finite() || v < 0.0 {
            return Some(format!("{field} out of range: {v}"));
        }
    }
    for (field, value) in &amounts[..3] {
        if value.is_some_and(|v| v > MAX_MACRO_G) {
            return Some(format!("{field} above {MAX_MACRO_G}"));
        }
    }
    None
}

#[cfg(test)]
#[path = "nutrition_test.rs"]
mod tests;
