//! User-facing strings. English only.

use std::fmt::Write;

use crate::services::nutrition::NutritionAnalysis;

pub const THROTTLED: &str = "Too many requests. Please wait a bit and try again 🙂";
pub const BUSY: &str = "⏳ Still working on your previous message. Send this one again in a moment.";
pub const PROCESSING_NEW: &str = "🔄 Combobulating...";
pub const PROCESSING_EDIT: &str = "🔄 Analysing again with your feedback...";
pub const SANITY_FAIL: &str = "⚠️ The values look unrealistic. Please double-check and try again.";
pub const UNRECOGNIZED: &str = "I couldn't recognize the food. Please try sending it again.";
pub const MEAL_NOT_FOUND: &str = "Meal not found.";
pub const ALREADY_SAVED: &str = "Already saved.";
pub const DELETED: &str = "🗑️ Deleted.";
pub const SAVED_PREFIX: &str = "✅ Saved. You added: ";
pub const INTERNAL_ERROR: &str = "Something went wrong on our side. Please try again later.";

pub const PRECHECK_NOT_TEXT: &str = "Please ✏️ write a food or drink.";
pub const PRECHECK_WATER: &str = "Water doesn't contain calories or macros, so there is nothing to log. 😀";
pub const PRECHECK_VAGUE: &str =
    "That is too vague for an estimate. Tell me what you ate and roughly how much 😀";

pub const CORRECTION_PROMPT: &str = "Send corrected text for this meal, or pick an option below:";
pub const CORRECTION_KEPT: &str = "👍 Kept as is.";
pub const CORRECTION_EXPIRED: &str = "⌛ Correction window closed. Tap ✏️ Edit on the meal to try again.";
pub const CORRECTION_REPLACED: &str = "↪️ Replaced by a newer correction.";
pub const CORRECTION_STALE: &str = "This correction window has closed.";

pub const BUTTON_EDIT: &str = "✏️ Edit";
pub const BUTTON_DELETE: &str = "🛑 Delete";
pub const BUTTON_KEEP: &str = "👍 Looks right";

#[must_use]
pub fn edit_window_expired(hours: u64) -> String {
    format!("⏳ This meal can no longer be edited (older than {hours}h).")
}

#[must_use]
pub fn delete_window_expired(hours: u64) -> String {
    format!("⏳ This meal can no longer be deleted (older than {hours}h).")
}

/// Summary shown on the processing message once a meal is stored.
#[must_use]
pub fn meal_saved(analysis: &NutritionAnalysis) -> String {
    let mut out = String::from(SAVED_PREFIX);
    out.push_str(analysis.meal_name.as_deref().unwrap_or("Unknown"));
    let _ = write!(out, "\n\nCalories: {} kcal", analysis.calories_kcal.unwrap_or(0));
    let _ = write!(
        out,
        "\nMacros: Protein {:.1} g · Carbs {:.1} g · Fat {:.1} g",
        analysis.protein_g.unwrap_or(0.0),
        analysis.carbs_g.unwrap_or(0.0),
        analysis.fat_g.unwrap_or(0.0),
    );
    if let Some(weight) = analysis.weight_g {
        let _ = write!(out, "\nWeight: {weight:.0} g");
    }
    if let Some(volume) = analysis.volume_ml {
        let _ = write!(out, "\nVolume: {volume:.0} ml");
    }
    if let Some(caffeine) = analysis.caffeine_mg {
        let _ = write!(out, "\nCaffeine: {caffeine:.0} mg");
    }
    if !analysis.likely_ingredients.is_empty() {
        out.push_str("\n\nLikely Ingredients:");
        for ingredient in &analysis.likely_ingredients {
            let _ = write!(out, "\n• {}", ingredient.name);
            if let Some(amount) = ingredient.amount.as_deref() {
                let _ = write!(out, " ({amount})");
            }
            if let Some(kcal) = ingredient.calories_kcal {
                let _ = write!(out, " ~{kcal} kcal");
            }
        }
    }
    out
}
