//! Cheap text filter run before rate limiting and inference.
//!
//! Conservative on purpose: a false reject costs the user more than one
//! wasted inference call, so only exact or keyword matches are rejected.

use crate::texts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Empty, emoji-only or medicine.
    NotFood,
    Water,
    Vague,
}

impl Rejection {
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::NotFood => texts::PRECHECK_NOT_TEXT,
            Self::Water => texts::PRECHECK_WATER,
            Self::Vague => texts::PRECHECK_VAGUE,
        }
    }
}

const WATER_EXACT: &[&str] = &["вода", "water", "стакан воды", "попил воды"];
const MEDICINE_KEYWORDS: &[&str] = &["лекарство", "таблетка", "ibuprofen", "paracetamol"];
const VAGUE_WORDS: &[&str] = &["вкусняшка", "еда", "поел", "ням", "что-то"];

/// Returns the first rule the text trips, or `None` if it may proceed.
#[must_use]
pub fn check_text(text: &str) -> Option<Rejection> {
    let normalized = text.trim().to_lowercase();

    if !normalized.chars().any(char::is_alphanumeric) {
        return Some(Rejection::NotFood);
    }
    if WATER_EXACT.contains(&normalized.as_str()) {
        return Some(Rejection::Water);
    }
    if MEDICINE_KEYWORDS.iter().any(|kw| normalized.contains(kw)) {
        return Some(Rejection::NotFood);
    }
    if !normalized.chars().any(|c| c.is_ascii_digit()) && VAGUE_WORDS.contains(&normalized.as_str()) {
        return Some(Rejection::Vague);
    }
    None
}

#[cfg(test)]
#[path = "precheck_test.rs"]
mod tests;
