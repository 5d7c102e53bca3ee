//! Meal records — create, read, update, soft delete.
//!
//! DESIGN
//! ======
//! `MealRepo` is the only persistence seam the gate uses. Every query is
//! scoped to the owning user, and soft-deleted rows are invisible to `get`
//! and `update`. `soft_delete` only flips live rows, so repeating it is
//! harmless and reports `false`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::UserId;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::error::ErrorCode for RepoError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)))
    }
}

/// Nutrition fields written on create and overwritten by a correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealNutrition {
    pub meal_name: String,
    pub calories_kcal: i32,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
}

#[derive(Debug, Clone)]
pub struct NewMeal {
    pub user_id: UserId,
    /// Chat and message of the user input; together they make creation idempotent.
    pub chat_id: i64,
    pub message_id: i64,
    pub source: String,
    pub original_text: Option<String>,
    pub nutrition: MealNutrition,
    pub raw_analysis: serde_json::Value,
}

/// A stored meal. Mirrors the `meal_entries` table.
#[derive(Debug, Clone, PartialEq)]
pub struct MealRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub chat_id: i64,
    pub message_id: i64,
    pub source: String,
    pub original_text: Option<String>,
    pub nutrition: MealNutrition,
    pub consumed_at: OffsetDateTime,
    pub is_deleted: bool,
}

// =============================================================================
// REPOSITORY TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait MealRepo: Send + Sync {
    /// Insert a new meal.
    ///
    /// # Errors
    ///
    /// Returns a [`RepoError`] if the write fails.
    async fn create(&self, meal: NewMeal) -> Result<MealRecord, RepoError>;

    /// Fetch a live meal owned by `user_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`RepoError`] if the read fails.
    async fn get(&self, meal_id: Uuid, user_id: UserId) -> Result<Option<MealRecord>, RepoError>;

    /// Overwrite the nutrition of a live meal. Returns `false` if not found.
    ///
    /// # Errors
    ///
    /// Returns a [`RepoError`] if the write fails.
    async fn update(
        &self,
        meal_id: Uuid,
        user_id: UserId,
        nutrition: &MealNutrition,
        raw_analysis: serde_json::Value,
    ) -> Result<bool, RepoError>;

    /// Mark a live meal as deleted. Returns `false` if it was not found,
    /// not owned by `user_id`, or already deleted.
    ///
    /// # Errors
    ///
    /// Returns a [`RepoError`] if the write fails.
    async fn soft_delete(&self, meal_id: Uuid, user_id: UserId) -> Result<bool, RepoError>;

    /// Whether a meal was already created from this chat message.
    ///
    /// # Errors
    ///
    /// Returns a [`RepoError`] if the read fails.
    async fn exists_by_message(&self, chat_id: i64, message_id: i64) -> Result<bool, RepoError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgMealRepo {
    pool: PgPool,
}

impl PgMealRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MEAL_COLUMNS: &str = "id, user_id, chat_id, message_id, source, original_text, meal_name, \
                            calories_kcal, protein_g, carbs_g, fat_g, consumed_at, is_deleted";

fn row_to_meal(row: &PgRow) -> Result<MealRecord, sqlx::Error> {
    Ok(MealRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        chat_id: row.try_get("chat_id")?,
        message_id: row.try_get("message_id")?,
        source: row.try_get("source")?,
        original_text: row.try_get("original_text")?,
        nutrition: MealNutrition {
            meal_name: row.try_get("meal_name")?,
            calories_kcal: row.try_get("calories_kcal")?,
            protein_g: row.try_get("protein_g")?,
            carbs_g: row.try_get("carbs_g")?,
            fat_g: row.try_get("fat_g")?,
        },
        consumed_at: row.try_get("consumed_at")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}

#[async_trait::async_trait]
impl MealRepo for PgMealRepo {
    async fn create(&self, meal: NewMeal) -> Result<MealRecord, RepoError> {
        let row = sqlx::query(&format!(
            "INSERT INTO meal_entries
                 (id, user_id, chat_id, message_id, source, original_text, meal_name,
                  calories_kcal, protein_g, carbs_g, fat_g, raw_analysis)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING {MEAL_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(meal.user_id)
        .bind(meal.chat_id)
        .bind(meal.message_id)
        .bind(&meal.source)
        .bind(&meal.original_text)
        .bind(&meal.nutrition.meal_name)
        .bind(meal.nutrition.calories_kcal)
        .bind(meal.nutrition.protein_g)
        .bind(meal.nutrition.carbs_g)
        .bind(meal.nutrition.fat_g)
        .bind(&meal.raw_analysis)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_meal(&row)?)
    }

    async fn get(&self, meal_id: Uuid, user_id: UserId) -> Result<Option<MealRecord>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {MEAL_COLUMNS} FROM meal_entries
             WHERE id = $1 AND user_id = $2 AND is_deleted = false"
        ))
        .bind(meal_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_meal).transpose()?)
    }

    async fn update(
        &self,
        meal_id: Uuid,
        user_id: UserId,
        nutrition: &MealNutrition,
        raw_analysis: serde_json::Value,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE meal_entries
             SET meal_name = $3, calories_kcal = $4, protein_g = $5, carbs_g = $6, fat_g = $7,
                 raw_analysis = $8
             WHERE id = $1 AND user_id = $2 AND is_deleted = false",
        )
        .bind(meal_id)
        .bind(user_id)
        .bind(&nutrition.meal_name)
        .bind(nutrition.calories_kcal)
        .bind(nutrition.protein_g)
        .bind(nutrition.carbs_g)
        .bind(nutrition.fat_g)
        .bind(&raw_analysis)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete(&self, meal_id: Uuid, user_id: UserId) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE meal_entries SET is_deleted = true, deleted_at = now()
             WHERE id = $1 AND user_id = $2 AND is_deleted = false",
        )
        .bind(meal_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists_by_message(&self, chat_id: i64, message_id: i64) -> Result<bool, RepoError> {
        let row = sqlx::query("SELECT 1 FROM meal_entries WHERE chat_id = $1 AND message_id = $2")
            .bind(chat_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Process-local repository for tests and database-less runs.
#[derive(Default)]
pub struct MemoryMealRepo {
    meals: Mutex<HashMap<Uuid, MealRecord>>,
}

impl MemoryMealRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as-is (used to seed fixtures with a chosen `consumed_at`).
    #[cfg(test)]
    pub fn insert(&self, record: MealRecord) {
        self.lock().insert(record.id, record);
    }

    /// Fetch a record regardless of deletion state.
    #[cfg(test)]
    #[must_use]
    pub fn get_raw(&self, meal_id: Uuid) -> Option<MealRecord> {
        self.lock().get(&meal_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, MealRecord>> {
        self.meals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl MealRepo for MemoryMealRepo {
    async fn create(&self, meal: NewMeal) -> Result<MealRecord, RepoError> {
        let record = MealRecord {
            id: Uuid::new_v4(),
            user_id: meal.user_id,
            chat_id: meal.chat_id,
            message_id: meal.message_id,
            source: meal.source,
            original_text: meal.original_text,
            nutrition: meal.nutrition,
            consumed_at: OffsetDateTime::now_utc(),
            is_deleted: false,
        };
        self.lock().insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, meal_id: Uuid, user_id: UserId) -> Result<Option<MealRecord>, RepoError> {
        Ok(self
            .lock()
            .get(&meal_id)
            .filter(|m| m.user_id == user_id && !m.is_deleted)
            .cloned())
    }

    async fn update(
        &self,
        meal_id: Uuid,
        user_id: UserId,
        nutrition: &MealNutrition,
        _raw_analysis: serde_json::Value,
    ) -> Result<bool, RepoError> {
        let mut meals = self.lock();
        match meals.get_mut(&meal_id) {
            Some(m) if m.user_id == user_id && !m.is_deleted => {
                m.nutrition = nutrition.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn soft_delete(&self, meal_id: Uuid, user_id: UserId) -> Result<bool, RepoError> {
        let mut meals = self.lock();
        match meals.get_mut(&meal_id) {
            Some(m) if m.user_id == user_id && !m.is_deleted => {
                m.is_deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists_by_message(&self, chat_id: i64, message_id: i64) -> Result<bool, RepoError> {
        Ok(self
            .lock()
            .values()
            .any(|m| m.chat_id == chat_id && m.message_id == message_id))
    }
}

#[cfg(test)]
#[path = "meals_test.rs"]
mod tests;
