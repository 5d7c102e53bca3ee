use super::*;

fn nutrition(name: &str, kcal: i32) -> MealNutrition {
    MealNutrition { meal_name: name.into(), calories_kcal: kcal, protein_g: 10.0, carbs_g: 20.0, fat_g: 5.0 }
}

fn new_meal(user_id: UserId, message_id: i64) -> NewMeal {
    NewMeal {
        user_id,
        chat_id: 100,
        message_id,
        source: "text".into(),
        original_text: Some("two eggs".into()),
        nutrition: nutrition("Eggs", 140),
        raw_analysis: serde_json::json!({"action": "save"}),
    }
}

#[tokio::test]
async fn create_then_get() {
    let repo = MemoryMealRepo::new();
    let meal = repo.create(new_meal(42, 1)).await.unwrap();

    let fetched = repo.get(meal.id, 42).await.unwrap().unwrap();
    assert_eq!(fetched.nutrition.meal_name, "Eggs");
    assert!(!fetched.is_deleted);
}

#[tokio::test]
async fn get_is_scoped_to_owner() {
    let repo = MemoryMealRepo::new();
    let meal = repo.create(new_meal(42, 1)).await.unwrap();
    assert!(repo.get(meal.id, 43).await.unwrap().is_none());
}

#[tokio::test]
async fn soft_delete_is_idempotent() {
    let repo = MemoryMealRepo::new();
    let meal = repo.create(new_meal(42, 1)).await.unwrap();

    assert!(repo.soft_delete(meal.id, 42).await.unwrap());
    assert!(!repo.soft_delete(meal.id, 42).await.unwrap());
    assert!(repo.get(meal.id, 42).await.unwrap().is_none());
    assert!(repo.get_raw(meal.id).unwrap().is_deleted);
}

#[tokio::test]
async fn soft_delete_rejects_other_user() {
    let repo = MemoryMealRepo::new();
    let meal = repo.create(new_meal(42, 1)).await.unwrap();

    assert!(!repo.soft_delete(meal.id, 43).await.unwrap());
    assert!(repo.get(meal.id, 42).await.unwrap().is_some());
}

#[tokio::test]
async fn update_overwrites_nutrition() {
    let repo = MemoryMealRepo::new();
    let meal = repo.create(new_meal(42, 1)).await.unwrap();

    let updated = repo
        .update(meal.id, 42, &nutrition("Three eggs", 210), serde_json::Value::Null)
        .await
        .unwrap();
    assert!(updated);
    let fetched = repo.get(meal.id, 42).await.unwrap().unwrap();
    assert_eq!(fetched.nutrition.calories_kcal, 210);
}

#[tokio::test]
async fn update_skips_deleted() {
    let repo = MemoryMealRepo::new();
    let meal = repo.create(new_meal(42, 1)).await.unwrap();
    repo.soft_delete(meal.id, 42).await.unwrap();

    let updated = repo
        .update(meal.id, 42, &nutrition("Ghost", 1), serde_json::Value::Null)
        .await
        .unwrap();
    assert!(!updated);
}

#[tokio::test]
async fn exists_by_message_matches_chat_and_message() {
    let repo = MemoryMealRepo::new();
    repo.create(new_meal(42, 7)).await.unwrap();

    assert!(repo.exists_by_message(100, 7).await.unwrap());
    assert!(!repo.exists_by_message(100, 8).await.unwrap());
    assert!(!repo.exists_by_message(101, 7).await.unwrap());
}
