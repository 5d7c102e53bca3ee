use super::*;

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::db::meals::{MealNutrition, MemoryMealRepo};
use crate::services::nutrition::Ingredient;
use crate::transport::test_support::{RecordingTransport, Sent};

const USER: UserId = 42;

struct StubAnalyzer {
    /// `None` makes the call fail like a provider outage.
    next: Mutex<Option<NutritionAnalysis>>,
    hold: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl StubAnalyzer {
    fn returning(analysis: NutritionAnalysis) -> Self {
        Self { next: Mutex::new(Some(analysis)), hold: None, calls: AtomicUsize::new(0) }
    }

    fn set(&self, analysis: Option<NutritionAnalysis>) {
        *self.next.lock().unwrap() = analysis;
    }
}

#[async_trait::async_trait]
impl NutritionAnalyzer for StubAnalyzer {
    async fn analyze_text(&self, _text: &str) -> Result<NutritionAnalysis, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        self.next
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LlmError::ApiRequest("connection reset".into()))
    }
}

fn eggs(kcal: i32) -> NutritionAnalysis {
    NutritionAnalysis {
        action: AnalysisAction::Save,
        meal_name: Some("Eggs".into()),
        calories_kcal: Some(kcal),
        protein_g: Some(12.0),
        carbs_g: Some(1.0),
        fat_g: Some(10.0),
        likely_ingredients: vec![Ingredient { name: "egg".into(), amount: Some("2 pcs".into()), calories_kcal: Some(kcal) }],
        confidence: 0.9,
        ..NutritionAnalysis::unrecognized()
    }
}

struct Fx {
    svc: MealService,
    transport: Arc<RecordingTransport>,
    repo: Arc<MemoryMealRepo>,
    analyzer: Arc<StubAnalyzer>,
}

fn fixture_with(gate: GateConfig, analyzer: StubAnalyzer) -> Fx {
    let transport = Arc::new(RecordingTransport::default());
    let repo = Arc::new(MemoryMealRepo::new());
    let analyzer = Arc::new(analyzer);
    let svc = MealService::new(gate, repo.clone(), transport.clone(), Some(analyzer.clone() as Arc<dyn NutritionAnalyzer>));
    Fx { svc, transport, repo, analyzer }
}

fn fixture() -> Fx {
    fixture_with(GateConfig { rate_limit_quota: 10, ..GateConfig::default() }, StubAnalyzer::returning(eggs(140)))
}

fn text(message_id: i64, body: &str) -> IncomingText {
    IncomingText { user_id: USER, chat_id: USER, message_id, text: body.to_string() }
}

fn callback(action: CallbackAction, message: Option<MessageRef>) -> IncomingCallback {
    IncomingCallback { callback_id: "cb-1".into(), user_id: USER, message, action }
}

fn processing(message_id: i64) -> MessageRef {
    MessageRef { chat_id: USER, message_id }
}

fn old_meal(repo: &MemoryMealRepo, age: time::Duration) -> Uuid {
    let id = Uuid::new_v4();
    repo.insert(MealRecord {
        id,
        user_id: USER,
        chat_id: USER,
        message_id: 900,
        source: "text".into(),
        original_text: Some("toast".into()),
        nutrition: MealNutrition {
            meal_name: "Toast".into(),
            calories_kcal: 90,
            protein_g: 3.0,
            carbs_g: 15.0,
            fat_g: 1.0,
        },
        consumed_at: OffsetDateTime::now_utc() - age,
        is_deleted: false,
    });
    id
}

async fn save_meal(fx: &Fx, message_id: i64) -> Uuid {
    match fx.svc.handle_text(text(message_id, "2 eggs")).await.unwrap() {
        MealOutcome::Saved { meal_id } => meal_id,
        other => panic!("expected Saved, got {other:?}"),
    }
}

// =============================================================================
// handle_text
// =============================================================================

#[tokio::test]
async fn text_is_analyzed_and_saved() {
    let fx = fixture();
    let meal_id = save_meal(&fx, 1).await;

    let record = fx.repo.get_raw(meal_id).unwrap();
    assert_eq!(record.nutrition.calories_kcal, 140);
    assert_eq!(record.original_text.as_deref(), Some("2 eggs"));

    let calls = fx.transport.calls();
    assert_eq!(
        calls[0],
        Sent::Send { chat_id: USER, text: texts::PROCESSING_NEW.into(), controls: None }
    );
    assert_eq!(
        fx.transport.edits_of(processing(1)),
        vec![(texts::meal_saved(&eggs(140)), Some(saved_controls(meal_id)))]
    );
    assert_eq!(fx.svc.guard.in_flight(USER), 0);
}

#[tokio::test]
async fn precheck_rejection_costs_no_quota() {
    let fx = fixture();
    let before = fx.svc.limiter.remaining(USER);

    let outcome = fx.svc.handle_text(text(1, "water")).await.unwrap();

    assert_eq!(outcome, MealOutcome::Rejected(Rejection::Water));
    assert_eq!(fx.svc.limiter.remaining(USER), before);
    assert_eq!(fx.transport.sent_texts(), vec![texts::PRECHECK_WATER.to_string()]);
    assert_eq!(fx.analyzer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn quota_exhaustion_throttles() {
    let gate = GateConfig { rate_limit_quota: 1, ..GateConfig::default() };
    let fx = fixture_with(gate, StubAnalyzer::returning(eggs(140)));
    save_meal(&fx, 1).await;

    let outcome = fx.svc.handle_text(text(2, "toast")).await.unwrap();

    assert_eq!(outcome, MealOutcome::Throttled);
    assert_eq!(fx.transport.sent_texts().last().map(String::as_str), Some(texts::THROTTLED));
    assert_eq!(fx.analyzer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_request_while_first_in_flight_is_busy() {
    let hold = Arc::new(Notify::new());
    let analyzer = StubAnalyzer { hold: Some(hold.clone()), ..StubAnalyzer::returning(eggs(140)) };
    let fx = fixture_with(GateConfig { rate_limit_quota: 10, ..GateConfig::default() }, analyzer);

    let svc = fx.svc.clone();
    let first = tokio::spawn(async move { svc.handle_text(text(1, "2 eggs")).await });
    while fx.svc.guard.in_flight(USER) == 0 {
        tokio::task::yield_now().await;
    }

    let second = fx.svc.handle_text(text(2, "toast")).await.unwrap();
    assert_eq!(second, MealOutcome::Busy);
    assert_eq!(fx.transport.edits_of(processing(2)), vec![(texts::BUSY.to_string(), None)]);

    hold.notify_one();
    assert!(matches!(first.await.unwrap().unwrap(), MealOutcome::Saved { .. }));
    assert_eq!(fx.svc.guard.in_flight(USER), 0);
    assert_eq!(fx.analyzer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_repeats_until_inference_finishes() {
    let hold = Arc::new(Notify::new());
    let analyzer = StubAnalyzer { hold: Some(hold.clone()), ..StubAnalyzer::returning(eggs(140)) };
    let fx = fixture_with(GateConfig { rate_limit_quota: 10, ..GateConfig::default() }, analyzer);

    let svc = fx.svc.clone();
    let pending = tokio::spawn(async move { svc.handle_text(text(1, "2 eggs")).await });

    // Ticks at 0 s, 4 s and 8 s.
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(fx.transport.typing_count(), 3);

    hold.notify_one();
    assert!(matches!(pending.await.unwrap().unwrap(), MealOutcome::Saved { .. }));
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(fx.transport.typing_count(), 3);
}

#[tokio::test]
async fn missing_analyzer_replies_unrecognized() {
    let transport = Arc::new(RecordingTransport::default());
    let svc = MealService::new(GateConfig::default(), Arc::new(MemoryMealRepo::new()), transport.clone(), None);

    let outcome = svc.handle_text(text(1, "2 eggs")).await.unwrap();

    assert_eq!(outcome, MealOutcome::Unrecognized);
    assert_eq!(transport.edits_of(processing(1)), vec![(texts::UNRECOGNIZED.to_string(), None)]);
}

#[tokio::test]
async fn inference_failure_propagates_after_slot_release() {
    let fx = fixture();
    fx.analyzer.set(None);

    let err = fx.svc.handle_text(text(1, "2 eggs")).await.unwrap_err();

    assert!(matches!(err, MealError::Inference(LlmError::ApiRequest(_))));
    assert!(err.retryable());
    assert_eq!(fx.svc.guard.in_flight(USER), 0);
    assert_eq!(fx.transport.edits_of(processing(1)), vec![(texts::UNRECOGNIZED.to_string(), None)]);
}

#[tokio::test]
async fn model_rejection_shows_its_message() {
    let fx = fixture();
    fx.analyzer.set(Some(NutritionAnalysis {
        action: AnalysisAction::RejectNotFood,
        user_message: Some("That's a chair.".into()),
        ..NutritionAnalysis::unrecognized()
    }));

    let outcome = fx.svc.handle_text(text(1, "a chair")).await.unwrap();

    assert_eq!(outcome, MealOutcome::ModelRejected(AnalysisAction::RejectNotFood));
    assert_eq!(fx.transport.edits_of(processing(1)), vec![("That's a chair.".to_string(), None)]);
}

#[tokio::test]
async fn implausible_values_are_not_saved() {
    let fx = fixture();
    fx.analyzer.set(Some(eggs(50_000)));

    let outcome = fx.svc.handle_text(text(1, "2 eggs")).await.unwrap();

    assert_eq!(outcome, MealOutcome::ImplausibleValues);
    assert!(!fx.repo.exists_by_message(USER, 1).await.unwrap());
    assert_eq!(fx.transport.edits_of(processing(1)), vec![(texts::SANITY_FAIL.to_string(), None)]);
}

#[tokio::test]
async fn redelivered_message_is_saved_once() {
    let fx = fixture();
    save_meal(&fx, 7).await;

    let outcome = fx.svc.handle_text(text(7, "2 eggs")).await.unwrap();

    assert_eq!(outcome, MealOutcome::AlreadySaved);
}

// =============================================================================
// corrections
// =============================================================================

async fn start_correction(fx: &Fx, meal_id: Uuid) -> SessionToken {
    match fx.svc.handle_callback(callback(CallbackAction::EditSaved(meal_id), None)).await.unwrap() {
        MealOutcome::CorrectionStarted { token, .. } => token,
        other => panic!("expected CorrectionStarted, got {other:?}"),
    }
}

#[tokio::test]
async fn correction_prompt_carries_session_token() {
    let fx = fixture();
    let meal_id = save_meal(&fx, 1).await;

    let token = start_correction(&fx, meal_id).await;

    // Message 1 is the processing message, 2 the correction prompt.
    assert_eq!(
        fx.transport.calls().iter().rfind(|c| matches!(c, Sent::Send { .. })),
        Some(&Sent::Send {
            chat_id: USER,
            text: texts::CORRECTION_PROMPT.into(),
            controls: Some(correction_controls(&token)),
        })
    );
    assert!(fx.transport.edits_of(processing(2)).is_empty());
    assert_eq!(fx.svc.sessions().current(USER).unwrap().target_id, meal_id);
    assert_eq!(fx.transport.answers().last(), Some(&(None, false)));
}

#[tokio::test]
async fn correction_text_updates_the_meal() {
    let fx = fixture();
    let meal_id = save_meal(&fx, 1).await;
    start_correction(&fx, meal_id).await;
    fx.analyzer.set(Some(eggs(210)));

    let outcome = fx.svc.handle_text(text(2, "3 eggs actually")).await.unwrap();

    assert_eq!(outcome, MealOutcome::Updated { meal_id });
    assert_eq!(fx.repo.get_raw(meal_id).unwrap().nutrition.calories_kcal, 210);
    assert!(fx.svc.sessions().current(USER).is_none());
    assert!(fx.transport.sent_texts().contains(&texts::PROCESSING_EDIT.to_string()));
}

#[tokio::test]
async fn correction_for_meal_deleted_meanwhile_is_not_found() {
    let fx = fixture();
    let meal_id = save_meal(&fx, 1).await;
    start_correction(&fx, meal_id).await;
    fx.repo.soft_delete(meal_id, USER).await.unwrap();

    let outcome = fx.svc.handle_text(text(2, "3 eggs")).await.unwrap();

    assert_eq!(outcome, MealOutcome::MealNotFound);
    assert!(fx.svc.sessions().current(USER).is_none());
}

#[tokio::test]
async fn correction_outside_edit_window_is_refused() {
    let fx = fixture();
    let meal_id = old_meal(&fx.repo, time::Duration::hours(49));

    let outcome = fx.svc.handle_callback(callback(CallbackAction::EditSaved(meal_id), None)).await.unwrap();

    assert_eq!(outcome, MealOutcome::WindowClosed);
    assert_eq!(fx.transport.answers(), vec![(Some(texts::edit_window_expired(48)), true)]);
    assert!(fx.svc.sessions().current(USER).is_none());
}

#[tokio::test]
async fn correction_of_foreign_meal_is_not_found() {
    let fx = fixture();
    let meal_id = save_meal(&fx, 1).await;
    let cb = IncomingCallback { user_id: 7, ..callback(CallbackAction::EditSaved(meal_id), None) };

    assert_eq!(fx.svc.handle_callback(cb).await.unwrap(), MealOutcome::MealNotFound);
}

#[tokio::test]
async fn keep_then_stale_press() {
    let fx = fixture();
    let meal_id = save_meal(&fx, 1).await;
    let token = start_correction(&fx, meal_id).await;

    let kept = fx.svc.handle_callback(callback(CallbackAction::KeepCorrection(token.clone()), None)).await.unwrap();
    assert_eq!(kept, MealOutcome::CorrectionKept { meal_id });
    assert!(!fx.repo.get_raw(meal_id).unwrap().is_deleted);

    let again = fx.svc.handle_callback(callback(CallbackAction::DeleteCorrection(token), None)).await.unwrap();
    assert_eq!(again, MealOutcome::Stale);
    assert_eq!(fx.transport.answers().last(), Some(&(Some(texts::CORRECTION_STALE.to_string()), true)));
    assert!(!fx.repo.get_raw(meal_id).unwrap().is_deleted);
}

/// Delays every send that carries controls, so overlapping corrections
/// interleave.
struct SlowControls(Arc<RecordingTransport>);

#[async_trait::async_trait]
impl Transport for SlowControls {
    async fn send(&self, chat_id: i64, text: &str, controls: Option<&Controls>) -> Result<MessageRef, TransportError> {
        if controls.is_some() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.0.send(chat_id, text, controls).await
    }

    async fn edit(&self, message: MessageRef, text: &str, controls: Option<&Controls>) -> Result<(), TransportError> {
        self.0.edit(message, text, controls).await
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>, alert: bool) -> Result<(), TransportError> {
        self.0.answer_callback(callback_id, text, alert).await
    }

    async fn typing(&self, chat_id: i64) -> Result<(), TransportError> {
        self.0.typing(chat_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn overlapping_corrections_leave_one_live_prompt() {
    let recorder = Arc::new(RecordingTransport::default());
    let repo = Arc::new(MemoryMealRepo::new());
    let svc = MealService::new(GateConfig::default(), repo.clone(), Arc::new(SlowControls(recorder.clone())), None);
    let meal_id = old_meal(&repo, time::Duration::minutes(5));

    let press = move |svc: MealService| {
        tokio::spawn(async move { svc.handle_callback(callback(CallbackAction::EditSaved(meal_id), None)).await })
    };
    let first = press(svc.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = press(svc.clone());

    let MealOutcome::CorrectionStarted { token: first_token, .. } = first.await.unwrap().unwrap() else {
        panic!("first press did not start a correction");
    };
    let MealOutcome::CorrectionStarted { token: second_token, .. } = second.await.unwrap().unwrap() else {
        panic!("second press did not start a correction");
    };
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // First prompt is message 1, second is message 2.
    assert_eq!(svc.sessions().current(USER).unwrap().token, second_token);
    assert_eq!(recorder.edits_of(processing(1)), vec![(texts::CORRECTION_REPLACED.to_string(), None)]);
    assert!(recorder.edits_of(processing(2)).is_empty());
    assert!(recorder.calls().contains(&Sent::Send {
        chat_id: USER,
        text: texts::CORRECTION_PROMPT.into(),
        controls: Some(correction_controls(&first_token)),
    }));
}

#[tokio::test]
async fn delete_from_correction_prompt() {
    let fx = fixture();
    let meal_id = save_meal(&fx, 1).await;
    let token = start_correction(&fx, meal_id).await;

    let outcome = fx.svc.handle_callback(callback(CallbackAction::DeleteCorrection(token), None)).await.unwrap();

    assert_eq!(outcome, MealOutcome::Deleted { meal_id });
    assert!(fx.repo.get_raw(meal_id).unwrap().is_deleted);
}

#[tokio::test]
async fn correction_delete_outside_delete_window_is_refused() {
    let gate = GateConfig { delete_window: Duration::from_secs(3600), ..GateConfig::default() };
    let fx = fixture_with(gate, StubAnalyzer::returning(eggs(140)));
    let meal_id = old_meal(&fx.repo, time::Duration::hours(2));
    let token = start_correction(&fx, meal_id).await;

    let outcome = fx
        .svc
        .handle_callback(callback(CallbackAction::DeleteCorrection(token.clone()), None))
        .await
        .unwrap();

    assert_eq!(outcome, MealOutcome::WindowClosed);
    assert!(!fx.repo.get_raw(meal_id).unwrap().is_deleted);
    assert_eq!(fx.transport.answers().last(), Some(&(Some(texts::delete_window_expired(1)), true)));
    // Still open for keep or a correction text.
    assert_eq!(fx.svc.sessions().current(USER).unwrap().token, token);
}

#[tokio::test]
async fn stale_correction_delete_skips_the_window_lookup() {
    let fx = fixture();
    let meal_id = old_meal(&fx.repo, time::Duration::hours(72));

    let outcome = fx
        .svc
        .handle_callback(callback(CallbackAction::DeleteCorrection(SessionToken::generate()), None))
        .await
        .unwrap();

    assert_eq!(outcome, MealOutcome::Stale);
    assert_eq!(fx.transport.answers(), vec![(Some(texts::CORRECTION_STALE.to_string()), true)]);
    assert!(!fx.repo.get_raw(meal_id).unwrap().is_deleted);
}

// =============================================================================
// delete_saved
// =============================================================================

#[tokio::test]
async fn delete_saved_meal_rewrites_message() {
    let fx = fixture();
    let meal_id = save_meal(&fx, 1).await;

    let outcome = fx
        .svc
        .handle_callback(callback(CallbackAction::DeleteSaved(meal_id), Some(processing(1))))
        .await
        .unwrap();

    assert_eq!(outcome, MealOutcome::Deleted { meal_id });
    assert!(fx.repo.get_raw(meal_id).unwrap().is_deleted);
    assert_eq!(fx.transport.edits_of(processing(1)).last(), Some(&(texts::DELETED.to_string(), None)));

    let again = fx
        .svc
        .handle_callback(callback(CallbackAction::DeleteSaved(meal_id), Some(processing(1))))
        .await
        .unwrap();
    assert_eq!(again, MealOutcome::MealNotFound);
}

#[tokio::test]
async fn delete_outside_window_is_refused() {
    let fx = fixture();
    let meal_id = old_meal(&fx.repo, time::Duration::hours(72));

    let outcome = fx.svc.handle_callback(callback(CallbackAction::DeleteSaved(meal_id), None)).await.unwrap();

    assert_eq!(outcome, MealOutcome::WindowClosed);
    assert!(!fx.repo.get_raw(meal_id).unwrap().is_deleted);
}

// =============================================================================
// callback parsing
// =============================================================================

#[test]
fn parses_known_callback_payloads() {
    let id = Uuid::new_v4();
    assert_eq!(CallbackAction::parse(&format!("saved_edit:{id}")), Some(CallbackAction::EditSaved(id)));
    assert_eq!(CallbackAction::parse(&format!("saved_delete:{id}")), Some(CallbackAction::DeleteSaved(id)));
    assert_eq!(
        CallbackAction::parse("fb_ok:abc123"),
        Some(CallbackAction::KeepCorrection(SessionToken::from("abc123")))
    );
    assert_eq!(
        CallbackAction::parse("fb_del:abc123"),
        Some(CallbackAction::DeleteCorrection(SessionToken::from("abc123")))
    );
}

#[test]
fn rejects_unknown_callback_payloads() {
    assert_eq!(CallbackAction::parse("saved_edit:not-a-uuid"), None);
    assert_eq!(CallbackAction::parse("fb_ok:"), None);
    assert_eq!(CallbackAction::parse("hist_delete:x"), None);
    assert_eq!(CallbackAction::parse("garbage"), None);
}

#[test]
fn button_payloads_round_trip_through_parse() {
    let token = SessionToken::generate();
    let controls = correction_controls(&token);
    assert_eq!(
        CallbackAction::parse(&controls.rows[0][0].data),
        Some(CallbackAction::KeepCorrection(token))
    );
}
