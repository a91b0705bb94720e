//! Periodic classification of every known device.
//!
//! The scheduler sleeps for the warm-up delay, then runs one pass per
//! interval until its [`CancellationToken`] fires. A pass walks the devices
//! one at a time:
//!
//! 1. fetch readings inside the lookback window
//! 2. build the feature window and classify
//! 3. read the previous phase
//! 4. append the estimate to history
//! 5. alert when a previous phase exists and differs
//! 6. upsert the current phase
//!
//! A failure on one device is logged and counted; the pass moves on.

use crate::classification::features::WindowError;
use crate::context::ServiceContext;
use crate::notify::transition_message;
use crate::state::AppState;
use crate::telemetry::StoreError;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of classifying one device in a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEstimate {
    pub device_id: String,
    pub phase: String,
    pub probabilities: Vec<f64>,
    pub previous: Option<String>,
    pub transition: bool,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutcome {
    Classified(DeviceEstimate),
    NoRecentData,
    Skipped(WindowError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub devices: usize,
    pub classified: usize,
    pub skipped: usize,
    pub failed: usize,
    pub transitions: usize,
    /// The device list itself could not be fetched.
    pub listing_failed: bool,
    pub cancelled: bool,
    pub estimates: Vec<DeviceEstimate>,
}

impl PassSummary {
    fn started(at: OffsetDateTime) -> Self {
        Self {
            started_at: at,
            finished_at: at,
            devices: 0,
            classified: 0,
            skipped: 0,
            failed: 0,
            transitions: 0,
            listing_failed: false,
            cancelled: false,
            estimates: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.listing_failed && self.failed == 0
    }
}

pub fn spawn_scheduler(
    ctx: ServiceContext,
    state: Arc<RwLock<AppState>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(ctx, state, cancel))
}

/// Runs passes until `cancel` fires. Cancellation is honoured during the
/// warm-up, between passes and between devices.
pub async fn run(ctx: ServiceContext, state: Arc<RwLock<AppState>>, cancel: CancellationToken) {
    info!(
        interval_minutes = ctx.schedule.interval.as_secs() / 60,
        warm_up_secs = ctx.schedule.warm_up.as_secs(),
        "Classification scheduler started"
    );

    if sleep_or_cancel(ctx.schedule.warm_up, &cancel).await {
        loop {
            let cycle_start = Instant::now();
            let summary = run_pass(&ctx, &cancel, OffsetDateTime::now_utc()).await;
            publish(&state, summary);

            let remaining = ctx.schedule.interval.saturating_sub(cycle_start.elapsed());
            if cancel.is_cancelled() || !sleep_or_cancel(remaining, &cancel).await {
                break;
            }
        }
    }

    info!("Classification scheduler stopped");
}

/// Returns `false` when cancelled before `duration` elapsed.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn publish(state: &Arc<RwLock<AppState>>, summary: PassSummary) {
    match state.write() {
        Ok(mut guard) => guard.record_pass(summary),
        Err(_) => warn!("State lock poisoned while recording pass"),
    }
}

/// One pass over every device known to the store. `now` anchors the
/// lookback window and stamps every write made in this pass.
pub async fn run_pass(
    ctx: &ServiceContext,
    cancel: &CancellationToken,
    now: OffsetDateTime,
) -> PassSummary {
    let mut summary = PassSummary::started(now);
    info!("Running classification pass");

    let devices = match ctx.store.devices().await {
        Ok(devices) => devices,
        Err(err) => {
            error!(error = %err, "Failed to list devices, pass aborted");
            summary.listing_failed = true;
            summary.finished_at = OffsetDateTime::now_utc();
            return summary;
        }
    };
    if devices.is_empty() {
        warn!("No devices in the store");
    }
    summary.devices = devices.len();

    for device in &devices {
        if cancel.is_cancelled() {
            info!(device = %device, "Pass cancelled before device");
            summary.cancelled = true;
            break;
        }

        match classify_device(ctx, device, now).await {
            Ok(DeviceOutcome::Classified(estimate)) => {
                summary.classified += 1;
                if estimate.transition {
                    summary.transitions += 1;
                }
                summary.estimates.push(estimate);
            }
            Ok(DeviceOutcome::NoRecentData) => {
                warn!(device = %device, "No recent readings");
                summary.skipped += 1;
            }
            Ok(DeviceOutcome::Skipped(reason)) => {
                warn!(device = %device, reason = %reason, "Classification skipped");
                summary.skipped += 1;
            }
            Err(err) => {
                error!(device = %device, error = %err, "Classification failed");
                summary.failed += 1;
            }
        }
    }

    summary.finished_at = OffsetDateTime::now_utc();
    info!(
        devices = summary.devices,
        classified = summary.classified,
        skipped = summary.skipped,
        failed = summary.failed,
        transitions = summary.transitions,
        "Classification pass finished"
    );
    summary
}

/// Classify, persist and alert for a single device.
///
/// History is appended before the state upsert; a crash in between leaves
/// them one pass apart.
pub async fn classify_device(
    ctx: &ServiceContext,
    device_id: &str,
    now: OffsetDateTime,
) -> Result<DeviceOutcome, StoreError> {
    let readings = ctx
        .store
        .readings_since(device_id, now - ctx.schedule.lookback)
        .await?;
    if readings.is_empty() {
        return Ok(DeviceOutcome::NoRecentData);
    }

    let estimate = match ctx.classifier.classify(&readings) {
        Ok(estimate) => estimate,
        Err(reason) => return Ok(DeviceOutcome::Skipped(reason)),
    };

    let previous = ctx
        .store
        .last_phase(device_id)
        .await?
        .filter(|phase| !phase.is_empty());

    ctx.store
        .append_classification(device_id, &estimate, now)
        .await?;

    let transition = previous
        .as_deref()
        .is_some_and(|previous| previous != estimate.phase);
    if let Some(previous) = previous.as_deref().filter(|_| transition) {
        let message = transition_message(device_id, previous, &estimate.phase, now);
        ctx.notifier.notify(&message).await;
    }

    ctx.store
        .set_last_phase(device_id, &estimate.phase, now)
        .await?;

    info!(
        device = %device_id,
        phase = %estimate.phase,
        previous = ?previous,
        "Device classified"
    );

    Ok(DeviceOutcome::Classified(DeviceEstimate {
        device_id: device_id.to_string(),
        phase: estimate.phase,
        probabilities: estimate.probabilities,
        previous,
        transition,
        timestamp: now,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::PhaseClassifier;
    use crate::classification::features::{FeaturePreparer, FeatureWindow, RobustScaler};
    use crate::classification::model::{LabelDecoder, PhaseModel};
    use crate::context::ScheduleSettings;
    use crate::notify::{Notifier, NotifyOutcome};
    use crate::telemetry::memory::InMemoryStore;
    use crate::telemetry::{Reading, TelemetryStore};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-03-10 12:00 UTC);

    /// Picks the class whose index equals the rounded mean of the first
    /// column, so tests steer the phase through the readings.
    #[derive(Debug)]
    struct MeanModel;

    impl PhaseModel for MeanModel {
        fn predict(&self, window: &FeatureWindow) -> Vec<f64> {
            let mean = window.rows().iter().map(|row| row[0]).sum::<f64>() / window.len() as f64;
            let class = (mean.round().max(0.0) as usize).min(2);
            let mut probabilities = vec![0.0; 3];
            probabilities[class] = 1.0;
            probabilities
        }

        fn input_width(&self) -> usize {
            1
        }

        fn class_count(&self) -> usize {
            3
        }
    }

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().expect("messages lock").clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str) -> NotifyOutcome {
            self.messages.lock().expect("messages lock").push(message.to_string());
            NotifyOutcome::Sent
        }
    }

    fn classifier() -> PhaseClassifier {
        PhaseClassifier::new(
            FeaturePreparer::new(vec!["phase_hint".to_string()], RobustScaler::identity(1)),
            Box::new(MeanModel),
            LabelDecoder::new(vec![
                "decline".to_string(),
                "growth".to_string(),
                "stationary".to_string(),
            ]),
        )
    }

    /// `count` hourly readings ending at `end`, all carrying `hint`.
    fn hourly_until(device: &str, count: i64, hint: f64, end: OffsetDateTime) -> Vec<Reading> {
        (0..count)
            .map(|i| Reading::new(device, end - time::Duration::hours(i)).with("phase_hint", hint))
            .collect()
    }

    fn hourly(device: &str, count: i64, hint: f64) -> Vec<Reading> {
        hourly_until(device, count, hint, NOW)
    }

    fn context(
        store: Arc<InMemoryStore>,
        notifier: Arc<RecordingNotifier>,
    ) -> ServiceContext {
        ServiceContext::new(
            store,
            Arc::new(classifier()),
            notifier,
            ScheduleSettings::with_interval(Duration::from_secs(3600)),
        )
    }

    #[tokio::test]
    async fn first_classification_writes_state_without_alert() -> Result<(), StoreError> {
        let store = Arc::new(InMemoryStore::with_readings(hourly("tank-1", 48, 1.0)));
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = context(Arc::clone(&store), Arc::clone(&notifier));

        let summary = run_pass(&ctx, &CancellationToken::new(), NOW).await;

        assert_eq!(summary.classified, 1);
        assert_eq!(summary.transitions, 0);
        assert!(notifier.messages().is_empty());
        assert_eq!(store.last_phase("tank-1").await?, Some("growth".to_string()));
        assert_eq!(store.history()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn changed_phase_sends_one_alert() -> Result<(), StoreError> {
        let store = Arc::new(InMemoryStore::with_readings(hourly("tank-1", 48, 0.0)));
        store.seed_state("tank-1", "growth", NOW - time::Duration::hours(1))?;
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = context(Arc::clone(&store), Arc::clone(&notifier));

        let summary = run_pass(&ctx, &CancellationToken::new(), NOW).await;

        let messages = notifier.messages();
        assert_eq!(summary.transitions, 1);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("growth"));
        assert!(messages[0].contains("decline"));
        assert!(messages[0].contains("tank-1"));
        assert_eq!(store.last_phase("tank-1").await?, Some("decline".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn unchanged_phase_sends_nothing() -> Result<(), StoreError> {
        let store = Arc::new(InMemoryStore::with_readings(hourly("tank-1", 48, 1.0)));
        store.seed_state("tank-1", "growth", NOW - time::Duration::hours(1))?;
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = context(Arc::clone(&store), Arc::clone(&notifier));

        let summary = run_pass(&ctx, &CancellationToken::new(), NOW).await;

        assert_eq!(summary.classified, 1);
        assert!(notifier.messages().is_empty());
        let state = store.state("tank-1")?.expect("state present");
        assert_eq!(state.updated_at, NOW);
        Ok(())
    }

    #[tokio::test]
    async fn short_history_writes_nothing() -> Result<(), StoreError> {
        let store = Arc::new(InMemoryStore::with_readings(hourly("tank-1", 47, 1.0)));
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = context(Arc::clone(&store), Arc::clone(&notifier));

        let summary = run_pass(&ctx, &CancellationToken::new(), NOW).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.classified, 0);
        assert!(store.history()?.is_empty());
        assert!(store.state("tank-1")?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn readings_outside_lookback_are_ignored() -> Result<(), StoreError> {
        // 60 readings in total but only 40 inside the 48 hour window.
        let mut readings = hourly("tank-1", 40, 1.0);
        readings.extend((49..69).map(|i| {
            Reading::new("tank-1", NOW - time::Duration::hours(i)).with("phase_hint", 1.0)
        }));
        let store = Arc::new(InMemoryStore::with_readings(readings));
        let ctx = context(Arc::clone(&store), Arc::new(RecordingNotifier::default()));

        let outcome = classify_device(&ctx, "tank-1", NOW).await?;

        assert_eq!(
            outcome,
            DeviceOutcome::Skipped(WindowError::InsufficientData {
                required: 48,
                available: 40,
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn device_without_recent_data_is_skipped() -> Result<(), StoreError> {
        let stale = vec![Reading::new("tank-9", NOW - time::Duration::hours(72)).with("phase_hint", 1.0)];
        let store = Arc::new(InMemoryStore::with_readings(stale));
        let ctx = context(Arc::clone(&store), Arc::new(RecordingNotifier::default()));

        let outcome = classify_device(&ctx, "tank-9", NOW).await?;

        assert_eq!(outcome, DeviceOutcome::NoRecentData);
        Ok(())
    }

    #[tokio::test]
    async fn store_failure_on_one_device_does_not_stop_the_pass() -> Result<(), StoreError> {
        let mut readings = hourly("tank-1", 48, 1.0);
        readings.extend(hourly("tank-2", 48, 2.0));
        let store = Arc::new(InMemoryStore::with_readings(readings));
        store.fail_queries_for("tank-1")?;
        let ctx = context(Arc::clone(&store), Arc::new(RecordingNotifier::default()));

        let summary = run_pass(&ctx, &CancellationToken::new(), NOW).await;

        assert_eq!(summary.devices, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.classified, 1);
        assert!(!summary.is_clean());
        assert_eq!(store.last_phase("tank-2").await?, Some("stationary".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_device() -> Result<(), StoreError> {
        let store = Arc::new(InMemoryStore::with_readings(hourly("tank-1", 48, 1.0)));
        let ctx = context(Arc::clone(&store), Arc::new(RecordingNotifier::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_pass(&ctx, &cancel, NOW).await;

        assert!(summary.cancelled);
        assert_eq!(summary.classified, 0);
        assert!(store.history()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn run_returns_when_cancelled_during_warm_up() {
        let store = Arc::new(InMemoryStore::with_readings(hourly("tank-1", 48, 1.0)));
        let ctx = context(Arc::clone(&store), Arc::new(RecordingNotifier::default()));
        let state = Arc::new(RwLock::new(AppState::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        spawn_scheduler(ctx, Arc::clone(&state), cancel)
            .await
            .expect("scheduler task");

        let guard = state.read().expect("state lock");
        assert!(guard.last_pass().is_none());
        assert!(store.history().expect("history").is_empty());
    }

    #[tokio::test]
    async fn run_publishes_pass_then_stops_on_cancel() {
        let readings = hourly_until("tank-1", 48, 1.0, OffsetDateTime::now_utc());
        let store = Arc::new(InMemoryStore::with_readings(readings));
        let mut ctx = context(Arc::clone(&store), Arc::new(RecordingNotifier::default()));
        ctx.schedule.warm_up = Duration::ZERO;
        let state = Arc::new(RwLock::new(AppState::new()));
        let mut passes = {
            let guard = state.read().expect("state lock");
            guard.subscribe_last_pass()
        };
        let cancel = CancellationToken::new();

        let handle = spawn_scheduler(ctx, Arc::clone(&state), cancel.clone());
        passes.changed().await.expect("pass published");
        cancel.cancel();
        handle.await.expect("scheduler task");

        let guard = state.read().expect("state lock");
        let summary = guard.last_pass().expect("pass recorded");
        assert_eq!(summary.classified, 1);
        assert_eq!(guard.estimates().len(), 1);
    }

    #[tokio::test]
    async fn failed_device_listing_ends_pass_and_next_pass_retries() -> Result<(), StoreError> {
        let store = Arc::new(InMemoryStore::new());
        for reading in hourly("tank-1", 48, 1.0) {
            store.insert_reading(reading)?;
        }
        store.fail_device_listing(true)?;
        let ctx = context(Arc::clone(&store), Arc::new(RecordingNotifier::default()));
        let cancel = CancellationToken::new();

        let failed = run_pass(&ctx, &cancel, NOW).await;

        assert!(failed.listing_failed);
        assert!(!failed.is_clean());
        assert_eq!(failed.devices, 0);
        assert_eq!(failed.classified, 0);
        assert!(store.history()?.is_empty());
        assert!(store.state("tank-1")?.is_none());

        store.fail_device_listing(false)?;
        let retried = run_pass(&ctx, &cancel, NOW).await;

        assert!(retried.is_clean());
        assert_eq!(retried.classified, 1);
        assert_eq!(store.history()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn run_publishes_pass_with_failed_listing() {
        let store = Arc::new(InMemoryStore::with_readings(hourly("tank-1", 48, 1.0)));
        store.fail_device_listing(true).expect("listing switch");
        let mut ctx = context(Arc::clone(&store), Arc::new(RecordingNotifier::default()));
        ctx.schedule.warm_up = Duration::ZERO;
        let state = Arc::new(RwLock::new(AppState::new()));
        let mut passes = {
            let guard = state.read().expect("state lock");
            guard.subscribe_last_pass()
        };
        let cancel = CancellationToken::new();

        let handle = spawn_scheduler(ctx, Arc::clone(&state), cancel.clone());
        passes.changed().await.expect("pass published");
        cancel.cancel();
        handle.await.expect("scheduler task");

        let guard = state.read().expect("state lock");
        let summary = guard.last_pass().expect("pass recorded");
        assert!(summary.listing_failed);
        assert!(!summary.is_clean());
        assert!(guard.estimates().is_empty());
    }
}
