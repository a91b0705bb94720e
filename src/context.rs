//! Everything a classification pass needs, built once at startup and shared
//! read-only with the scheduler task.

use crate::classification::PhaseClassifier;
use crate::notify::Notifier;
use crate::telemetry::TelemetryStore;
use std::sync::Arc;
use std::time::Duration;

/// Delay before the first pass, letting the rest of the process come up.
pub const WARM_UP: Duration = Duration::from_secs(2);

/// Trailing span of readings considered for one classification.
pub const LOOKBACK: time::Duration = time::Duration::hours(48);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub interval: Duration,
    pub warm_up: Duration,
    pub lookback: time::Duration,
}

impl ScheduleSettings {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            warm_up: WARM_UP,
            lookback: LOOKBACK,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn TelemetryStore>,
    pub classifier: Arc<PhaseClassifier>,
    pub notifier: Arc<dyn Notifier>,
    pub schedule: ScheduleSettings,
}

impl ServiceContext {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        classifier: Arc<PhaseClassifier>,
        notifier: Arc<dyn Notifier>,
        schedule: ScheduleSettings,
    ) -> Self {
        Self {
            store,
            classifier,
            notifier,
            schedule,
        }
    }
}
