use crate::classification::scheduler::{DeviceEstimate, PassSummary};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// What this process has observed so far: the last finished pass and the
/// most recent estimate per device. Persistent state lives in the store.
#[derive(Debug)]
pub struct AppState {
    interval: Duration,
    last_pass: Option<PassSummary>,
    last_pass_tx: watch::Sender<Option<PassSummary>>,
    estimates: BTreeMap<String, DeviceEstimate>,
    estimates_tx: watch::Sender<Vec<DeviceEstimate>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        let (last_pass_tx, _last_pass_rx) = watch::channel(None);
        let (estimates_tx, _estimates_rx) = watch::channel(Vec::new());
        Self {
            interval,
            last_pass: None,
            last_pass_tx,
            estimates: BTreeMap::new(),
            estimates_tx,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_pass(&self) -> Option<&PassSummary> {
        self.last_pass.as_ref()
    }

    pub fn subscribe_last_pass(&self) -> watch::Receiver<Option<PassSummary>> {
        self.last_pass_tx.subscribe()
    }

    /// Latest estimate per device, ordered by device id.
    pub fn estimates(&self) -> Vec<&DeviceEstimate> {
        self.estimates.values().collect()
    }

    pub fn subscribe_estimates(&self) -> watch::Receiver<Vec<DeviceEstimate>> {
        self.estimates_tx.subscribe()
    }

    /// Devices skipped or failed in this pass keep their previous estimate.
    pub fn record_pass(&mut self, summary: PassSummary) {
        for estimate in &summary.estimates {
            self.estimates
                .insert(estimate.device_id.clone(), estimate.clone());
        }
        self.estimates_tx
            .send_replace(self.estimates.values().cloned().collect());
        self.last_pass = Some(summary.clone());
        self.last_pass_tx.send_replace(Some(summary));
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
