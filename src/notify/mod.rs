//! Phase-transition alerts.
//!
//! Delivery is best-effort: a [`Notifier`] never returns an error, it
//! reports what happened through [`NotifyOutcome`] and logs failures itself.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::warn;

pub mod telegram;

use telegram::{TelegramCredentials, TelegramNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Disabled,
    Failed,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The remote server returned a non-2xx status code.
    #[error("messaging endpoint returned HTTP {0}")]
    HttpStatus(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    async fn notify(&self, message: &str) -> NotifyOutcome;
}

/// Used when no messaging credentials are configured.
#[derive(Debug, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, _message: &str) -> NotifyOutcome {
        warn!("Alert not sent: BOT_TOKEN or CHAT_ID missing");
        NotifyOutcome::Disabled
    }
}

/// Telegram when credentials are present, otherwise a notifier that only
/// logs.
pub fn build_notifier(
    credentials: Option<TelegramCredentials>,
    api_base: Option<&str>,
) -> Result<Arc<dyn Notifier>, NotifyError> {
    match credentials {
        Some(credentials) => Ok(Arc::new(TelegramNotifier::new(credentials, api_base)?)),
        None => Ok(Arc::new(DisabledNotifier)),
    }
}

/// Markdown alert for a device whose phase changed.
pub fn transition_message(
    device_id: &str,
    previous: &str,
    current: &str,
    at: OffsetDateTime,
) -> String {
    let when = at
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
        .unwrap_or_else(|_| at.to_string());
    format!(
        "🔔 *Phase change detected*\nDevice: `{device_id}`\nBefore: `{previous}`\nNow: *{current}*\n🕒 {when} UTC"
    )
}
