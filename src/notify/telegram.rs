use crate::notify::{NotifyError, NotifyOutcome, Notifier};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// HTTP request timeout for a single send.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

impl fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

/// Sends alerts through the Bot API `sendMessage` method.
pub struct TelegramNotifier {
    client: reqwest::Client,
    credentials: TelegramCredentials,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(
        credentials: TelegramCredentials,
        api_base: Option<&str>,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            credentials,
            api_base: api_base
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn send_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.credentials.bot_token)
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let payload = SendMessage {
            chat_id: &self.credentials.chat_id,
            text,
            parse_mode: "Markdown",
        };
        let response = self.client.post(self.send_url()).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

impl fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("api_base", &self.api_base)
            .field("credentials", &self.credentials)
            .finish()
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) -> NotifyOutcome {
        match self.send(message).await {
            Ok(()) => {
                info!(chat_id = %self.credentials.chat_id, "Alert sent");
                NotifyOutcome::Sent
            }
            Err(err) => {
                // reqwest errors carry the URL, which embeds the bot token.
                let err = match err {
                    NotifyError::Request(inner) => NotifyError::Request(inner.without_url()),
                    other => other,
                };
                warn!(error = %err, "Failed to send alert");
                NotifyOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> TelegramCredentials {
        TelegramCredentials {
            bot_token: "123:secret".to_string(),
            chat_id: "-1001".to_string(),
        }
    }

    #[test]
    fn send_url_embeds_token() -> Result<(), NotifyError> {
        let notifier = TelegramNotifier::new(credentials(), Some("http://localhost:8081/"))?;

        assert_eq!(
            notifier.send_url(),
            "http://localhost:8081/bot123:secret/sendMessage"
        );
        Ok(())
    }

    #[test]
    fn default_base_is_public_api() -> Result<(), NotifyError> {
        let notifier = TelegramNotifier::new(credentials(), None)?;

        assert!(notifier.send_url().starts_with("https://api.telegram.org/bot"));
        Ok(())
    }

    #[test]
    fn debug_output_hides_token() -> Result<(), NotifyError> {
        let notifier = TelegramNotifier::new(credentials(), None)?;

        let rendered = format!("{notifier:?}");

        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("-1001"));
        Ok(())
    }

    #[test]
    fn payload_uses_markdown() -> Result<(), serde_json::Error> {
        let payload = SendMessage {
            chat_id: "-1001",
            text: "*hi*",
            parse_mode: "Markdown",
        };

        let value = serde_json::to_value(&payload)?;

        assert_eq!(
            value,
            serde_json::json!({"chat_id": "-1001", "text": "*hi*", "parse_mode": "Markdown"})
        );
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_failure() -> Result<(), NotifyError> {
        // Nothing listens on the discard port locally.
        let notifier = TelegramNotifier::new(credentials(), Some("http://127.0.0.1:9"))?;

        assert_eq!(notifier.notify("phase changed").await, NotifyOutcome::Failed);
        Ok(())
    }
}
