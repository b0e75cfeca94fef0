//! Delivery of rendered account reports.
//!
//! Notification failures never affect scheduling; the worst case is a warning
//! in the log and a report that only exists there.

use std::future::Future;

pub trait Notifier: Send + Sync + 'static {
    fn send(&self, text: &str) -> impl Future<Output = ()> + Send;
}

/// Telegram bot delivery. With no token configured the report block is logged
/// instead, so unconfigured runs still surface per-account results.
pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
    user_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, user_ids: Vec<i64>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            user_ids,
        }
    }

    pub fn from_config(config: &crate::config::TelegramConfig) -> Self {
        Self::new(config.bot_token.clone(), config.user_ids.clone())
    }
}

impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) {
        if self.bot_token.is_empty() || self.user_ids.is_empty() {
            tracing::info!("account report:\n{text}");
            return;
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        for user_id in &self.user_ids {
            let payload = serde_json::json!({
                "chat_id": user_id,
                "text": text,
                "disable_web_page_preview": true,
            });
            match self.http.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(user_id, status = %response.status(), "telegram rejected the report");
                }
                Err(err) => {
                    tracing::warn!(user_id, %err, "failed to deliver the report");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_notifier_never_errors() {
        let notifier = TelegramNotifier::new(String::new(), vec![]);
        notifier.send("[1/1] 0xabc\n\nNo actions").await;
    }
}
