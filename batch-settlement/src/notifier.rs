//! SMS outcome notifications

use crate::config::NotificationConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Outcome notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `body` to the user reference `to`
    async fn notify(&self, to: &str, body: &str) -> Result<()>;
}

/// Notifier that drops every message
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, to: &str, _body: &str) -> Result<()> {
        debug!("Notifications disabled, not messaging {}", to);
        Ok(())
    }
}

/// Twilio Messages API notifier
#[derive(Clone)]
pub struct TwilioNotifier {
    client: Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl std::fmt::Debug for TwilioNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwilioNotifier")
            .field("base_url", &self.base_url)
            .field("account_sid", &self.account_sid)
            .field("from_number", &self.from_number)
            .finish_non_exhaustive()
    }
}

impl TwilioNotifier {
    /// Create notifier from configuration
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            client,
            base_url: "https://api.twilio.com".to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
        })
    }

    /// Point at a different API host
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url.trim_end_matches('/'),
            self.account_sid
        )
    }
}

#[async_trait]
impl Notifier for TwilioNotifier {
    async fn notify(&self, to: &str, body: &str) -> Result<()> {
        let mut params = HashMap::new();
        params.insert("To", to);
        params.insert("From", self.from_number.as_str());
        params.insert("Body", body);

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Notification(format!("status {}: {}", status, error_text)));
        }

        debug!("SMS sent to {}", to);
        Ok(())
    }
}
