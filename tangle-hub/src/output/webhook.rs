//! Webhook output handler.
//!
//! Posts each event as a JSON record to a configured URL. The event name and
//! hub id also travel as headers so receivers can route without parsing.

use super::{EventHandler, EventRecord};
use crate::events::HubEvent;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

const EVENT_HEADER: &str = "X-Hub-Event";
const HUB_HEADER: &str = "X-Hub-Id";

/// Handler that POSTs events to a webhook URL.
pub struct WebhookHandler {
    /// HTTP client with a 30s request timeout
    client: Client,
    /// Webhook URL to POST events to
    url: String,
    /// Number of retries on failure
    max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    retry_delay: Duration,
}

/// Why a delivery attempt failed.
enum Delivery {
    /// Worth another attempt.
    Retry(anyhow::Error),
    /// The receiver rejected the record; resending won't help.
    Rejected(anyhow::Error),
}

impl WebhookHandler {
    /// Create a handler posting to `url` with 3 retries starting at a 1s delay.
    ///
    /// The URL is only parsed when the first event is sent.
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            url: url.to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        })
    }

    async fn post_with_retry(&self, event: &HubEvent) -> anyhow::Result<()> {
        let mut delay = self.retry_delay;
        let mut attempt = 0;

        loop {
            match self.post_once(event).await {
                Ok(()) => return Ok(()),
                Err(Delivery::Rejected(e)) => return Err(e),
                Err(Delivery::Retry(e)) if attempt >= self.max_retries => return Err(e),
                Err(Delivery::Retry(e)) => {
                    attempt += 1;
                    tracing::warn!(
                        "Webhook retry {} for {} event of hub #{}: {}",
                        attempt,
                        event.name(),
                        event.hub(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    async fn post_once(&self, event: &HubEvent) -> Result<(), Delivery> {
        let response = self
            .client
            .post(&self.url)
            .header(EVENT_HEADER, event.name())
            .header(HUB_HEADER, event.hub().to_string())
            .json(&EventRecord::new(event))
            .send()
            .await
            .map_err(|e| Delivery::Retry(e.into()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!("Posted {} event of hub #{} to webhook", event.name(), event.hub());
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let error = anyhow::anyhow!(
            "Webhook returned status {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        );
        if is_retryable(status) {
            Err(Delivery::Retry(error))
        } else {
            Err(Delivery::Rejected(error))
        }
    }
}

/// Statuses worth another attempt.
fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

#[async_trait]
impl EventHandler for WebhookHandler {
    async fn handle(&self, event: &HubEvent) -> anyhow::Result<()> {
        self.post_with_retry(event).await
    }
}
