//! Output handlers for hub events.
//!
//! Events published on the [`EventBus`](crate::events::EventBus) can be
//! delivered to:
//! - Stdout (JSON lines)
//! - Webhook (HTTP POST)

mod stdout;
mod webhook;

pub use stdout::StdoutHandler;
pub use webhook::WebhookHandler;

use async_trait::async_trait;
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::config::OutputMode;
use crate::events::HubEvent;

/// An event stamped with the time it was delivered.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord<'a> {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: &'a HubEvent,
}

impl<'a> EventRecord<'a> {
    pub fn new(event: &'a HubEvent) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        }
    }
}

/// Trait for event output handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a single event.
    async fn handle(&self, event: &HubEvent) -> anyhow::Result<()>;

    /// Flush any buffered output.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Create an event handler based on configuration.
pub fn create_handler(
    output_mode: &OutputMode,
    webhook_url: Option<&str>,
) -> anyhow::Result<Box<dyn EventHandler>> {
    match output_mode {
        OutputMode::Stdout => Ok(Box::new(StdoutHandler::new())),
        OutputMode::Webhook => {
            let url = webhook_url
                .ok_or_else(|| anyhow::anyhow!("webhook_url required for webhook output mode"))?;
            Ok(Box::new(WebhookHandler::new(url)?))
        }
    }
}

/// Deliver every event received on `events` to `handler` until the bus is
/// dropped.
pub fn spawn_forwarder(
    mut events: broadcast::Receiver<HubEvent>,
    handler: Box<dyn EventHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = handler.handle(&event).await {
                        tracing::error!("Failed to deliver {} event: {}", event.name(), e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event output lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        if let Err(e) = handler.flush().await {
            tracing::warn!("Failed to flush event output: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<HubEvent>>>);

    #[async_trait]
    impl EventHandler for Collect {
        async fn handle(&self, event: &HubEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_webhook_mode_requires_url() {
        assert!(create_handler(&OutputMode::Webhook, None).is_err());
        assert!(create_handler(&OutputMode::Stdout, None).is_ok());
    }

    #[test]
    fn test_record_flattens_event() {
        let event = HubEvent::Deposit {
            hub: 3,
            account: 4,
            address: "A".to_string(),
            key_index: 1,
            value: 9,
        };
        let json = serde_json::to_value(EventRecord::new(&event)).unwrap();
        assert_eq!(json["event"], "deposit");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_forwarder_drains_until_closed() {
        let bus = EventBus::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_forwarder(bus.subscribe(), Box::new(Collect(seen.clone())));

        bus.emit(HubEvent::Credit {
            hub: 1,
            account: 2,
            value: 3,
            credit: Some(3),
            balance_on_tangle: None,
            off_chain: true,
        });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
