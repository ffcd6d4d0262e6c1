//! Domain events emitted by the hub engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AccountId, HotWalletInput, HubId, Sweep};

/// Events consumers can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum HubEvent {
    /// Value arrived on a deposit address.
    #[serde(rename = "deposit")]
    Deposit {
        hub: HubId,
        account: AccountId,
        address: String,
        #[serde(rename = "keyIndex")]
        key_index: u64,
        value: u64,
    },
    /// A deposit was submitted for sweeping into the hot wallet.
    #[serde(rename = "sweep")]
    Sweep {
        hub: HubId,
        account: AccountId,
        address: String,
        #[serde(rename = "keyIndex")]
        key_index: u64,
        #[serde(rename = "destinationAddress")]
        destination_address: String,
        value: u64,
        tx: String,
    },
    /// Account credit was raised, by a confirmed sweep or an operator.
    #[serde(rename = "credit")]
    Credit {
        hub: HubId,
        account: AccountId,
        value: u64,
        /// Credit after the change, when it could be read back.
        credit: Option<i64>,
        #[serde(rename = "balanceOnTangle")]
        balance_on_tangle: Option<i64>,
        #[serde(rename = "offChain")]
        off_chain: bool,
    },
    /// A withdrawal was submitted.
    #[serde(rename = "withdraw")]
    Withdraw {
        hub: HubId,
        account: AccountId,
        value: u64,
        /// Credit after the debit.
        credit: i64,
        address: String,
        remainder: u64,
        inputs: Vec<HotWalletInput>,
        #[serde(rename = "remainderAddress")]
        remainder_address: Option<String>,
        hash: String,
    },
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::Deposit { .. } => "deposit",
            HubEvent::Sweep { .. } => "sweep",
            HubEvent::Credit { .. } => "credit",
            HubEvent::Withdraw { .. } => "withdraw",
        }
    }

    pub fn hub(&self) -> HubId {
        match self {
            HubEvent::Deposit { hub, .. }
            | HubEvent::Sweep { hub, .. }
            | HubEvent::Credit { hub, .. }
            | HubEvent::Withdraw { hub, .. } => *hub,
        }
    }

    pub(crate) fn sweep(hub: HubId, sweep: &Sweep, tx: &str) -> Self {
        HubEvent::Sweep {
            hub,
            account: sweep.account,
            address: sweep.address.clone(),
            key_index: sweep.key_index,
            destination_address: sweep.destination_address.clone(),
            value: sweep.value,
            tx: tx.to_string(),
        }
    }
}

/// Fan-out of hub events.
///
/// Clone this to share across components. Emitting never blocks and never
/// fails; events sent while nobody subscribes are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: HubEvent) {
        tracing::debug!("Emitting {} event for hub #{}", event.name(), event.hub());
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let event = HubEvent::Deposit {
            hub: 1,
            account: 2,
            address: "ADDR".to_string(),
            key_index: 2_000_000,
            value: 1000,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "deposit");
        assert_eq!(json["data"]["keyIndex"], 2_000_000);
        assert_eq!(json["data"]["value"], 1000);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(HubEvent::Credit {
            hub: 1,
            account: 1,
            value: 5,
            credit: Some(5),
            balance_on_tangle: Some(0),
            off_chain: true,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "credit");
        assert_eq!(event.hub(), 1);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(HubEvent::Sweep {
            hub: 1,
            account: 1,
            address: "A".to_string(),
            key_index: 0,
            destination_address: "B".to_string(),
            value: 1,
            tx: "T".to_string(),
        });
    }
}
