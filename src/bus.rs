//! Event bus (C11): typed publish/subscribe on top of `tokio::sync::broadcast`
//! feeding the admin WebSocket relay.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::arbiter::ThreatReport;
use crate::orchestrator::MarkerVerificationResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BusEvent {
    #[serde(rename = "threat_report")]
    ThreatReport(ThreatReport),
    #[serde(rename = "marker_armed")]
    MarkerArmed { account_id: u32 },
    #[serde(rename = "marker_verification")]
    MarkerVerification {
        account_id: u32,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },
    #[serde(rename = "audit_purge")]
    AuditPurge { removed: u64 },
}

impl From<&MarkerVerificationResult> for BusEvent {
    fn from(r: &MarkerVerificationResult) -> Self {
        BusEvent::MarkerVerification {
            account_id: 0,
            state: format!("{:?}", r.state),
            confidence: Some(r.confidence_score),
        }
    }
}

/// Thin wrapper around a broadcast channel. Delivery is at-least-once per
/// subscriber and preserves publish order within this process; a slow
/// subscriber that falls behind the channel capacity will observe a lagged
/// receiver error rather than silently missing events forever.
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: BusEvent) {
        // No active subscribers is not an error: the bus is fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(BusEvent::MarkerArmed { account_id: 1 });
        bus.publish(BusEvent::MarkerArmed { account_id: 2 });
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (BusEvent::MarkerArmed { account_id: a }, BusEvent::MarkerArmed { account_id: b }) => {
                assert_eq!(a, 1);
                assert_eq!(b, 2);
            }
            _ => panic!("unexpected event order"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(BusEvent::AuditPurge { removed: 0 });
    }
}
