//! In-process relay: a channel bus shared by multiple relay clients.
//!
//! Used by tests and same-process loopback runs. Mirrors the hosted
//! relay's delivery model: frames published by a client are delivered to
//! every *other* subscriber of the channel (publisher exclusion), in
//! publish order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{RelaySubscription, SignalFrame, SignalingRelay};

#[derive(Default)]
struct BusState {
    next_client: u64,
    /// channel name → subscribers
    channels: HashMap<String, Vec<BusSubscriber>>,
}

struct BusSubscriber {
    client: u64,
    tx: mpsc::UnboundedSender<SignalFrame>,
}

/// Shared bus handing out per-client relay handles.
#[derive(Clone, Default)]
pub struct RelayBus {
    state: Arc<Mutex<BusState>>,
}

impl RelayBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new relay client attached to this bus.
    pub fn client(&self) -> InMemoryRelay {
        let id = {
            let mut state = self.state.lock().expect("relay bus poisoned");
            state.next_client += 1;
            state.next_client
        };
        InMemoryRelay {
            id,
            state: self.state.clone(),
        }
    }
}

/// One client's view of the bus. Each client has an identity so its own
/// publishes are not echoed back to it.
pub struct InMemoryRelay {
    id: u64,
    state: Arc<Mutex<BusState>>,
}

#[async_trait]
impl SignalingRelay for InMemoryRelay {
    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().expect("relay bus poisoned");
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(BusSubscriber {
                client: self.id,
                tx,
            });
        debug!(event = "relay_subscribe", channel, client = self.id);
        Ok(RelaySubscription {
            channel: channel.to_string(),
            frames: rx,
        })
    }

    async fn publish(&self, channel: &str, frame: SignalFrame) -> Result<()> {
        let mut state = self.state.lock().expect("relay bus poisoned");
        let subscribers = state
            .channels
            .get_mut(channel)
            .ok_or_else(|| anyhow!("relay channel '{}' has no subscribers", channel))?;
        // Drop subscribers whose receiving end has gone away.
        subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in subscribers.iter() {
            if sub.client != self.id {
                let _ = sub.tx.send(frame.clone());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) {
        let mut state = self.state.lock().expect("relay bus poisoned");
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.retain(|sub| sub.client != self.id);
            if subscribers.is_empty() {
                state.channels.remove(channel);
            }
        }
        debug!(event = "relay_unsubscribe", channel, client = self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalKind;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_other_subscribers_in_publish_order() {
        let bus = RelayBus::new();
        let a = bus.client();
        let b = bus.client();

        let mut sub_b = b.subscribe("private-AB12CD").await.unwrap();
        let _sub_a = a.subscribe("private-AB12CD").await.unwrap();

        for i in 0..3 {
            a.publish(
                "private-AB12CD",
                SignalFrame::ice_candidate(json!({ "seq": i })),
            )
            .await
            .unwrap();
        }

        for i in 0..3 {
            let frame = sub_b.frames.recv().await.unwrap();
            assert_eq!(frame.event, SignalKind::IceCandidate);
            assert_eq!(frame.payload["seq"], i);
        }
    }

    #[tokio::test]
    async fn publisher_does_not_receive_its_own_frames() {
        let bus = RelayBus::new();
        let a = bus.client();
        let b = bus.client();

        let mut sub_a = a.subscribe("private-XYZXYZ").await.unwrap();
        let _sub_b = b.subscribe("private-XYZXYZ").await.unwrap();

        a.publish("private-XYZXYZ", SignalFrame::ready())
            .await
            .unwrap();
        b.publish("private-XYZXYZ", SignalFrame::ready())
            .await
            .unwrap();

        // Only b's frame reaches a.
        let frame = sub_a.frames.recv().await.unwrap();
        assert_eq!(frame.event, SignalKind::Ready);
        assert!(sub_a.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_to_empty_channel_is_an_error() {
        let bus = RelayBus::new();
        let a = bus.client();
        assert!(a
            .publish("private-NOBODY", SignalFrame::ready())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = RelayBus::new();
        let a = bus.client();
        let _sub = a.subscribe("private-ONCE01").await.unwrap();

        a.unsubscribe("private-ONCE01").await;
        a.unsubscribe("private-ONCE01").await;
        a.unsubscribe("private-NEVER1").await;
    }
}
