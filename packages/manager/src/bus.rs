//! Transition announcements bus.

use std::future::Future;
use std::pin::Pin;

use job_core::TransitionBatch;
use thiserror::Error;
use tokio::sync::broadcast;

/// A publish was rejected by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Bus is closed")]
    Closed,
}

/// Boxed future returned by [`EventBus::publish`].
pub type BusFuture = Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>>;

/// Publish side of the notification bus.
pub trait EventBus: Send + Sync + 'static {
    /// Issue a publish of `payload` on `topic`.
    ///
    /// The message must be handed to the bus before this returns; the
    /// future only reports whether the bus accepted it.
    fn publish(&self, topic: &str, payload: TransitionBatch) -> BusFuture;
}

/// A message seen by bus subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: TransitionBatch,
}

/// In-process bus on a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<Published>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, topic: &str, payload: TransitionBatch) -> BusFuture {
        tracing::debug!("Publishing {} transitions on {}", payload.len(), topic);
        // No subscribers is fine.
        let _ = self.tx.send(Published {
            topic: topic.to_string(),
            payload,
        });
        Box::pin(std::future::ready(Ok(())))
    }
}
