//! In-process fan-out of chat changes to live subscribers.
//!
//! Delivery is push-only: a subscriber sees what is published while it is
//! connected, in publish order. Anything missed (not yet subscribed, or lagged
//! past the channel capacity) must be recovered by refetching history.

use crate::chat::{ChatMessage, ChatSession};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A message was appended to a session.
    MessageInserted(ChatMessage),

    /// A visitor message was delivered to Telegram and stamped with its id.
    MessageRelayed(ChatMessage),

    /// A session row was created.
    SessionCreated(ChatSession),
}

impl Event {
    pub fn session_id(&self) -> &str {
        match self {
            Event::MessageInserted(msg) | Event::MessageRelayed(msg) => &msg.session_id,
            Event::SessionCreated(session) => &session.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscriber lagged behind and skipped {0} events")]
    Lagged(u64),

    #[error("event bus closed")]
    Closed,
}

impl From<broadcast::error::RecvError> for SubscriptionError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Lagged(n) => SubscriptionError::Lagged(n),
            broadcast::error::RecvError::Closed => SubscriptionError::Closed,
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // No receivers is the common case between page views.
        let _ = self.tx.send(event);
    }

    /// Every change, for the operator dashboard.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Messages inserted into one session, for the visitor's widget.
    pub fn subscribe_session(&self, session_id: impl Into<String>) -> SessionSubscription {
        SessionSubscription {
            session_id: session_id.into(),
            rx: self.tx.subscribe(),
        }
    }

    /// Run `callback` for each message inserted into `session_id` until the
    /// returned handle is unsubscribed or dropped.
    pub fn on_session_message<F>(
        &self,
        session_id: impl Into<String>,
        mut callback: F,
    ) -> SubscriptionHandle
    where
        F: FnMut(ChatMessage) + Send + 'static,
    {
        let mut subscription = self.subscribe_session(session_id);

        let task = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(msg) => callback(msg),
                    Err(SubscriptionError::Lagged(skipped)) => {
                        warn!(
                            session_id = %subscription.session_id(),
                            skipped,
                            "Session subscriber lagged, history refetch required"
                        );
                    }
                    Err(SubscriptionError::Closed) => break,
                }
            }
        });

        SubscriptionHandle { task: Some(task) }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<Event, SubscriptionError> {
        Ok(self.rx.recv().await?)
    }
}

pub struct SessionSubscription {
    session_id: String,
    rx: broadcast::Receiver<Event>,
}

impl SessionSubscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next message inserted into this session.
    pub async fn recv(&mut self) -> Result<ChatMessage, SubscriptionError> {
        loop {
            if let Event::MessageInserted(msg) = self.rx.recv().await? {
                if msg.session_id == self.session_id {
                    return Ok(msg);
                }
            }
        }
    }
}

/// Owns a callback subscription. Dropping it also stops delivery.
pub struct SubscriptionHandle {
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Tear down the subscription. Once this returns no further callback runs.
    pub async fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
