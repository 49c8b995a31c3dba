//! Visitor → operator path: persist the message, then notify Telegram.

use crate::{
    bus::{Event, EventBus},
    chat::{ChatMessage, NewMessage},
    config::Config,
    interface::telegram::{render_visitor_message, BotApi, DeliveryError, SentMessage},
    store::{Store, StoreError},
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Rejected before anything was written.
    #[error("{0}")]
    Validation(String),

    /// Nothing was sent; the caller should keep the input and retry.
    #[error("failed to store message: {0}")]
    Persistence(#[from] StoreError),
}

/// Result of the Telegram notification step.
#[derive(Debug)]
pub enum Delivery {
    Delivered(SentMessage),
    Failed(DeliveryError),
}

#[derive(Debug)]
pub struct RelayOutcome {
    /// The stored visitor message, stamped when delivery succeeded.
    pub message: ChatMessage,
    pub delivery: Delivery,
}

impl RelayOutcome {
    pub fn notified(&self) -> bool {
        matches!(self.delivery, Delivery::Delivered(_))
    }

    pub fn warning(&self) -> Option<String> {
        match &self.delivery {
            Delivery::Delivered(_) => None,
            Delivery::Failed(err) => Some(format!(
                "Message saved, but the operator could not be notified: {err}"
            )),
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    store: Store,
    bus: Arc<EventBus>,
    bot: Option<Arc<dyn BotApi>>,
    config: Arc<Config>,
}

impl Relay {
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        bot: Option<Arc<dyn BotApi>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            bus,
            bot,
            config,
        }
    }

    /// Store a visitor message and forward it to the operator.
    ///
    /// Only validation and storage failures are errors. A failed Telegram
    /// notification is reported through [`RelayOutcome::delivery`].
    pub async fn relay(&self, session_id: &str, content: &str) -> Result<RelayOutcome, RelayError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(RelayError::Validation("Session id is required.".to_string()));
        }
        if content.trim().is_empty() {
            return Err(RelayError::Validation("Message is required.".to_string()));
        }

        let (session, created) = self.store.ensure_session(session_id).await?;
        if created {
            info!(session_id, "Chat session created");
            self.bus.publish(Event::SessionCreated(session));
        }

        let mut message = self
            .store
            .append_message(&NewMessage::visitor(session_id, content))
            .await?;
        self.bus.publish(Event::MessageInserted(message.clone()));

        let delivery = match self.deliver(&message).await {
            Ok(sent) => {
                self.stamp(&mut message, sent).await;
                Delivery::Delivered(sent)
            }
            Err(err) => {
                warn!(session_id, message_id = message.id, "Telegram notification failed: {}", err);
                Delivery::Failed(err)
            }
        };

        Ok(RelayOutcome { message, delivery })
    }

    async fn deliver(&self, message: &ChatMessage) -> Result<SentMessage, DeliveryError> {
        let (Some(bot), Some(chat_id)) = (self.bot.as_ref(), self.config.operator_chat_id) else {
            return Err(DeliveryError::NotConfigured);
        };

        let link = self.config.dashboard_link(&message.session_id);
        let text = render_visitor_message(&message.content, &message.session_id, link.as_deref());

        let timeout = self.config.relay_timeout;
        match tokio::time::timeout(timeout, bot.send_markdown(chat_id, &text, None)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        }
    }

    async fn stamp(&self, message: &mut ChatMessage, sent: SentMessage) {
        match self
            .store
            .set_external_message_id(message.id, sent.chat_id, sent.message_id)
            .await
        {
            Ok(true) => {
                message.external_chat_id = Some(sent.chat_id);
                message.external_message_id = Some(sent.message_id);
                self.bus.publish(Event::MessageRelayed(message.clone()));
            }
            Ok(false) => {
                warn!(
                    message_id = message.id,
                    external_chat_id = sent.chat_id,
                    external_message_id = sent.message_id,
                    "Message already stamped or missing, replies to it may not correlate"
                );
            }
            Err(err) => {
                error!(
                    message_id = message.id,
                    external_chat_id = sent.chat_id,
                    external_message_id = sent.message_id,
                    "Failed to record Telegram message id: {}",
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatSession;
    use crate::entity::Sender;
    use crate::interface::telegram::fake::{Behavior, FakeBot};
    use crate::store::test_store;
    use std::time::Duration;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            operator_chat_id: Some(42),
            public_base_url: Some("https://example.dev".to_string()),
            relay_timeout: Duration::from_millis(200),
            ..Config::default()
        })
    }

    async fn relay_with(bot: Option<Arc<FakeBot>>) -> (Relay, Store, Arc<EventBus>) {
        let store = test_store().await;
        let bus = Arc::new(EventBus::new());
        let bot = bot.map(|b| b as Arc<dyn BotApi>);
        let relay = Relay::new(store.clone(), bus.clone(), bot, config());
        (relay, store, bus)
    }

    #[tokio::test]
    async fn relays_and_stamps_external_id() {
        let bot = Arc::new(FakeBot::delivering_from(999));
        let (relay, store, _bus) = relay_with(Some(bot.clone())).await;

        let outcome = relay.relay("abc-123", "Hello, is anyone there?").await.unwrap();

        assert!(outcome.notified());
        assert!(outcome.warning().is_none());
        assert_eq!(outcome.message.external_chat_id, Some(42));
        assert_eq!(outcome.message.external_message_id, Some(999));

        let history = store.get_chat_history("abc-123").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, Sender::Visitor);
        assert_eq!(history[0].content, "Hello, is anyone there?");
        assert_eq!(history[0].external_chat_id, Some(42));
        assert_eq!(history[0].external_message_id, Some(999));

        let sent = bot.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, 42);
        assert!(sent[0].text.contains("`abc-123`"));
        assert!(sent[0].text.contains("https://example.dev/telegram-chat#abc-123"));
    }

    #[tokio::test]
    async fn rejected_delivery_still_stores_message() {
        let bot = Arc::new(FakeBot::with(Behavior::Reject));
        let (relay, store, _bus) = relay_with(Some(bot)).await;

        let outcome = relay.relay("s", "hi").await.unwrap();

        assert!(!outcome.notified());
        assert!(matches!(outcome.delivery, Delivery::Failed(DeliveryError::Api(_))));
        assert!(outcome.warning().unwrap().contains("could not be notified"));

        let history = store.get_chat_history("s").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].external_message_id, None);
    }

    #[tokio::test]
    async fn slow_delivery_times_out_as_failure() {
        let bot = Arc::new(FakeBot::with(Behavior::Hang));
        let (relay, store, _bus) = relay_with(Some(bot)).await;

        let outcome = relay.relay("s", "anyone?").await.unwrap();

        assert!(matches!(outcome.delivery, Delivery::Failed(DeliveryError::Timeout(_))));
        assert_eq!(store.get_chat_history("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_bot_is_a_soft_failure() {
        let (relay, store, _bus) = relay_with(None).await;

        let outcome = relay.relay("s", "hi").await.unwrap();

        assert!(matches!(outcome.delivery, Delivery::Failed(DeliveryError::NotConfigured)));
        assert_eq!(store.get_chat_history("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_input_is_rejected_before_any_write() {
        let bot = Arc::new(FakeBot::delivering_from(1));
        let (relay, store, _bus) = relay_with(Some(bot.clone())).await;

        assert!(matches!(relay.relay("s", "   ").await, Err(RelayError::Validation(_))));
        assert!(matches!(relay.relay("  ", "hi").await, Err(RelayError::Validation(_))));

        assert!(store.get_session("s").await.unwrap().is_none());
        assert!(store.list_sessions(10).await.unwrap().is_empty());
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn repeated_sends_reuse_the_session() {
        let bot = Arc::new(FakeBot::delivering_from(10));
        let (relay, store, bus) = relay_with(Some(bot)).await;
        let mut events = bus.subscribe_all();

        relay.relay("s", "one").await.unwrap();
        relay.relay("s", "two").await.unwrap();

        assert_eq!(store.list_sessions(10).await.unwrap().len(), 1);
        let contents: Vec<_> = store
            .get_chat_history("s")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two"]);

        assert!(matches!(events.recv().await.unwrap(), Event::SessionCreated(_)));
        assert!(matches!(events.recv().await.unwrap(), Event::MessageInserted(_)));
        assert!(matches!(events.recv().await.unwrap(), Event::MessageRelayed(_)));
        assert!(matches!(events.recv().await.unwrap(), Event::MessageInserted(_)));
    }

    #[tokio::test]
    async fn failed_stamp_keeps_delivery_and_skips_relayed_event() {
        let store = test_store().await;
        let bus = Arc::new(EventBus::new());
        let relay_via = |first_id: i64| {
            let bot: Arc<dyn BotApi> = Arc::new(FakeBot::delivering_from(first_id));
            Relay::new(store.clone(), bus.clone(), Some(bot), config())
        };

        relay_via(999).relay("alice", "first").await.unwrap();

        // A second bot hands back a message id that is already stored for this chat.
        let mut events = bus.subscribe_all();
        let outcome = relay_via(999).relay("bob", "second").await.unwrap();

        assert!(outcome.notified());
        assert!(outcome.warning().is_none());
        assert_eq!(outcome.message.external_message_id, None);

        let history = store.get_chat_history("bob").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].external_chat_id, None);
        assert_eq!(history[0].external_message_id, None);
        assert_eq!(
            store.find_session_by_external_id(42, 999).await.unwrap().as_deref(),
            Some("alice")
        );

        bus.publish(Event::SessionCreated(ChatSession::new("end")));
        loop {
            match events.recv().await.unwrap() {
                Event::MessageRelayed(msg) => panic!("unexpected relayed event for {}", msg.session_id),
                Event::SessionCreated(session) if session.id == "end" => break,
                _ => {}
            }
        }
    }
}
