//! In-process pub/sub, one ordered handler list per event kind.
//!
//! `publish` awaits every subscribed handler for that event's kind, in
//! subscription order; handlers for different kinds never interact. Each
//! event kind gets its own statically-typed subscriber list, rather than a
//! single dynamically-keyed dispatch table.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use serde_json::Value;

use crate::message::Message;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An async event handler. Implemented automatically for any
/// `Fn(E) -> impl Future<Output = anyhow::Result<()>>`.
pub trait Handler<E>: Send + Sync {
    fn call(&self, event: E) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<E, F, Fut> Handler<E> for F
where
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(&self, event: E) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(event))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDiscovered {
    pub uid: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeLost {
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageReceived {
    pub uid: String,
    pub message: Message,
}

impl MessageReceived {
    /// The `{type, body}` shape delivered to outer collaborators.
    pub fn to_json(&self) -> Value {
        match &self.message {
            Message::System(body) => serde_json::json!({"type": "system", "body": body}),
            Message::User(body) => serde_json::json!({"type": "user", "body": body}),
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    node_discovered: Mutex<Vec<Arc<dyn Handler<NodeDiscovered>>>>,
    node_lost: Mutex<Vec<Arc<dyn Handler<NodeLost>>>>,
    message_received: Mutex<Vec<Arc<dyn Handler<MessageReceived>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_node_discovered(&self, handler: Arc<dyn Handler<NodeDiscovered>>) {
        self.node_discovered.lock().push(handler);
    }

    pub fn subscribe_node_lost(&self, handler: Arc<dyn Handler<NodeLost>>) {
        self.node_lost.lock().push(handler);
    }

    pub fn subscribe_message_received(&self, handler: Arc<dyn Handler<MessageReceived>>) {
        self.message_received.lock().push(handler);
    }

    pub async fn publish_node_discovered(&self, event: NodeDiscovered) {
        let handlers: Vec<_> = self.node_discovered.lock().clone();
        for handler in handlers {
            if let Err(e) = handler.call(event.clone()).await {
                warn!("[EventBus] NodeDiscovered handler failed: {e}");
            }
        }
    }

    pub async fn publish_node_lost(&self, event: NodeLost) {
        let handlers: Vec<_> = self.node_lost.lock().clone();
        for handler in handlers {
            if let Err(e) = handler.call(event.clone()).await {
                warn!("[EventBus] NodeLost handler failed: {e}");
            }
        }
    }

    pub async fn publish_message_received(&self, event: MessageReceived) {
        let handlers: Vec<_> = self.message_received.lock().clone();
        for handler in handlers {
            if let Err(e) = handler.call(event.clone()).await {
                warn!("[EventBus] MessageReceived handler failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn handlers_invoked_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe_node_discovered(Arc::new(move |_: NodeDiscovered| {
            let o1 = o1.clone();
            async move {
                o1.lock().push(1);
                Ok(())
            }
        }));

        let o2 = order.clone();
        bus.subscribe_node_discovered(Arc::new(move |_: NodeDiscovered| {
            let o2 = o2.clone();
            async move {
                o2.lock().push(2);
                Ok(())
            }
        }));

        bus.publish_node_discovered(NodeDiscovered {
            uid: "a".into(),
            ip: "1.2.3.4".into(),
        })
        .await;

        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe_node_lost(Arc::new(|_: NodeLost| async {
            anyhow::bail!("boom")
        }));

        let c = count.clone();
        bus.subscribe_node_lost(Arc::new(move |_: NodeLost| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        bus.publish_node_lost(NodeLost { uid: "a".into() }).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish_message_received(MessageReceived {
            uid: "a".into(),
            message: Message::User(serde_json::json!(1)),
        })
        .await;
    }
}
