//! Event dispatch for the lifecycle client.
//!
//! [`EventDispatcher`] fans out three observable event streams — message
//! received, closed, error — to zero or more subscribers. Delivery is
//! synchronous, in registration order, on whichever task raised the event
//! (the receive loop for inbound events, the closing task for an explicit
//! teardown). A panicking subscriber is isolated so it cannot prevent
//! delivery to later subscribers in the same dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::close_code::CloseCode;
use crate::error::WsClientError;
use crate::message::WsMessage;

/// Opaque handle returned by the subscribe methods, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type MessageHandler = Arc<dyn Fn(&WsMessage) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(CloseCode, Option<&str>) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&WsClientError) + Send + Sync>;

/// Ordered fan-out of message / closed / error events.
///
/// Handlers for one event kind are invoked in the order they were
/// registered. The handler lists are snapshotted before invocation, so a
/// handler may subscribe or unsubscribe re-entrantly without deadlocking;
/// such changes take effect from the next dispatch.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    message: Mutex<Vec<(SubscriptionId, MessageHandler)>>,
    closed: Mutex<Vec<(SubscriptionId, CloseHandler)>>,
    error: Mutex<Vec<(SubscriptionId, ErrorHandler)>>,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a handler for complete inbound messages.
    pub fn subscribe_message(
        &self,
        handler: impl Fn(&WsMessage) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.message.lock().push((id, Arc::new(handler)));
        id
    }

    /// Register a handler for the terminal close notification.
    pub fn subscribe_closed(
        &self,
        handler: impl Fn(CloseCode, Option<&str>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.closed.lock().push((id, Arc::new(handler)));
        id
    }

    /// Register a handler for asynchronous transport errors.
    pub fn subscribe_error(
        &self,
        handler: impl Fn(&WsClientError) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.error.lock().push((id, Arc::new(handler)));
        id
    }

    /// Remove the subscription with the given id.
    ///
    /// Returns `true` if a handler was removed, `false` if the id was
    /// unknown (already unsubscribed, or cleared by disposal).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        fn remove<H>(list: &Mutex<Vec<(SubscriptionId, H)>>, id: SubscriptionId) -> bool {
            let mut guard = list.lock();
            let before = guard.len();
            guard.retain(|(sub, _)| *sub != id);
            guard.len() != before
        }

        remove(&self.message, id) || remove(&self.closed, id) || remove(&self.error, id)
    }

    /// Remove every subscription. Called on disposal.
    pub fn clear(&self) {
        self.message.lock().clear();
        self.closed.lock().clear();
        self.error.lock().clear();
    }

    /// Dispatch a complete inbound message to all message subscribers.
    pub fn emit_message(&self, message: &WsMessage) {
        let handlers: Vec<MessageHandler> = {
            let guard = self.message.lock();
            guard.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                warn!("message subscriber panicked; continuing with remaining subscribers");
            }
        }
    }

    /// Dispatch the terminal close notification to all closed subscribers.
    pub fn emit_closed(&self, code: CloseCode, reason: Option<&str>) {
        let handlers: Vec<CloseHandler> = {
            let guard = self.closed.lock();
            guard.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(code, reason))).is_err() {
                warn!("closed subscriber panicked; continuing with remaining subscribers");
            }
        }
    }

    /// Dispatch an asynchronous transport error to all error subscribers.
    pub fn emit_error(&self, error: &WsClientError) {
        let handlers: Vec<ErrorHandler> = {
            let guard = self.error.lock();
            guard.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                warn!("error subscriber panicked; continuing with remaining subscribers");
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("message_subscribers", &self.message.lock().len())
            .field("closed_subscribers", &self.closed.lock().len())
            .field("error_subscribers", &self.error.lock().len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn message_subscribers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            dispatcher.subscribe_message(move |_| order.lock().unwrap().push(tag));
        }

        dispatcher.emit_message(&WsMessage::Text("hi".into()));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery() {
        let dispatcher = EventDispatcher::new();
        let reached = Arc::new(StdMutex::new(false));

        dispatcher.subscribe_message(|_| panic!("boom"));
        {
            let reached = Arc::clone(&reached);
            dispatcher.subscribe_message(move |_| *reached.lock().unwrap() = true);
        }

        dispatcher.emit_message(&WsMessage::Text("hi".into()));
        assert!(*reached.lock().unwrap());
    }

    #[test]
    fn unsubscribe_removes_exactly_one_handler() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(StdMutex::new(0u32));

        let keep = {
            let count = Arc::clone(&count);
            dispatcher.subscribe_message(move |_| *count.lock().unwrap() += 1)
        };
        let drop_me = {
            let count = Arc::clone(&count);
            dispatcher.subscribe_message(move |_| *count.lock().unwrap() += 10)
        };

        assert!(dispatcher.unsubscribe(drop_me));
        assert!(!dispatcher.unsubscribe(drop_me), "second removal is a no-op");

        dispatcher.emit_message(&WsMessage::Text("hi".into()));
        assert_eq!(*count.lock().unwrap(), 1);

        assert!(dispatcher.unsubscribe(keep));
    }

    #[test]
    fn unsubscribe_finds_handlers_across_event_kinds() {
        let dispatcher = EventDispatcher::new();
        let closed_id = dispatcher.subscribe_closed(|_, _| {});
        let error_id = dispatcher.subscribe_error(|_| {});

        assert!(dispatcher.unsubscribe(closed_id));
        assert!(dispatcher.unsubscribe(error_id));
        assert!(!dispatcher.unsubscribe(closed_id));
    }

    #[test]
    fn clear_removes_all_subscriptions() {
        let dispatcher = EventDispatcher::new();
        let fired = Arc::new(StdMutex::new(false));

        {
            let fired = Arc::clone(&fired);
            dispatcher.subscribe_closed(move |_, _| *fired.lock().unwrap() = true);
        }
        dispatcher.clear();

        dispatcher.emit_closed(CloseCode::Normal, None);
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn closed_event_carries_code_and_reason() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(StdMutex::new(None));

        {
            let seen = Arc::clone(&seen);
            dispatcher.subscribe_closed(move |code, reason| {
                *seen.lock().unwrap() = Some((code, reason.map(str::to_owned)));
            });
        }

        dispatcher.emit_closed(CloseCode::Away, Some("going away"));
        assert_eq!(
            *seen.lock().unwrap(),
            Some((CloseCode::Away, Some("going away".to_owned())))
        );
    }

    #[test]
    fn reentrant_subscribe_does_not_deadlock() {
        let dispatcher = Arc::new(EventDispatcher::new());

        {
            let inner = Arc::clone(&dispatcher);
            dispatcher.subscribe_message(move |_| {
                inner.subscribe_message(|_| {});
            });
        }

        // Must not deadlock; the new handler joins from the next dispatch.
        dispatcher.emit_message(&WsMessage::Text("hi".into()));
    }
}
