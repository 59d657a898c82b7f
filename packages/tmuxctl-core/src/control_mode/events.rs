//! Event bus for control mode notifications
//!
//! An explicit observer list owned by the connection driver. Each subscriber
//! gets its own unbounded channel, so a notification is handed to every
//! subscriber in stream order, once, before the driver reads the next line.

use tokio::sync::mpsc;

use super::parser::Notification;

pub type SubscriptionId = u64;

/// Which notifications a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    /// Only `%output` for this pane
    PaneOutput(String),
}

impl EventFilter {
    pub fn matches(&self, notification: &Notification) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::PaneOutput(pane) => {
                matches!(notification, Notification::Output { pane_id, .. } if pane_id == pane)
            }
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Notification>,
}

/// Observer list. Publishing with no subscribers drops the notification.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
    next_id: SubscriptionId,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, filter, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Deliver to every matching subscriber. Subscribers whose
    /// [`Subscription`] is gone are pruned. Returns the delivery count.
    pub fn publish(&mut self, notification: &Notification) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|s| {
            if s.tx.is_closed() {
                return false;
            }
            if !s.filter.matches(notification) {
                return true;
            }
            match s.tx.send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Drop every subscriber; their `recv` then returns `None`.
    pub fn close_all(&mut self) {
        self.subscribers.clear();
    }
}

/// Receiving end of a subscription.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) stops delivery.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next notification, or `None` once the connection has closed.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Stop delivery now. Anything already queued is discarded.
    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(pane: &str, data: &str) -> Notification {
        Notification::Output {
            pane_id: pane.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let mut bus = EventBus::new();
        assert_eq!(bus.publish(&output("%1", "x")), 0);
        // A later subscriber does not see earlier notifications
        let mut sub = bus.subscribe(EventFilter::All);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_delivery_in_order_to_all_subscribers() {
        let mut bus = EventBus::new();
        let mut a = bus.subscribe(EventFilter::All);
        let mut b = bus.subscribe(EventFilter::All);

        let events = [
            output("%1", "one"),
            Notification::WindowAdd {
                window_id: "@1".to_string(),
            },
            output("%1", "two"),
        ];
        for event in &events {
            assert_eq!(bus.publish(event), 2);
        }

        for sub in [&mut a, &mut b] {
            for expected in &events {
                assert_eq!(sub.try_recv().as_ref(), Some(expected));
            }
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn test_pane_filter() {
        let mut bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::PaneOutput("%2".to_string()));
        bus.publish(&output("%1", "other"));
        bus.publish(&Notification::PaneModeChanged {
            pane_id: "%2".to_string(),
        });
        bus.publish(&output("%2", "mine"));
        assert_eq!(sub.try_recv(), Some(output("%2", "mine")));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::All);
        let mut keep = bus.subscribe(EventFilter::All);
        sub.unsubscribe();

        assert_eq!(bus.publish(&output("%1", "x")), 1);
        assert_eq!(bus.len(), 1);
        assert!(keep.try_recv().is_some());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let mut bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::All);
        drop(sub);
        assert_eq!(bus.publish(&output("%1", "x")), 0);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_unsubscribe_by_id() {
        let mut bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::All);
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        bus.publish(&output("%1", "x"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let mut bus = EventBus::new();
        let mut sub = bus.subscribe(EventFilter::All);
        bus.close_all();
        assert_eq!(sub.recv().await, None);
    }
}
