use std::sync::Mutex;
use tokio::sync::mpsc;

/// Predicate deciding whether a subscriber receives a given event.
pub type EventFilter<T> = Box<dyn Fn(&T) -> bool + Send + 'static>;

struct EventSub<T> {
    filter: Option<EventFilter<T>>,
    tx: mpsc::UnboundedSender<T>,
}

/// A list of event subscribers fed by a single dispatching reader.
///
/// Subscribers whose receiving side is gone are dropped on the next
/// dispatch. Dispatch order is registration order.
pub struct EventSubs<T> {
    subs: Mutex<Vec<EventSub<T>>>,
}

impl<T> Default for EventSubs<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventSubs<T> {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
        }
    }

    /// Registers a subscriber receiving every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        self.subscribe_with(None)
    }

    /// Registers a subscriber receiving only events matching `filter`.
    pub fn subscribe_filtered(&self, filter: EventFilter<T>) -> mpsc::UnboundedReceiver<T> {
        self.subscribe_with(Some(filter))
    }

    fn subscribe_with(&self, filter: Option<EventFilter<T>>) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().unwrap().push(EventSub { filter, tx });
        rx
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.subs.lock().unwrap().clear();
    }
}

impl<T: Clone> EventSubs<T> {
    /// Delivers `event` to every live, matching subscriber.
    pub fn dispatch(&self, event: &T) {
        self.subs.lock().unwrap().retain(|sub| {
            match &sub.filter {
                Some(filter) if !filter(event) => true,
                _ => sub.tx.send(event.clone()).is_ok(),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_in_registration_order() {
        let subs: EventSubs<u32> = EventSubs::new();
        let mut rx_a = subs.subscribe();
        let mut rx_b = subs.subscribe();
        subs.dispatch(&7);
        assert_eq!(rx_a.try_recv().unwrap(), 7);
        assert_eq!(rx_b.try_recv().unwrap(), 7);
    }

    #[test]
    fn filters_and_prunes_dead_subscribers() {
        let subs: EventSubs<u32> = EventSubs::new();
        let mut odd = subs.subscribe_filtered(Box::new(|v| v % 2 == 1));
        let dead = subs.subscribe();
        drop(dead);
        subs.dispatch(&2);
        subs.dispatch(&3);
        assert_eq!(odd.try_recv().unwrap(), 3);
        assert!(odd.try_recv().is_err());
        assert!(!subs.is_empty());
    }
}
