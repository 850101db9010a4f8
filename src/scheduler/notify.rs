//! Error subscribers.
//!
//! Callers register a channel sender together with a key selector; after
//! each transaction the scheduler delivers one notification per key whose
//! error state changed. Disconnected subscribers are dropped.

use crossbeam::channel::Sender;

use crate::api::{KeySelector, KeyWithError, SbError};

struct Subscriber {
    sender: Sender<KeyWithError>,
    selector: KeySelector,
}

#[derive(Default)]
pub struct ErrorSubscribers {
    subscribers: Vec<Subscriber>,
}

impl ErrorSubscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, sender: Sender<KeyWithError>, selector: KeySelector) {
        self.subscribers.push(Subscriber { sender, selector });
    }

    /// Deliver an error-state change to every matching subscriber.
    pub fn notify(&mut self, key: &str, error: Option<SbError>) {
        self.subscribers.retain(|sub| {
            if !(sub.selector)(key) {
                return true;
            }
            let notification = KeyWithError {
                key: key.to_string(),
                error: error.clone(),
            };
            sub.sender.send(notification).is_ok()
        });
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::prefix_selector;
    use std::sync::Arc;

    #[test]
    fn notification_respects_selector() {
        let mut subs = ErrorSubscribers::new();
        let (tx, rx) = crossbeam::channel::unbounded();
        subs.subscribe(tx, prefix_selector("iface/"));

        subs.notify("route/r1", None);
        assert!(rx.try_recv().is_err());

        let err: SbError = Arc::new(std::io::Error::other("down"));
        subs.notify("iface/eth0", Some(err));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.key, "iface/eth0");
        assert_eq!(got.error.map(|e| e.to_string()), Some("down".to_string()));
    }

    #[test]
    fn disconnected_subscribers_are_dropped() {
        let mut subs = ErrorSubscribers::new();
        let (tx, rx) = crossbeam::channel::unbounded();
        subs.subscribe(tx, prefix_selector(""));
        drop(rx);

        subs.notify("any/key", None);
        assert!(subs.is_empty());
    }
}
