//! The library-posted event taxonomy and the handler registry each manager owns. Handlers are
//! plain closures; the only generic machinery here is priority ordering and cancellation.

use crate::connection::{CloseReason, CustomObjectSlot};
use crate::network_id::NetworkId;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// One posted occurrence. Raw-connection filtering is a distinct, cancellable mechanism (see
/// `FilterHandler`/`dispatch_filter` below) rather than an `Event` variant, since its outcome
/// (cancel + rename) doesn't fit the fire-and-forget shape the other events share.
/// `ConfigureConnection` is mutable in one respect: the handler may attach a custom object via
/// `custom_object`, which the eventual `Connection` shares and exposes to packet handlers.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionClosed { id: NetworkId, reason: CloseReason },
    PacketSendingFailed { id: NetworkId, packet_type: i32 },
    PacketReceiveRejected { source_id: NetworkId, packet_type: i32 },
    ConfigureConnection { new_id: NetworkId, custom_object: Arc<CustomObjectSlot> },
}

/// What a raw-connection filter handler decides. Other event kinds have no cancellable
/// outcome, so their handlers return `()` via `EventHandler::Plain`.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub cancel: bool,
    pub name: String,
}

pub type PlainHandler = Box<dyn Fn(&Event) + Send + Sync>;
pub type FilterHandler = Box<dyn Fn(&SocketAddr, &str) -> FilterOutcome + Send + Sync>;

enum Slot {
    Plain(PlainHandler),
    Filter(FilterHandler),
}

struct Entry {
    priority: i32,
    order: usize,
    slot: Slot,
}

/// Registration API replacing the reflection-driven handler discovery of the original source
/// with an explicit call: `add_handler(priority, f)`. Lower priority runs first; ties break by
/// insertion order (a stable sort by `(priority, insertion_index)`).
pub struct EventHandler {
    entries: RwLock<Vec<Entry>>,
    next_order: std::sync::atomic::AtomicUsize,
}

impl EventHandler {
    pub fn new() -> EventHandler {
        EventHandler {
            entries: RwLock::new(Vec::new()),
            next_order: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn next_order(&self) -> usize {
        self.next_order.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Registers a handler for the plain `Event` taxonomy (everything but raw-connection
    /// filtering, which goes through `add_filter_handler`).
    pub fn add_handler(&self, priority: i32, f: impl Fn(&Event) + Send + Sync + 'static) {
        let order = self.next_order();
        let mut entries = self.entries.write().expect("event handler lock poisoned");
        entries.push(Entry {
            priority,
            order,
            slot: Slot::Plain(Box::new(f)),
        });
        entries.sort_by_key(|e| (e.priority, e.order));
    }

    /// Registers a filter handler for a newly accepted raw connection, the one hook whose
    /// outcome can cancel the attempt and rename the connection.
    pub fn add_filter_handler(&self, priority: i32, f: impl Fn(&SocketAddr, &str) -> FilterOutcome + Send + Sync + 'static) {
        let order = self.next_order();
        let mut entries = self.entries.write().expect("event handler lock poisoned");
        entries.push(Entry {
            priority,
            order,
            slot: Slot::Filter(Box::new(f)),
        });
        entries.sort_by_key(|e| (e.priority, e.order));
    }

    pub fn dispatch(&self, event: &Event) {
        let entries = self.entries.read().expect("event handler lock poisoned");
        for entry in entries.iter() {
            if let Slot::Plain(f) = &entry.slot {
                f(event);
            }
        }
    }

    /// Runs the filter chain for an incoming raw connection. The first handler to cancel wins;
    /// subsequent handlers still run (so logging/metrics handlers registered after a filter
    /// still observe the attempt) but their `name`/`cancel` output is discarded once cancelled.
    pub fn dispatch_filter(&self, addr: &SocketAddr, suggested_name: &str) -> FilterOutcome {
        let entries = self.entries.read().expect("event handler lock poisoned");
        let mut outcome = FilterOutcome {
            cancel: false,
            name: suggested_name.to_string(),
        };

        for entry in entries.iter() {
            if let Slot::Filter(f) = &entry.slot {
                let result = f(addr, &outcome.name);
                if result.cancel {
                    outcome.cancel = true;
                }
                outcome.name = result.name;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn handlers_run_in_priority_then_insertion_order() {
        let handler = EventHandler::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = order.clone();
        handler.add_handler(10, move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        handler.add_handler(0, move |_| o2.lock().unwrap().push(2));
        let o3 = order.clone();
        handler.add_handler(0, move |_| o3.lock().unwrap().push(3));

        handler.dispatch(&Event::PacketReceiveRejected {
            source_id: NetworkId::bind("x", 1),
            packet_type: 1,
        });

        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
    }

    #[test]
    fn filter_cancellation_is_sticky() {
        let handler = EventHandler::new();
        let calls = Arc::new(AtomicUsize::new(0));

        handler.add_filter_handler(0, |_, name| FilterOutcome {
            cancel: true,
            name: name.to_string(),
        });

        let c = calls.clone();
        handler.add_filter_handler(1, move |_, name| {
            c.fetch_add(1, Ordering::SeqCst);
            FilterOutcome {
                cancel: false,
                name: name.to_string(),
            }
        });

        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let outcome = handler.dispatch_filter(&addr, "RemoteId-1");

        assert!(outcome.cancel);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn filter_handler_can_rename() {
        let handler = EventHandler::new();
        handler.add_filter_handler(0, |_, _| FilterOutcome {
            cancel: false,
            name: "renamed".to_string(),
        });

        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let outcome = handler.dispatch_filter(&addr, "RemoteId-1");

        assert!(!outcome.cancel);
        assert_eq!(outcome.name, "renamed");
    }
}
