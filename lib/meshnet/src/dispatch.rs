//! Delivers received packets to the manager's registered handler chain, either inline on the
//! connection's own reader thread or via one managed worker thread with a bounded queue.

use crate::connection::CustomObjectSlot;
use crate::events::{Event, EventHandler};
use crate::network_id::NetworkId;
use crate::packet::Packet;
use netsupport::logging::{error, Logger};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, RwLock};
use std::thread;

pub type PacketHandler = Box<dyn Fn(&NetworkId, &dyn Packet, &CustomObjectSlot) + Send + Sync>;

/// The ordered chain of registered packet handlers, updated atomically under a write lock so
/// registration is safe to race with concurrent receipt (§4.C).
#[derive(Default)]
struct HandlerChain {
    handlers: RwLock<Vec<PacketHandler>>,
}

impl HandlerChain {
    fn add(&self, handler: PacketHandler) {
        self.handlers.write().expect("handler chain lock poisoned").push(handler);
    }

    fn invoke(&self, source: &NetworkId, packet: &dyn Packet, custom_object: &CustomObjectSlot) {
        let handlers = self.handlers.read().expect("handler chain lock poisoned");
        for handler in handlers.iter() {
            handler(source, packet, custom_object);
        }
    }
}

enum Job {
    Deliver(NetworkId, Box<dyn Packet>, Arc<CustomObjectSlot>),
}

/// Caller-thread mode invokes the chain directly on the reader thread; managed-thread mode
/// enqueues onto a bounded channel served by one worker thread owned by this struct.
pub enum Dispatch {
    CallerThread { chain: Arc<HandlerChain> },
    ManagedThread {
        chain: Arc<HandlerChain>,
        sender: SyncSender<Job>,
        _worker: thread::JoinHandle<()>,
    },
}

impl Dispatch {
    pub fn caller_thread() -> Dispatch {
        Dispatch::CallerThread {
            chain: Arc::new(HandlerChain::default()),
        }
    }

    /// `capacity = None` means an effectively unbounded queue (matches the documented default);
    /// `sync_channel` requires a concrete bound so we pick a large one rather than special-case
    /// an unbounded variant.
    pub fn managed_thread(capacity: Option<usize>, log: Logger) -> Dispatch {
        let bound = capacity.unwrap_or(1 << 20);
        let (sender, receiver): (SyncSender<Job>, Receiver<Job>) = sync_channel(bound.max(1));
        let chain = Arc::new(HandlerChain::default());

        let worker_chain = chain.clone();
        let worker = thread::spawn(move || {
            for job in receiver {
                let Job::Deliver(source, packet, custom_object) = job;
                invoke_guarded(&log, || worker_chain.invoke(&source, packet.as_ref(), &custom_object));
            }
        });

        Dispatch::ManagedThread {
            chain,
            sender,
            _worker: worker,
        }
    }

    pub fn add_handler(&self, handler: PacketHandler) {
        match self {
            Dispatch::CallerThread { chain } => chain.add(handler),
            Dispatch::ManagedThread { chain, .. } => chain.add(handler),
        }
    }

    /// Delivers `packet` from `source`. In managed-thread mode, a full queue rejects the
    /// packet and posts `PacketReceiveRejected`; the reader thread is never blocked waiting
    /// for handler execution.
    pub fn deliver(&self, source: &NetworkId, packet: Box<dyn Packet>, custom_object: &Arc<CustomObjectSlot>, events: &EventHandler) {
        match self {
            Dispatch::CallerThread { chain } => chain.invoke(source, packet.as_ref(), custom_object),
            Dispatch::ManagedThread { sender, .. } => {
                let packet_type = packet.packet_id();
                if let Err(TrySendError::Full(_)) = sender.try_send(Job::Deliver(source.clone(), packet, custom_object.clone())) {
                    events.dispatch(&Event::PacketReceiveRejected {
                        source_id: source.clone(),
                        packet_type,
                    });
                }
            }
        }
    }
}

/// Catches panics from user handlers at the dispatch boundary so they never affect connection
/// state machine transitions. Caller-thread mode invokes handlers directly inside
/// `catch_unwind`; managed-thread mode wraps the same call inside its worker loop.
pub fn invoke_guarded(log: &Logger, f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        error!(log, "packet handler panicked"; "context" => "dispatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsupport::logging;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Dummy;
    impl Packet for Dummy {
        fn packet_id(&self) -> i32 {
            1
        }
        fn write_data(&self, _w: &mut dyn std::io::Write) -> std::io::Result<()> {
            Ok(())
        }
        fn read_data(&mut self, _r: &mut dyn std::io::Read) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn caller_thread_invokes_all_handlers_in_order() {
        let dispatch = Dispatch::caller_thread();
        let events = EventHandler::new();
        let custom_object = Arc::new(CustomObjectSlot::new());

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        dispatch.add_handler(Box::new(move |_, _, _| o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        dispatch.add_handler(Box::new(move |_, _, _| o2.lock().unwrap().push(2)));

        dispatch.deliver(&NetworkId::bind("x", 1), Box::new(Dummy), &custom_object, &events);

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    /// Stalls the single worker thread inside its first handler invocation, fills the bounded
    /// queue to its capacity, and asserts that exactly the next (capacity+1-th) delivery is
    /// rejected -- not merely "some number at most the attempt count" (§8).
    #[test]
    fn managed_thread_rejects_exactly_the_delivery_past_capacity() {
        const CAPACITY: usize = 2;

        let events = Arc::new(EventHandler::new());
        let rejected = Arc::new(AtomicUsize::new(0));
        let r = rejected.clone();
        events.add_handler(0, move |event| {
            if let Event::PacketReceiveRejected { .. } = event {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });

        let dispatch = Dispatch::managed_thread(Some(CAPACITY), logging::discard());
        let custom_object = Arc::new(CustomObjectSlot::new());

        let entered_first = Arc::new(std::sync::Barrier::new(2));
        let release = Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let first_call = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let entered_first_worker = entered_first.clone();
        let release_worker = release.clone();
        let first_call_worker = first_call.clone();
        dispatch.add_handler(Box::new(move |_, _, _| {
            if first_call_worker.swap(false, Ordering::SeqCst) {
                entered_first_worker.wait();
            }
            let (lock, cvar) = &*release_worker;
            let mut done = lock.lock().unwrap();
            while !*done {
                done = cvar.wait(done).unwrap();
            }
        }));

        // This delivery is picked up by the worker immediately and stalls it inside the
        // handler above, freeing the queue back up to its full `CAPACITY`.
        dispatch.deliver(&NetworkId::bind("x", 1), Box::new(Dummy), &custom_object, &events);
        entered_first.wait();

        for _ in 0..CAPACITY {
            dispatch.deliver(&NetworkId::bind("x", 1), Box::new(Dummy), &custom_object, &events);
        }
        assert_eq!(rejected.load(Ordering::SeqCst), 0);

        dispatch.deliver(&NetworkId::bind("x", 1), Box::new(Dummy), &custom_object, &events);
        assert_eq!(rejected.load(Ordering::SeqCst), 1);

        let (lock, cvar) = &*release;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}
