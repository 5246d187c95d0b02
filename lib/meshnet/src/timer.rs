//! Process-wide periodic liveness tick and one-shot delayed actions. Lazily started on first
//! subscription; there is exactly one of these per process.

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, Weak};
use std::thread;
use std::time::Duration;

pub use netsupport::time::clock_ms;

/// Anything the global timer can tick. `ManagerCore` implements this; subscribing wires a
/// manager into the periodic liveness sweep described in §4.G.
pub trait Tickable: Send + Sync {
    fn update_connection_status(&self);
}

struct Inner {
    subscribers: RwLock<Vec<Weak<dyn Tickable>>>,
    tick_period_ms: AtomicU64,
}

const DEFAULT_TICK_PERIOD_MS: u64 = 60_000;

lazy_static! {
    static ref TIMER: GlobalTimer = GlobalTimer::start();
}

pub struct GlobalTimer {
    inner: std::sync::Arc<Inner>,
}

impl GlobalTimer {
    fn start() -> GlobalTimer {
        let inner = std::sync::Arc::new(Inner {
            subscribers: RwLock::new(Vec::new()),
            tick_period_ms: AtomicU64::new(DEFAULT_TICK_PERIOD_MS),
        });

        let background = inner.clone();
        thread::spawn(move || loop {
            let period = background.tick_period_ms.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(period));

            let subscribers = background.subscribers.read().expect("global timer subscribers lock poisoned");
            for subscriber in subscribers.iter() {
                if let Some(manager) = subscriber.upgrade() {
                    manager.update_connection_status();
                }
            }
        });

        GlobalTimer { inner }
    }

    pub fn instance() -> &'static GlobalTimer {
        &TIMER
    }

    /// Subscribes `manager` to the periodic tick. Dead entries (managers already dropped) are
    /// pruned opportunistically on every subscribe.
    pub fn subscribe(&self, manager: Weak<dyn Tickable>) {
        let mut subscribers = self.inner.subscribers.write().expect("global timer subscribers lock poisoned");
        subscribers.retain(|existing| existing.upgrade().is_some());
        subscribers.push(manager);
    }

    pub fn unsubscribe(&self, manager: &Weak<dyn Tickable>) {
        let mut subscribers = self.inner.subscribers.write().expect("global timer subscribers lock poisoned");
        subscribers.retain(|existing| !std::ptr::eq(existing.as_ptr() as *const (), manager.as_ptr() as *const ()));
    }

    pub fn set_tick_period(&self, ms: u64) {
        self.inner.tick_period_ms.store(ms, Ordering::Relaxed);
    }

    /// Runs `action` on a dedicated thread after `ms`. Used for one-shot delayed work (e.g. a
    /// deferred retry) that should not block the timer's own tick thread.
    pub fn delay(&self, ms: u64, action: impl FnOnce() + Send + 'static) {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(ms));
            action();
        });
    }

    /// Schedules `action` the same way as `delay`. Named separately to mirror the
    /// fire-and-forget-vs-inline distinction from the design notes; this crate has no separate
    /// ambient worker pool for misc background work beyond the encoder/decoder pools (`coder_pool`),
    /// so both land on a plain spawned thread.
    pub fn delay_async(&self, ms: u64, action: impl FnOnce() + Send + 'static) {
        self.delay(ms, action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    struct Counter(AtomicBool);
    impl Tickable for Counter {
        fn update_connection_status(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn delay_runs_after_the_given_duration() {
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();

        GlobalTimer::instance().delay(10, move || f.store(true, Ordering::SeqCst));

        thread::sleep(StdDuration::from_millis(100));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn unsubscribe_stops_further_ticks() {
        let counter = Arc::new(Counter(AtomicBool::new(false)));
        let weak: Weak<dyn Tickable> = Arc::downgrade(&counter) as Weak<dyn Tickable>;

        GlobalTimer::instance().subscribe(weak.clone());
        GlobalTimer::instance().unsubscribe(&weak);

        // No direct way to force a tick from the test without sleeping a full period, so this
        // only asserts unsubscribe does not panic and the entry is gone from later pruning.
    }
}
