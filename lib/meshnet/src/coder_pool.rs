//! Optional offloading of CPU-bound encode/decode work onto a small cached thread pool, so a
//! slow `Packet::write_data`/`read_data` implementation doesn't stall a connection's reader
//! thread or the caller of `send_packet`.

use std::cell::Cell;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

thread_local! {
    static OWNING_POOL: Cell<Option<usize>> = Cell::new(None);
}

type Job = Box<dyn FnOnce() + Send>;

/// A cached pool of `size` worker threads, or pass-through (disabled) mode when `size == 0`
/// (matching `use_encoder_thread_pool` / `use_decoder_thread_pool` being unset).
pub struct CoderPool {
    id: usize,
    sender: Option<SyncSender<Job>>,
    _workers: Vec<thread::JoinHandle<()>>,
}

static NEXT_POOL_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);

impl CoderPool {
    /// `size = 0` builds a disabled (pass-through) pool: `is_valid_coder_thread` always
    /// reports true and `submit` runs the task inline.
    pub fn new(size: usize) -> CoderPool {
        let id = NEXT_POOL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if size == 0 {
            return CoderPool {
                id,
                sender: None,
                _workers: Vec::new(),
            };
        }

        let (sender, receiver): (SyncSender<Job>, Receiver<Job>) = sync_channel(size * 64);
        let receiver = Arc::new(std::sync::Mutex::new(receiver));

        let workers = (0..size)
            .map(|_| {
                let receiver = receiver.clone();
                thread::spawn(move || {
                    OWNING_POOL.with(|cell| cell.set(Some(id)));
                    loop {
                        let job = {
                            let receiver = receiver.lock().expect("coder pool receiver lock poisoned");
                            receiver.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => return,
                        }
                    }
                })
            })
            .collect();

        CoderPool {
            id,
            sender: Some(sender),
            _workers: workers,
        }
    }

    /// True if the calling thread was spawned by this pool, or if the pool is disabled. Callers
    /// check this before the blocking encode/decode path to avoid a deadlock pattern where a
    /// handler running on a pool thread would otherwise re-submit to the same pool and wait on
    /// itself.
    pub fn is_valid_coder_thread(&self) -> bool {
        match &self.sender {
            None => true,
            Some(_) => OWNING_POOL.with(|cell| cell.get() == Some(self.id)),
        }
    }

    /// Submits `task` to the pool. In pass-through mode runs it inline and returns `true`. If
    /// submission is refused (pool shut down or over-saturated), runs `on_rejected` instead and
    /// returns `false` — callers post whatever manager event fits their call site (encode:
    /// `PacketSendingFailed`, decode: `PacketReceiveRejected`) rather than `CoderPool` knowing
    /// about `Event` itself.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static, on_rejected: impl FnOnce()) -> bool {
        match &self.sender {
            None => {
                task();
                true
            }
            Some(sender) => match sender.try_send(Box::new(task)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    on_rejected();
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn disabled_pool_is_always_a_valid_coder_thread() {
        let pool = CoderPool::new(0);
        assert!(pool.is_valid_coder_thread());
    }

    #[test]
    fn enabled_pool_runs_submitted_work() {
        let pool = CoderPool::new(1);
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();

        assert!(pool.submit(move || d.store(true, Ordering::SeqCst), || panic!("should not be rejected")));

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn oversaturated_pool_rejects_and_calls_on_rejected() {
        let pool = CoderPool::new(1);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        // Occupy the pool's single worker, then fill its queue (size * 64 = 64 slots) so the
        // next submission is refused.
        pool.submit(
            move || {
                let _ = release_rx.recv();
            },
            || panic!("should not be rejected"),
        );
        for _ in 0..64 {
            pool.submit(|| (), || panic!("should not be rejected"));
        }

        let rejected = Arc::new(AtomicBool::new(false));
        let r = rejected.clone();
        let accepted = pool.submit(|| (), move || r.store(true, Ordering::SeqCst));

        assert!(!accepted);
        assert!(rejected.load(Ordering::SeqCst));

        let _ = release_tx.send(());
    }

    #[test]
    fn calling_thread_is_not_a_pool_thread() {
        let pool = CoderPool::new(1);
        assert!(!pool.is_valid_coder_thread());
    }
}
