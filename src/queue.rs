//! Cooperative delay queue enforcing minimum spacing between sends.
//!
//! Each queue owns at most one worker task. The worker awaits the item's
//! spacing delay *before* running it, so consecutive executions are at least
//! one delay apart regardless of how fast items are enqueued. The worker is
//! spawned lazily on the first `add` and re-spawned after `stop`, which lets
//! the connection supervisor stop the queues on a drop and reuse them after a
//! reconnect.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueueItem {
    job: Job,
    delay: Option<Duration>,
    done: oneshot::Sender<()>,
}

/// Completion handle returned by [`MessageQueue::add`].
pub struct Ticket {
    rx: oneshot::Receiver<()>,
}

impl Ticket {
    /// Resolve once the item has executed; `Err(Cancelled)` if the queue was
    /// stopped first.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| Error::Cancelled)
    }
}

struct QueueShared {
    items: Mutex<VecDeque<QueueItem>>,
    /// Queued plus in-flight items; `join` waits for zero.
    depth: AtomicUsize,
    available: Notify,
    idle: Notify,
}

pub struct MessageQueue {
    default_delay: Duration,
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageQueue {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            shared: Arc::new(QueueShared {
                items: Mutex::new(VecDeque::new()),
                depth: AtomicUsize::new(0),
                available: Notify::new(),
                idle: Notify::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue a job with the queue's default spacing.
    pub fn add<F>(&self, job: F) -> Ticket
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.add_delayed(job, None)
    }

    /// Enqueue a job with an explicit spacing delay.
    pub fn add_delayed<F>(&self, job: F, delay: Option<Duration>) -> Ticket
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let item = QueueItem {
            job: Box::pin(job),
            delay,
            done,
        };
        self.shared.depth.fetch_add(1, Ordering::SeqCst);
        self.shared.items.lock().unwrap().push_back(item);
        self.shared.available.notify_one();
        self.ensure_worker();
        Ticket { rx }
    }

    fn ensure_worker(&self) {
        let mut slot = self.worker.lock().unwrap();
        let running = slot.as_ref().is_some_and(|handle| !handle.is_finished());
        if running {
            return;
        }
        let shared = self.shared.clone();
        let default_delay = self.default_delay;
        *slot = Some(tokio::spawn(async move {
            loop {
                let item = loop {
                    let notified = shared.available.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if let Some(item) = shared.items.lock().unwrap().pop_front() {
                        break item;
                    }
                    notified.await;
                };
                tokio::time::sleep(item.delay.unwrap_or(default_delay)).await;
                item.job.await;
                let _ = item.done.send(());
                if shared.depth.fetch_sub(1, Ordering::SeqCst) == 1 {
                    shared.idle.notify_waiters();
                }
            }
        }));
    }

    /// Cancel the worker and discard the backlog. Pending tickets resolve as
    /// cancelled. Safe to call repeatedly; the queue accepts new items again
    /// afterwards.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
        let discarded: Vec<QueueItem> = self.shared.items.lock().unwrap().drain(..).collect();
        drop(discarded);
        self.shared.depth.store(0, Ordering::SeqCst);
        self.shared.idle.notify_waiters();
    }

    /// Resolve when the queue is empty and the worker is idle.
    pub async fn join(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.depth.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn consecutive_executions_are_spaced() {
        let queue = MessageQueue::new(Duration::from_millis(100));
        let stamps = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let stamps = stamps.clone();
            queue.add(async move {
                stamps.lock().unwrap().push(Instant::now());
            });
        }
        queue.join().await;

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_delay_overrides_default() {
        let queue = MessageQueue::new(Duration::from_secs(60));
        let start = Instant::now();
        let ticket = queue.add_delayed(async {}, Some(Duration::from_millis(5)));
        ticket.wait().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_backlog_with_cancellation() {
        let queue = MessageQueue::new(Duration::from_secs(3600));
        let ticket = queue.add(async {});
        queue.stop();
        queue.stop(); // idempotent
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));
        queue.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queue_accepts_items_again_after_stop() {
        let queue = MessageQueue::new(Duration::from_millis(1));
        queue.add(async {}).wait().await.unwrap();
        queue.stop();
        queue.add(async {}).wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn items_run_in_fifo_order() {
        let queue = MessageQueue::new(Duration::from_millis(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            let order = order.clone();
            queue.add(async move {
                order.lock().unwrap().push(n);
            });
        }
        queue.join().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
