use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;

use mproxy_pool::CredentialPool;
use mproxy_registry::ModelFamily;

/// How many requests of one family may be in flight at once.
const FAMILY_CONCURRENCY: usize = 32;
/// EWMA smoothing for the wait estimate.
const EWMA_ALPHA: f64 = 0.2;

/// Grant held while a request is dispatched; dropping it frees family
/// capacity, which wakes the scheduler's semaphore wait.
pub struct QueueTicket {
    _permit: Option<OwnedSemaphorePermit>,
}

struct Waiter {
    grant: oneshot::Sender<QueueTicket>,
    enqueued_at: Instant,
}

struct FamilyQueue {
    waiters: Mutex<VecDeque<Waiter>>,
    capacity: Arc<Semaphore>,
    enqueue_signal: Notify,
    ewma_wait_ms: Mutex<f64>,
    depth: std::sync::atomic::AtomicUsize,
}

impl FamilyQueue {
    fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            capacity: Arc::new(Semaphore::new(FAMILY_CONCURRENCY)),
            enqueue_signal: Notify::new(),
            ewma_wait_ms: Mutex::new(0.0),
            depth: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

/// One FIFO per model family plus a cooperative scheduler task per family.
/// The scheduler dequeues only while the family has no credential lockout and
/// capacity is free; it wakes on enqueue, on credential state change and on
/// lockout expiry.
pub struct QueueSet {
    pool: Arc<CredentialPool>,
    families: Mutex<HashMap<ModelFamily, Arc<FamilyQueue>>>,
}

impl QueueSet {
    pub fn new(pool: Arc<CredentialPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            families: Mutex::new(HashMap::new()),
        })
    }

    async fn family_queue(self: &Arc<Self>, family: ModelFamily) -> Arc<FamilyQueue> {
        let mut families = self.families.lock().await;
        if let Some(queue) = families.get(&family) {
            return queue.clone();
        }
        let queue = Arc::new(FamilyQueue::new());
        families.insert(family, queue.clone());
        drop(families);
        self.clone().spawn_scheduler(family, queue.clone());
        queue
    }

    fn spawn_scheduler(self: Arc<Self>, family: ModelFamily, queue: Arc<FamilyQueue>) {
        let pool_changed = self.pool.change_notifier();
        tokio::spawn(async move {
            loop {
                // Park until there is at least one waiter.
                loop {
                    if !queue.waiters.lock().await.is_empty() {
                        break;
                    }
                    queue.enqueue_signal.notified().await;
                }

                // Honor the family lockout before dispatching the head.
                let remaining = self.pool.lockout_remaining(family).await;
                if !remaining.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = pool_changed.notified() => {}
                    }
                    continue;
                }

                let permit = match queue.capacity.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let waiter = { queue.waiters.lock().await.pop_front() };
                let Some(waiter) = waiter else {
                    drop(permit);
                    continue;
                };
                queue
                    .depth
                    .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);

                let waited = waiter.enqueued_at.elapsed();
                {
                    let mut ewma = queue.ewma_wait_ms.lock().await;
                    let sample = waited.as_millis() as f64;
                    *ewma = if *ewma == 0.0 {
                        sample
                    } else {
                        EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * *ewma
                    };
                }

                let ticket = QueueTicket {
                    _permit: Some(permit),
                };
                // A dropped receiver (client went away while queued) releases
                // the ticket immediately.
                let _ = waiter.grant.send(ticket);
            }
        });
    }

    /// FIFO enqueue; resolves when the scheduler grants dispatch.
    pub async fn enqueue(self: &Arc<Self>, family: ModelFamily) -> QueueTicket {
        self.enqueue_inner(family, false).await
    }

    /// Head re-enqueue for retries, after the caller's backoff sleep.
    pub async fn reenqueue(self: &Arc<Self>, family: ModelFamily, backoff: Duration) -> QueueTicket {
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
        self.enqueue_inner(family, true).await
    }

    async fn enqueue_inner(self: &Arc<Self>, family: ModelFamily, at_head: bool) -> QueueTicket {
        let queue = self.family_queue(family).await;
        let (grant, accept) = oneshot::channel();
        {
            let mut waiters = queue.waiters.lock().await;
            let waiter = Waiter {
                grant,
                enqueued_at: Instant::now(),
            };
            if at_head {
                waiters.push_front(waiter);
            } else {
                waiters.push_back(waiter);
            }
        }
        queue
            .depth
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        queue.enqueue_signal.notify_one();
        match accept.await {
            Ok(ticket) => ticket,
            // The scheduler task never dies while the set is alive; this arm
            // must still not panic the request.
            Err(_) => QueueTicket { _permit: None },
        }
    }

    pub async fn depth(self: &Arc<Self>, family: ModelFamily) -> usize {
        let families = self.families.lock().await;
        families
            .get(&family)
            .map(|queue| queue.depth.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// EWMA of recent queue waits.
    pub async fn estimated_wait(self: &Arc<Self>, family: ModelFamily) -> Duration {
        let families = self.families.lock().await;
        match families.get(&family) {
            Some(queue) => {
                let ewma = *queue.ewma_wait_ms.lock().await;
                Duration::from_millis(ewma as u64)
            }
            None => Duration::ZERO,
        }
    }
}
