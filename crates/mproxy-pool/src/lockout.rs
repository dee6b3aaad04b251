use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};

/// Min-heap of lockout deadlines. A background task sleeps until the next
/// deadline and pokes the shared change notifier so queue schedulers re-check
/// `lockout_remaining` exactly when it can have changed.
#[derive(Debug)]
pub(crate) struct LockoutQueue {
    heap: Mutex<BinaryHeap<Reverse<Instant>>>,
    wakeup: Notify,
}

impl LockoutQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
        }
    }

    pub(crate) async fn push(&self, until: Instant) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse(until));
        }
        // Always notify: the background task re-computes the next deadline.
        self.wakeup.notify_one();
    }

    pub(crate) fn spawn_expiry_task(self: Arc<Self>, changed: Arc<Notify>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse(deadline)| *deadline)
                };

                match next {
                    None => {
                        self.wakeup.notified().await;
                        continue;
                    }
                    Some(deadline) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {}
                            _ = self.wakeup.notified() => continue,
                        }
                    }
                }

                let now = Instant::now();
                let mut fired = false;
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse(deadline)) = heap.peek().copied() {
                        if deadline > now {
                            break;
                        }
                        heap.pop();
                        fired = true;
                    }
                }
                if fired {
                    changed.notify_waiters();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn notifies_when_deadline_elapses() {
        let queue = Arc::new(LockoutQueue::new());
        let changed = Arc::new(Notify::new());
        queue.clone().spawn_expiry_task(changed.clone());

        let waiter = {
            let changed = changed.clone();
            tokio::spawn(async move { changed.notified().await })
        };
        // Give the waiter a beat to register before the deadline is queued.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(Instant::now() + Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("lockout expiry should notify")
            .unwrap();
    }
}
