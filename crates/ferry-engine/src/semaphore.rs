//! Task wake-up semaphores.
//!
//! `give` wakes one waiter (or the next one to arrive). `end` wakes every
//! waiter for good; `take` then reports `Ended` until `unend`.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Something was given; go look for work.
    Work,
    /// The semaphore was ended; shut down.
    Ended,
}

#[derive(Debug, Default)]
pub struct BpSemaphore {
    notify: Notify,
    ended: AtomicBool,
}

impl BpSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn give(&self) {
        self.notify.notify_one();
    }

    pub async fn take(&self) -> Wake {
        if self.is_ended() {
            return Wake::Ended;
        }
        self.notify.notified().await;
        if self.is_ended() {
            Wake::Ended
        } else {
            Wake::Work
        }
    }

    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn unend(&self) {
        self.ended.store(false, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn give_before_take_is_not_lost() {
        let sem = BpSemaphore::new();
        sem.give();
        assert_eq!(sem.take().await, Wake::Work);
    }

    #[tokio::test]
    async fn end_wakes_a_blocked_taker() {
        let sem = Arc::new(BpSemaphore::new());
        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sem.end();
        assert_eq!(waiter.await.unwrap(), Wake::Ended);
        assert_eq!(sem.take().await, Wake::Ended);

        sem.unend();
        sem.give();
        assert_eq!(sem.take().await, Wake::Work);
    }
}
