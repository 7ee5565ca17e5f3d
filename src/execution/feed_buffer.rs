use crate::models::Bar;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Bounded handoff between the feed task and the decision loop
///
/// One producer, one consumer. When full, the oldest bar is dropped to make
/// room, so `push` never blocks. Each push wakes a waiting consumer.
#[derive(Clone)]
pub struct FeedBuffer {
    data: Arc<Mutex<VecDeque<Bar>>>,
    ready: Arc<Notify>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl FeedBuffer {
    /// Create a new feed buffer
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of bars held at once (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            ready: Arc::new(Notify::new()),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Bar>> {
        // A panic elsewhere must not take the feed down with it
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a bar, evicting the oldest one if the buffer is full
    ///
    /// Returns true when an eviction happened.
    pub fn push(&self, bar: Bar) -> bool {
        let evicted = {
            let mut data = self.lock();
            let evicted = if data.len() >= self.capacity {
                data.pop_front();
                true
            } else {
                false
            };
            data.push_back(bar);
            evicted
        };

        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    /// Append many bars (warm-up preload) with a single wake-up
    pub fn extend(&self, bars: impl IntoIterator<Item = Bar>) -> usize {
        let mut evicted = 0;
        {
            let mut data = self.lock();
            for bar in bars {
                if data.len() >= self.capacity {
                    data.pop_front();
                    evicted += 1;
                }
                data.push_back(bar);
            }
        }

        self.dropped.fetch_add(evicted as u64, Ordering::Relaxed);
        self.ready.notify_one();
        evicted
    }

    /// Take the oldest bar without waiting
    pub fn try_pop(&self) -> Option<Bar> {
        self.lock().pop_front()
    }

    /// Take the oldest bar, waiting up to `wait` for one to arrive
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Bar> {
        if let Some(bar) = self.try_pop() {
            return Some(bar);
        }

        // Notify keeps a permit if the producer fired before we started waiting
        match tokio::time::timeout(wait, self.ready.notified()).await {
            Ok(()) => self.try_pop(),
            Err(_) => None,
        }
    }

    /// Wake a waiting consumer without pushing anything
    pub fn wake(&self) {
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bars discarded by the drop-oldest policy so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
