//! Bounded fire-and-forget queues drained by a background worker.
//!
//! Used for response traces and the gap audit log. Pushing never blocks and
//! never fails: when the queue is full the overflow policy decides which item
//! is discarded, and the discard is counted.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gapwise_shared::{KnowledgeGap, KnowledgeWriter, OverflowPolicy, TraceConfig, TraceRecord, TraceSink};

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> Shared<T> {
    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A bounded queue with a single draining worker.
pub struct BackgroundQueue<T> {
    name: &'static str,
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BackgroundQueue<T> {
    /// An idle queue; items accumulate until [`start`](Self::start) is called.
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            name,
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                capacity: capacity.max(1),
                policy,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker. Each item is handed to `handler` in FIFO order.
    pub fn start<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = self.shared.clone();
        let name = self.name;
        let handle = tokio::spawn(async move {
            loop {
                let next = shared.items().pop_front();
                match next {
                    Some(item) => handler(item).await,
                    None if shared.closed.load(Ordering::Acquire) => break,
                    None => shared.notify.notified().await,
                }
            }
            debug!(queue = name, "background queue drained");
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self
    }

    /// Enqueue `item`. Returns false when the item itself was discarded.
    pub fn push(&self, item: T) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let accepted = {
            let mut items = self.shared.items();
            if items.len() < self.shared.capacity {
                items.push_back(item);
                true
            } else {
                match self.shared.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        self.record_drop();
                        true
                    }
                    OverflowPolicy::DropNewest => {
                        self.record_drop();
                        false
                    }
                }
            }
        };
        if accepted {
            self.shared.notify.notify_one();
        }
        accepted
    }

    fn record_drop(&self) {
        let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(queue = self.name, policy = ?self.shared.policy, dropped = total, "queue full, item dropped");
    }

    /// Items discarded since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items and wait for the worker to drain the backlog.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(queue = self.name, error = %e, "queue worker panicked");
            }
        }
    }
}

/// Trace queue persisting every record through `sink`.
pub fn trace_queue(sink: Arc<dyn TraceSink>, config: &TraceConfig) -> BackgroundQueue<TraceRecord> {
    BackgroundQueue::new("trace", config.queue_capacity, config.overflow).start(move |record: TraceRecord| {
        let sink = sink.clone();
        async move {
            if let Err(e) = sink.append(&record).await {
                warn!(query_id = %record.query_id, error = %e, "failed to persist trace");
            }
        }
    })
}

/// Audit queue appending every detected gap to the store's gap log.
pub fn gap_audit_queue(
    writer: Arc<dyn KnowledgeWriter>,
    capacity: usize,
    policy: OverflowPolicy,
) -> BackgroundQueue<KnowledgeGap> {
    BackgroundQueue::new("gap-audit", capacity, policy).start(move |gap: KnowledgeGap| {
        let writer = writer.clone();
        async move {
            if let Err(e) = writer.record_gap(&gap).await {
                warn!(gap_id = %gap.id, error = %e, "failed to record gap");
            }
        }
    })
}
