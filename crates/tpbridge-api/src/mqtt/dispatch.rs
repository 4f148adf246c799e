// Inbound message dispatch.
//
// Each (subscription, topic) pair gets its own worker task fed through an
// unbounded channel. A worker runs its handler on the blocking pool one
// message at a time, so a handler sees messages of one topic in receipt
// order while different topics proceed concurrently. Idle workers retire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, warn};

use crate::mqtt::link::Message;

/// Callback invoked for every message matching a subscription.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type WorkerKey = (u64, String);
type WorkerMap = HashMap<WorkerKey, WorkerSlot>;

struct WorkerSlot {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

pub(crate) struct Dispatcher {
    workers: Arc<Mutex<WorkerMap>>,
    next_worker: AtomicU64,
    cancel: Mutex<CancellationToken>,
    span: Span,
}

impl Dispatcher {
    pub(crate) fn new(span: Span) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_worker: AtomicU64::new(0),
            cancel: Mutex::new(CancellationToken::new()),
            span,
        }
    }

    /// Hand `message` to the worker for `(subscription_id, topic)`,
    /// starting one if needed.
    pub(crate) fn dispatch(&self, subscription_id: u64, handler: &MessageHandler, message: Message) {
        let key = (subscription_id, message.topic.clone());
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let message = match workers.get(&key) {
            Some(slot) => match slot.tx.send(message) {
                Ok(()) => return,
                // Worker already exited; start a fresh one.
                Err(mpsc::error::SendError(returned)) => returned,
            },
            None => message,
        };
        workers.remove(&key);
        self.spawn_worker(&mut workers, key, handler, message);
    }

    fn spawn_worker(
        &self,
        workers: &mut WorkerMap,
        key: WorkerKey,
        handler: &MessageHandler,
        first: Message,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Cannot fail: `rx` is alive.
        let _ = tx.send(first);
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        workers.insert(key.clone(), WorkerSlot { id, tx });

        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let worker = Worker {
            id,
            key,
            rx,
            handler: Arc::clone(handler),
            workers: Arc::clone(&self.workers),
            cancel,
        };
        tokio::spawn(worker.run().instrument(self.span.clone()));
    }

    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop every worker and drop undelivered messages.
    pub(crate) fn clear(&self) {
        let old = {
            let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *cancel, CancellationToken::new())
        };
        old.cancel();
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

struct Worker {
    id: u64,
    key: WorkerKey,
    rx: mpsc::UnboundedReceiver<Message>,
    handler: MessageHandler,
    workers: Arc<Mutex<WorkerMap>>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = tokio::time::timeout(WORKER_IDLE_TIMEOUT, self.rx.recv()) => next,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => {
                    if self.retire() {
                        break;
                    }
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            let topic = message.topic.clone();
            let invoke = tokio::task::spawn_blocking(move || handler(message));
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = invoke => {
                    if let Err(e) = result {
                        warn!(topic = %topic, error = %e, "message handler panicked");
                    }
                }
            }
        }
        debug!(topic = %self.key.1, "dispatch worker exiting");
    }

    /// Remove this worker from the map if nothing is pending. Senders hold
    /// the map lock, so nothing can arrive after removal.
    fn retire(&mut self) -> bool {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.rx.is_empty() {
            return false;
        }
        if workers
            .get(&self.key)
            .is_some_and(|slot| slot.id == self.id)
        {
            workers.remove(&self.key);
        }
        true
    }
}
