//! Dispatch worker draining the handoff queue into the transmitter.
//!
//! Producers enqueue and return immediately; one background task sends
//! everything pending in batches. Shutting down never cancels a send that
//! is already on the wire.

use crate::transmitter::Transmitter;
use cluster_core::{HandoffQueue, Member, OutboundMessage, PendingMessage, QueueConfig};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct MessageDispatcher {
    queue: Arc<HandoffQueue<PendingMessage>>,
    task: JoinHandle<()>,
}

impl MessageDispatcher {
    pub fn spawn(transmitter: Arc<Transmitter>, config: &QueueConfig) -> Self {
        let queue = Arc::new(HandoffQueue::<PendingMessage>::new(config.max_len));
        let worker_queue = Arc::clone(&queue);
        let timeout = config.remove_timeout();

        let task = tokio::spawn(async move {
            while worker_queue.is_enabled() {
                let batch = worker_queue.remove(timeout).await;
                if !batch.is_empty() {
                    debug!("Dispatching {} queued message(s)", batch.len());
                }
                let total = batch.len();
                for (sent, pending) in batch.into_iter().enumerate() {
                    if !worker_queue.is_enabled() {
                        debug!("Dispatcher stopped, dropping {} message(s)", total - sent);
                        break;
                    }
                    if let Err(e) = transmitter
                        .send_message(&pending.destinations, &pending.message)
                        .await
                    {
                        warn!("Queued message not fully delivered: {}", e);
                    }
                }
            }
        });

        Self { queue, task }
    }

    /// Queue a message for delivery. Returns false when the queue is full or
    /// shut down.
    pub fn enqueue(&self, destinations: Vec<Member>, message: OutboundMessage) -> bool {
        self.queue.add(PendingMessage {
            destinations,
            message,
        })
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drop pending messages and let the worker exit once its current send
    /// completes or times out.
    pub fn shutdown(&self) {
        self.queue.set_enabled(false);
    }

    /// Wait for the worker to exit. Call after [`MessageDispatcher::shutdown`].
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Dispatch worker failed: {}", e);
        }
    }
}
