//! In-process broker with the same routing rules as the AMQP topology:
//! fan-out exchanges copy to every bound queue, the default exchange routes by
//! queue name, and reply queues vanish as soon as their owner lets go of them.

use super::{
    Acknowledger, BrokerError, BrokerMessage, BrokerTransport, Delivery, DeliveryStream,
    ReplySubscription,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

struct MemoryQueue {
    sender: mpsc::UnboundedSender<BrokerMessage>,
    receiver: Option<mpsc::UnboundedReceiver<BrokerMessage>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, Vec<String>>,
    queues: HashMap<String, MemoryQueue>,
    reply_queues: usize,
}

#[derive(Default)]
pub struct MemoryTransport {
    topology: Arc<Mutex<Topology>>,
    acked: Arc<AtomicU64>,
    unroutable: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply queues currently declared and not yet torn down
    pub fn reply_queue_count(&self) -> usize {
        self.lock().reply_queues
    }

    /// Work-queue messages acknowledged so far
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    /// Messages published to a queue name that does not exist
    pub fn unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::SeqCst)
    }

    /// Whether `queue` exists and a work consumer has taken it
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.receiver.is_none())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Topology> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct MemoryAcker {
    acked: Arc<AtomicU64>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryReplySubscription {
    name: String,
    receiver: mpsc::UnboundedReceiver<BrokerMessage>,
    topology: Arc<Mutex<Topology>>,
}

impl Drop for MemoryReplySubscription {
    fn drop(&mut self) {
        let mut topology = self
            .topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if topology.queues.remove(&self.name).is_some() {
            topology.reply_queues -= 1;
        }
    }
}

#[async_trait]
impl ReplySubscription for MemoryReplySubscription {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn next_message(&mut self) -> Option<Result<BrokerMessage, BrokerError>> {
        self.receiver.recv().await.map(Ok)
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        drop(self);
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.lock().exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn open_reply_queue(&self) -> Result<Box<dyn ReplySubscription>, BrokerError> {
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        let mut queue = MemoryQueue::new();
        let receiver = queue
            .receiver
            .take()
            .ok_or_else(|| BrokerError::Consume("reply queue already consumed".to_string()))?;

        {
            let mut topology = self.lock();
            topology.queues.insert(name.clone(), queue);
            topology.reply_queues += 1;
        }

        Ok(Box::new(MemoryReplySubscription {
            name,
            receiver,
            topology: self.topology.clone(),
        }))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        let topology = self.lock();

        let targets: Vec<String> = if exchange.is_empty() {
            topology
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            topology
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::Channel(format!("no exchange '{}'", exchange)))?
                .clone()
        };

        if targets.is_empty() {
            self.unroutable.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("Dropping unroutable message for '{}'", routing_key);
            return Ok(());
        }

        for name in &targets {
            if let Some(queue) = topology.queues.get(name) {
                // Receiver gone means the owner tore the queue down mid-publish.
                let _ = queue.sender.send(message.clone());
            }
        }
        Ok(())
    }

    async fn consume_work_queue(
        &self,
        exchange: &str,
        queue: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        let receiver = {
            let mut topology = self.lock();
            let bindings = topology.exchanges.entry(exchange.to_string()).or_default();
            if !bindings.iter().any(|q| q == queue) {
                bindings.push(queue.to_string());
            }
            topology
                .queues
                .entry(queue.to_string())
                .or_insert_with(MemoryQueue::new)
                .receiver
                .take()
                .ok_or_else(|| {
                    BrokerError::Consume(format!("queue '{}' already has a consumer", queue))
                })?
        };

        let acked = self.acked.clone();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let acked = acked.clone();
            async move {
                let message = receiver.recv().await?;
                let delivery = Delivery::new(message, Box::new(MemoryAcker { acked }));
                Some((Ok(delivery), receiver))
            }
        });
        Ok(stream.boxed())
    }
}
