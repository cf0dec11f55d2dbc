//! Intake dispatcher
//!
//! Routes inbound deliveries to one worker task per partition key. Each
//! worker owns a bounded FIFO queue and hands its events to the
//! [`EventProcessor`] one at a time, so per-key order is exactly arrival
//! order while distinct keys proceed in parallel.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{IngestError, IngestResult};
use crate::event::{Delivery, Event, PartitionKey};
use crate::outcome::ProcessingOutcome;
use crate::processor::EventProcessor;

struct Job {
    event: Event,
    done: oneshot::Sender<ProcessingOutcome>,
}

pub struct IngestDispatcher {
    processor: Arc<EventProcessor>,
    queue_capacity: usize,
    queues: Mutex<HashMap<PartitionKey, mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl IngestDispatcher {
    pub fn new(processor: Arc<EventProcessor>) -> Self {
        let queue_capacity = processor.config().dispatcher_queue_capacity;
        Self {
            processor,
            queue_capacity,
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    /// Enqueue a delivery on its partition's worker
    ///
    /// Waits while the partition queue is full. The returned receiver
    /// resolves once the event's outcome is final.
    pub async fn submit(
        &self,
        delivery: Delivery,
    ) -> IngestResult<oneshot::Receiver<ProcessingOutcome>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }

        let Delivery { partition, event } = delivery;
        let sender = self.sender_for(&partition)?;
        let (done, receiver) = oneshot::channel();

        sender.send(Job { event, done }).await.map_err(|_| {
            IngestError::DispatcherClosed(format!("worker for partition {} stopped", partition))
        })?;

        Ok(receiver)
    }

    /// Submit and wait for the outcome
    pub async fn submit_and_wait(&self, delivery: Delivery) -> IngestResult<ProcessingOutcome> {
        let receiver = self.submit(delivery).await?;
        receiver
            .await
            .map_err(|_| IngestError::DispatcherClosed("outcome channel dropped".to_string()))
    }

    /// Drain `deliveries`, returning outcomes in stream order
    pub async fn run<S>(&self, deliveries: S) -> IngestResult<Vec<ProcessingOutcome>>
    where
        S: Stream<Item = Delivery>,
    {
        let mut deliveries = Box::pin(deliveries);
        let mut pending = Vec::new();

        while let Some(delivery) = deliveries.next().await {
            pending.push(self.submit(delivery).await?);
        }

        debug!(submitted = pending.len(), "Delivery stream drained");

        let mut outcomes = Vec::with_capacity(pending.len());
        for receiver in pending {
            let outcome = receiver
                .await
                .map_err(|_| IngestError::DispatcherClosed("outcome channel dropped".to_string()))?;
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Number of partitions with a live worker
    pub fn worker_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Close every queue and wait for workers to finish what was enqueued
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let queues: Vec<_> = {
            let mut queues = self.queues.lock();
            queues.drain().collect()
        };
        drop(queues);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let count = workers.len();

        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Partition worker terminated abnormally: {}", e);
            }
        }

        info!(workers = count, "Intake dispatcher shut down");
    }

    fn sender_for(&self, partition: &PartitionKey) -> IngestResult<mpsc::Sender<Job>> {
        let mut queues = self.queues.lock();
        // Rechecked under the lock; shutdown drains queues while holding it
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        if let Some(sender) = queues.get(partition) {
            return Ok(sender.clone());
        }

        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let worker = tokio::spawn(partition_worker(
            Arc::clone(&self.processor),
            partition.clone(),
            receiver,
        ));
        self.workers.lock().push(worker);
        queues.insert(partition.clone(), sender.clone());

        debug!(partition = %partition, "Spawned partition worker");
        Ok(sender)
    }
}

fn closed_error() -> IngestError {
    IngestError::DispatcherClosed("dispatcher has been shut down".to_string())
}

async fn partition_worker(
    processor: Arc<EventProcessor>,
    partition: PartitionKey,
    mut jobs: mpsc::Receiver<Job>,
) {
    while let Some(Job { event, done }) = jobs.recv().await {
        let outcome = processor.intake(event, partition.clone()).await;
        if done.send(outcome).is_err() {
            debug!(partition = %partition, "Outcome receiver dropped");
        }
    }

    debug!(partition = %partition, "Partition worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::effect::NoopEffect;

    fn dispatcher() -> IngestDispatcher {
        let processor = EventProcessor::new(IngestConfig::default(), NoopEffect).unwrap();
        IngestDispatcher::new(Arc::new(processor))
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let dispatcher = dispatcher();

        let first = dispatcher.submit_and_wait(Delivery::global("e1")).await.unwrap();
        let second = dispatcher.submit_and_wait(Delivery::global("e1")).await.unwrap();

        assert_eq!(first, ProcessingOutcome::Processed);
        assert_eq!(second, ProcessingOutcome::DuplicateIgnored);
        assert_eq!(dispatcher.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_one_worker_per_partition() {
        let dispatcher = dispatcher();

        dispatcher.submit_and_wait(Delivery::new("a", "x")).await.unwrap();
        dispatcher.submit_and_wait(Delivery::new("b", "x")).await.unwrap();
        dispatcher.submit_and_wait(Delivery::new("a", "y")).await.unwrap();

        assert_eq!(dispatcher.worker_count(), 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let dispatcher = dispatcher();
        dispatcher.submit_and_wait(Delivery::global("e1")).await.unwrap();

        dispatcher.shutdown().await;

        let err = dispatcher.submit(Delivery::global("e2")).await.unwrap_err();
        assert!(matches!(err, IngestError::DispatcherClosed(_)));
        assert_eq!(dispatcher.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_no_worker_spawned_once_closed() {
        let dispatcher = dispatcher();
        dispatcher.shutdown().await;

        // A submit that passed its first check just before shutdown
        let err = dispatcher.sender_for(&PartitionKey::new("late")).unwrap_err();
        assert!(matches!(err, IngestError::DispatcherClosed(_)));
        assert_eq!(dispatcher.worker_count(), 0);
        assert!(dispatcher.workers.lock().is_empty());
    }
}
