use crate::config::WorkerConfig;
use crate::services::broker::{
    BrokerError, BrokerMessage, BrokerTransport, Delivery, JobRequest, MessageProperties,
};
use crate::services::processor::JobProcessor;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use utoipa::ToSchema;

/// What happened to one work-queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Processed and the reply was published
    Replied { job_id: String, output_key: String },
    /// Processed, but the message named no reply queue
    NoReplyTo { job_id: String, output_key: String },
    /// Body was not a job request; dropped
    Malformed { reason: String },
    /// The processor failed; no reply is sent
    ProcessingFailed { job_id: String, reason: String },
    /// Processed, but publishing the reply failed
    ReplyFailed { job_id: String, reason: String },
}

/// Outcome of a message together with the result of acknowledging it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub outcome: JobOutcome,
    pub ack_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    replied: AtomicU64,
    no_reply_to: AtomicU64,
    malformed: AtomicU64,
    processing_failed: AtomicU64,
    reply_failed: AtomicU64,
    ack_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct WorkerStatsSnapshot {
    pub replied: u64,
    pub no_reply_to: u64,
    pub malformed: u64,
    pub processing_failed: u64,
    pub reply_failed: u64,
    pub ack_failed: u64,
}

impl WorkerStats {
    fn record(&self, report: &JobReport) {
        let counter = match report.outcome {
            JobOutcome::Replied { .. } => &self.replied,
            JobOutcome::NoReplyTo { .. } => &self.no_reply_to,
            JobOutcome::Malformed { .. } => &self.malformed,
            JobOutcome::ProcessingFailed { .. } => &self.processing_failed,
            JobOutcome::ReplyFailed { .. } => &self.reply_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if report.ack_error.is_some() {
            self.ack_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            replied: self.replied.load(Ordering::Relaxed),
            no_reply_to: self.no_reply_to.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            processing_failed: self.processing_failed.load(Ordering::Relaxed),
            reply_failed: self.reply_failed.load(Ordering::Relaxed),
            ack_failed: self.ack_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct JobHandler {
    transport: Arc<dyn BrokerTransport>,
    processor: Arc<dyn JobProcessor>,
    stats: Arc<WorkerStats>,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
}

impl JobHandler {
    async fn handle(&self, delivery: Delivery) -> JobReport {
        let outcome = self.process(&delivery.message).await;

        // Acknowledge only after the reply attempt, whatever its result.
        let ack_error = match delivery.ack().await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("Failed to acknowledge message: {}", e);
                Some(e.to_string())
            }
        };

        let report = JobReport { outcome, ack_error };
        self.stats.record(&report);
        if let Some(reports) = &self.reports {
            let _ = reports.send(report.clone());
        }
        report
    }

    async fn process(&self, message: &BrokerMessage) -> JobOutcome {
        let job: JobRequest = match serde_json::from_slice(&message.body) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("🗑️  Dropping malformed job message: {}", e);
                return JobOutcome::Malformed {
                    reason: e.to_string(),
                };
            }
        };
        tracing::info!("📥 Job {} received: {}", job.id, job.filename);

        let output_key = match self.processor.process(&job).await {
            Ok(key) => key,
            Err(e) => {
                tracing::error!("Job {} processing failed: {:#}", job.id, e);
                return JobOutcome::ProcessingFailed {
                    job_id: job.id,
                    reason: format!("{:#}", e),
                };
            }
        };

        let Some(reply_to) = message.properties.reply_to.clone() else {
            tracing::warn!("Job {} has no reply_to, result {} not announced", job.id, output_key);
            return JobOutcome::NoReplyTo {
                job_id: job.id,
                output_key,
            };
        };

        let job_id = job.id.clone();
        match self
            .publish_reply(job, output_key.clone(), &reply_to, message)
            .await
        {
            Ok(()) => {
                tracing::info!("📤 Job {} replied to {}", job_id, reply_to);
                JobOutcome::Replied { job_id, output_key }
            }
            Err(e) => {
                tracing::error!("Job {} reply publish failed: {}", job_id, e);
                JobOutcome::ReplyFailed {
                    job_id,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn publish_reply(
        &self,
        job: JobRequest,
        output_key: String,
        reply_to: &str,
        request: &BrokerMessage,
    ) -> Result<(), BrokerError> {
        let reply = BrokerMessage::json(
            &job.into_reply(output_key),
            MessageProperties {
                correlation_id: request.properties.correlation_id.clone(),
                ..Default::default()
            },
        )?;
        self.transport.publish("", reply_to, reply).await
    }
}

/// Consumes the work queue and runs each job on a fixed-size pool.
pub struct ProcessingWorker {
    transport: Arc<dyn BrokerTransport>,
    processor: Arc<dyn JobProcessor>,
    exchange: String,
    queue: String,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
    shutdown: watch::Receiver<bool>,
}

impl ProcessingWorker {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        processor: Arc<dyn JobProcessor>,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            processor,
            exchange: exchange.into(),
            queue: queue.into(),
            config,
            stats: Arc::new(WorkerStats::default()),
            reports: None,
            shutdown,
        }
    }

    /// Every finished message is also sent to `reports`.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<JobReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub async fn run(mut self) -> Result<(), BrokerError> {
        let pool_size = self.config.pool_size.max(1);
        let prefetch = u16::try_from(pool_size).unwrap_or(u16::MAX);
        let mut deliveries = self
            .transport
            .consume_work_queue(&self.exchange, &self.queue, prefetch)
            .await?;

        tracing::info!(
            "🚀 Processing worker started ({} handlers, queue '{}')",
            pool_size,
            self.queue
        );

        let (tx, rx) = mpsc::channel::<Delivery>(self.config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handler = JobHandler {
            transport: self.transport.clone(),
            processor: self.processor.clone(),
            stats: self.stats.clone(),
            reports: self.reports.clone(),
        };

        let mut pool = JoinSet::new();
        for _ in 0..pool_size {
            let rx = rx.clone();
            let handler = handler.clone();
            pool.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(delivery) => {
                            handler.handle(delivery).await;
                        }
                        None => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Processing worker shutting down");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => tracing::error!("Work queue consumer error: {}", e),
                    None => {
                        tracing::warn!("Work queue consumer closed");
                        break;
                    }
                }
            }
        }

        // Closing the internal queue lets the pool drain what was already taken.
        drop(tx);
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker task failed: {}", e);
            }
        }
        drop(deliveries);

        tracing::info!("✅ Processing worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::broker::memory::MemoryTransport;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SuffixProcessor;

    #[async_trait]
    impl JobProcessor for SuffixProcessor {
        async fn process(&self, job: &JobRequest) -> anyhow::Result<String> {
            if job.object_key == "explode" {
                return Err(anyhow!("boom"));
            }
            Ok(format!("processed/{}", job.object_key))
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            pool_size: 2,
            queue_capacity: 4,
            output_prefix: "processed".to_string(),
        }
    }

    struct Harness {
        transport: Arc<MemoryTransport>,
        reports: mpsc::UnboundedReceiver<JobReport>,
        stats: Arc<WorkerStats>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<(), BrokerError>>,
    }

    async fn start() -> Harness {
        let transport = Arc::new(MemoryTransport::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (report_tx, reports) = mpsc::unbounded_channel();
        let worker = ProcessingWorker::new(
            transport.clone(),
            Arc::new(SuffixProcessor),
            "pcd_files",
            "file_metadata_queue",
            config(),
            shutdown_rx,
        )
        .with_reports(report_tx);
        let stats = worker.stats();
        let handle = tokio::spawn(worker.run());

        for _ in 0..100 {
            if transport.has_consumer("file_metadata_queue") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        Harness {
            transport,
            reports,
            stats,
            shutdown,
            handle,
        }
    }

    async fn next_report(harness: &mut Harness) -> JobReport {
        tokio::time::timeout(Duration::from_secs(5), harness.reports.recv())
            .await
            .expect("worker produced no report")
            .expect("report channel closed")
    }

    fn job_message(object_key: &str, properties: MessageProperties) -> BrokerMessage {
        BrokerMessage::json(
            &JobRequest {
                id: "9".to_string(),
                filename: "cloud.ply".to_string(),
                object_key: object_key.to_string(),
            },
            properties,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_reply_carries_correlation_id_to_reply_queue() {
        let mut harness = start().await;
        let mut reply_queue = harness.transport.open_reply_queue().await.unwrap();

        harness
            .transport
            .publish(
                "pcd_files",
                "",
                job_message(
                    "in-key",
                    MessageProperties {
                        correlation_id: Some("token-1".to_string()),
                        reply_to: Some(reply_queue.queue_name().to_string()),
                        content_type: None,
                    },
                ),
            )
            .await
            .unwrap();

        let report = next_report(&mut harness).await;
        assert_eq!(
            report.outcome,
            JobOutcome::Replied {
                job_id: "9".to_string(),
                output_key: "processed/in-key".to_string()
            }
        );
        assert!(report.ack_error.is_none());

        let reply = reply_queue.next_message().await.unwrap().unwrap();
        assert_eq!(reply.properties.correlation_id.as_deref(), Some("token-1"));
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["minio_key"], "processed/in-key");
        assert_eq!(body["id"], "9");

        let _ = harness.shutdown.send(true);
        harness.handle.await.unwrap().unwrap();
        assert_eq!(harness.transport.acked(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_acked_and_counted() {
        let mut harness = start().await;

        harness
            .transport
            .publish(
                "pcd_files",
                "",
                BrokerMessage {
                    body: b"{not json".to_vec(),
                    properties: MessageProperties::default(),
                },
            )
            .await
            .unwrap();

        let report = next_report(&mut harness).await;
        assert!(matches!(report.outcome, JobOutcome::Malformed { .. }));
        assert_eq!(harness.stats.snapshot().malformed, 1);
        assert_eq!(harness.transport.acked(), 1);
    }

    #[tokio::test]
    async fn test_processing_failure_sends_no_reply() {
        let mut harness = start().await;
        let mut reply_queue = harness.transport.open_reply_queue().await.unwrap();

        harness
            .transport
            .publish(
                "pcd_files",
                "",
                job_message(
                    "explode",
                    MessageProperties {
                        correlation_id: Some("token-2".to_string()),
                        reply_to: Some(reply_queue.queue_name().to_string()),
                        content_type: None,
                    },
                ),
            )
            .await
            .unwrap();

        let report = next_report(&mut harness).await;
        assert!(matches!(report.outcome, JobOutcome::ProcessingFailed { .. }));
        assert_eq!(harness.stats.snapshot().processing_failed, 1);

        let nothing =
            tokio::time::timeout(Duration::from_millis(50), reply_queue.next_message()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_missing_reply_to_is_reported() {
        let mut harness = start().await;

        harness
            .transport
            .publish(
                "pcd_files",
                "",
                job_message("in-key", MessageProperties::default()),
            )
            .await
            .unwrap();

        let report = next_report(&mut harness).await;
        assert!(matches!(report.outcome, JobOutcome::NoReplyTo { .. }));
        assert_eq!(harness.stats.snapshot().no_reply_to, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let harness = start().await;
        harness.shutdown.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), harness.handle)
            .await
            .expect("worker did not stop");
        assert!(result.unwrap().is_ok());
    }
}
