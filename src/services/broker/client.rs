use super::{
    BrokerError, BrokerMessage, BrokerTransport, JobReply, JobRequest, MessageProperties,
    ReplySubscription,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier placed on a request and echoed on its reply. Minted from a v4
/// UUID, so tokens do not repeat within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: Option<&str>) -> bool {
        candidate == Some(self.0.as_str())
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one request/reply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Published,
    Matched,
    TimedOut,
    Cancelled,
    Closed,
}

impl CallState {
    fn can_move_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Published)
                | (Published, Matched)
                | (Published, TimedOut)
                | (Published, Cancelled)
                | (_, Closed)
        ) && self != Closed
    }
}

struct CallTracker {
    token: CorrelationToken,
    state: CallState,
}

impl CallTracker {
    fn advance(&mut self, next: CallState) {
        debug_assert!(
            self.state.can_move_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(token = %self.token, "reply call {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Request/reply over the fan-out exchange, one private reply queue per call.
pub struct CorrelationClient {
    transport: Arc<dyn BrokerTransport>,
    exchange: String,
}

impl CorrelationClient {
    pub fn new(transport: Arc<dyn BrokerTransport>, exchange: impl Into<String>) -> Self {
        Self {
            transport,
            exchange: exchange.into(),
        }
    }

    /// Publishes `job` and waits for the reply carrying this call's token.
    ///
    /// Replies with any other token are dropped. The wait ends on the first
    /// matching reply, on `timeout`, or when `cancel` fires; the reply queue is
    /// torn down on every exit path.
    pub async fn request_reply(
        &self,
        job: &JobRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobReply, BrokerError> {
        self.transport.declare_exchange(&self.exchange).await?;

        let mut subscription = self.transport.open_reply_queue().await?;
        let mut call = CallTracker {
            token: CorrelationToken::mint(),
            state: CallState::Idle,
        };

        let result = self
            .publish_and_wait(subscription.as_mut(), &mut call, job, timeout, cancel)
            .await;

        let queue = subscription.queue_name().to_string();
        if let Err(e) = subscription.close().await {
            warn!("Failed to close reply queue {}: {}", queue, e);
        }
        call.advance(CallState::Closed);

        result
    }

    async fn publish_and_wait(
        &self,
        subscription: &mut dyn ReplySubscription,
        call: &mut CallTracker,
        job: &JobRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobReply, BrokerError> {
        let message = BrokerMessage::json(
            job,
            MessageProperties {
                correlation_id: Some(call.token.to_string()),
                reply_to: Some(subscription.queue_name().to_string()),
                content_type: None,
            },
        )?;

        self.transport.publish(&self.exchange, "", message).await?;
        call.advance(CallState::Published);
        debug!(
            "📨 Job {} published, awaiting reply on {}",
            job.id,
            subscription.queue_name()
        );

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    call.advance(CallState::Cancelled);
                    return Err(BrokerError::Cancelled);
                }
                next = subscription.next_message() => match next {
                    Some(Ok(reply)) if call.token.matches(reply.properties.correlation_id.as_deref()) => {
                        call.advance(CallState::Matched);
                        return Ok(serde_json::from_slice(&reply.body)?);
                    }
                    Some(Ok(reply)) => {
                        warn!(
                            "Discarding reply with foreign correlation id {:?} on {}",
                            reply.properties.correlation_id,
                            subscription.queue_name()
                        );
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(BrokerError::ReplyQueueClosed),
                },
                _ = &mut deadline => {
                    call.advance(CallState::TimedOut);
                    return Err(BrokerError::Timeout(timeout));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::broker::memory::MemoryTransport;
    use futures::StreamExt;

    const EXCHANGE: &str = "pcd_files";
    const QUEUE: &str = "file_metadata_queue";

    fn job(id: &str) -> JobRequest {
        JobRequest {
            id: id.to_string(),
            filename: format!("{}.ply", id),
            object_key: format!("key-{}", id),
        }
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = CorrelationToken::mint();
        let b = CorrelationToken::mint();
        assert_ne!(a, b);
        assert!(a.matches(Some(a.as_str())));
        assert!(!a.matches(Some(b.as_str())));
        assert!(!a.matches(None));
    }

    #[test]
    fn test_state_transitions() {
        assert!(CallState::Idle.can_move_to(CallState::Published));
        assert!(CallState::Published.can_move_to(CallState::Matched));
        assert!(CallState::Idle.can_move_to(CallState::Closed));
        assert!(!CallState::Idle.can_move_to(CallState::Matched));
        assert!(!CallState::Closed.can_move_to(CallState::Closed));
        assert!(!CallState::Matched.can_move_to(CallState::TimedOut));
    }

    #[tokio::test]
    async fn test_foreign_reply_is_ignored_and_matching_reply_wins() {
        let transport = Arc::new(MemoryTransport::new());
        let mut work = transport
            .consume_work_queue(EXCHANGE, QUEUE, 1)
            .await
            .unwrap();
        let client = CorrelationClient::new(transport.clone(), EXCHANGE);

        let responder = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let delivery = work.next().await.unwrap().unwrap();
                let props = delivery.message.properties.clone();
                let reply_to = props.reply_to.unwrap();
                let request: JobRequest = serde_json::from_slice(&delivery.message.body).unwrap();

                let foreign = BrokerMessage::json(
                    &request.clone().into_reply("wrong".to_string()),
                    MessageProperties {
                        correlation_id: Some("someone-else".to_string()),
                        ..Default::default()
                    },
                )
                .unwrap();
                transport.publish("", &reply_to, foreign).await.unwrap();

                let matching = BrokerMessage::json(
                    &request.into_reply("processed/right.bin".to_string()),
                    MessageProperties {
                        correlation_id: props.correlation_id,
                        ..Default::default()
                    },
                )
                .unwrap();
                transport.publish("", &reply_to, matching).await.unwrap();
                delivery.ack().await.unwrap();
            })
        };

        let reply = client
            .request_reply(&job("1"), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(reply.object_key, "processed/right.bin");
        assert_eq!(transport.reply_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_times_out_and_cleans_up() {
        let transport = Arc::new(MemoryTransport::new());
        let client = CorrelationClient::new(transport.clone(), EXCHANGE);

        let err = client
            .request_reply(&job("2"), Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Timeout(_)));
        assert_eq!(transport.reply_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_queue_early() {
        let transport = Arc::new(MemoryTransport::new());
        let client = CorrelationClient::new(transport.clone(), EXCHANGE);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = client
            .request_reply(&job("3"), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.reply_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_matching_reply_is_payload_error() {
        let transport = Arc::new(MemoryTransport::new());
        let mut work = transport
            .consume_work_queue(EXCHANGE, QUEUE, 1)
            .await
            .unwrap();
        let client = CorrelationClient::new(transport.clone(), EXCHANGE);

        let responder = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let delivery = work.next().await.unwrap().unwrap();
                let props = delivery.message.properties.clone();
                let garbage = BrokerMessage {
                    body: b"not json".to_vec(),
                    properties: MessageProperties {
                        correlation_id: props.correlation_id,
                        ..Default::default()
                    },
                };
                transport
                    .publish("", &props.reply_to.unwrap(), garbage)
                    .await
                    .unwrap();
            })
        };

        let err = client
            .request_reply(&job("4"), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        responder.await.unwrap();

        assert!(matches!(err, BrokerError::Payload(_)));
        assert_eq!(transport.reply_queue_count(), 0);
    }
}
