use crate::config::RetryPolicy;
use std::fmt::Display;
use std::future::Future;
use tracing::{info, warn};

/// Runs `op` until it succeeds or the policy's attempts are exhausted, sleeping
/// a fixed backoff between attempts. Returns the last error on exhaustion.
pub async fn retry_connect<T, E, F, Fut>(policy: RetryPolicy, service: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("✅ {} reachable after {} attempts", service, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt < attempts => {
                warn!(
                    "⏳ {} not ready (attempt {}/{}): {}",
                    service, attempt, attempts, e
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => {
                warn!("❌ {} unreachable after {} attempts: {}", service, attempts, e);
                return Err(e);
            }
        }
    }
}
