use crate::config::{BrokerBackend, BrokerConfig, RetryPolicy};
use crate::services::broker::BrokerTransport;
use crate::services::broker::amqp::AmqpTransport;
use crate::services::broker::memory::MemoryTransport;
use crate::utils::retry::retry_connect;
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

/// Connects the broker transport and declares the shared exchange.
pub async fn setup_broker(
    config: &BrokerConfig,
    retry: RetryPolicy,
) -> anyhow::Result<Arc<dyn BrokerTransport>> {
    let transport: Arc<dyn BrokerTransport> = match config.backend {
        BrokerBackend::Memory => {
            info!("🧪 In-memory broker");
            Arc::new(MemoryTransport::new())
        }
        BrokerBackend::Amqp => {
            info!("🐇 Broker: {}", redact(&config.url));
            let url = config.url.as_str();
            let transport = retry_connect(retry, "Message broker", move || {
                AmqpTransport::connect(url)
            })
            .await
            .context("message broker unreachable")?;
            Arc::new(transport)
        }
    };

    transport
        .declare_exchange(&config.exchange)
        .await
        .with_context(|| format!("failed to declare exchange '{}'", config.exchange))?;
    info!("✅ Exchange '{}' declared", config.exchange);

    Ok(transport)
}

/// Hides the password part of an AMQP URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            let credentials = &url[scheme + 3..at];
            match credentials.split_once(':') {
                Some((user, _)) => format!("{}{}:***{}", &url[..scheme + 3], user, &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}
