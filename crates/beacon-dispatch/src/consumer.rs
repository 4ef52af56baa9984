//! Per-queue consumer loops.
//!
//! One task per domain queue. Each waits for the broker, consumes, and
//! handles deliveries one at a time so per-queue publish order holds. When
//! the stream ends (connection loss) the loop waits for readiness again
//! and re-consumes. Cancellation is observed between deliveries only.

use std::sync::Arc;
use std::time::Duration;

use beacon_broker::{Broker, wait_until_ready};
use beacon_core::routing::Domain;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::DispatchEngine;

/// Consumer loop settings.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Instance-unique prefix for consumer tags.
    pub tag_prefix: String,
    /// Readiness poll interval while disconnected.
    pub ready_poll: Duration,
    /// Pause after a failed consume before retrying.
    pub retry_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            tag_prefix: "beacon".into(),
            ready_poll: Duration::from_millis(250),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Consume `queue` until `cancel` fires.
pub async fn run_consumer(
    broker: Arc<dyn Broker>,
    engine: DispatchEngine,
    queue: String,
    config: ConsumerConfig,
    cancel: CancellationToken,
) {
    let tag = format!("{}.dispatch.{queue}", config.tag_prefix);
    loop {
        // Readiness wait in long slices so cancellation stays responsive.
        let ready = tokio::select! {
            () = cancel.cancelled() => break,
            r = wait_until_ready(broker.as_ref(), Duration::from_secs(60), config.ready_poll) => r,
        };
        if ready.is_err() {
            continue;
        }

        let mut stream = match broker.consume(&queue, &tag).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(queue = %queue, error = %err, "consume failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(config.retry_delay) => continue,
                }
            }
        };
        info!(queue = %queue, "dispatch consumer started");

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };
            match next {
                None => {
                    if let Err(err) = broker.cancel(&tag).await {
                        warn!(queue = %queue, error = %err, "consumer cancel failed");
                    }
                    info!(queue = %queue, "dispatch consumer stopped");
                    return;
                }
                Some(Some(Ok(delivery))) => engine.process_delivery(delivery).await,
                Some(Some(Err(err))) => {
                    warn!(queue = %queue, error = %err, "delivery stream error");
                    break;
                }
                Some(None) => {
                    warn!(queue = %queue, "delivery stream ended, re-consuming");
                    break;
                }
            }
        }
    }
    info!(queue = %queue, "dispatch consumer stopped");
}

/// Spawn one consumer per domain queue.
pub fn spawn_all(
    broker: &Arc<dyn Broker>,
    engine: &DispatchEngine,
    config: &ConsumerConfig,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    Domain::ALL
        .iter()
        .map(|domain| {
            tokio::spawn(run_consumer(
                Arc::clone(broker),
                engine.clone(),
                domain.notification_queue().to_owned(),
                config.clone(),
                cancel.child_token(),
            ))
        })
        .collect()
}
