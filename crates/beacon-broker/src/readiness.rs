//! Bounded wait for broker readiness.

use std::time::Duration;

use tokio::time::Instant;

use crate::broker::Broker;
use crate::errors::{BrokerError, Result};

/// Poll `broker.is_ready()` every `poll` until it is true or `timeout`
/// elapses. Returns immediately when already ready.
pub async fn wait_until_ready(broker: &dyn Broker, timeout: Duration, poll: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if broker.is_ready() {
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(BrokerError::NotReady { waited });
        }
        tokio::time::sleep(poll.min(timeout - waited)).await;
    }
}
