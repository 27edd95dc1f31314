use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::bus::{publish_json, Bus};
use crate::models::HealthEvent;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Publish a health event every 30s until `shutdown` fires (spec §4.5
/// "Heartbeats"). Intended to run as its own background task, independent
/// of message handlers, per spec §5's "dedicated workers" requirement.
pub async fn run_heartbeat(
    bus: Arc<dyn Bus>,
    topic: String,
    node_type: &'static str,
    hostname: String,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(node_type, "heartbeat task shutting down");
                return;
            }
            _ = ticker.tick() => {
                let event = HealthEvent {
                    node_type: node_type.to_string(),
                    hostname: hostname.clone(),
                    status: "online".to_string(),
                    timestamp: Utc::now(),
                };
                if let Err(err) = publish_json(bus.as_ref(), &topic, &event).await {
                    tracing::warn!(error = %err, node_type, "failed to publish heartbeat");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testutil::InMemoryBus;

    #[tokio::test]
    async fn heartbeat_stops_on_cancellation() {
        let bus = Arc::new(InMemoryBus::default());
        let shutdown = tokio_util::sync::CancellationToken::new();
        shutdown.cancel();

        run_heartbeat(bus.clone(), "health-event".to_string(), "crawler", "host-1".to_string(), shutdown).await;

        assert_eq!(bus.len("health-event").await, 0);
    }
}
