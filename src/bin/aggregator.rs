use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crawlhub::aggregator::server::build_router;
use crawlhub::aggregator::Aggregator;
use crawlhub::bus::{RedisBus, Subscription};
use crawlhub::config::AggregatorConfig;
use crawlhub::models::{HealthEvent, ProgressEvent};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

/// Consume one subscription to completion, applying `handle` to each
/// decoded message and acking unconditionally — the aggregator never nacks,
/// it just best-effort ingests whatever the bus redelivers (spec §4.4).
async fn run_ingest_loop<T, F, Fut>(
    mut subscription: impl Subscription,
    shutdown: CancellationToken,
    label: &'static str,
    handle: F,
) where
    T: serde::de::DeserializeOwned,
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(label, "ingest loop shutting down");
                return;
            }
            delivery = subscription.recv() => {
                let delivery = match delivery {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, label, "error receiving delivery");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                match delivery.decode::<T>() {
                    Ok(message) => handle(message).await,
                    Err(err) => tracing::warn!(error = %err, label, "malformed message, dropping"),
                }

                if let Err(err) = subscription.ack(&delivery.id).await {
                    tracing::warn!(error = %err, label, "failed to ack delivery");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AggregatorConfig::from_env().expect("failed to load configuration from environment");

    let redis_bus = RedisBus::new(&config.bus.url, config.bus.visibility_timeout)
        .expect("failed to construct redis bus client");

    let aggregator = Arc::new(Aggregator::new(&config, Utc::now()));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    let progress_subscription = redis_bus
        .subscribe(&config.progress_event_topic, &config.progress_event_group, "aggregator")
        .await
        .expect("failed to subscribe to progress-event topic");
    {
        let aggregator = aggregator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_ingest_loop::<ProgressEvent, _, _>(progress_subscription, shutdown, "progress-event", move |event| {
                let aggregator = aggregator.clone();
                async move { aggregator.handle_progress_event(event).await }
            })
            .await;
        });
    }

    let health_subscription = redis_bus
        .subscribe(&config.health_event_topic, &config.health_event_group, "aggregator")
        .await
        .expect("failed to subscribe to health-event topic");
    {
        let aggregator = aggregator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_ingest_loop::<HealthEvent, _, _>(health_subscription, shutdown, "health-event", move |event| {
                let aggregator = aggregator.clone();
                async move { aggregator.handle_health_event(event).await }
            })
            .await;
        });
    }

    {
        let aggregator = aggregator.clone();
        let shutdown = shutdown.clone();
        let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        aggregator.sweep_stalls(now).await;
                        aggregator.sweep_health(now).await;
                    }
                }
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("aggregator service starting on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind to address");

    axum::serve(listener, build_router(aggregator))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("server error");
}
