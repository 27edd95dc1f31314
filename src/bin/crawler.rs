use std::sync::Arc;
use std::time::Duration;

use crawlhub::blob::{BlobConfig, S3BlobStore};
use crawlhub::bus::{Bus, RedisBus, Subscription};
use crawlhub::config::CrawlerConfig;
use crawlhub::crawler::{CrawlEngine, TaskOutcome};
use crawlhub::health;
use crawlhub::models::CrawlTask;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CrawlerConfig::from_env().expect("failed to load configuration from environment");

    let blob = Arc::new(S3BlobStore::new(BlobConfig {
        endpoint: config.blob.endpoint.clone(),
        access_key: config.blob.access_key.clone(),
        secret_key: config.blob.secret_key.clone(),
        bucket: config.blob.bucket.clone(),
    }));

    let redis_bus = RedisBus::new(&config.bus.url, config.bus.visibility_timeout)
        .expect("failed to construct redis bus client");
    let bus: Arc<dyn Bus> = Arc::new(redis_bus.clone());

    let engine = Arc::new(CrawlEngine::new(blob, bus.clone(), config.clone()));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    tokio::spawn(health::run_heartbeat(
        bus,
        config.health_event_topic.clone(),
        "crawler",
        config.host_id.clone(),
        shutdown.clone(),
    ));

    let mut subscription = redis_bus
        .subscribe(&config.crawl_task_topic, &config.crawl_task_group, &config.host_id)
        .await
        .expect("failed to subscribe to crawl-task topic");

    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_fetches));
    let mut tasks: tokio::task::JoinSet<(String, TaskOutcome)> = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("crawler subscriber shutting down");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                match joined {
                    Ok((id, TaskOutcome::Ack)) => {
                        if let Err(err) = subscription.ack(&id).await {
                            tracing::warn!(error = %err, "failed to ack crawl-task delivery");
                        }
                    }
                    Ok((_, TaskOutcome::Nack)) => {}
                    Err(err) => tracing::warn!(error = %err, "crawl-task worker task panicked"),
                }
            }
            delivery = subscription.recv() => {
                let delivery = match delivery {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "error receiving crawl-task delivery");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                let task: CrawlTask = match delivery.decode() {
                    Ok(task) => task,
                    Err(err) => {
                        tracing::warn!(error = %err, "malformed crawl-task, dropping");
                        continue;
                    }
                };

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
                let engine = engine.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let outcome = engine.process_task(&task).await;
                    (delivery.id, outcome)
                });
            }
        }
    }

    while tasks.join_next().await.is_some() {}
}
