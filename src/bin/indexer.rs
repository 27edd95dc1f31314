use std::sync::Arc;
use std::time::Duration;

use crawlhub::blob::{BlobConfig, S3BlobStore};
use crawlhub::bus::{Bus, RedisBus, Subscription};
use crawlhub::config::IndexerConfig;
use crawlhub::health;
use crawlhub::index::{EsIndexClient, SearchIndex};
use crawlhub::indexer::{IndexOutcome, IndexerEngine};
use crawlhub::models::IndexTask;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = IndexerConfig::from_env().expect("failed to load configuration from environment");

    let blob = Arc::new(S3BlobStore::new(BlobConfig {
        endpoint: config.blob.endpoint.clone(),
        access_key: config.blob.access_key.clone(),
        secret_key: config.blob.secret_key.clone(),
        bucket: config.blob.bucket.clone(),
    }));

    let index = Arc::new(EsIndexClient::new(
        &config.index.host,
        config.index.port,
        &config.index.index_name,
        config.index.username.as_deref(),
        config.index.password.as_deref(),
    ));
    if let Err(err) = index.ensure_index().await {
        tracing::warn!(error = %err, "failed to ensure index mapping exists, continuing anyway");
    }

    let redis_bus = RedisBus::new(&config.bus.url, config.bus.visibility_timeout)
        .expect("failed to construct redis bus client");
    let bus: Arc<dyn Bus> = Arc::new(redis_bus.clone());

    let engine = Arc::new(IndexerEngine::new(blob, bus.clone(), index, config.clone()));

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
        "indexer",
        config.host_id.clone(),
        shutdown.clone(),
    ));

    let mut subscription = redis_bus
        .subscribe(&config.index_task_topic, &config.index_task_group, &config.host_id)
        .await
        .expect("failed to subscribe to index-task topic");

    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_upserts));
    let mut tasks: tokio::task::JoinSet<(String, IndexOutcome)> = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("indexer subscriber shutting down");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                match joined {
                    Ok((id, IndexOutcome::Ack)) => {
                        if let Err(err) = subscription.ack(&id).await {
                            tracing::warn!(error = %err, "failed to ack index-task delivery");
                        }
                    }
                    Ok((_, IndexOutcome::Nack)) => {}
                    Err(err) => tracing::warn!(error = %err, "index-task worker task panicked"),
                }
            }
            delivery = subscription.recv() => {
                let delivery = match delivery {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "error receiving index-task delivery");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                let task: IndexTask = match delivery.decode() {
                    Ok(task) => task,
                    Err(err) => {
                        tracing::warn!(error = %err, "malformed index-task, dropping");
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
