use std::{sync::Arc, time::Duration};

use pigeonhole::{
    InMemoryStorage, Providers, Store, StoreSettings, WorkerPool, WorkerPoolSettings,
    WorkerSettings, provider,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Welcome {
    id: u32,
    to: String,
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let storage = InMemoryStorage::new();

    let providers = Arc::new(Providers::new());
    providers.register(provider::from_fn("email", |envelope| async move {
        let welcome: Welcome = envelope.payload.decode()?;
        tracing::info!(id = welcome.id, to = %welcome.to, "Sending welcome email");
        Ok::<_, pigeonhole::BoxError>(())
    }));

    let store = Arc::new(Store::new(
        storage.clone(),
        StoreSettings::default()
            .with_max_batch_size(10)
            .with_flush_interval(Duration::from_secs(1)),
    )
    .unwrap());
    let pool = Arc::new(WorkerPool::new(
        providers,
        storage,
        WorkerPoolSettings::default()
            .with_count_of_workers(2)
            .with_worker(WorkerSettings::default().with_batch_size(5)),
    ));

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let flush_handle = tokio::spawn({
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        async move { store.run(cancel).await.expect("flush loop failed") }
    });

    let producer_handle = tokio::spawn({
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        async move {
            let mut id = 0;
            while !cancel.is_cancelled() {
                let welcome = Welcome {
                    id,
                    to: format!("user{id}@example.com"),
                };
                store
                    .dispatch("email", &welcome)
                    .await
                    .expect("Failed to buffer message");
                id += 1;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    });

    let pool_handle = tokio::spawn(async move {
        pool.start_blocking(cancel).await.expect("worker pool failed");
    });

    tokio::try_join!(cancel_handle, flush_handle, producer_handle, pool_handle).unwrap();
}
