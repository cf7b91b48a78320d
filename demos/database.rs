use std::{sync::Arc, time::Duration};

use pigeonhole::{
    OutboxConfig, Providers, Store, WorkerPool, provider, storage::sqlx::PgStorage,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
    amount_cents: u64,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // Settings come from pigeonhole.toml (optional) and PIGEONHOLE_* variables
    let config = OutboxConfig::load("pigeonhole.toml").unwrap();

    // Postgres connection
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.unwrap();
    let storage = PgStorage::try_new(pool)
        .await
        .unwrap()
        .with_owner(format!("demo-{}", std::process::id()));

    let providers = Arc::new(Providers::new());
    providers.register(provider::from_fn("orders", |envelope| async move {
        let order: OrderPlaced = envelope.payload.decode()?;
        tracing::info!(
            order_id = order.order_id,
            amount_cents = order.amount_cents,
            attempt = envelope.number_of_attempts,
            "Publishing order"
        );
        Ok::<_, pigeonhole::BoxError>(())
    }));

    let store = Arc::new(Store::new(storage.clone(), config.store_settings().unwrap()).unwrap());
    let workers = Arc::new(WorkerPool::new(
        providers,
        storage,
        config.pool_settings().unwrap(),
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
            let mut order_id = 0;
            while !cancel.is_cancelled() {
                let order = OrderPlaced {
                    order_id,
                    amount_cents: 1_000 + order_id * 10,
                };
                store
                    .dispatch("orders", &order)
                    .await
                    .expect("Failed to buffer message");
                order_id += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    });

    let pool_handle = tokio::spawn(async move {
        workers
            .start_blocking(cancel)
            .await
            .expect("worker pool failed");
    });

    tokio::try_join!(cancel_handle, flush_handle, producer_handle, pool_handle).unwrap();
}
