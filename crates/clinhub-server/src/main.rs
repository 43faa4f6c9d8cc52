//! Clinhub server binary.
//!
//! Serves the HTTP surface from [`api`] and runs the hub's dispatcher and
//! background workers until Ctrl-C.
//!
//! # Environment Variables
//! - `CLINHUB_ADDR`: listen address (default `0.0.0.0:8080`)
//! - `DATABASE_URL`: PostgreSQL store, when built with the `postgres` feature;
//!   the in-memory store is used otherwise
//! - `CLINHUB_*`: hub settings, see [`clinhub::config`]

mod api;

use std::sync::Arc;

use clinhub::store::HubStore;
use clinhub::{Hub, HubConfig, MemoryStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    clinhub::telemetry::init_tracing("clinhub=info,clinhub_server=info");

    let config = HubConfig::from_env()?;
    let addr = std::env::var("CLINHUB_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.into());

    #[cfg(feature = "postgres")]
    if let Ok(url) = std::env::var("DATABASE_URL") {
        let store = clinhub::PgStore::connect(&url).await?;
        store.migrate().await?;
        info!("using postgres store");
        return serve(store, config, &addr).await;
    }

    info!("using in-memory store");
    serve(MemoryStore::new(), config, &addr).await
}

async fn serve<S: HubStore>(store: S, config: HubConfig, addr: &str) -> anyhow::Result<()> {
    let transport = config.spoke_transport()?;
    let audit_sink = config.audit_sink()?;
    let hub = Arc::new(
        Hub::builder(store)
            .with_clinical_workflows()
            .transport(transport)
            .shared_audit_sink(audit_sink)
            .config(config)
            .build()?,
    );

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let runner = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.run(async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            })
            .await
        })
    };

    let listener = TcpListener::bind(addr).await?;
    info!(addr, worker_id = hub.worker_id(), "clinhub listening");

    axum::serve(listener, api::router(Arc::clone(&hub)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    let _ = stop_tx.send(true);
    runner.await??;
    Ok(())
}
