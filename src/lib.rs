#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    background::BackgroundRunner,
    budget_gate::BudgetGate,
    config::Config,
    db::RuntimeDb,
    dispatcher::Dispatcher,
    ledger::Ledger,
    matchmaker::Matchmaker,
    schema_registry::SchemaRegistry,
    server::{build_router, AppState},
    store::{InMemoryStore, PostgresStore, Store},
};

pub mod background;
pub mod budget_gate;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod matchmaker;
pub mod schema_registry;
pub mod server;
pub mod store;

pub async fn build_runtime_state(config: &Config) -> Result<AppState> {
    let (store, db): (Arc<dyn Store>, Option<Arc<RuntimeDb>>) = match &config.db_url {
        Some(url) => {
            let db = Arc::new(RuntimeDb::connect(url).await?);
            (Arc::new(PostgresStore::new(db.clone())), Some(db))
        }
        None => (Arc::new(InMemoryStore::new()), None),
    };

    let schema_registry = Arc::new(SchemaRegistry::load_from_dir(&config.capability_schema_dir)?);
    let ledger = Arc::new(Ledger::new(store.clone()));
    let budget_gate = Arc::new(BudgetGate::new(store.clone(), config.canonical_timezone));
    let matchmaker = Arc::new(Matchmaker::new(store.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        ledger.clone(),
        matchmaker,
        schema_registry.clone(),
        config.platform_account_id,
        format!("http://{}", config.bind_addr),
    ));

    let runner = Arc::new(BackgroundRunner::new(
        store.clone(),
        dispatcher.clone(),
        config.dispatch_worker_concurrency.max(1),
    ));
    runner.spawn();

    Ok(AppState {
        store,
        ledger,
        budget_gate,
        schema_registry,
        dispatcher,
        db,
    })
}

pub async fn build_app(config: &Config) -> Result<axum::Router> {
    Ok(build_router(build_runtime_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "task market runtime listening"
    );
    axum::serve(listener, build_app(&config).await?).await?;
    Ok(())
}
