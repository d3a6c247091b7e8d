use std::sync::Arc;

use contract_client::{AlloyLedger, WalletCache, WalletHandle};
use tokio::sync::watch;
use worker::config::WorkerConfig;
use worker::dispatch::HttpDownstream;
use worker::handler::Pipeline;
use worker::logging::init_logging;
use worker::persistence::{load_settlements, save_settlements, spawn_snapshot_task};
use worker::profile::SupabaseProfiles;
use worker::queue::{JobQueue, SupabaseQueue};
use worker::settlement::{SettlementLedger, TokenSettlement};
use worker::supabase::{http_client, SupabaseRest};
use worker::Worker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();

    let config = WorkerConfig::from_env()?;

    let http = http_client(config.http_timeout)?;
    let rest = SupabaseRest::new(&config.supabase_url, &config.supabase_key, http.clone());
    let queue: Arc<dyn JobQueue> = Arc::new(SupabaseQueue::new(rest.clone(), &config.queue_name));
    let profiles = Arc::new(SupabaseProfiles::new(rest));
    let downstream = Arc::new(HttpDownstream::new(&config.api_url, http));

    let ledger = Arc::new(AlloyLedger::new(&config.chain)?);
    let wallets = Arc::new(WalletCache::new(config.chain.chain_id, config.wallet_ttl));
    let funder = Arc::new(WalletHandle::from_secret_key(
        &config.funder_private_key,
        config.chain.chain_id,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (records, snapshots) = match &config.snapshot_path {
        Some(path) => {
            let records = load_settlements(path);
            let task = spawn_snapshot_task(
                records.clone(),
                path.clone(),
                config.snapshot_interval,
                shutdown_rx.clone(),
            );
            (records, Some(task))
        }
        None => (Arc::new(SettlementLedger::new()), None),
    };

    let settlement = Arc::new(TokenSettlement::new(
        ledger,
        wallets,
        records.clone(),
        funder.clone(),
        config.terms.clone(),
    ));
    let pipeline = Pipeline::new(profiles, settlement, downstream.clone(), queue.clone());
    let worker = Worker::new(queue, pipeline, config.consumer.clone());

    tracing::info!(
        queue = %config.queue_name,
        chain_id = config.chain.chain_id,
        rpc_url = %config.chain.rpc_url,
        funder = %funder.address(),
        endpoint = %downstream.endpoint(),
        "worker started"
    );

    let consumer = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, finishing in-flight batch");
    let _ = shutdown_tx.send(true);
    consumer.await?;
    if let Some(task) = snapshots {
        task.await?;
    }

    if let Some(path) = &config.snapshot_path {
        save_settlements(path, &records).await?;
        tracing::info!(?path, records = records.len(), "final settlement snapshot written");
    }

    Ok(())
}
