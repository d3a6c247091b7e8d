//! JSON snapshots of the settlement ledger, so a restarted worker does not
//! drip again for jobs it already paid out.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::settlement::{SettlementLedger, SettlementRecord};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reads a snapshot written by [`save_settlements`]. A missing, empty or
/// unreadable file yields an empty ledger.
pub fn load_settlements(path: &Path) -> Arc<SettlementLedger> {
    let raw = match std::fs::read(path) {
        Ok(raw) if !raw.is_empty() => raw,
        Ok(_) | Err(_) => {
            tracing::info!(?path, "no settlement snapshot, starting with an empty ledger");
            return Arc::new(SettlementLedger::new());
        }
    };

    match serde_json::from_slice::<Vec<SettlementRecord>>(&raw) {
        Ok(records) => {
            let ledger = SettlementLedger::restore(records);
            tracing::info!(?path, records = ledger.len(), "settlement ledger restored");
            Arc::new(ledger)
        }
        Err(e) => {
            tracing::warn!(?path, error = %e, "unreadable settlement snapshot ignored");
            Arc::new(SettlementLedger::new())
        }
    }
}

/// Writes every record, ordered by job id. The file is replaced by rename so
/// a crash mid-write leaves the previous snapshot intact.
pub async fn save_settlements(path: &Path, ledger: &SettlementLedger) -> Result<(), SnapshotError> {
    let encoded = serde_json::to_vec_pretty(&ledger.snapshot())?;
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, encoded).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

/// Snapshots `ledger` to `path` every `period` until `shutdown` flips to true.
/// The final write on shutdown is left to the caller.
pub fn spawn_snapshot_task(
    ledger: Arc<SettlementLedger>,
    path: PathBuf,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick is immediate
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match save_settlements(&path, &ledger).await {
                Ok(()) => tracing::debug!(records = ledger.len(), "settlement snapshot written"),
                Err(e) => tracing::warn!(?path, error = %e, "settlement snapshot failed"),
            }
        }
    })
}
