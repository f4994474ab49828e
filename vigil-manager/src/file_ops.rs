//! The file-ops worker: mirrors the status snapshot to JSON files.
//!
//! Admin tooling without broker or Redis access reads these files. Each pass
//! also recomputes the deactivated set: enrolled clients without a live
//! session, plus enrolled clients that are blocked.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vigil_common::users::UserDirectory;
use vigil_status::{StatusBucket, StatusStore as _, StatusStoreService};

use crate::metrics::METRICS_ID_MANAGER_SNAPSHOTS_WRITTEN;

/// Settings for the file-ops worker.
#[derive(Debug, Clone)]
pub struct FileOpsConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Directory the JSON files are written to.
    pub output_dir: PathBuf,
}

/// Runs the mirror loop until the token is cancelled.
pub async fn file_ops_task(
    status: StatusStoreService,
    users: Arc<UserDirectory>,
    config: FileOpsConfig,
    cancellation_token: CancellationToken,
) {
    if let Err(err) = tokio::fs::create_dir_all(&config.output_dir).await {
        tracing::error!("cannot create snapshot directory {:?}: {err:?}", config.output_dir);
    }
    let mut interval = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancellation_token.cancelled() => {
                tracing::info!("file-ops worker stopping");
                return;
            }
        }
        if let Err(err) = sync_once(&status, &users, &config.output_dir).await {
            tracing::error!("file-ops pass failed: {err:?}");
        }
    }
}

/// One mirror pass: recompute the deactivated set and write every bucket.
pub async fn sync_once(
    status: &StatusStoreService,
    users: &UserDirectory,
    output_dir: &Path,
) -> eyre::Result<()> {
    let snapshot = status.snapshot().await?;
    let available: BTreeSet<String> = users.available().into_iter().collect();
    let active: BTreeSet<String> = snapshot.active_clients.iter().cloned().collect();
    let blocked: BTreeSet<String> = snapshot.blocked_clients.iter().cloned().collect();

    let deactivated: Vec<String> = available
        .difference(&active)
        .chain(available.intersection(&blocked))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    status
        .replace_bucket(StatusBucket::Deactivated, deactivated.clone())
        .await?;

    write_bucket(output_dir, StatusBucket::Active, &snapshot.active_clients).await?;
    write_bucket(output_dir, StatusBucket::Paused, &snapshot.paused_clients).await?;
    write_bucket(output_dir, StatusBucket::Blocked, &snapshot.blocked_clients).await?;
    write_bucket(output_dir, StatusBucket::Deactivated, &deactivated).await?;
    write_bucket(
        output_dir,
        StatusBucket::ConnectivityError,
        &snapshot.connecting_internet_error,
    )
    .await?;
    ::metrics::counter!(METRICS_ID_MANAGER_SNAPSHOTS_WRITTEN).increment(1);
    Ok(())
}

async fn write_bucket(
    output_dir: &Path,
    bucket: StatusBucket,
    names: &[String],
) -> eyre::Result<()> {
    let path = output_dir.join(format!("{}.json", bucket.key()));
    let payload = serde_json::to_vec_pretty(names)?;
    tokio::fs::write(&path, payload).await?;
    Ok(())
}
