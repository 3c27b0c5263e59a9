//! Stale job reaper
//!
//! A job left in `processing` by a crashed worker would otherwise stay there
//! forever. Jobs that started longer ago than `stale_after` are failed.

use chrono::Utc;
use librarium_common::config::ImportConfig;
use librarium_common::errors::Result;
use librarium_common::Repository;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const ABANDONED_MESSAGE: &str = "Import abandoned while processing";

/// Fail every job processing for longer than `stale_after`
pub async fn reap_stale_jobs(repository: &Repository, stale_after: Duration) -> Result<Vec<Uuid>> {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
        .checked_sub_signed(stale_after)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let reaped = repository.fail_stale_import_jobs(cutoff, ABANDONED_MESSAGE).await?;
    for job_id in &reaped {
        warn!(job_id = %job_id, "Failed abandoned import job");
    }
    Ok(reaped)
}

/// Run the reaper every `reaper_interval` until the task is aborted
pub fn spawn_reaper(repository: Repository, config: &ImportConfig) -> JoinHandle<()> {
    let stale_after = config.stale_after();
    let period = config.reaper_interval();

    tokio::spawn(async move {
        info!(
            stale_after_secs = stale_after.as_secs(),
            interval_secs = period.as_secs(),
            "Stale job reaper started"
        );

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = reap_stale_jobs(&repository, stale_after).await {
                error!(error = %e, "Stale job sweep failed");
            }
        }
    })
}
