
use anyhow::Result;
use itertools::Itertools;
use tracing::{debug, info};

use crate::database::Database;
use crate::database::models::{EmbeddingJob, JobStatus};

/// Out-of-band queue repair: deduplication, stuck-job recovery, and
/// re-queueing of completions that produced no chunks. All operations are
/// idempotent.
pub struct QueueMaintenance {
    database: Database,
    stuck_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    pub duplicates_removed: u64,
    pub stuck_reset: u64,
    pub requeued: u64,
}

impl QueueMaintenance {
    #[inline]
    pub fn new(database: Database, stuck_timeout_secs: u64) -> Self {
        Self {
            database,
            stuck_timeout_secs,
        }
    }

    #[inline]
    pub async fn run(&self) -> Result<MaintenanceReport> {
        info!("Running queue maintenance");

        let duplicates_removed = self.deduplicate().await?;
        let stuck_reset = self.reset_stuck().await?;
        let requeued = self.requeue_incomplete().await?;

        let report = MaintenanceReport {
            duplicates_removed,
            stuck_reset,
            requeued,
        };
        info!(
            "Maintenance done: {} duplicates removed, {} stuck reset, {} requeued",
            report.duplicates_removed, report.stuck_reset, report.requeued
        );
        Ok(report)
    }

    /// Keep exactly one queue entry per `(record_id, table)`. Preference
    /// order: a completed entry that actually has chunks, then pending,
    /// then anything else; ties go to the earliest entry.
    #[inline]
    pub async fn deduplicate(&self) -> Result<u64> {
        let jobs = self.database.list_jobs().await?;
        let groups = jobs
            .into_iter()
            .map(|job| ((job.record_id.clone(), job.table_name.clone()), job))
            .into_group_map();

        let mut doomed = Vec::new();
        for ((record_id, table_name), group) in groups {
            if group.len() < 2 {
                continue;
            }

            let mut ranked = Vec::with_capacity(group.len());
            for job in group {
                let rank = self.dedup_rank(&job).await?;
                ranked.push((rank, job));
            }
            ranked.sort_by(|a, b| {
                (a.0, a.1.created_at, a.1.id).cmp(&(b.0, b.1.created_at, b.1.id))
            });

            debug!(
                "Deduplicating {} queue entries for {}.{}",
                ranked.len(),
                table_name,
                record_id
            );
            doomed.extend(ranked.into_iter().skip(1).map(|(_, job)| job.id));
        }

        let removed = self.database.delete_jobs(&doomed).await?;
        if removed > 0 {
            info!("Removed {} duplicate queue entries", removed);
        }
        Ok(removed)
    }

    async fn dedup_rank(&self, job: &EmbeddingJob) -> Result<u8> {
        match job.status {
            JobStatus::Completed => {
                let has_chunks = match job.content_type() {
                    Some(content_type) => {
                        self.database
                            .chunk_count_for_record(&job.record_id, content_type)
                            .await?
                            > 0
                    }
                    None => false,
                };
                Ok(if has_chunks { 0 } else { 2 })
            }
            JobStatus::Pending => Ok(1),
            JobStatus::Processing | JobStatus::Failed => Ok(2),
        }
    }

    /// "Completed but chunkless" is a self-detectable failure mode; put
    /// those jobs back in line as if never attempted.
    #[inline]
    pub async fn requeue_incomplete(&self) -> Result<u64> {
        let ids = self.database.requeue_empty_completions().await?;
        Ok(ids.len() as u64)
    }

    #[inline]
    pub async fn reset_stuck(&self) -> Result<u64> {
        self.database.reset_stuck_jobs(self.stuck_timeout_secs).await
    }
}
