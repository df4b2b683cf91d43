
use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::database::models::{
    ContentChunkRow, ContentType, EmbeddingJob, MetricsSummary, NewContentChunk, NewEmbeddingJob,
    NewJobMetric, QueueStats, SubredditQueueCount,
};
use crate::database::vector::encode_f32_le;

pub struct JobQueueQueries;

impl JobQueueQueries {
    #[inline]
    pub async fn enqueue(pool: &SqlitePool, new_job: NewEmbeddingJob) -> Result<EmbeddingJob> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO embedding_jobs \
             (record_id, table_name, content_function, embedding_column, status, priority, subreddit, created_at) \
             VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)",
        )
        .bind(&new_job.record_id)
        .bind(&new_job.table_name)
        .bind(&new_job.content_function)
        .bind(&new_job.embedding_column)
        .bind(new_job.priority)
        .bind(&new_job.subreddit)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to enqueue embedding job")?
        .last_insert_rowid();

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve enqueued job"))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<EmbeddingJob>> {
        let job = sqlx::query_as::<_, EmbeddingJob>("SELECT * FROM embedding_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to get job by id")?;

        Ok(job)
    }

    /// Atomically claim up to `limit` pending jobs, marking them `processing`
    /// and incrementing their attempt counters. The single UPDATE makes the
    /// claim exclusive across concurrent callers.
    #[inline]
    pub async fn claim_batch(
        pool: &SqlitePool,
        limit: i64,
        min_priority: i64,
        subreddit: Option<&str>,
    ) -> Result<Vec<EmbeddingJob>> {
        let now = Utc::now().naive_utc();
        let mut jobs = sqlx::query_as::<_, EmbeddingJob>(
            "UPDATE embedding_jobs \
             SET status = 'processing', attempts = attempts + 1, claimed_at = ?1 \
             WHERE id IN ( \
                 SELECT id FROM embedding_jobs \
                 WHERE status = 'pending' AND priority >= ?2 \
                   AND (?3 IS NULL OR subreddit = ?3) \
                 ORDER BY priority DESC, created_at ASC, id ASC \
                 LIMIT ?4 \
             ) \
             RETURNING *",
        )
        .bind(now)
        .bind(min_priority)
        .bind(subreddit)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to claim job batch")?;

        // RETURNING row order is unspecified; keep highest priority first
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        debug!("Claimed batch of {} jobs", jobs.len());
        Ok(jobs)
    }

    #[inline]
    pub async fn mark_completed(pool: &SqlitePool, id: i64) -> Result<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "UPDATE embedding_jobs \
             SET status = 'completed', last_error = NULL, processed_at = ? \
             WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to mark job completed")?;

        Ok(())
    }

    #[inline]
    pub async fn mark_failed(pool: &SqlitePool, id: i64, error: &str) -> Result<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "UPDATE embedding_jobs \
             SET status = 'failed', last_error = ?, processed_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to mark job failed")?;

        Ok(())
    }

    /// Return a claimed job to the queue without counting the attempt.
    /// Used for token-budget deferrals, which are not failures.
    #[inline]
    pub async fn defer(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_jobs \
             SET status = 'pending', attempts = MAX(attempts - 1, 0), claimed_at = NULL \
             WHERE id = ?",
        )
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to defer job")?;

        Ok(())
    }

    /// Full reset used by maintenance: back to a fresh pending job.
    #[inline]
    pub async fn requeue(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_jobs \
             SET status = 'pending', attempts = 0, last_error = NULL, \
                 claimed_at = NULL, processed_at = NULL \
             WHERE id = ?",
        )
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to requeue job")?;

        Ok(())
    }

    /// Reset `completed` jobs that have no derived chunks back to `pending`.
    #[inline]
    pub async fn requeue_empty_completions(pool: &SqlitePool) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "UPDATE embedding_jobs \
             SET status = 'pending', attempts = 0, last_error = NULL, \
                 claimed_at = NULL, processed_at = NULL \
             WHERE status = 'completed' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM content_chunks c \
                   WHERE c.parent_id = embedding_jobs.record_id \
                     AND c.content_type = CASE embedding_jobs.table_name \
                                          WHEN 'posts' THEN 'post' \
                                          WHEN 'comments' THEN 'comment' \
                                          ELSE embedding_jobs.table_name END \
               ) \
             RETURNING id",
        )
        .fetch_all(pool)
        .await
        .context("Failed to requeue empty completions")?;

        if !ids.is_empty() {
            warn!("Requeued {} completed jobs with no derived chunks", ids.len());
        }
        Ok(ids)
    }

    /// Reset jobs stuck in `processing` longer than the timeout. A worker
    /// crash must not strand its claimed batch.
    #[inline]
    pub async fn reset_stuck(pool: &SqlitePool, timeout_secs: u64) -> Result<u64> {
        let cutoff = Utc::now().naive_utc() - chrono::Duration::seconds(timeout_secs as i64);
        let reset = sqlx::query(
            "UPDATE embedding_jobs \
             SET status = 'pending', claimed_at = NULL \
             WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at < ?",
        )
        .bind(cutoff)
        .execute(pool)
        .await
        .context("Failed to reset stuck jobs")?
        .rows_affected();

        if reset > 0 {
            warn!("Reset {} stuck processing jobs", reset);
        }
        Ok(reset)
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<EmbeddingJob>> {
        let jobs = sqlx::query_as::<_, EmbeddingJob>(
            "SELECT * FROM embedding_jobs ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(pool)
        .await
        .context("Failed to list jobs")?;

        Ok(jobs)
    }

    #[inline]
    pub async fn delete_many(pool: &SqlitePool, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM embedding_jobs WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }

        let deleted = query
            .execute(pool)
            .await
            .context("Failed to delete jobs")?
            .rows_affected();

        Ok(deleted)
    }

    #[inline]
    pub async fn stats(pool: &SqlitePool) -> Result<QueueStats> {
        let (pending, processing, completed, failed) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                "SELECT \
                     COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) \
                 FROM embedding_jobs",
            )
            .fetch_one(pool)
            .await
            .context("Failed to get queue statistics")?;

        let oldest_pending = sqlx::query_scalar::<_, Option<chrono::NaiveDateTime>>(
            "SELECT MIN(created_at) FROM embedding_jobs WHERE status = 'pending'",
        )
        .fetch_one(pool)
        .await
        .context("Failed to get oldest pending job")?;

        let oldest_pending_age_seconds = oldest_pending.map(|created_at| {
            let now = Utc::now().naive_utc();
            now.signed_duration_since(created_at).num_seconds().max(0) as u64
        });

        Ok(QueueStats {
            pending_count: pending as u64,
            processing_count: processing as u64,
            completed_count: completed as u64,
            failed_count: failed as u64,
            total_count: (pending + processing + completed + failed) as u64,
            oldest_pending_age_seconds,
        })
    }

    #[inline]
    pub async fn pending_by_subreddit(pool: &SqlitePool) -> Result<Vec<SubredditQueueCount>> {
        let counts = sqlx::query_as::<_, SubredditQueueCount>(
            "SELECT subreddit, COUNT(*) as pending \
             FROM embedding_jobs WHERE status = 'pending' \
             GROUP BY subreddit ORDER BY pending DESC",
        )
        .fetch_all(pool)
        .await
        .context("Failed to get pending counts by subreddit")?;

        Ok(counts)
    }
}

pub struct ContentQueries;

impl ContentQueries {
    /// Fetch the source text for a job via its named content function.
    /// `Ok(None)` means the record does not exist.
    #[inline]
    pub async fn fetch_content(pool: &SqlitePool, job: &EmbeddingJob) -> Result<Option<String>> {
        match job.content_function.as_str() {
            "post_content" => {
                let row = sqlx::query_as::<_, (String, String)>(
                    "SELECT title, body FROM posts WHERE id = ?",
                )
                .bind(&job.record_id)
                .fetch_optional(pool)
                .await
                .context("Failed to fetch post content")?;

                Ok(row.map(|(title, body)| {
                    if title.trim().is_empty() {
                        body
                    } else {
                        format!("{title}\n\n{body}")
                    }
                }))
            }
            "comment_content" => {
                let body =
                    sqlx::query_scalar::<_, String>("SELECT body FROM comments WHERE id = ?")
                        .bind(&job.record_id)
                        .fetch_optional(pool)
                        .await
                        .context("Failed to fetch comment content")?;

                Ok(body)
            }
            other => bail!("Unknown content function: {other}"),
        }
    }

    /// Write the first chunk's vector back into the job's legacy embedding
    /// column so non-chunk-aware readers keep working.
    #[inline]
    pub async fn write_back_embedding(
        pool: &SqlitePool,
        job: &EmbeddingJob,
        embedding: &[f32],
    ) -> Result<()> {
        if job.content_type().is_none() {
            bail!("Refusing write-back to unknown table: {}", job.table_name);
        }
        if !is_plain_identifier(&job.embedding_column) {
            bail!(
                "Refusing write-back to invalid column name: {}",
                job.embedding_column
            );
        }

        let sql = format!(
            "UPDATE {} SET {} = ? WHERE id = ?",
            job.table_name, job.embedding_column
        );
        let updated = sqlx::query(&sql)
            .bind(encode_f32_le(embedding))
            .bind(&job.record_id)
            .execute(pool)
            .await
            .context("Failed to write back legacy embedding")?
            .rows_affected();

        if updated == 0 {
            bail!(
                "Legacy embedding write-back matched no record: {}.{}",
                job.table_name,
                job.record_id
            );
        }
        Ok(())
    }
}

pub struct ChunkQueries;

impl ChunkQueries {
    /// Replace the whole chunk set for a record in one transaction, so a
    /// successful re-run never leaves stale chunks behind.
    #[inline]
    pub async fn replace_chunks(
        pool: &SqlitePool,
        parent_id: &str,
        content_type: ContentType,
        chunks: &[NewContentChunk],
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        let mut tx = pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM content_chunks WHERE parent_id = ? AND content_type = ?")
            .bind(parent_id)
            .bind(content_type.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete stale chunks")?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO content_chunks \
                 (parent_id, content_type, chunk_index, chunk_text, embedding, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.parent_id)
            .bind(chunk.content_type.to_string())
            .bind(chunk.chunk_index)
            .bind(&chunk.chunk_text)
            .bind(encode_f32_le(&chunk.embedding))
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert content chunk")?;
        }

        tx.commit().await.context("Failed to commit chunk set")?;
        debug!(
            "Stored {} chunks for {} {}",
            chunks.len(),
            content_type,
            parent_id
        );
        Ok(())
    }

    #[inline]
    pub async fn list_for_record(
        pool: &SqlitePool,
        parent_id: &str,
        content_type: ContentType,
    ) -> Result<Vec<ContentChunkRow>> {
        let chunks = sqlx::query_as::<_, ContentChunkRow>(
            "SELECT * FROM content_chunks \
             WHERE parent_id = ? AND content_type = ? \
             ORDER BY chunk_index ASC",
        )
        .bind(parent_id)
        .bind(content_type.to_string())
        .fetch_all(pool)
        .await
        .context("Failed to list chunks for record")?;

        Ok(chunks)
    }

    #[inline]
    pub async fn count_for_record(
        pool: &SqlitePool,
        parent_id: &str,
        content_type: ContentType,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM content_chunks WHERE parent_id = ? AND content_type = ?",
        )
        .bind(parent_id)
        .bind(content_type.to_string())
        .fetch_one(pool)
        .await
        .context("Failed to count chunks for record")?;

        Ok(count)
    }

    #[inline]
    pub async fn total_count(pool: &SqlitePool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM content_chunks")
            .fetch_one(pool)
            .await
            .context("Failed to count chunks")?;

        Ok(count)
    }
}

pub struct MetricsQueries;

impl MetricsQueries {
    #[inline]
    pub async fn insert(pool: &SqlitePool, metric: NewJobMetric) -> Result<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO job_metrics \
             (job_type, content_length, chunk_count, processing_time_ms, subreddit, success, error_message, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metric.job_type)
        .bind(metric.content_length)
        .bind(metric.chunk_count)
        .bind(metric.processing_time_ms)
        .bind(&metric.subreddit)
        .bind(metric.success)
        .bind(&metric.error_message)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to insert job metric")?;

        Ok(())
    }

    #[inline]
    pub async fn summary(pool: &SqlitePool, window_minutes: u32) -> Result<MetricsSummary> {
        let cutoff = Utc::now().naive_utc() - chrono::Duration::minutes(window_minutes as i64);
        let (jobs, succeeded, chunks, avg_ms) =
            sqlx::query_as::<_, (i64, i64, i64, Option<f64>)>(
                "SELECT \
                     COUNT(*), \
                     COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(chunk_count), 0), \
                     AVG(CAST(processing_time_ms AS REAL)) \
                 FROM job_metrics WHERE recorded_at >= ?",
            )
            .bind(cutoff)
            .fetch_one(pool)
            .await
            .context("Failed to summarize job metrics")?;

        Ok(MetricsSummary {
            jobs_recorded: jobs as u64,
            jobs_succeeded: succeeded as u64,
            total_chunks: chunks as u64,
            average_processing_time_ms: avg_ms,
        })
    }
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
