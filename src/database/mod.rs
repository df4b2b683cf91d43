use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

use crate::database::models::{
    ContentChunkRow, ContentType, EmbeddingJob, MetricsSummary, NewContentChunk, NewEmbeddingJob,
    NewJobMetric, QueueStats, SubredditQueueCount,
};
use crate::database::queries::{ChunkQueries, ContentQueries, JobQueueQueries, MetricsQueries};


pub mod models;
pub mod queries;
pub mod vector;

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub async fn new<P: AsRef<Path>>(database_url: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_url)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    // Queue operations
    pub async fn enqueue_job(&self, new_job: NewEmbeddingJob) -> Result<EmbeddingJob> {
        JobQueueQueries::enqueue(&self.pool, new_job).await
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<EmbeddingJob>> {
        JobQueueQueries::get_by_id(&self.pool, id).await
    }

    pub async fn claim_batch(
        &self,
        limit: i64,
        min_priority: i64,
        subreddit: Option<&str>,
    ) -> Result<Vec<EmbeddingJob>> {
        JobQueueQueries::claim_batch(&self.pool, limit, min_priority, subreddit).await
    }

    pub async fn mark_job_completed(&self, id: i64) -> Result<()> {
        JobQueueQueries::mark_completed(&self.pool, id).await
    }

    pub async fn mark_job_failed(&self, id: i64, error: &str) -> Result<()> {
        JobQueueQueries::mark_failed(&self.pool, id, error).await
    }

    pub async fn defer_job(&self, id: i64) -> Result<()> {
        JobQueueQueries::defer(&self.pool, id).await
    }

    pub async fn requeue_job(&self, id: i64) -> Result<()> {
        JobQueueQueries::requeue(&self.pool, id).await
    }

    pub async fn requeue_empty_completions(&self) -> Result<Vec<i64>> {
        JobQueueQueries::requeue_empty_completions(&self.pool).await
    }

    pub async fn reset_stuck_jobs(&self, timeout_secs: u64) -> Result<u64> {
        JobQueueQueries::reset_stuck(&self.pool, timeout_secs).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<EmbeddingJob>> {
        JobQueueQueries::list_all(&self.pool).await
    }

    pub async fn delete_jobs(&self, ids: &[i64]) -> Result<u64> {
        JobQueueQueries::delete_many(&self.pool, ids).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        JobQueueQueries::stats(&self.pool).await
    }

    pub async fn pending_by_subreddit(&self) -> Result<Vec<SubredditQueueCount>> {
        JobQueueQueries::pending_by_subreddit(&self.pool).await
    }

    // Content operations
    pub async fn fetch_content(&self, job: &EmbeddingJob) -> Result<Option<String>> {
        ContentQueries::fetch_content(&self.pool, job).await
    }

    pub async fn write_back_embedding(&self, job: &EmbeddingJob, embedding: &[f32]) -> Result<()> {
        ContentQueries::write_back_embedding(&self.pool, job, embedding).await
    }

    // Chunk operations
    pub async fn replace_chunks(
        &self,
        parent_id: &str,
        content_type: ContentType,
        chunks: &[NewContentChunk],
    ) -> Result<()> {
        ChunkQueries::replace_chunks(&self.pool, parent_id, content_type, chunks).await
    }

    pub async fn chunks_for_record(
        &self,
        parent_id: &str,
        content_type: ContentType,
    ) -> Result<Vec<ContentChunkRow>> {
        ChunkQueries::list_for_record(&self.pool, parent_id, content_type).await
    }

    pub async fn chunk_count_for_record(
        &self,
        parent_id: &str,
        content_type: ContentType,
    ) -> Result<i64> {
        ChunkQueries::count_for_record(&self.pool, parent_id, content_type).await
    }

    pub async fn total_chunk_count(&self) -> Result<i64> {
        ChunkQueries::total_count(&self.pool).await
    }

    // Metrics operations
    pub async fn record_metric(&self, metric: NewJobMetric) -> Result<()> {
        MetricsQueries::insert(&self.pool, metric).await
    }

    pub async fn metrics_summary(&self, window_minutes: u32) -> Result<MetricsSummary> {
        MetricsQueries::summary(&self.pool, window_minutes).await
    }

    /// Reclaim space and refresh statistics after maintenance deletes.
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing database");

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("Failed to vacuum database")?;

        sqlx::query("ANALYZE")
            .execute(&self.pool)
            .await
            .context("Failed to analyze database")?;

        debug!("Database optimization completed");
        Ok(())
    }
}
