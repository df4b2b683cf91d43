#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::EmbedqError;
use crate::config::Config;
use crate::database::Database;
use crate::database::models::{EmbeddingJob, NewContentChunk, NewJobMetric};
use crate::embeddings::chunking::{self, ChunkerConfig};
use crate::embeddings::client::{EmbeddingClient, ProviderError};
use crate::metrics::MetricsSink;

/// Shared token accounting for one batch. Reservations are atomic so
/// concurrent jobs cannot overcommit the budget.
#[derive(Debug)]
pub struct TokenBudget {
    max: u64,
    used: AtomicU64,
}

impl TokenBudget {
    #[inline]
    pub fn new(max: u64) -> Self {
        Self {
            max,
            used: AtomicU64::new(0),
        }
    }

    /// Reserve `tokens` against the budget. Returns false (and reserves
    /// nothing) when the reservation would exceed the maximum.
    #[inline]
    pub fn try_reserve(&self, tokens: u64) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(tokens).filter(|total| *total <= self.max)
            })
            .is_ok()
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    Failed,
    /// Token budget deferral; a scheduling decision, not a failure.
    Deferred,
}

/// Structured result of one job attempt. Processing never panics or
/// propagates job-level errors; they land here.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: i64,
    pub disposition: JobDisposition,
    pub chunk_count: usize,
    pub token_estimate: u64,
    pub processing_time_ms: u64,
    pub rate_limited: bool,
    pub error: Option<String>,
}

/// Aggregate result of one claimed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub rate_limit_hit: bool,
    pub errors: Vec<String>,
}

enum Processed {
    Embedded {
        chunk_count: usize,
        token_estimate: u64,
        content_length: usize,
    },
    Deferred {
        token_estimate: u64,
    },
}

/// Claims jobs from the queue, chunks their content, embeds each chunk,
/// and persists the results.
#[derive(Debug, Clone)]
pub struct EmbeddingWorker {
    database: Database,
    client: EmbeddingClient,
    metrics: MetricsSink,
    chunker: ChunkerConfig,
    batch_size: usize,
    min_priority: i64,
    max_token_budget: u64,
}

impl EmbeddingWorker {
    #[inline]
    pub fn new(database: Database, client: EmbeddingClient, config: &Config) -> Self {
        let metrics = MetricsSink::new(database.clone());
        Self {
            database,
            client,
            metrics,
            chunker: ChunkerConfig::default(),
            batch_size: config.pool.batch_size,
            min_priority: config.pool.min_priority,
            max_token_budget: config.pool.max_token_budget,
        }
    }

    /// Claim and process one batch. Job failures are absorbed into the
    /// report; only queue-level claim errors propagate.
    #[inline]
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let jobs = self
            .database
            .claim_batch(self.batch_size as i64, self.min_priority, None)
            .await?;

        let mut report = BatchReport {
            claimed: jobs.len(),
            ..BatchReport::default()
        };

        if jobs.is_empty() {
            return Ok(report);
        }

        let budget = TokenBudget::new(self.max_token_budget);

        for job in &jobs {
            let outcome = self.process(job, &budget).await;
            match outcome.disposition {
                JobDisposition::Completed => report.completed += 1,
                JobDisposition::Deferred => report.deferred += 1,
                JobDisposition::Failed => {
                    report.failed += 1;
                    report.rate_limit_hit |= outcome.rate_limited;
                    if let Some(error) = outcome.error {
                        report.errors.push(error);
                    }
                }
            }
        }

        debug!(
            "Batch done: {} claimed, {} completed, {} failed, {} deferred",
            report.claimed, report.completed, report.failed, report.deferred
        );
        Ok(report)
    }

    /// Process one already-claimed job to a terminal state or a deferral.
    #[inline]
    pub async fn process(&self, job: &EmbeddingJob, budget: &TokenBudget) -> JobOutcome {
        let started = Instant::now();
        debug!(
            "Processing job {} for {}.{}",
            job.id, job.table_name, job.record_id
        );

        let result = self.process_inner(job, budget).await;
        let processing_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Processed::Embedded {
                chunk_count,
                token_estimate,
                content_length,
            }) => {
                if let Err(error) = self.database.mark_job_completed(job.id).await {
                    warn!("Failed to mark job {} completed: {}", job.id, error);
                }
                self.record_metric(job, content_length, chunk_count, processing_time_ms, true, None)
                    .await;
                info!(
                    "Job {} completed: {} chunks in {}ms",
                    job.id, chunk_count, processing_time_ms
                );
                JobOutcome {
                    job_id: job.id,
                    disposition: JobDisposition::Completed,
                    chunk_count,
                    token_estimate,
                    processing_time_ms,
                    rate_limited: false,
                    error: None,
                }
            }
            Ok(Processed::Deferred { token_estimate }) => {
                debug!(
                    "Job {} deferred: estimate of {} tokens exceeds remaining batch budget",
                    job.id, token_estimate
                );
                JobOutcome {
                    job_id: job.id,
                    disposition: JobDisposition::Deferred,
                    chunk_count: 0,
                    token_estimate,
                    processing_time_ms,
                    rate_limited: false,
                    error: None,
                }
            }
            Err(error) => {
                let rate_limited =
                    matches!(&error, EmbedqError::Provider(p) if p.is_rate_limit());
                let message = error.to_string();
                if let Err(mark_error) = self.database.mark_job_failed(job.id, &message).await {
                    warn!("Failed to mark job {} failed: {}", job.id, mark_error);
                }
                self.record_metric(job, 0, 0, processing_time_ms, false, Some(message.clone()))
                    .await;
                warn!("Job {} failed: {}", job.id, message);
                JobOutcome {
                    job_id: job.id,
                    disposition: JobDisposition::Failed,
                    chunk_count: 0,
                    token_estimate: 0,
                    processing_time_ms,
                    rate_limited,
                    error: Some(message),
                }
            }
        }
    }

    async fn process_inner(
        &self,
        job: &EmbeddingJob,
        budget: &TokenBudget,
    ) -> Result<Processed, EmbedqError> {
        let content_type = job.content_type().ok_or_else(|| {
            EmbedqError::ContentFetch(format!("Unsupported source table: {}", job.table_name))
        })?;

        let content = self
            .database
            .fetch_content(job)
            .await
            .map_err(|e| EmbedqError::ContentFetch(e.to_string()))?;

        let content = match content {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                return Err(EmbedqError::ContentFetch(format!(
                    "Empty or missing content for {}.{}",
                    job.table_name, job.record_id
                )));
            }
        };

        let token_estimate = chunking::estimate_tokens(&content);
        if !budget.try_reserve(token_estimate) {
            // Not a failure: hand the job back untouched for a later batch
            self.database
                .defer_job(job.id)
                .await
                .map_err(|e| EmbedqError::Database(e.to_string()))?;
            return Ok(Processed::Deferred { token_estimate });
        }

        let chunk_texts = chunking::chunk_text(&content, content_type, &self.chunker);

        let mut chunks = Vec::with_capacity(chunk_texts.len());
        for (index, text) in chunk_texts.iter().enumerate() {
            let embedding = self.embed(text).await?;
            chunks.push(NewContentChunk {
                parent_id: job.record_id.clone(),
                content_type,
                chunk_index: index as i64,
                chunk_text: text.clone(),
                embedding,
            });
        }

        self.database
            .replace_chunks(&job.record_id, content_type, &chunks)
            .await
            .map_err(|e| EmbedqError::Persistence(e.to_string()))?;

        // Legacy single-vector column keeps non-chunk-aware readers working
        if let Some(first) = chunks.first() {
            self.database
                .write_back_embedding(job, &first.embedding)
                .await
                .map_err(|e| EmbedqError::Persistence(e.to_string()))?;
        }

        Ok(Processed::Embedded {
            chunk_count: chunks.len(),
            token_estimate,
            content_length: content.len(),
        })
    }

    /// The provider client is synchronous; run it off the async executor.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedqError> {
        let client = self.client.clone();
        let text = text.to_string();
        let vector = tokio::task::spawn_blocking(move || client.embed(&text))
            .await
            .map_err(|e| {
                EmbedqError::Provider(ProviderError::Fatal(format!("Embedding task failed: {e}")))
            })??;
        Ok(vector)
    }

    async fn record_metric(
        &self,
        job: &EmbeddingJob,
        content_length: usize,
        chunk_count: usize,
        processing_time_ms: u64,
        success: bool,
        error_message: Option<String>,
    ) {
        let metric = NewJobMetric {
            job_type: job
                .content_type()
                .map(|t| t.to_string())
                .unwrap_or_else(|| job.table_name.clone()),
            content_length: content_length as i64,
            chunk_count: chunk_count as i64,
            processing_time_ms: processing_time_ms as i64,
            subreddit: job.subreddit.clone(),
            success,
            error_message,
        };

        // Metrics failures must never fail the job itself
        if let Err(error) = self.metrics.record(metric).await {
            warn!("Failed to record metric for job {}: {}", job.id, error);
        }
    }
}
