// Per-job metrics recording for throughput reporting

use anyhow::Result;
use tracing::debug;

use crate::database::Database;
use crate::database::models::{MetricsSummary, NewJobMetric};

/// Persists one metrics row per processed job, success or failure.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    database: Database,
}

impl MetricsSink {
    #[inline]
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    #[inline]
    pub async fn record(&self, metric: NewJobMetric) -> Result<()> {
        debug!(
            "Recording metric: type={} chunks={} success={}",
            metric.job_type, metric.chunk_count, metric.success
        );
        self.database.record_metric(metric).await
    }

    #[inline]
    pub async fn recent_summary(&self, window_minutes: u32) -> Result<MetricsSummary> {
        self.database.metrics_summary(window_minutes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn record_and_summarize() {
        let temp_dir = TempDir::new().expect("can create temp dir");
        let database = Database::new(temp_dir.path().join("test.db"))
            .await
            .expect("can create database");
        let sink = MetricsSink::new(database);

        sink.record(NewJobMetric {
            job_type: "post".to_string(),
            content_length: 4200,
            chunk_count: 2,
            processing_time_ms: 85,
            subreddit: Some("rust".to_string()),
            success: true,
            error_message: None,
        })
        .await
        .expect("can record metric");

        let summary = sink.recent_summary(10).await.expect("can summarize");
        assert_eq!(summary.jobs_recorded, 1);
        assert_eq!(summary.jobs_succeeded, 1);
        assert_eq!(summary.total_chunks, 2);
    }
}
