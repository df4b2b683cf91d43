use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

/// One unit of work in the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct EmbeddingJob {
    pub id: i64,
    pub record_id: String,
    pub schema_name: String,
    pub table_name: String,
    pub content_function: String,
    pub embedding_column: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub priority: i64,
    pub last_error: Option<String>,
    pub subreddit: Option<String>,
    pub claimed_at: Option<NaiveDateTime>,
    pub processed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum ContentType {
    Post,
    Comment,
}

impl ContentType {
    /// Maps a queue job's source table to the chunk content type.
    #[inline]
    pub fn for_table(table_name: &str) -> Option<Self> {
        match table_name {
            "posts" => Some(ContentType::Post),
            "comments" => Some(ContentType::Comment),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ContentType::Post => write!(f, "post"),
            ContentType::Comment => write!(f, "comment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEmbeddingJob {
    pub record_id: String,
    pub table_name: String,
    pub content_function: String,
    pub embedding_column: String,
    pub priority: i64,
    pub subreddit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ContentChunkRow {
    pub id: i64,
    pub parent_id: String,
    pub content_type: ContentType,
    pub chunk_index: i64,
    pub chunk_text: String,
    pub embedding: Vec<u8>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewContentChunk {
    pub parent_id: String,
    pub content_type: ContentType,
    pub chunk_index: i64,
    pub chunk_text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_count: u64,
    pub processing_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub total_count: u64,
    pub oldest_pending_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SubredditQueueCount {
    pub subreddit: Option<String>,
    pub pending: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobMetric {
    pub job_type: String,
    pub content_length: i64,
    pub chunk_count: i64,
    pub processing_time_ms: i64,
    pub subreddit: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Aggregates over `job_metrics` within a trailing time window.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub jobs_recorded: u64,
    pub jobs_succeeded: u64,
    pub total_chunks: u64,
    pub average_processing_time_ms: Option<f64>,
}

impl EmbeddingJob {
    #[inline]
    pub fn content_type(&self) -> Option<ContentType> {
        ContentType::for_table(&self.table_name)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}
