use super::*;
use crate::database::models::{ContentType, JobStatus, NewEmbeddingJob};
use crate::database::vector::decode_f32_le;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn create_test_worker(endpoint: String) -> (EmbeddingWorker, Database, TempDir) {
    let temp_dir = TempDir::new().expect("can create temp dir");
    let database = Database::new(temp_dir.path().join("test.db"))
        .await
        .expect("can create database");

    let mut config = Config::default();
    config.provider.endpoint = endpoint;
    config.provider.timeout_seconds = 5;
    config.pool.batch_size = 5;

    let client = EmbeddingClient::new(&config.provider)
        .expect("can create client")
        .with_retry_attempts(1);
    let worker = EmbeddingWorker::new(database.clone(), client, &config);

    (worker, database, temp_dir)
}

async fn mount_embeddings(server: &MockServer, expected_requests: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"embedding": [0.1, 0.2, 0.3, 0.4]}]
        })))
        .expect(expected_requests)
        .mount(server)
        .await;
}

async fn insert_post(database: &Database, id: &str, body: &str) {
    sqlx::query("INSERT INTO posts (id, subreddit, title, body) VALUES (?, 'rust', '', ?)")
        .bind(id)
        .bind(body)
        .execute(database.pool())
        .await
        .expect("can insert post");
}

async fn enqueue_post_job(database: &Database, record_id: &str) -> i64 {
    database
        .enqueue_job(NewEmbeddingJob {
            record_id: record_id.to_string(),
            table_name: "posts".to_string(),
            content_function: "post_content".to_string(),
            embedding_column: "embedding".to_string(),
            priority: 0,
            subreddit: Some("rust".to_string()),
        })
        .await
        .expect("can enqueue job")
        .id
}

fn long_paragraph(word: &str, target_len: usize) -> String {
    let mut text = String::new();
    while text.len() < target_len {
        text.push_str(word);
        text.push(' ');
    }
    text.trim_end().to_string()
}

#[test]
fn token_budget_reservations_are_exact() {
    let budget = TokenBudget::new(100);
    assert!(budget.try_reserve(60));
    assert!(!budget.try_reserve(50));
    assert!(budget.try_reserve(40));
    assert!(!budget.try_reserve(1));
    assert_eq!(budget.used(), 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_chunk_post_processed_end_to_end() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 2).await;

    let (worker, database, _temp_dir) = create_test_worker(server.uri()).await;

    let body = format!(
        "{}\n\n{}",
        long_paragraph("first half of a very long discussion", 4500),
        long_paragraph("second half of that same discussion", 4500)
    );
    insert_post(&database, "t3_long", &body).await;
    let job_id = enqueue_post_job(&database, "t3_long").await;

    let job = database
        .claim_batch(1, 0, None)
        .await
        .expect("can claim")
        .remove(0);
    let budget = TokenBudget::new(100_000);

    let outcome = worker.process(&job, &budget).await;

    assert_eq!(outcome.disposition, JobDisposition::Completed);
    assert_eq!(outcome.chunk_count, 2);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.token_estimate, chunking::estimate_tokens(&body));

    let stored = database
        .get_job(job_id)
        .await
        .expect("can fetch job")
        .expect("job exists");
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.processed_at.is_some());

    let chunks = database
        .chunks_for_record("t3_long", ContentType::Post)
        .await
        .expect("can list chunks");
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk_index, 0);
    assert_eq!(chunks[1].chunk_index, 1);

    // Legacy write-back carries the first chunk's vector
    let blob = sqlx::query_scalar::<_, Vec<u8>>("SELECT embedding FROM posts WHERE id = 't3_long'")
        .fetch_one(database.pool())
        .await
        .expect("can read legacy embedding");
    assert_eq!(
        decode_f32_le(&blob).expect("can decode"),
        vec![0.1, 0.2, 0.3, 0.4]
    );

    let metrics = database
        .metrics_summary(10)
        .await
        .expect("can summarize metrics");
    assert_eq!(metrics.jobs_recorded, 1);
    assert_eq!(metrics.jobs_succeeded, 1);
    assert_eq!(metrics.total_chunks, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn over_budget_job_is_deferred_not_failed() {
    let server = MockServer::start().await;
    // The provider must not be called at all
    mount_embeddings(&server, 0).await;

    let (worker, database, _temp_dir) = create_test_worker(server.uri()).await;

    insert_post(
        &database,
        "t3_big",
        &long_paragraph("exhaustive budget-busting content", 6000),
    )
    .await;
    let job_id = enqueue_post_job(&database, "t3_big").await;

    let job = database
        .claim_batch(1, 0, None)
        .await
        .expect("can claim")
        .remove(0);

    // ceil(6000+/4) > 1000
    let budget = TokenBudget::new(1000);
    let outcome = worker.process(&job, &budget).await;

    assert_eq!(outcome.disposition, JobDisposition::Deferred);
    assert!(outcome.error.is_none());
    assert!(outcome.token_estimate > 1000);

    let stored = database
        .get_job(job_id)
        .await
        .expect("can fetch job")
        .expect("job exists");
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempts, 0);
    assert!(stored.last_error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_content_fails_the_job() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 0).await;

    let (worker, database, _temp_dir) = create_test_worker(server.uri()).await;

    let job_id = enqueue_post_job(&database, "t3_ghost").await;
    let job = database
        .claim_batch(1, 0, None)
        .await
        .expect("can claim")
        .remove(0);

    let outcome = worker.process(&job, &TokenBudget::new(100_000)).await;

    assert_eq!(outcome.disposition, JobDisposition::Failed);
    assert!(!outcome.rate_limited);
    assert!(
        outcome
            .error
            .as_deref()
            .expect("error message present")
            .contains("missing")
    );

    let stored = database
        .get_job(job_id)
        .await
        .expect("can fetch job")
        .expect("job exists");
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.last_error.is_some());

    let metrics = database
        .metrics_summary(10)
        .await
        .expect("can summarize metrics");
    assert_eq!(metrics.jobs_recorded, 1);
    assert_eq!(metrics.jobs_succeeded, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn one_bad_job_does_not_poison_the_batch() {
    let server = MockServer::start().await;
    mount_embeddings(&server, 1).await;

    let (worker, database, _temp_dir) = create_test_worker(server.uri()).await;

    insert_post(&database, "t3_good", "A perfectly reasonable short post body.").await;
    enqueue_post_job(&database, "t3_good").await;
    enqueue_post_job(&database, "t3_missing").await;

    let report = worker.run_batch().await.expect("can run batch");

    assert_eq!(report.claimed, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 0);
    assert!(!report.rate_limit_hit);

    let jobs = database.list_jobs().await.expect("can list jobs");
    let good = jobs
        .iter()
        .find(|j| j.record_id == "t3_good")
        .expect("good job exists");
    let bad = jobs
        .iter()
        .find(|j| j.record_id == "t3_missing")
        .expect("bad job exists");
    assert_eq!(good.status, JobStatus::Completed);
    assert_eq!(bad.status, JobStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_rate_limit_flags_the_report() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let (worker, database, _temp_dir) = create_test_worker(server.uri()).await;

    insert_post(&database, "t3_abc", "A short post that will hit the limit.").await;
    enqueue_post_job(&database, "t3_abc").await;

    let report = worker.run_batch().await.expect("can run batch");

    assert_eq!(report.failed, 1);
    assert!(report.rate_limit_hit);
    assert!(report.errors.iter().any(|e| e.contains("429")));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_queue_produces_empty_report() {
    let server = MockServer::start().await;
    let (worker, _database, _temp_dir) = create_test_worker(server.uri()).await;

    let report = worker.run_batch().await.expect("can run batch");

    assert_eq!(report.claimed, 0);
    assert_eq!(report.completed, 0);
    assert_eq!(report.failed, 0);
}
