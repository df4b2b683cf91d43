use super::*;
use crate::database::models::{JobStatus, NewEmbeddingJob};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        processor_count: 2,
        batch_size: 2,
        min_delay_between_batches_ms: 10,
        dynamic_delay: true,
        max_runtime_hours: 6.0,
        stagger_start_ms: 0,
        rate_limit_recovery_wait_ms: 10,
        max_rate_limit_retries: 0,
        max_token_budget: 100_000,
        avg_tokens_per_job: 0,
        safety_margin: 0.85,
        min_priority: 0,
        status_interval_secs: 30,
        stuck_job_timeout_secs: 300,
    }
}

async fn create_test_pool(
    pool_config: PoolConfig,
    endpoint: String,
) -> (ProcessorPool, Database, TempDir) {
    let temp_dir = TempDir::new().expect("can create temp dir");
    let database = Database::new(temp_dir.path().join("test.db"))
        .await
        .expect("can create database");

    let mut config = Config::default();
    config.pool = pool_config;
    config.provider.endpoint = endpoint;
    config.provider.timeout_seconds = 5;
    config.provider.requests_per_minute = 600_000;
    config.provider.tokens_per_minute = 1_000_000_000;

    let client = EmbeddingClient::new(&config.provider)
        .expect("can create client")
        .with_retry_attempts(1);
    let pool = ProcessorPool::new(config, database.clone(), client);

    (pool, database, temp_dir)
}

#[test]
fn delay_uses_token_limit_when_it_dominates() {
    let config = PoolConfig::default();
    // batch 10 * avg 2000 tokens * 4 workers * 60000 / (1M tpm * 0.85)
    let delay = compute_batch_delay(&config, 3000, 1_000_000);
    assert_eq!(delay, Duration::from_millis(5647));
}

#[test]
fn delay_uses_request_limit_when_it_dominates() {
    let config = PoolConfig {
        avg_tokens_per_job: 0,
        ..PoolConfig::default()
    };
    // batch 10 * 4 workers * 60000 / (60 rpm * 0.85)
    let delay = compute_batch_delay(&config, 60, 1_000_000);
    assert_eq!(delay, Duration::from_millis(47_059));
}

#[test]
fn delay_never_drops_below_minimum() {
    let config = PoolConfig {
        avg_tokens_per_job: 0,
        ..PoolConfig::default()
    };
    let delay = compute_batch_delay(&config, 4_000_000, 1_000_000_000_000);
    assert_eq!(delay, Duration::from_millis(1000));
}

#[test]
fn rate_limit_signature_classification() {
    assert!(contains_rate_limit_signature("HTTP 429: rate_limit_exceeded"));
    assert!(contains_rate_limit_signature("got status 429 from provider"));
    assert!(contains_rate_limit_signature("read error: ECONNRESET"));
    assert!(contains_rate_limit_signature("request timed out: ETIMEDOUT"));
    assert!(contains_rate_limit_signature("Connection reset by peer"));
    assert!(contains_rate_limit_signature("Too Many Requests"));

    assert!(!contains_rate_limit_signature("content missing for record"));
    assert!(!contains_rate_limit_signature("HTTP 500"));
    assert!(!contains_rate_limit_signature(""));
}

#[test]
fn pool_state_counters_and_flags() {
    let shutdown = Arc::new(AtomicBool::new(false));
    let state = PoolState::new(Arc::clone(&shutdown));

    assert!(!state.shutdown_requested());
    assert!(!state.is_rate_limited());
    assert_eq!(state.active_workers(), 0);

    state.worker_started();
    state.worker_started();
    state.add_batch(&BatchReport {
        claimed: 5,
        completed: 3,
        failed: 1,
        deferred: 1,
        rate_limit_hit: false,
        errors: vec![],
    });
    state.worker_stopped();

    let snapshot = state.snapshot();
    assert_eq!(snapshot.claimed, 5);
    assert_eq!(snapshot.completed, 3);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.deferred, 1);
    assert_eq!(snapshot.active_workers, 1);

    state.set_rate_limited();
    assert!(state.is_rate_limited());

    shutdown.store(true, Ordering::SeqCst);
    assert!(state.shutdown_requested());
}

#[tokio::test(flavor = "multi_thread")]
async fn preset_shutdown_exits_without_work() {
    let (pool, _database, _temp_dir) =
        create_test_pool(fast_pool_config(), "http://localhost:9".to_string()).await;

    pool.shutdown_handle().store(true, Ordering::SeqCst);

    let summary = pool.run().await.expect("run completes");
    assert_eq!(summary.exit_reason, ExitReason::Shutdown);
    assert_eq!(summary.claimed, 0);
    assert_eq!(summary.rate_limit_restarts, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_runtime_exits_on_max_runtime() {
    let config = PoolConfig {
        max_runtime_hours: 0.0,
        ..fast_pool_config()
    };
    let (pool, _database, _temp_dir) =
        create_test_pool(config, "http://localhost:9".to_string()).await;

    let summary = pool.run().await.expect("run completes");
    assert_eq!(summary.exit_reason, ExitReason::MaxRuntime);
    assert_eq!(summary.claimed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limit_with_no_retry_budget_halts_pool() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let (pool, database, _temp_dir) = create_test_pool(fast_pool_config(), server.uri()).await;

    sqlx::query("INSERT INTO posts (id, subreddit, title, body) VALUES ('t3_a', 'rust', '', 'short post body')")
        .execute(database.pool())
        .await
        .expect("can insert post");
    database
        .enqueue_job(NewEmbeddingJob {
            record_id: "t3_a".to_string(),
            table_name: "posts".to_string(),
            content_function: "post_content".to_string(),
            embedding_column: "embedding".to_string(),
            priority: 0,
            subreddit: None,
        })
        .await
        .expect("can enqueue job");

    let summary = pool.run().await.expect("run completes");

    assert_eq!(summary.exit_reason, ExitReason::RateLimitExhausted);
    assert_eq!(summary.rate_limit_restarts, 0);
    assert_eq!(summary.failed, 1);

    let jobs = database.list_jobs().await.expect("can list jobs");
    assert_eq!(jobs[0].status, JobStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limit_restarts_within_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let config = PoolConfig {
        max_rate_limit_retries: 1,
        // Long enough for both runs, short enough to finish the test quickly
        max_runtime_hours: 0.0005,
        ..fast_pool_config()
    };
    let (pool, database, _temp_dir) = create_test_pool(config, server.uri()).await;

    sqlx::query("INSERT INTO posts (id, subreddit, title, body) VALUES ('t3_a', 'rust', '', 'short post body')")
        .execute(database.pool())
        .await
        .expect("can insert post");
    database
        .enqueue_job(NewEmbeddingJob {
            record_id: "t3_a".to_string(),
            table_name: "posts".to_string(),
            content_function: "post_content".to_string(),
            embedding_column: "embedding".to_string(),
            priority: 0,
            subreddit: None,
        })
        .await
        .expect("can enqueue job");

    let summary = pool.run().await.expect("run completes");

    // First run trips the limit, the second finds an empty queue and runs
    // out the clock
    assert_eq!(summary.rate_limit_restarts, 1);
    assert_eq!(summary.exit_reason, ExitReason::MaxRuntime);
    assert_eq!(summary.failed, 1);
}
