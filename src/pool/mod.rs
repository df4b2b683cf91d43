#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PoolConfig};
use crate::database::Database;
use crate::embeddings::client::EmbeddingClient;
use crate::worker::{BatchReport, EmbeddingWorker};

/// Consecutive empty batches before the idle backoff kicks in.
const EMPTY_STREAK_THRESHOLD: u32 = 5;
/// Delay multiplier applied while the queue stays empty.
const IDLE_BACKOFF_MULTIPLIER: u32 = 3;

const RATE_LIMIT_SIGNATURES: &[&str] = &[
    "429",
    "rate_limit_exceeded",
    "rate limit",
    "too many requests",
    "econnreset",
    "etimedout",
    "connection reset",
    "socket hang up",
];

/// Secondary net over accumulated batch error text; the typed
/// `ProviderError::RateLimited` is the primary signal.
#[inline]
pub fn contains_rate_limit_signature(text: &str) -> bool {
    let lowered = text.to_lowercase();
    RATE_LIMIT_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}

/// Cross-worker coordination state, scoped to one pool run. The shutdown
/// flag is shared with the process and survives restarts; everything else
/// is torn down and rebuilt on a rate-limit restart.
#[derive(Debug)]
pub struct PoolState {
    shutdown: Arc<AtomicBool>,
    rate_limited: AtomicBool,
    active_workers: AtomicUsize,
    total_claimed: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
    total_deferred: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub deferred: u64,
    pub active_workers: usize,
}

impl PoolState {
    #[inline]
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            shutdown,
            rate_limited: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            total_claimed: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_deferred: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_rate_limited(&self) {
        self.rate_limited.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn add_batch(&self, report: &BatchReport) {
        self.total_claimed
            .fetch_add(report.claimed as u64, Ordering::SeqCst);
        self.total_completed
            .fetch_add(report.completed as u64, Ordering::SeqCst);
        self.total_failed
            .fetch_add(report.failed as u64, Ordering::SeqCst);
        self.total_deferred
            .fetch_add(report.deferred as u64, Ordering::SeqCst);
    }

    #[inline]
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            claimed: self.total_claimed.load(Ordering::SeqCst),
            completed: self.total_completed.load(Ordering::SeqCst),
            failed: self.total_failed.load(Ordering::SeqCst),
            deferred: self.total_deferred.load(Ordering::SeqCst),
            active_workers: self.active_workers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    MaxRuntime,
    RateLimitExhausted,
}

/// Final accounting for one `run()` call, across all restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub deferred: u64,
    pub rate_limit_restarts: u32,
    pub exit_reason: ExitReason,
}

/// Runs N staggered worker loops against the shared queue, keeping request
/// and token throughput under the provider's published limits.
pub struct ProcessorPool {
    config: Config,
    database: Database,
    client: EmbeddingClient,
    batch_delay: Duration,
    shutdown: Arc<AtomicBool>,
}

impl ProcessorPool {
    #[inline]
    pub fn new(config: Config, database: Database, client: EmbeddingClient) -> Self {
        let (requests_per_minute, tokens_per_minute) = client.rate_limits();
        let batch_delay = compute_batch_delay(&config.pool, requests_per_minute, tokens_per_minute);

        Self {
            config,
            database,
            client,
            batch_delay,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed by all workers at their next batch boundary.
    #[inline]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    #[inline]
    pub fn batch_delay(&self) -> Duration {
        self.batch_delay
    }

    /// Run worker loops until shutdown, max runtime, or an exhausted
    /// rate-limit retry budget. Rate-limit stops restart the whole pool
    /// after the recovery wait.
    #[inline]
    pub async fn run(&self) -> Result<RunSummary> {
        info!(
            "Starting processor pool: {} workers, batch size {}, base delay {}ms",
            self.config.pool.processor_count,
            self.config.pool.batch_size,
            self.batch_delay.as_millis()
        );

        self.install_interrupt_handler();

        let mut restarts = 0u32;
        let mut totals = PoolSnapshot::default();

        let exit_reason = loop {
            let state = Arc::new(PoolState::new(Arc::clone(&self.shutdown)));
            self.run_once(Arc::clone(&state)).await;

            let snapshot = state.snapshot();
            totals.claimed += snapshot.claimed;
            totals.completed += snapshot.completed;
            totals.failed += snapshot.failed;
            totals.deferred += snapshot.deferred;

            if state.is_rate_limited() && !state.shutdown_requested() {
                if restarts >= self.config.pool.max_rate_limit_retries {
                    error!(
                        "Rate limit retry budget exhausted after {} restarts; halting pool",
                        restarts
                    );
                    break ExitReason::RateLimitExhausted;
                }
                restarts += 1;
                warn!(
                    "Rate limit detected; restarting pool in {}ms (attempt {}/{})",
                    self.config.pool.rate_limit_recovery_wait_ms,
                    restarts,
                    self.config.pool.max_rate_limit_retries
                );
                sleep(Duration::from_millis(
                    self.config.pool.rate_limit_recovery_wait_ms,
                ))
                .await;
                continue;
            }

            break if state.shutdown_requested() {
                ExitReason::Shutdown
            } else {
                ExitReason::MaxRuntime
            };
        };

        let summary = RunSummary {
            claimed: totals.claimed,
            completed: totals.completed,
            failed: totals.failed,
            deferred: totals.deferred,
            rate_limit_restarts: restarts,
            exit_reason,
        };

        info!(
            "Pool finished ({:?}): {} claimed, {} completed, {} failed, {} deferred, {} restarts",
            summary.exit_reason,
            summary.claimed,
            summary.completed,
            summary.failed,
            summary.deferred,
            summary.rate_limit_restarts
        );

        Ok(summary)
    }

    async fn run_once(&self, state: Arc<PoolState>) {
        let reporter = self.spawn_status_reporter(Arc::clone(&state));

        let mut handles = Vec::with_capacity(self.config.pool.processor_count);
        for slot in 0..self.config.pool.processor_count {
            let worker =
                EmbeddingWorker::new(self.database.clone(), self.client.clone(), &self.config);
            handles.push(tokio::spawn(worker_loop(
                slot,
                worker,
                Arc::clone(&state),
                self.config.pool.clone(),
                self.batch_delay,
            )));
        }

        join_all(handles).await;
        reporter.abort();
    }

    fn spawn_status_reporter(&self, state: Arc<PoolState>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.pool.status_interval_secs);

        tokio::spawn(async move {
            #[expect(
                clippy::infinite_loop,
                reason = "intended to run until handle is aborted"
            )]
            loop {
                sleep(interval).await;
                let snapshot = state.snapshot();
                info!(
                    "Pool status: {} active workers, {} claimed, {} completed, {} failed, {} deferred",
                    snapshot.active_workers,
                    snapshot.claimed,
                    snapshot.completed,
                    snapshot.failed,
                    snapshot.deferred
                );
            }
        })
    }

    fn install_interrupt_handler(&self) {
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; workers will stop at their next batch boundary");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }
}

/// One processor slot. Runs batches until the runtime cap, a shutdown
/// request, or a pool-wide rate-limit stop. In-flight batches always
/// finish; the flags are checked only at batch boundaries.
async fn worker_loop(
    slot: usize,
    worker: EmbeddingWorker,
    state: Arc<PoolState>,
    config: PoolConfig,
    base_delay: Duration,
) {
    if config.stagger_start_ms > 0 {
        sleep(Duration::from_millis(config.stagger_start_ms * slot as u64)).await;
    }

    state.worker_started();
    info!("Worker {} started", slot);

    let started = Instant::now();
    let max_runtime = Duration::from_secs_f64(config.max_runtime_hours.max(0.0) * 3600.0);
    let mut empty_streak = 0u32;

    while started.elapsed() < max_runtime
        && !state.shutdown_requested()
        && !state.is_rate_limited()
    {
        let report = match worker.run_batch().await {
            Ok(report) => report,
            Err(error) => {
                let message = error.to_string();
                error!("Worker {} batch error: {}", slot, message);
                if contains_rate_limit_signature(&message) {
                    state.set_rate_limited();
                    break;
                }
                sleep(base_delay).await;
                continue;
            }
        };

        state.add_batch(&report);

        if report.rate_limit_hit
            || report
                .errors
                .iter()
                .any(|error| contains_rate_limit_signature(error))
        {
            warn!("Worker {} detected rate limiting; signalling pool stop", slot);
            state.set_rate_limited();
            break;
        }

        if report.claimed == 0 {
            empty_streak += 1;
        } else {
            empty_streak = 0;
        }

        let mut delay = base_delay;
        if config.dynamic_delay {
            if empty_streak >= EMPTY_STREAK_THRESHOLD {
                delay = base_delay * IDLE_BACKOFF_MULTIPLIER;
                debug!(
                    "Worker {} idle for {} batches, delay now {}ms",
                    slot,
                    empty_streak,
                    delay.as_millis()
                );
            } else if report.claimed < config.batch_size {
                // Partial batch: the queue is draining, ease off a little
                delay = base_delay + base_delay / 2;
            }
        }

        sleep(delay).await;
    }

    state.worker_stopped();

    let reason = if state.is_rate_limited() {
        "rate limit"
    } else if state.shutdown_requested() {
        "shutdown requested"
    } else {
        "max runtime reached"
    };
    info!(
        "Worker {} exiting after {:?} ({})",
        slot,
        started.elapsed(),
        reason
    );
}

/// Safe inter-batch delay derived from the provider's published limits.
/// Computed once at startup; the margin keeps actual usage under the
/// provider's hard ceiling.
#[inline]
pub fn compute_batch_delay(
    config: &PoolConfig,
    requests_per_minute: u32,
    tokens_per_minute: u64,
) -> Duration {
    let workers = config.processor_count as f64;
    let batch = config.batch_size as f64;

    let request_delay_ms =
        (batch * workers * 60_000.0) / (f64::from(requests_per_minute) * config.safety_margin);
    let token_delay_ms = (batch * config.avg_tokens_per_job as f64 * workers * 60_000.0)
        / (tokens_per_minute as f64 * config.safety_margin);

    let delay_ms = (config.min_delay_between_batches_ms as f64)
        .max(request_delay_ms)
        .max(token_delay_ms);

    Duration::from_millis(delay_ms.round() as u64)
}
