use crate::models::{NewAd, RunReport, RunState, StageReport, StoreFeedKey, SweepResponse};
use crate::pipeline::{Pipeline, PipelineError, StageOutcome, stages};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Bounded-retry policy applied to every stage transition: exponential
/// backoff from `initial_interval`, doubling per attempt, capped at
/// `max_interval`, with a per-attempt wall-clock timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
    pub stage_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(100),
            max_attempts: 10,
            stage_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_interval: env_secs("RETRY_INITIAL_SECS", defaults.initial_interval),
            max_interval: env_secs("RETRY_MAX_INTERVAL_SECS", defaults.max_interval),
            max_attempts: std::env::var("RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.max_attempts),
            stage_timeout: env_secs("STAGE_TIMEOUT_SECS", defaults.stage_timeout),
        }
    }

    /// Delay before the attempt after `attempt` (1-based), jittered so
    /// concurrent runs don't retry in lockstep.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_interval
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = doubled.min(self.max_interval);
        capped.mul_f64(rand::rng().random_range(0.8..1.2))
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Sequences the stages per store, applies the retry policy, and fans out
/// across discovered stores with a bounded worker count.
#[derive(Clone)]
pub struct Coordinator {
    pipeline: Pipeline,
    policy: RetryPolicy,
    workers: usize,
    shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(pipeline: Pipeline, policy: RetryPolicy) -> Self {
        let workers = std::env::var("MAX_CONCURRENT_RUNS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(4);
        Self {
            pipeline,
            policy,
            workers,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Stops the sweep at the next stage boundary; in-flight stages
    /// finish (their writes are safe to re-issue on the next sweep).
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// One full pass: discovery once, then a concurrent run per expired
    /// store. A failed run is reported, never propagated to siblings.
    pub async fn sweep(&self) -> Result<SweepResponse, PipelineError> {
        let today = chrono::Utc::now().date_naive();
        let mut sweep_stages = Vec::new();
        let keys = self
            .run_stage("discover_stores", &mut sweep_stages, || {
                stages::discover_stores(&self.pipeline.catalog.stores, today)
            })
            .await?;
        info!(
            target = "larder.pipeline",
            discovered = keys.len(),
            "sweep discovered expired-ad stores"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for key in keys.clone() {
            let coordinator = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };
                Some(coordinator.run_store(&key).await)
            });
        }

        let mut runs: Vec<RunReport> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(err) => {
                    error!(target = "larder.pipeline", error = %err, "store run task aborted")
                }
            }
        }
        runs.sort_by_key(|run| run.store_id);

        let failed = runs
            .iter()
            .filter(|run| run.state == RunState::Failed)
            .count();
        let processed = runs.len() - failed;
        crate::metrics::sweep_finished(processed, failed);
        Ok(SweepResponse {
            sweep_id: Uuid::new_v4().to_string(),
            discovered: keys.len(),
            processed,
            failed,
            stages: sweep_stages,
            runs,
        })
    }

    /// On-demand run for a single store.
    pub async fn run_single(&self, store_id: i64) -> Result<RunReport, PipelineError> {
        let key = self
            .pipeline
            .catalog
            .stores
            .feed_key(store_id)
            .await
            .map_err(|err| PipelineError::transient("discover_stores", err.to_string()))?
            .ok_or_else(|| {
                PipelineError::invalid_input("discover_stores", format!("unknown store {store_id}"))
            })?;
        Ok(self.run_store(&key).await)
    }

    /// Drives one store through `Fetching -> Resolving -> Classifying
    /// (optional) -> Committing`. Failures land in the report; this
    /// function never propagates them.
    pub async fn run_store(&self, key: &StoreFeedKey) -> RunReport {
        let run_id = Uuid::new_v4();
        let mut stage_log = Vec::new();

        if self.shutdown_requested() {
            return self.cancelled(key, run_id, stage_log, "fetch_listings");
        }
        let listings = match self
            .run_stage("fetch_listings", &mut stage_log, || {
                stages::fetch_listings(&self.pipeline.feed, key)
            })
            .await
        {
            Ok(listings) => listings,
            Err(err) => return self.failed(key, run_id, stage_log, err),
        };

        // No food promotions this week: short-circuit before commit. No
        // ad row, no catalog writes; the store is rediscovered next sweep.
        let Some(first) = listings.first() else {
            info!(
                target = "larder.pipeline",
                store_id = key.store_id,
                "feed returned no food items; skipping commit"
            );
            return self.done(key, run_id, stage_log, None, 0);
        };
        let (sale_start, sale_end) = (first.valid_from, first.valid_to);

        if self.shutdown_requested() {
            return self.cancelled(key, run_id, stage_log, "resolve_translations");
        }
        let split = match self
            .run_stage("resolve_translations", &mut stage_log, || {
                stages::resolve_translations(&self.pipeline.catalog.translations, &listings)
            })
            .await
        {
            Ok(split) => split,
            Err(err) => return self.failed(key, run_id, stage_log, err),
        };

        let mut line_items = split.resolved;
        if !split.unresolved.is_empty() {
            if self.shutdown_requested() {
                return self.cancelled(key, run_id, stage_log, "classify_unresolved");
            }
            let classified = match self
                .run_stage("classify_unresolved", &mut stage_log, || {
                    stages::classify_unresolved(
                        &self.pipeline.classifier,
                        &self.pipeline.catalog.ingredients,
                        &self.pipeline.catalog.translations,
                        &split.unresolved,
                    )
                })
                .await
            {
                Ok(classified) => classified,
                Err(err) => return self.failed(key, run_id, stage_log, err),
            };
            line_items.extend(classified);
        }

        if self.shutdown_requested() {
            return self.cancelled(key, run_id, stage_log, "commit_ad");
        }
        let ad = NewAd {
            run_id,
            store_id: key.store_id,
            sale_start,
            sale_end,
            line_items,
        };
        let ad_id = match self
            .run_stage("commit_ad", &mut stage_log, || {
                stages::commit_ad(&self.pipeline.catalog.ads, &ad)
            })
            .await
        {
            Ok(ad_id) => ad_id,
            Err(err) => return self.failed(key, run_id, stage_log, err),
        };

        self.done(key, run_id, stage_log, Some(ad_id), ad.line_items.len())
    }

    /// Runs one stage under the retry policy. Each attempt gets the full
    /// stage timeout; a timeout counts as a transient failure.
    async fn run_stage<T, F, Fut>(
        &self,
        name: &'static str,
        stage_log: &mut Vec<StageReport>,
        attempt_fn: F,
    ) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let mut attempt = 1u32;
        let outcome = loop {
            let err = match timeout(self.policy.stage_timeout, attempt_fn()).await {
                Ok(Ok(outcome)) => break outcome,
                Ok(Err(err)) => err,
                Err(_) => PipelineError::transient(
                    name,
                    format!("timed out after {:?}", self.policy.stage_timeout),
                ),
            };
            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                return Err(err);
            }
            let delay = self.policy.backoff_delay(attempt);
            warn!(
                target = "larder.pipeline",
                stage = name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "stage attempt failed; retrying"
            );
            sleep(delay).await;
            attempt += 1;
        };
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stage_log.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }

    fn done(
        &self,
        key: &StoreFeedKey,
        run_id: Uuid,
        stages: Vec<StageReport>,
        ad_id: Option<i64>,
        line_items: usize,
    ) -> RunReport {
        crate::metrics::run_finished(key.store_id, "done");
        RunReport {
            store_id: key.store_id,
            run_id,
            state: RunState::Done,
            failed_stage: None,
            error: None,
            ad_id,
            line_items,
            committed: ad_id.is_some(),
            stages,
        }
    }

    fn failed(
        &self,
        key: &StoreFeedKey,
        run_id: Uuid,
        stages: Vec<StageReport>,
        err: PipelineError,
    ) -> RunReport {
        error!(
            target = "larder.pipeline",
            store_id = key.store_id,
            stage = err.stage(),
            error = %err,
            "store run failed after retry exhaustion"
        );
        crate::metrics::run_finished(key.store_id, "failed");
        RunReport {
            store_id: key.store_id,
            run_id,
            state: RunState::Failed,
            failed_stage: Some(err.stage().to_string()),
            error: Some(err.detail().to_string()),
            ad_id: None,
            line_items: 0,
            committed: false,
            stages,
        }
    }

    fn cancelled(
        &self,
        key: &StoreFeedKey,
        run_id: Uuid,
        stages: Vec<StageReport>,
        next_stage: &'static str,
    ) -> RunReport {
        warn!(
            target = "larder.pipeline",
            store_id = key.store_id,
            stage = next_stage,
            "run cancelled at stage boundary"
        );
        crate::metrics::run_finished(key.store_id, "cancelled");
        RunReport {
            store_id: key.store_id,
            run_id,
            state: RunState::Failed,
            failed_stage: Some(next_stage.to_string()),
            error: Some("run cancelled before stage".to_string()),
            ad_id: None,
            line_items: 0,
            committed: false,
            stages,
        }
    }
}
