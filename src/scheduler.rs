//! Refresh cadence and fan-out across providers.
//!
//! Each tick runs one credential -> fetch -> normalize pipeline per provider
//! concurrently on its own task, each under its own timeout. A failing or
//! panicking pipeline degrades only its own snapshot. Results are merged in
//! configuration order and written to the [`SnapshotCache`]. The published
//! result carries the last connected snapshot of every provider that is
//! currently down.

use crate::cache::SnapshotCache;
use crate::clock::Clock;
use crate::credentials::CredentialSource;
use crate::error::UsageError;
use crate::models::{AggregatedResult, ProviderId, UsageSnapshot};
use crate::normalize::normalize;
use crate::providers::ProviderFetcher;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type InflightRun = Shared<BoxFuture<'static, Arc<AggregatedResult>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Fetching,
    Merging,
    PartialFailure,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub refresh_interval: Duration,
    pub fetch_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone)]
pub struct AggregationScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    providers: Vec<Arc<dyn ProviderFetcher>>,
    credentials: Arc<dyn CredentialSource>,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
    cache: Mutex<SnapshotCache>,
    phase: Mutex<SchedulerPhase>,
    publisher: watch::Sender<Arc<AggregatedResult>>,
    inflight: Mutex<Option<InflightRun>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AggregationScheduler {
    /// `providers` must already be in configuration order.
    pub fn new(
        providers: Vec<Arc<dyn ProviderFetcher>>,
        credentials: Arc<dyn CredentialSource>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Self {
        let initial = Arc::new(AggregatedResult::new(Vec::new(), clock.now()));
        let (publisher, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                providers,
                credentials,
                clock,
                options,
                cache: Mutex::new(SnapshotCache::new()),
                phase: Mutex::new(SchedulerPhase::Idle),
                publisher,
                inflight: Mutex::new(None),
            }),
        }
    }

    /// Run a tick now, or join the one already in flight.
    pub async fn refresh(&self) -> Arc<AggregatedResult> {
        let run = {
            let mut slot = lock(&self.inner.inflight);
            match slot.as_ref() {
                Some(run) => {
                    tracing::debug!("Refresh already in flight, joining it");
                    run.clone()
                }
                None => {
                    let run = Arc::clone(&self.inner).spawn_tick();
                    *slot = Some(run.clone());
                    run
                }
            }
        };
        run.await
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AggregatedResult>> {
        self.inner.publisher.subscribe()
    }

    /// Last published result; empty before the first tick completes.
    pub fn latest(&self) -> Arc<AggregatedResult> {
        self.inner.publisher.borrow().clone()
    }

    pub fn phase(&self) -> SchedulerPhase {
        *lock(&self.inner.phase)
    }

    /// Spawn the timer loop. The first tick fires immediately.
    pub fn start(&self) -> SchedulerHandle {
        let scheduler = self.clone();
        let period = self.inner.options.refresh_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                scheduler.refresh().await;
            }
        });
        tracing::debug!(interval_secs = period.as_secs(), "Scheduler started");
        SchedulerHandle {
            scheduler: self.clone(),
            task,
        }
    }
}

impl Inner {
    fn spawn_tick(self: Arc<Self>) -> InflightRun {
        let providers = self.provider_ids();
        let clock = Arc::clone(&self.clock);
        let task = tokio::spawn(self.run_tick());
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "Refresh task failed");
                    let now = clock.now();
                    let snapshots = providers
                        .into_iter()
                        .map(|p| UsageSnapshot::disconnected(p, "Internal error during refresh", now))
                        .collect();
                    Arc::new(AggregatedResult::new(snapshots, now))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        let mut current = lock(&self.phase);
        if *current != phase {
            tracing::debug!(from = ?*current, to = ?phase, "Scheduler phase");
            *current = phase;
        }
    }

    async fn run_tick(self: Arc<Self>) -> Arc<AggregatedResult> {
        let started = Instant::now();
        let _guard = TickGuard(Arc::clone(&self));
        self.set_phase(SchedulerPhase::Fetching);

        let pipelines: Vec<_> = self
            .providers
            .iter()
            .map(|fetcher| Arc::clone(&self).spawn_pipeline(Arc::clone(fetcher)))
            .collect();
        let snapshots = join_all(pipelines).await;

        let failed = snapshots.iter().filter(|s| !s.is_connected).count();
        self.set_phase(if failed > 0 {
            SchedulerPhase::PartialFailure
        } else {
            SchedulerPhase::Merging
        });

        let mut result = AggregatedResult::new(snapshots, self.clock.now());
        {
            let mut cache = lock(&self.cache);
            cache.update(&result);
            for snapshot in &result.providers {
                if let Some(stale) = cache.fallback(snapshot.provider_id) {
                    result
                        .last_connected
                        .insert(snapshot.provider_id, stale.clone());
                }
            }
        }
        let result = Arc::new(result);
        self.publisher.send_replace(Arc::clone(&result));

        tracing::debug!(
            providers = result.providers.len(),
            failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Published usage snapshot"
        );
        result
    }

    /// Run one provider's pipeline on its own task so a panic inside it
    /// only disconnects that provider.
    async fn spawn_pipeline(self: Arc<Self>, fetcher: Arc<dyn ProviderFetcher>) -> UsageSnapshot {
        let provider = fetcher.id();
        let clock = Arc::clone(&self.clock);
        let task = tokio::spawn(async move { self.run_pipeline(fetcher.as_ref()).await });
        match task.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "Provider pipeline aborted");
                UsageSnapshot::disconnected(provider, "Internal error during refresh", clock.now())
            }
        }
    }

    async fn run_pipeline(&self, fetcher: &dyn ProviderFetcher) -> UsageSnapshot {
        let provider = fetcher.id();
        let started = Instant::now();
        let timeout = self.options.fetch_timeout;

        let outcome = match tokio::time::timeout(timeout, self.fetch_snapshot(fetcher)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(UsageError::ProviderUnavailable(format!(
                "{} did not respond within {}s",
                provider.display_name(),
                timeout.as_secs_f64()
            ))),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(snapshot) => {
                tracing::debug!(provider = %provider, duration_ms, "Provider refreshed");
                snapshot
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(provider = %provider, duration_ms, error = %e, "Provider misconfigured");
                UsageSnapshot::disconnected(provider, e.to_string(), self.clock.now())
            }
            Err(e) => {
                tracing::warn!(
                    provider = %provider,
                    duration_ms,
                    kind = ?e.kind(),
                    error = %e,
                    "Provider refresh failed"
                );
                UsageSnapshot::disconnected(provider, e.to_string(), self.clock.now())
            }
        }
    }

    async fn fetch_snapshot(&self, fetcher: &dyn ProviderFetcher) -> Result<UsageSnapshot, UsageError> {
        let provider = fetcher.id();
        let credential = self.credentials.load(provider).await?;
        let raw = fetcher.fetch_usage(&credential).await?;
        if raw.provider() != provider {
            return Err(UsageError::ParseError(format!(
                "{} client returned a {} payload",
                provider.display_name(),
                raw.provider().display_name()
            )));
        }

        let now = self.clock.now();
        let mut snapshot = normalize(&raw, &credential, now);
        let costs = fetcher.local_costs(now).await;
        snapshot.apply_costs(&costs);
        Ok(snapshot)
    }
}

/// Returns the scheduler to `Idle` and frees the in-flight slot when a tick
/// ends, including by panic or cancellation.
struct TickGuard(Arc<Inner>);

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.set_phase(SchedulerPhase::Idle);
        *lock(&self.0.inflight) = None;
    }
}

/// Running timer loop. Dropping the handle leaves the loop running; call
/// [`SchedulerHandle::shutdown`] to stop it.
pub struct SchedulerHandle {
    scheduler: AggregationScheduler,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request an on-demand refresh without waiting for it.
    pub fn refresh_now(&self) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            scheduler.refresh().await;
        });
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        tracing::debug!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::credentials::{Credential, StaticCredentials};
    use crate::models::CostSummary;
    use crate::providers::claude::{ClaudeUsage, RateWindowResponse};
    use crate::providers::codex::{CodexUsage, RateLimitDetails, WindowSnapshot};
    use crate::providers::RawUsagePayload;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFetcher {
        id: ProviderId,
        outcome: Result<RawUsagePayload, UsageError>,
        later: Option<Result<RawUsagePayload, UsageError>>,
        panics: bool,
        delay: Duration,
        costs: CostSummary,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn ok(id: ProviderId) -> Self {
            let payload = match id {
                ProviderId::Claude => RawUsagePayload::Claude(ClaudeUsage {
                    five_hour: Some(RateWindowResponse {
                        utilization: Some(30.0),
                        resets_at: None,
                    }),
                    ..Default::default()
                }),
                ProviderId::Codex => RawUsagePayload::Codex(CodexUsage {
                    plan_type: Some("plus".into()),
                    rate_limit: Some(RateLimitDetails {
                        primary_window: Some(WindowSnapshot {
                            used: Some(410.0),
                            limit: Some(1000.0),
                            ..Default::default()
                        }),
                        secondary_window: None,
                    }),
                }),
            };
            Self::with_outcome(id, Ok(payload))
        }

        fn failing(id: ProviderId, err: UsageError) -> Self {
            Self::with_outcome(id, Err(err))
        }

        fn with_outcome(id: ProviderId, outcome: Result<RawUsagePayload, UsageError>) -> Self {
            Self {
                id,
                outcome,
                later: None,
                panics: false,
                delay: Duration::ZERO,
                costs: CostSummary::default(),
                calls: AtomicUsize::new(0),
            }
        }

        fn panicking(id: ProviderId) -> Self {
            Self {
                panics: true,
                ..Self::ok(id)
            }
        }

        /// Every call after the first returns `err`.
        fn then_failing(mut self, err: UsageError) -> Self {
            self.later = Some(Err(err));
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn with_costs(mut self, costs: CostSummary) -> Self {
            self.costs = costs;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderFetcher for FakeFetcher {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn fetch_usage(&self, _credential: &Credential) -> Result<RawUsagePayload, UsageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panics {
                panic!("malformed payload");
            }
            match &self.later {
                Some(later) if call > 0 => later.clone(),
                _ => self.outcome.clone(),
            }
        }

        async fn local_costs(&self, _now: DateTime<Utc>) -> CostSummary {
            self.costs.clone()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, 8, 0, 0).unwrap()
    }

    fn all_credentials() -> Arc<dyn CredentialSource> {
        Arc::new(StaticCredentials::new([
            Credential::bearer(ProviderId::Claude, "claude-token"),
            Credential::bearer(ProviderId::Codex, "codex-token"),
        ]))
    }

    fn scheduler_with(
        fetchers: &[Arc<FakeFetcher>],
        credentials: Arc<dyn CredentialSource>,
        fetch_timeout: Duration,
    ) -> AggregationScheduler {
        let providers = fetchers
            .iter()
            .map(|f| Arc::clone(f) as Arc<dyn ProviderFetcher>)
            .collect();
        AggregationScheduler::new(
            providers,
            credentials,
            Arc::new(FixedClock::new(now())),
            SchedulerOptions {
                refresh_interval: Duration::from_millis(50),
                fetch_timeout,
            },
        )
    }

    fn scheduler(fetchers: &[Arc<FakeFetcher>]) -> AggregationScheduler {
        scheduler_with(fetchers, all_credentials(), Duration::from_secs(5))
    }

    fn ids(result: &AggregatedResult) -> Vec<ProviderId> {
        result.providers.iter().map(|s| s.provider_id).collect()
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_provider() {
        let claude = Arc::new(FakeFetcher::failing(
            ProviderId::Claude,
            UsageError::ProviderUnavailable("API error: 503".into()),
        ));
        let codex = Arc::new(FakeFetcher::ok(ProviderId::Codex));
        let result = scheduler(&[claude, codex]).refresh().await;

        let failed = &result.providers[0];
        assert!(!failed.is_connected);
        assert_eq!(failed.error_message.as_deref(), Some("API error: 503"));

        let ok = &result.providers[1];
        assert!(ok.is_connected);
        assert_eq!(ok.session_used_pct, 41.0);
        assert_eq!(ok.plan_name, "Plus");
        assert_eq!(ok.fetched_at, now());
    }

    #[tokio::test]
    async fn test_delayed_failure_leaves_sibling_snapshot_unchanged() {
        let solo = scheduler(&[Arc::new(FakeFetcher::ok(ProviderId::Codex))])
            .refresh()
            .await;
        let expected = serde_json::to_string(&solo.providers[0]).unwrap();

        let failing = FakeFetcher::failing(
            ProviderId::Claude,
            UsageError::ProviderUnavailable("API error: 500".into()),
        );
        let panicking = FakeFetcher::panicking(ProviderId::Claude);
        for sibling in [failing, panicking] {
            let sibling = Arc::new(sibling.delayed(Duration::from_millis(60)));
            let codex = Arc::new(FakeFetcher::ok(ProviderId::Codex));
            let result = scheduler(&[sibling, codex]).refresh().await;

            assert!(!result.providers[0].is_connected);
            assert_eq!(result.providers[1], solo.providers[0]);
            assert_eq!(serde_json::to_string(&result.providers[1]).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_scheduler_recovers_after_provider_panic() {
        let claude = Arc::new(FakeFetcher::panicking(ProviderId::Claude));
        let codex = Arc::new(FakeFetcher::ok(ProviderId::Codex));
        let scheduler = scheduler(&[claude.clone(), codex.clone()]);

        for round in 1..=3 {
            let result = tokio::time::timeout(Duration::from_secs(2), scheduler.refresh())
                .await
                .unwrap();
            assert_eq!(claude.calls(), round);
            assert_eq!(codex.calls(), round);
            assert_eq!(
                result.providers[0].error_message.as_deref(),
                Some("Internal error during refresh")
            );
            assert!(result.providers[1].is_connected);
            assert_eq!(scheduler.phase(), SchedulerPhase::Idle);
        }
    }

    #[tokio::test]
    async fn test_out_of_range_window_does_not_stall_refreshes() {
        let codex = Arc::new(FakeFetcher::with_outcome(
            ProviderId::Codex,
            Ok(RawUsagePayload::Codex(CodexUsage {
                plan_type: Some("plus".into()),
                rate_limit: Some(RateLimitDetails {
                    primary_window: None,
                    secondary_window: Some(WindowSnapshot {
                        used_percent: Some(50.0),
                        reset_at: Some((now() + chrono::Duration::days(3)).timestamp()),
                        limit_window_seconds: Some(i64::MAX),
                        ..Default::default()
                    }),
                }),
            })),
        ));
        let scheduler = scheduler(&[codex.clone()]);

        for round in 1..=3 {
            let result = tokio::time::timeout(Duration::from_secs(2), scheduler.refresh())
                .await
                .unwrap();
            assert_eq!(codex.calls(), round);
            let snapshot = &result.providers[0];
            assert!(snapshot.is_connected);
            assert_eq!(snapshot.weekly_used_pct, 50.0);
            assert_eq!(snapshot.weekly_window_seconds, None);
            assert_eq!(scheduler.phase(), SchedulerPhase::Idle);
        }
    }

    #[tokio::test]
    async fn test_order_follows_configuration_not_completion() {
        let slow_claude =
            Arc::new(FakeFetcher::ok(ProviderId::Claude).delayed(Duration::from_millis(80)));
        let fast_codex = Arc::new(FakeFetcher::ok(ProviderId::Codex));

        let result = scheduler(&[slow_claude.clone(), fast_codex.clone()])
            .refresh()
            .await;
        assert_eq!(ids(&result), vec![ProviderId::Claude, ProviderId::Codex]);

        let result = scheduler(&[fast_codex, slow_claude]).refresh().await;
        assert_eq!(ids(&result), vec![ProviderId::Codex, ProviderId::Claude]);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_coalesced() {
        let claude =
            Arc::new(FakeFetcher::ok(ProviderId::Claude).delayed(Duration::from_millis(100)));
        let codex =
            Arc::new(FakeFetcher::ok(ProviderId::Codex).delayed(Duration::from_millis(100)));
        let scheduler = scheduler(&[claude.clone(), codex.clone()]);

        let (a, b, c) = tokio::join!(scheduler.refresh(), scheduler.refresh(), scheduler.refresh());
        assert_eq!(claude.calls(), 1);
        assert_eq!(codex.calls(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));

        scheduler.refresh().await;
        assert_eq!(claude.calls(), 2);
        assert_eq!(codex.calls(), 2);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out_without_stalling_others() {
        let stuck =
            Arc::new(FakeFetcher::ok(ProviderId::Claude).delayed(Duration::from_secs(30)));
        let codex = Arc::new(FakeFetcher::ok(ProviderId::Codex));
        let scheduler = scheduler_with(
            &[stuck, codex],
            all_credentials(),
            Duration::from_millis(100),
        );

        let started = Instant::now();
        let result = scheduler.refresh().await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let timed_out = &result.providers[0];
        assert!(!timed_out.is_connected);
        assert!(timed_out
            .error_message
            .as_deref()
            .unwrap()
            .contains("did not respond"));
        assert!(result.providers[1].is_connected);
    }

    #[tokio::test]
    async fn test_missing_credential_skips_fetch() {
        let claude = Arc::new(FakeFetcher::ok(ProviderId::Claude));
        let codex = Arc::new(FakeFetcher::ok(ProviderId::Codex));
        let credentials: Arc<dyn CredentialSource> = Arc::new(StaticCredentials::new([
            Credential::bearer(ProviderId::Claude, "claude-token"),
        ]));
        let result = scheduler_with(
            &[claude.clone(), codex.clone()],
            credentials,
            Duration::from_secs(5),
        )
        .refresh()
        .await;

        assert!(result.providers[0].is_connected);
        let codex_snapshot = &result.providers[1];
        assert!(!codex_snapshot.is_connected);
        assert!(codex_snapshot
            .error_message
            .as_deref()
            .unwrap()
            .contains("codex"));
        assert_eq!(codex.calls(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_parse_failure() {
        let confused = Arc::new(FakeFetcher::with_outcome(
            ProviderId::Codex,
            Ok(RawUsagePayload::Claude(ClaudeUsage::default())),
        ));
        let result = scheduler(&[confused]).refresh().await;
        let snapshot = &result.providers[0];
        assert!(!snapshot.is_connected);
        assert!(snapshot
            .error_message
            .as_deref()
            .unwrap()
            .contains("Claude payload"));
    }

    #[tokio::test]
    async fn test_costs_only_on_connected_snapshots() {
        let costs = CostSummary {
            today: 1.5,
            today_tokens: 300_000,
            last_30_days: 20.0,
            last_30_days_tokens: 4_000_000,
        };
        let claude = Arc::new(FakeFetcher::ok(ProviderId::Claude).with_costs(costs.clone()));
        let codex = Arc::new(
            FakeFetcher::failing(
                ProviderId::Codex,
                UsageError::Unauthenticated("Token expired".into()),
            )
            .with_costs(costs),
        );
        let result = scheduler(&[claude, codex]).refresh().await;

        let connected = &result.providers[0];
        assert_eq!(connected.cost_today, 1.5);
        assert_eq!(connected.cost_30_days_tokens, 4_000_000);

        let disconnected = &result.providers[1];
        assert!(disconnected.model_usage.is_empty());
        assert_eq!(disconnected.cost_today, 0.0);
        assert_eq!(disconnected.cost_30_days_tokens, 0);
        assert_eq!(disconnected.session_used_pct, 0.0);
        assert_eq!(disconnected.weekly_used_pct, 0.0);
    }

    #[tokio::test]
    async fn test_publishes_and_updates_cache() {
        let codex = Arc::new(FakeFetcher::ok(ProviderId::Codex));
        let scheduler = scheduler(&[codex]);
        let mut rx = scheduler.subscribe();
        assert!(rx.borrow().providers.is_empty());

        let result = scheduler.refresh().await;
        rx.changed().await.unwrap();
        assert!(Arc::ptr_eq(&*rx.borrow(), &result));
        assert!(Arc::ptr_eq(&scheduler.latest(), &result));

        let cache = lock(&scheduler.inner.cache).clone();
        assert_eq!(cache.get(ProviderId::Codex), Some(&result.providers[0]));
    }

    #[tokio::test]
    async fn test_published_result_carries_last_connected() {
        let claude = Arc::new(FakeFetcher::ok(ProviderId::Claude));
        let codex = Arc::new(
            FakeFetcher::ok(ProviderId::Codex)
                .then_failing(UsageError::ProviderUnavailable("API error: 502".into())),
        );
        let scheduler = scheduler(&[claude, codex]);

        let good = scheduler.refresh().await;
        assert!(good.last_connected.is_empty());

        let mut rx = scheduler.subscribe();
        let degraded = scheduler.refresh().await;
        assert!(!degraded.providers[1].is_connected);
        assert_eq!(degraded.stale(ProviderId::Codex), Some(&good.providers[1]));
        assert_eq!(degraded.stale(ProviderId::Claude), None);
        assert!(Arc::ptr_eq(&*rx.borrow_and_update(), &degraded));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        scheduler.latest().save(&path).unwrap();
        let saved: AggregatedResult =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.stale(ProviderId::Codex), Some(&good.providers[1]));
        assert_eq!(saved.stale(ProviderId::Codex).unwrap().weekly_used_pct, 0.0);
        assert_eq!(saved.stale(ProviderId::Codex).unwrap().session_used_pct, 41.0);
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let claude =
            Arc::new(FakeFetcher::ok(ProviderId::Claude).delayed(Duration::from_millis(150)));
        let scheduler = scheduler(&[claude]);
        assert_eq!(scheduler.phase(), SchedulerPhase::Idle);

        let background = scheduler.clone();
        let run = tokio::spawn(async move { background.refresh().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.phase(), SchedulerPhase::Fetching);

        run.await.unwrap();
        assert_eq!(scheduler.phase(), SchedulerPhase::Idle);
    }

    #[tokio::test]
    async fn test_timer_loop_publishes_until_shutdown() {
        let claude = Arc::new(FakeFetcher::ok(ProviderId::Claude));
        let scheduler = scheduler(&[claude.clone()]);
        let mut rx = scheduler.subscribe();

        let handle = scheduler.start();
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), rx.changed())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(claude.calls() >= 2);

        handle.refresh_now();
        handle.shutdown().await;
        let after = claude.calls();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(claude.calls() <= after + 1);
    }
}
