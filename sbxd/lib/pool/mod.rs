//! Warm pool reconciliation and the warm-claim path.
//!
//! The pool keeps a rolling inventory of pre-provisioned namespaces labeled
//! `sbx.pool=warm`, each holding a ready `sandbox` pod running
//! `sleep infinity`. Cluster state is the source of truth: the reconciler
//! derives everything from labels on every tick, and concurrent claims are
//! resolved with conditional namespace updates, so a losing claimer simply
//! moves to the next candidate.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::time::interval;

use crate::{
    config::{
        join_csv, CacheConfig, Config, ResourceConfig, StreamConfig, WarmPoolConfig,
        ALLOWED_HOSTS_ENV_VAR, DISALLOWED_HOSTS_ENV_VAR, EXTERNAL_ID_LABEL, LAST_EXEC_ANNOTATION,
        POOL_LABEL, POOL_LABEL_WARM, SANDBOX_POD_NAME, STATE_LABEL, WARM_NAMESPACE_PREFIX,
        WARM_STATE_CLAIMED, WARM_STATE_CREATING, WARM_STATE_READY, WARM_WINDOW,
    },
    metrics::Metrics,
    orchestrator::{Orchestrator, OrchestratorResult, PvcSpec, SandboxPodSpec},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often the reconciler ticks.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The warm pool reconciler.
pub struct WarmPool {
    orchestrator: Arc<dyn Orchestrator>,
    cfg: WarmPoolConfig,
    cache: CacheConfig,
    stream: StreamConfig,
    resources: ResourceConfig,
    image: String,
    env: BTreeMap<String, String>,
    control_namespace: String,
    metrics: Arc<Metrics>,
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    recent: Vec<DateTime<Utc>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WarmPool {
    /// Creates the pool from resolved configuration.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut env: BTreeMap<String, String> = config.sandbox_env().into_iter().collect();
        let allowed = config.allowed_hosts();
        if !allowed.is_empty() {
            env.entry(ALLOWED_HOSTS_ENV_VAR.to_string())
                .or_insert_with(|| join_csv(&allowed));
        }
        let disallowed = config.disallowed_hosts();
        if !disallowed.is_empty() {
            env.entry(DISALLOWED_HOSTS_ENV_VAR.to_string())
                .or_insert_with(|| join_csv(&disallowed));
        }
        Self {
            orchestrator,
            cfg: config.warm_pool(),
            cache: config.cache(),
            stream: config.stream(),
            resources: config.resources(),
            image: config.image(),
            env,
            control_namespace: config.warm_control_namespace(),
            metrics,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Whether the pool is configured to run at all.
    pub fn enabled(&self) -> bool {
        if self.cfg.autosize {
            return self.cfg.max > 0 || self.cfg.min > 0;
        }
        self.cfg.size > 0
    }

    /// The pool sizing parameters in effect.
    pub fn config(&self) -> &WarmPoolConfig {
        &self.cfg
    }

    /// Records one user-facing create into the autosize window.
    pub fn record_create(&self) {
        if !self.cfg.autosize {
            return;
        }
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.recent.push(now);
        prune(&mut inner.recent, now);
    }

    /// The number of warm namespaces the pool should hold right now.
    pub fn desired_size(&self) -> usize {
        if !self.cfg.autosize {
            return self.cfg.size;
        }
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        prune(&mut inner.recent, now);
        inner.recent.len().max(self.cfg.min).min(self.cfg.max)
    }

    /// The reconciliation loop: one pass every 5 seconds, errors logged and
    /// retried on the next tick.
    pub async fn run(&self) {
        if let Err(err) = self.ensure_control_namespace().await {
            tracing::warn!("warm pool control namespace: {}", err);
        }
        let mut tick = interval(RECONCILE_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(err) = self.reconcile_once().await {
                tracing::warn!("warm pool reconcile: {}", err);
            }
            if let Err(err) = self.reap_idle().await {
                tracing::warn!("warm pool reap: {}", err);
            }
        }
    }

    /// Startup rebuild: reconcile immediately, then rehydrate the autosize
    /// window from the last-exec annotations of existing sandboxes.
    pub async fn rebuild_from_cluster(&self) -> OrchestratorResult<()> {
        if let Err(err) = self.ensure_control_namespace().await {
            tracing::warn!("warm pool control namespace: {}", err);
        }
        self.reconcile_once().await?;
        if !self.cfg.autosize {
            return Ok(());
        }
        let namespaces = self.orchestrator.list_namespaces(None).await?;
        let now = Utc::now();
        let window = chrono::Duration::from_std(WARM_WINDOW).expect("static window");
        let mut inner = self.inner.lock().unwrap();
        inner.recent.clear();
        for ns in namespaces {
            let Some(last) = ns.last_exec_unix() else {
                continue;
            };
            let Some(last) = DateTime::from_timestamp(last, 0) else {
                continue;
            };
            if now - last <= window {
                inner.recent.push(last);
            }
        }
        Ok(())
    }

    /// One reconciliation pass: refresh gauges, promote warm namespaces whose
    /// pod became ready, and grow the pool onto unused indices. Reconciliation
    /// never deletes above the desired line.
    pub async fn reconcile_once(&self) -> OrchestratorResult<()> {
        let desired = self.desired_size();

        let ready_selector = format!(
            "{}={},{}={}",
            POOL_LABEL, POOL_LABEL_WARM, STATE_LABEL, WARM_STATE_READY
        );
        if let Result::Ok(ready) = self.orchestrator.list_namespaces(Some(&ready_selector)).await {
            self.metrics.set_warm_pool(desired as i64, ready.len() as i64);
        }

        let warm_selector = format!("{}={}", POOL_LABEL, POOL_LABEL_WARM);
        let warm = self
            .orchestrator
            .list_namespaces(Some(&warm_selector))
            .await?;

        for ns in &warm {
            if ns.label(STATE_LABEL) != Some(WARM_STATE_CREATING) {
                continue;
            }
            let ready = match self
                .orchestrator
                .get_pod(&ns.name, SANDBOX_POD_NAME)
                .await
            {
                Result::Ok(pod) => pod.ready,
                Err(_) => false,
            };
            if !ready {
                continue;
            }
            let mut record = ns.clone();
            record
                .labels
                .insert(STATE_LABEL.to_string(), WARM_STATE_READY.to_string());
            // A conflict here just defers the promotion to the next tick.
            let _ = self.orchestrator.update_namespace(&record).await;
        }

        if warm.len() >= desired {
            return Ok(());
        }

        let used: Vec<usize> = warm.iter().filter_map(|ns| warm_index(&ns.name)).collect();
        let mut missing = desired - warm.len();
        for index in 1..=desired {
            if missing == 0 {
                break;
            }
            if used.contains(&index) {
                continue;
            }
            let name = format!("{}{}", WARM_NAMESPACE_PREFIX, index);
            if let Err(err) = self.create_warm_namespace(&name).await {
                tracing::warn!("create warm namespace {}: {}", name, err);
                continue;
            }
            missing -= 1;
        }
        Ok(())
    }

    /// Claims a ready warm namespace for a create request.
    ///
    /// Candidates are tried in deterministic index order; the namespace is
    /// marked claimed with a conditional update, and a conflict (another
    /// claimer won) advances to the next candidate. Returns `None` when no
    /// candidate could be claimed.
    pub async fn claim(&self, external_id: &str) -> OrchestratorResult<Option<String>> {
        let selector = format!(
            "{}={},{}={}",
            POOL_LABEL, POOL_LABEL_WARM, STATE_LABEL, WARM_STATE_READY
        );
        let mut candidates = self.orchestrator.list_namespaces(Some(&selector)).await?;
        candidates.sort_by_key(|ns| (warm_index(&ns.name).unwrap_or(usize::MAX), ns.name.clone()));

        for candidate in candidates {
            let ready = match self
                .orchestrator
                .get_pod(&candidate.name, SANDBOX_POD_NAME)
                .await
            {
                Result::Ok(pod) => pod.ready,
                Err(_) => false,
            };
            if !ready {
                continue;
            }
            let mut record = candidate.clone();
            record
                .labels
                .insert(STATE_LABEL.to_string(), WARM_STATE_CLAIMED.to_string());
            if !external_id.is_empty() {
                record
                    .labels
                    .insert(EXTERNAL_ID_LABEL.to_string(), external_id.to_string());
            }
            record.annotations.insert(
                LAST_EXEC_ANNOTATION.to_string(),
                Utc::now().timestamp().to_string(),
            );
            match self.orchestrator.update_namespace(&record).await {
                Result::Ok(()) => return Ok(Some(candidate.name)),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Deletes claimed warm namespaces whose last exec is older than the
    /// idle TTL. Namespaces that never ran anything (`last_exec_at=0`) are
    /// left to the sandbox idle reaper.
    pub async fn reap_idle(&self) -> OrchestratorResult<()> {
        let selector = format!(
            "{}={},{}={}",
            POOL_LABEL, POOL_LABEL_WARM, STATE_LABEL, WARM_STATE_CLAIMED
        );
        let claimed = self.orchestrator.list_namespaces(Some(&selector)).await?;
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.cfg.idle_ttl).unwrap_or(chrono::TimeDelta::MAX);
        for ns in claimed {
            let Some(last) = ns.last_exec_unix() else {
                continue;
            };
            if last == 0 {
                continue;
            }
            let Some(last) = DateTime::from_timestamp(last, 0) else {
                continue;
            };
            if now - last > ttl {
                if let Err(err) = self.orchestrator.delete_namespace(&ns.name).await {
                    tracing::warn!("reap warm namespace {}: {}", ns.name, err);
                } else {
                    tracing::info!("reaped idle warm namespace {}", ns.name);
                }
            }
        }
        Ok(())
    }

    async fn ensure_control_namespace(&self) -> OrchestratorResult<()> {
        self.orchestrator
            .ensure_namespace(&self.control_namespace, &BTreeMap::new(), &BTreeMap::new())
            .await
    }

    async fn create_warm_namespace(&self, name: &str) -> OrchestratorResult<()> {
        let labels = BTreeMap::from([
            (POOL_LABEL.to_string(), POOL_LABEL_WARM.to_string()),
            (STATE_LABEL.to_string(), WARM_STATE_CREATING.to_string()),
        ]);
        let annotations =
            BTreeMap::from([(LAST_EXEC_ANNOTATION.to_string(), "0".to_string())]);
        self.orchestrator
            .ensure_namespace(name, &labels, &annotations)
            .await?;

        if self.cache.mode == "pvc" {
            self.orchestrator
                .ensure_pvc(name, crate::config::CACHE_PVC_NAME, &PvcSpec::for_cache(&self.cache))
                .await?;
        }

        let spec = SandboxPodSpec::builder()
            .image(self.image.clone())
            .command(vec!["sleep".to_string(), "infinity".to_string()])
            .volume_mode("emptydir")
            .cache(self.cache.clone())
            .stream(self.stream.clone())
            .env(self.env.clone())
            .labels(BTreeMap::from([(
                "sbx.warm".to_string(),
                "true".to_string(),
            )]))
            .resources(self.resources.clone())
            .build();
        self.orchestrator
            .ensure_pod(name, SANDBOX_POD_NAME, &spec)
            .await
    }

    #[cfg(test)]
    pub(crate) fn recent_len(&self) -> usize {
        self.inner.lock().unwrap().recent.len()
    }

    #[cfg(test)]
    pub(crate) fn set_recent(&self, times: Vec<DateTime<Utc>>) {
        self.inner.lock().unwrap().recent = times;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses the numeric index out of a `sbx-warm-<n>` namespace name.
fn warm_index(name: &str) -> Option<usize> {
    name.strip_prefix(WARM_NAMESPACE_PREFIX)?.parse().ok()
}

fn prune(recent: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>) {
    let window = chrono::Duration::from_std(WARM_WINDOW).expect("static window");
    recent.retain(|t| now.signed_duration_since(*t) <= window);
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::orchestrator::fake::FakeOrchestrator;

    use super::*;

    fn pool_with(yaml: &str, fake: Arc<FakeOrchestrator>) -> WarmPool {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        WarmPool::new(fake, &config, Arc::new(Metrics::new()))
    }

    async fn make_ready(fake: &FakeOrchestrator, pool: &WarmPool, name: &str) {
        fake.set_pod_ready(name, SANDBOX_POD_NAME, true);
        pool.reconcile_once().await.unwrap();
        assert_eq!(
            fake.namespace(name).unwrap().label(STATE_LABEL),
            Some(WARM_STATE_READY)
        );
    }

    #[test]
    fn test_enabled() {
        let fake = Arc::new(FakeOrchestrator::new());
        assert!(!pool_with("{}", fake.clone()).enabled());
        assert!(pool_with("warm_pool_size: 2", fake.clone()).enabled());
        assert!(pool_with("warm_pool_autosize: true\nwarm_pool_min: 1", fake.clone()).enabled());
        assert!(pool_with("warm_pool_autosize: true", fake).enabled());
    }

    #[test]
    fn test_desired_size_fixed() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with("warm_pool_size: 3", fake);
        assert_eq!(pool.desired_size(), 3);
        pool.record_create();
        assert_eq!(pool.desired_size(), 3);
    }

    #[test]
    fn test_desired_size_autosize_clamps_to_recent_demand() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with(
            "warm_pool_autosize: true\nwarm_pool_min: 1\nwarm_pool_max: 2",
            fake,
        );
        assert_eq!(pool.desired_size(), 1);

        pool.record_create();
        pool.record_create();
        pool.record_create();
        assert_eq!(pool.desired_size(), 2);

        // Entries older than the window are pruned away.
        let old = Utc::now() - chrono::Duration::seconds(120);
        pool.set_recent(vec![old, old, Utc::now()]);
        assert_eq!(pool.desired_size(), 1);
        assert_eq!(pool.recent_len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_creates_missing_warm_namespaces() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with("warm_pool_size: 2", fake.clone());
        pool.reconcile_once().await.unwrap();

        let ns1 = fake.namespace("sbx-warm-1").unwrap();
        assert_eq!(ns1.label(POOL_LABEL), Some(POOL_LABEL_WARM));
        assert_eq!(ns1.label(STATE_LABEL), Some(WARM_STATE_CREATING));
        assert_eq!(ns1.annotation(LAST_EXEC_ANNOTATION), Some("0"));
        assert!(fake.has_pod("sbx-warm-1", SANDBOX_POD_NAME));
        assert!(fake.namespace("sbx-warm-2").is_some());

        let spec = fake.pod_spec("sbx-warm-1", SANDBOX_POD_NAME).unwrap();
        assert_eq!(spec.command, vec!["sleep".to_string(), "infinity".to_string()]);
    }

    #[tokio::test]
    async fn test_reconcile_fills_unused_indices_and_never_deletes() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with("warm_pool_size: 2", fake.clone());

        // An existing claimed warm namespace occupies index 1.
        fake.ensure_namespace(
            "sbx-warm-1",
            &BTreeMap::from([
                (POOL_LABEL.to_string(), POOL_LABEL_WARM.to_string()),
                (STATE_LABEL.to_string(), WARM_STATE_CLAIMED.to_string()),
            ]),
            &BTreeMap::new(),
        )
        .await
        .unwrap();

        pool.reconcile_once().await.unwrap();
        assert!(fake.namespace("sbx-warm-2").is_some());
        // The claimed namespace is counted, not replaced or deleted.
        assert_eq!(
            fake.namespace("sbx-warm-1").unwrap().label(STATE_LABEL),
            Some(WARM_STATE_CLAIMED)
        );
        assert_eq!(
            fake.namespace_names()
                .iter()
                .filter(|n| n.starts_with(WARM_NAMESPACE_PREFIX))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_reconcile_promotes_ready_pods() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with("warm_pool_size: 1", fake.clone());
        pool.reconcile_once().await.unwrap();
        assert_eq!(
            fake.namespace("sbx-warm-1").unwrap().label(STATE_LABEL),
            Some(WARM_STATE_CREATING)
        );

        make_ready(&fake, &pool, "sbx-warm-1").await;
    }

    #[tokio::test]
    async fn test_claim_takes_lowest_index_first() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with("warm_pool_size: 2", fake.clone());
        pool.reconcile_once().await.unwrap();
        make_ready(&fake, &pool, "sbx-warm-1").await;
        make_ready(&fake, &pool, "sbx-warm-2").await;

        let claimed = pool.claim("abc123").await.unwrap();
        assert_eq!(claimed.as_deref(), Some("sbx-warm-1"));

        let record = fake.namespace("sbx-warm-1").unwrap();
        assert_eq!(record.label(STATE_LABEL), Some(WARM_STATE_CLAIMED));
        assert_eq!(record.label(EXTERNAL_ID_LABEL), Some("abc123"));
        assert_ne!(record.annotation(LAST_EXEC_ANNOTATION), Some("0"));

        let claimed = pool.claim("").await.unwrap();
        assert_eq!(claimed.as_deref(), Some("sbx-warm-2"));

        assert_eq!(pool.claim("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_skips_unready_pods() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with("warm_pool_size: 1", fake.clone());
        pool.reconcile_once().await.unwrap();
        make_ready(&fake, &pool, "sbx-warm-1").await;
        fake.set_pod_ready("sbx-warm-1", SANDBOX_POD_NAME, false);

        assert_eq!(pool.claim("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_exactly_one_winner() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = Arc::new(pool_with("warm_pool_size: 1", fake.clone()));
        pool.reconcile_once().await.unwrap();
        make_ready(&fake, &pool, "sbx-warm-1").await;

        let (a, b) = tokio::join!(
            tokio::spawn({
                let pool = pool.clone();
                async move { pool.claim("a").await.unwrap() }
            }),
            tokio::spawn({
                let pool = pool.clone();
                async move { pool.claim("b").await.unwrap() }
            }),
        );
        let results = [a.unwrap(), b.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_stale_claim_update_conflicts() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with("warm_pool_size: 1", fake.clone());
        pool.reconcile_once().await.unwrap();
        make_ready(&fake, &pool, "sbx-warm-1").await;

        // Snapshot the candidate, let a claim win, then replay the stale
        // update the way a losing claimer would.
        let stale = fake.namespace("sbx-warm-1").unwrap();
        pool.claim("winner").await.unwrap().unwrap();
        let err = fake.update_namespace(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_reap_idle_deletes_only_stale_claimed() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with("warm_pool_size: 3\nidle_ttl: 1s", fake.clone());
        pool.reconcile_once().await.unwrap();

        let stale = (Utc::now() - chrono::Duration::seconds(600)).timestamp();
        for (name, state, last) in [
            ("sbx-warm-1", WARM_STATE_CLAIMED, stale.to_string()),
            ("sbx-warm-2", WARM_STATE_CLAIMED, "0".to_string()),
            ("sbx-warm-3", WARM_STATE_READY, stale.to_string()),
        ] {
            let mut record = fake.namespace(name).unwrap();
            record
                .labels
                .insert(STATE_LABEL.to_string(), state.to_string());
            record
                .annotations
                .insert(LAST_EXEC_ANNOTATION.to_string(), last);
            fake.update_namespace(&record).await.unwrap();
        }

        pool.reap_idle().await.unwrap();
        assert!(fake.namespace("sbx-warm-1").is_none());
        assert!(fake.namespace("sbx-warm-2").is_some());
        assert!(fake.namespace("sbx-warm-3").is_some());
    }

    #[tokio::test]
    async fn test_rebuild_rehydrates_recent_window() {
        let fake = Arc::new(FakeOrchestrator::new());
        let pool = pool_with(
            "warm_pool_autosize: true\nwarm_pool_max: 5",
            fake.clone(),
        );

        for (name, last) in [
            ("sbx-aaa", Utc::now().timestamp()),
            ("sbx-bbb", Utc::now().timestamp() - 10),
            ("sbx-old", Utc::now().timestamp() - 600),
        ] {
            fake.ensure_namespace(name, &BTreeMap::new(), &BTreeMap::new())
                .await
                .unwrap();
            fake.set_annotation(name, LAST_EXEC_ANNOTATION, &last.to_string());
        }

        pool.rebuild_from_cluster().await.unwrap();
        assert_eq!(pool.recent_len(), 2);
    }
}
