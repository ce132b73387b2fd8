//! Offering sync: configuration, the ingestion pipeline and its schedulers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use ipo_adapters::{
    source_client_for_mode, EmailConfig, EmailNotifier, LogNotifier, NotificationService,
    Session, SourceClient, SourceMode,
};
use ipo_core::{
    AuthError, CacheSnapshot, Credentials, CycleError, CycleRequest, CycleStages, FetchError,
    NotifyError, Offering, OfferingKey, StageStatus, SyncCycleResult,
};
use ipo_storage::{
    InMemoryRecordStore, InMemorySnapshotCache, PgRecordStore, PgSnapshotCache, RecordStore,
    SnapshotCache, DEFAULT_CACHE_KEY, MIGRATOR,
};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ipo-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub credentials: Credentials,
    pub recipients: Vec<String>,
    pub source_mode: String,
    pub source_path: PathBuf,
    pub brevo_api_key: Option<String>,
    pub sender_email: String,
    pub sender_name: String,
    pub sync_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_key: String,
    pub auth_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub notify_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: Option<String>,
    pub admin_token: Option<String>,
    pub web_port: u16,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn parse_recipients(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |name: &str, default: u64| {
            lookup(name)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            database_url: non_empty(lookup("DATABASE_URL")),
            credentials: Credentials::new(
                lookup("MEROSHARE_DP_ID").unwrap_or_default(),
                lookup("MEROSHARE_USERNAME").unwrap_or_default(),
                lookup("MEROSHARE_PASSWORD").unwrap_or_default(),
            ),
            recipients: lookup("IPO_NOTIFY_RECIPIENTS")
                .map(|v| parse_recipients(&v))
                .unwrap_or_default(),
            source_mode: lookup("IPO_SOURCE_MODE").unwrap_or_else(|| "fixture".to_string()),
            source_path: lookup("IPO_SOURCE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures/current_issues.json")),
            brevo_api_key: non_empty(lookup("BREVO_API_KEY")),
            sender_email: lookup("IPO_SENDER_EMAIL")
                .unwrap_or_else(|| "no-reply@newspluk.com".to_string()),
            sender_name: lookup("IPO_SENDER_NAME").unwrap_or_else(|| "Mero-Lagani Team".to_string()),
            sync_interval_secs: secs("IPO_SYNC_INTERVAL_SECS", 14 * 60),
            cache_ttl_secs: secs("IPO_CACHE_TTL_SECS", 15 * 60),
            cache_key: non_empty(lookup("IPO_CACHE_KEY")).unwrap_or_else(|| DEFAULT_CACHE_KEY.to_string()),
            auth_timeout_secs: secs("IPO_AUTH_TIMEOUT_SECS", 30),
            fetch_timeout_secs: secs("IPO_FETCH_TIMEOUT_SECS", 60),
            notify_timeout_secs: secs("IPO_NOTIFY_TIMEOUT_SECS", 20),
            scheduler_enabled: lookup("IPO_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            sync_cron: non_empty(lookup("IPO_SYNC_CRON")),
            admin_token: non_empty(lookup("IPO_ADMIN_TOKEN")),
            web_port: lookup("IPO_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.sync_interval_secs > 0, "IPO_SYNC_INTERVAL_SECS must be positive");
        ensure!(
            self.cache_ttl_secs > self.sync_interval_secs,
            "IPO_CACHE_TTL_SECS ({}) must exceed IPO_SYNC_INTERVAL_SECS ({}) or readers see cache misses between cycles",
            self.cache_ttl_secs,
            self.sync_interval_secs
        );
        ensure!(
            self.auth_timeout_secs > 0 && self.fetch_timeout_secs > 0 && self.notify_timeout_secs > 0,
            "step timeouts must be positive"
        );
        self.source_mode()?;
        Ok(())
    }

    /// Database URL for commands that only make sense against the persistent store.
    pub fn require_database_url(&self, command: &str) -> Result<&str> {
        self.database_url
            .as_deref()
            .with_context(|| format!("DATABASE_URL is required for {command}; the in-memory store starts empty"))
    }

    pub fn source_mode(&self) -> Result<SourceMode> {
        self.source_mode.parse()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            notify_timeout: Duration::from_secs(self.notify_timeout_secs),
        }
    }

    pub fn cycle_request(&self) -> CycleRequest {
        CycleRequest::new(self.credentials.clone(), self.recipients.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub cache_ttl: Duration,
    pub auth_timeout: Duration,
    pub fetch_timeout: Duration,
    pub notify_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(900),
            auth_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
            notify_timeout: Duration::from_secs(20),
        }
    }
}

/// Runs ingestion cycles: fetch, upsert, diff, cache publish, notify.
///
/// Every run goes through one gate owned by the pipeline, so scheduled ticks, cron jobs
/// and on-demand refreshes never overlap.
pub struct IngestionPipeline {
    source: Arc<dyn SourceClient>,
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn SnapshotCache>,
    notifier: Arc<dyn NotificationService>,
    settings: PipelineSettings,
    gate: Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn SnapshotCache>,
        notifier: Arc<dyn NotificationService>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            store,
            cache,
            notifier,
            settings,
            gate: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn SnapshotCache> {
        &self.cache
    }

    /// True while a cycle holds the gate.
    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Runs one cycle, waiting for any cycle already in flight to finish first.
    pub async fn run(&self, request: &CycleRequest) -> Result<SyncCycleResult, CycleError> {
        let _running = self.gate.lock().await;
        self.run_traced(request).await
    }

    /// Serves the cached snapshot if one is live once the gate is held, otherwise runs a
    /// cycle. Readers queued behind a cold-start cycle get its snapshot instead of
    /// scraping again.
    pub async fn snapshot_or_run(&self, request: &CycleRequest) -> Result<SnapshotOrRun, CycleError> {
        let _running = self.gate.lock().await;
        match self.cache.read_raw().await {
            Ok(Some(payload)) => return Ok(SnapshotOrRun::Cached(payload)),
            Ok(None) => {}
            Err(err) => warn!(key = self.cache.key(), error = %err, "cache read failed under gate"),
        }
        self.run_traced(request).await.map(SnapshotOrRun::Ran)
    }

    async fn run_traced(&self, request: &CycleRequest) -> Result<SyncCycleResult, CycleError> {
        let run_id = Uuid::new_v4();
        self.run_locked(run_id, request)
            .instrument(info_span!("sync_cycle", %run_id))
            .await
    }

    async fn run_locked(&self, run_id: Uuid, request: &CycleRequest) -> Result<SyncCycleResult, CycleError> {
        let started_at = Utc::now();
        info!(source = self.source.source_id(), "starting offering sync");

        request.credentials.ensure_complete()?;
        let session = match timeout(
            self.settings.auth_timeout,
            self.source.authenticate(&request.credentials),
        )
        .await
        {
            Ok(session) => session?,
            Err(_) => return Err(AuthError::Timeout(self.settings.auth_timeout).into()),
        };
        let guard = SessionGuard::new(self.source.clone(), session);

        let outcome = self.run_with_session(guard.session(), request).await;
        guard.close().await;

        let (fetched, saved_offerings, new_offerings, cache, notify) = outcome?;
        let result = SyncCycleResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched,
            saved_offerings,
            new_offerings,
            stages: CycleStages {
                fetch: StageStatus::Succeeded,
                persist: StageStatus::Succeeded,
                cache,
                notify,
            },
        };
        info!(
            fetched = result.fetched,
            saved = result.saved_offerings.len(),
            new = result.new_offerings.len(),
            "offering sync finished"
        );
        Ok(result)
    }

    async fn run_with_session(
        &self,
        session: &Session,
        request: &CycleRequest,
    ) -> Result<(usize, Vec<Offering>, Vec<Offering>, StageStatus, StageStatus), CycleError> {
        let raw = match timeout(
            self.settings.fetch_timeout,
            self.source.list_current_offerings(session),
        )
        .await
        {
            Ok(listing) => listing?,
            Err(_) => return Err(FetchError::Timeout(self.settings.fetch_timeout).into()),
        };
        info!(fetched = raw.len(), "fetched current offerings");

        let (saved, new) = self.persist(&raw).await?;

        // Cache and notification degrade independently of each other and never undo
        // the upserts above.
        let cache = self.publish_snapshot(&saved).await;
        let notify = self.notify_new(&request.recipients, &new).await;
        Ok((raw.len(), saved, new, cache, notify))
    }

    /// Upserts every raw offering. Returns each key seen (first-seen order, latest
    /// stored state) and the subset created by this cycle.
    async fn persist(
        &self,
        raw: &[ipo_core::RawOffering],
    ) -> Result<(Vec<Offering>, Vec<Offering>), CycleError> {
        let mut saved: Vec<Offering> = Vec::with_capacity(raw.len());
        let mut positions: HashMap<OfferingKey, usize> = HashMap::new();
        let mut created: Vec<usize> = Vec::new();

        for item in raw {
            let outcome = self.store.upsert(item).await?;
            let key = outcome.offering.key();
            let idx = match positions.get(&key) {
                Some(&idx) => {
                    saved[idx] = outcome.offering;
                    idx
                }
                None => {
                    positions.insert(key, saved.len());
                    saved.push(outcome.offering);
                    saved.len() - 1
                }
            };
            if outcome.was_created {
                created.push(idx);
            }
        }

        let new = created.into_iter().map(|idx| saved[idx].clone()).collect::<Vec<_>>();
        info!(saved = saved.len(), new = new.len(), "persisted offerings");
        Ok((saved, new))
    }

    async fn publish_snapshot(&self, saved: &[Offering]) -> StageStatus {
        let snapshot = CacheSnapshot::new(saved.to_vec());
        match self.cache.publish(&snapshot, self.settings.cache_ttl).await {
            Ok(()) => {
                info!(
                    key = self.cache.key(),
                    ttl_secs = self.settings.cache_ttl.as_secs(),
                    offerings = snapshot.len(),
                    "published offering snapshot"
                );
                StageStatus::Succeeded
            }
            Err(err) => {
                error!(key = self.cache.key(), error = %err, "snapshot publish failed; cache may be stale");
                StageStatus::failed(err)
            }
        }
    }

    async fn notify_new(&self, recipients: &[String], new: &[Offering]) -> StageStatus {
        if new.is_empty() {
            return StageStatus::skipped("no new offerings");
        }
        if recipients.is_empty() {
            warn!(new = new.len(), "new offerings found but no recipients are configured");
            return StageStatus::skipped("no recipients configured");
        }

        // Transports send one message per recipient, each bounded by notify_timeout.
        let per_recipient = u32::try_from(recipients.len()).unwrap_or(u32::MAX);
        let limit = self.settings.notify_timeout.saturating_mul(per_recipient);
        match timeout(limit, self.notifier.notify(recipients, new)).await {
            Ok(Ok(true)) => {
                info!(recipients = recipients.len(), new = new.len(), "notified subscribers");
                StageStatus::Succeeded
            }
            Ok(Ok(false)) => {
                warn!(recipients = recipients.len(), "no recipient accepted the notification");
                StageStatus::failed("no recipient accepted the notification")
            }
            Ok(Err(err)) => {
                error!(error = %err, "notification failed");
                StageStatus::failed(err)
            }
            Err(_) => {
                let err = NotifyError::Timeout(limit);
                error!(error = %err, "notification failed");
                StageStatus::failed(err)
            }
        }
    }
}

/// Outcome of [`IngestionPipeline::snapshot_or_run`].
#[derive(Debug)]
pub enum SnapshotOrRun {
    /// Raw JSON payload found in the cache.
    Cached(String),
    Ran(SyncCycleResult),
}

/// Owns an open session until `close` is awaited. If the cycle unwinds or its future is
/// dropped first, the close is handed to the runtime instead.
struct SessionGuard {
    source: Arc<dyn SourceClient>,
    session: Session,
}

impl SessionGuard {
    fn new(source: Arc<dyn SourceClient>, session: Session) -> Self {
        Self { source, session }
    }

    fn session(&self) -> &Session {
        &self.session
    }

    async fn close(mut self) {
        self.source.close(&mut self.session).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.session.is_closed() {
            return;
        }
        let session_id = self.session.id();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(%session_id, "cycle ended abnormally; releasing source session in background");
                let source = self.source.clone();
                let mut session = self.session.clone();
                runtime.spawn(async move { source.close(&mut session).await });
            }
            Err(_) => warn!(%session_id, "no runtime left to release source session"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    running: AtomicBool,
    stopped: AtomicBool,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
}

impl SchedulerStats {
    pub fn state(&self) -> SchedulerState {
        if self.stopped.load(Ordering::SeqCst) {
            SchedulerState::Stopped
        } else if self.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    /// Cycles that ran to completion or failure, panics included.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::SeqCst)
    }

    pub fn cycles_failed(&self) -> u64 {
        self.cycles_failed.load(Ordering::SeqCst)
    }
}

/// Fixed-delay periodic driver for [`IngestionPipeline`].
///
/// Runs a cycle immediately, then sleeps `interval` after each cycle whatever its
/// outcome. Cycles run one after another on a single task.
pub struct Scheduler {
    pipeline: Arc<IngestionPipeline>,
    request: CycleRequest,
    interval: Duration,
}

impl Scheduler {
    pub fn new(pipeline: Arc<IngestionPipeline>, request: CycleRequest, interval: Duration) -> Result<Self> {
        ensure!(!interval.is_zero(), "scheduler interval must be positive");
        let ttl = pipeline.settings().cache_ttl;
        ensure!(
            ttl > interval,
            "cache ttl {ttl:?} must exceed scheduler interval {interval:?}"
        );
        Ok(Self {
            pipeline,
            request,
            interval,
        })
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(SchedulerStats::default());
        let task = tokio::spawn(self.run_loop(shutdown_rx, stats.clone()));
        SchedulerHandle {
            shutdown: shutdown_tx,
            stats,
            task,
        }
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>, stats: Arc<SchedulerStats>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "offering sync scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }

            stats.running.store(true, Ordering::SeqCst);
            let pipeline = self.pipeline.clone();
            let request = self.request.clone();
            // A separate task turns a panic inside the cycle into a JoinError.
            let cycle = tokio::spawn(async move { pipeline.run(&request).await });
            match cycle.await {
                Ok(Ok(result)) => {
                    info!(run_id = %result.run_id, new = result.new_offerings.len(), "scheduled sync completed");
                }
                Ok(Err(err)) => {
                    stats.cycles_failed.fetch_add(1, Ordering::SeqCst);
                    error!(stage = %err.stage(), error = %err, "scheduled sync failed");
                }
                Err(join_err) => {
                    stats.cycles_failed.fetch_add(1, Ordering::SeqCst);
                    error!(error = %join_err, "scheduled sync aborted unexpectedly");
                }
            }
            stats.running.store(false, Ordering::SeqCst);
            stats.cycles_completed.fetch_add(1, Ordering::SeqCst);

            info!(secs = self.interval.as_secs(), "scheduler sleeping");
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        stats.stopped.store(true, Ordering::SeqCst);
        info!("offering sync scheduler stopped");
    }
}

/// Running scheduler. Dropping the handle also ends the loop after the current cycle.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    stats: Arc<SchedulerStats>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    pub fn state(&self) -> SchedulerState {
        self.stats.state()
    }

    /// Signals shutdown and waits for the in-flight cycle, if any, to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            error!(error = %err, "scheduler task ended abnormally");
        }
    }
}

/// Optional cron-driven trigger on top of the interval scheduler. Jobs share the
/// pipeline gate, so a cron tick during a scheduled cycle waits for it.
pub async fn maybe_build_cron_scheduler(
    config: &SyncConfig,
    pipeline: Arc<IngestionPipeline>,
) -> Result<Option<JobScheduler>> {
    let Some(cron) = config.sync_cron.as_deref() else {
        return Ok(None);
    };

    let sched = JobScheduler::new().await.context("creating cron scheduler")?;
    let request = config.cycle_request();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let request = request.clone();
        Box::pin(async move {
            match pipeline.run(&request).await {
                Ok(result) => info!(run_id = %result.run_id, "cron sync completed"),
                Err(err) => error!(stage = %err.stage(), error = %err, "cron sync failed"),
            }
        })
    })
    .with_context(|| format!("creating cron job for {cron}"))?;
    sched.add(job).await.context("adding cron job")?;
    Ok(Some(sched))
}

pub async fn connect_database(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("connecting to DATABASE_URL")?;
    MIGRATOR.run(&pool).await.context("applying migrations")?;
    Ok(pool)
}

/// Wires the pipeline from configuration: Postgres when `DATABASE_URL` is set, in-memory
/// otherwise; email when `BREVO_API_KEY` is set, log-only otherwise.
pub async fn build_pipeline(config: &SyncConfig) -> Result<Arc<IngestionPipeline>> {
    config.validate()?;

    let source: Arc<dyn SourceClient> =
        Arc::from(source_client_for_mode(config.source_mode()?, config.source_path.clone()));

    let (store, cache): (Arc<dyn RecordStore>, Arc<dyn SnapshotCache>) = match &config.database_url {
        Some(url) => {
            let pool = connect_database(url).await?;
            (
                Arc::new(PgRecordStore::new(pool.clone())),
                Arc::new(PgSnapshotCache::new(pool, config.cache_key.clone())),
            )
        }
        None => {
            warn!("DATABASE_URL not set; offerings and snapshot live in memory only");
            (
                Arc::new(InMemoryRecordStore::new()),
                Arc::new(InMemorySnapshotCache::new(config.cache_key.clone())),
            )
        }
    };

    let notifier: Arc<dyn NotificationService> = match &config.brevo_api_key {
        Some(api_key) => {
            let mut email = EmailConfig::new(api_key.clone());
            email.sender_email = config.sender_email.clone();
            email.sender_name = config.sender_name.clone();
            email.timeout = Duration::from_secs(config.notify_timeout_secs);
            Arc::new(EmailNotifier::new(email)?)
        }
        None => {
            warn!("BREVO_API_KEY not set; new offerings are only logged");
            Arc::new(LogNotifier)
        }
    };

    if !config.credentials.is_complete() {
        warn!("source credentials incomplete; every cycle will fail until MEROSHARE_* is set");
    }

    Ok(Arc::new(IngestionPipeline::new(
        source,
        store,
        cache,
        notifier,
        config.pipeline_settings(),
    )))
}

pub async fn run_sync_once_from_env() -> Result<SyncCycleResult> {
    let config = SyncConfig::from_env();
    let pipeline = build_pipeline(&config).await?;
    let result = pipeline.run(&config.cycle_request()).await?;
    Ok(result)
}
