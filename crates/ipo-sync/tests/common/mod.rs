//! Test doubles shared by the pipeline and scheduler tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipo_adapters::{NotificationService, Session, SourceClient, StaticSourceClient};
use ipo_core::{
    AuthError, CachePublishError, CacheReadError, Credentials, CycleRequest, FetchError,
    NotifyError, Offering, PersistenceError, RawOffering, UpsertOutcome,
};
use ipo_storage::{InMemoryRecordStore, InMemorySnapshotCache, RecordStore, SnapshotCache};
use ipo_sync::{IngestionPipeline, PipelineSettings};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub fn creds() -> Credentials {
    Credentials::new("13700", "investor", "secret")
}

pub fn request() -> CycleRequest {
    CycleRequest::new(creds(), vec!["investor@example.com".to_string()])
}

pub fn raw(name: &str, kind: &str, group: &str) -> RawOffering {
    RawOffering::new(name, kind, group)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    Accept,
    RejectAll,
    Fail,
    Hang,
    Panic,
    /// Accepts after spending the given time on each recipient.
    SlowPerRecipient(Duration),
}

/// Notifier that records every call.
#[derive(Debug)]
pub struct RecordingNotifier {
    mode: NotifyMode,
    pub calls: Mutex<Vec<(Vec<String>, Vec<Offering>)>>,
}

impl RecordingNotifier {
    pub fn new(mode: NotifyMode) -> Self {
        Self {
            mode,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn notified_names(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|(_, offerings)| offerings.iter().map(|o| o.name.clone()).collect())
            .collect()
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn notify(&self, recipients: &[String], offerings: &[Offering]) -> Result<bool, NotifyError> {
        self.calls
            .lock()
            .await
            .push((recipients.to_vec(), offerings.to_vec()));
        match self.mode {
            NotifyMode::Accept => Ok(true),
            NotifyMode::RejectAll => Ok(false),
            NotifyMode::Fail => Err(NotifyError::Transport("smtp relay unreachable".into())),
            NotifyMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(true)
            }
            NotifyMode::Panic => panic!("mail template crashed"),
            NotifyMode::SlowPerRecipient(each) => {
                for _ in recipients {
                    tokio::time::sleep(each).await;
                }
                Ok(true)
            }
        }
    }
}

/// Cache whose publish always fails.
#[derive(Debug, Default)]
pub struct BrokenCache;

#[async_trait]
impl SnapshotCache for BrokenCache {
    fn key(&self) -> &str {
        "ipo_list"
    }

    async fn publish_raw(&self, _payload: String, _ttl: Duration) -> Result<(), CachePublishError> {
        Err(CachePublishError::Backend("connection refused".into()))
    }

    async fn read_raw(&self) -> Result<Option<String>, CacheReadError> {
        Ok(None)
    }
}

/// Store that fails after `ok_writes` successful upserts.
pub struct FailingStore {
    inner: InMemoryRecordStore,
    ok_writes: usize,
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn new(ok_writes: usize) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            ok_writes,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn upsert(&self, raw: &RawOffering) -> Result<UpsertOutcome, PersistenceError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.ok_writes {
            return Err(PersistenceError::Write("deadlock detected".into()));
        }
        self.inner.upsert(raw).await
    }

    async fn list_all(&self) -> Result<Vec<Offering>, PersistenceError> {
        self.inner.list_all().await
    }

    async fn clear(&self) -> Result<u64, PersistenceError> {
        self.inner.clear().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFault {
    None,
    RejectLogin,
    FetchError,
    Panic,
    HangOnLogin,
    HangOnFetch,
}

/// Source wrapper that can fail its first `faulty_calls` cycles and tracks sessions.
pub struct ScriptedSource {
    inner: StaticSourceClient,
    fault: SourceFault,
    faulty_calls: usize,
    pub authenticated: AtomicUsize,
    pub closed: AtomicUsize,
    pub fetch_started_at: Mutex<Vec<Instant>>,
}

impl ScriptedSource {
    pub fn new(offerings: Vec<RawOffering>) -> Self {
        Self::faulty(offerings, SourceFault::None, 0)
    }

    pub fn faulty(offerings: Vec<RawOffering>, fault: SourceFault, faulty_calls: usize) -> Self {
        Self {
            inner: StaticSourceClient::new(offerings),
            fault,
            faulty_calls,
            authenticated: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            fetch_started_at: Mutex::new(Vec::new()),
        }
    }

    pub async fn replace_offerings(&self, offerings: Vec<RawOffering>) {
        self.inner.replace_offerings(offerings).await;
    }

    pub fn authenticated(&self) -> usize {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let call = self.authenticated.fetch_add(1, Ordering::SeqCst);
        if call < self.faulty_calls {
            match self.fault {
                SourceFault::RejectLogin => return Err(AuthError::Rejected("invalid password".into())),
                SourceFault::HangOnLogin => tokio::time::sleep(Duration::from_secs(3600)).await,
                _ => {}
            }
        }
        self.inner.authenticate(credentials).await
    }

    async fn list_current_offerings(&self, session: &Session) -> Result<Vec<RawOffering>, FetchError> {
        let mut started = self.fetch_started_at.lock().await;
        let call = started.len();
        started.push(Instant::now());
        drop(started);

        if call < self.faulty_calls {
            match self.fault {
                SourceFault::FetchError => {
                    return Err(FetchError::Transport("portal returned 502".into()))
                }
                SourceFault::Panic => panic!("scraper crashed"),
                SourceFault::HangOnFetch => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                SourceFault::None | SourceFault::RejectLogin | SourceFault::HangOnLogin => {}
            }
        }
        self.inner.list_current_offerings(session).await
    }

    async fn close(&self, session: &mut Session) {
        if session.mark_closed() {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub store: Arc<InMemoryRecordStore>,
    pub cache: Arc<InMemorySnapshotCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub pipeline: Arc<IngestionPipeline>,
}

impl Harness {
    pub fn new(source: ScriptedSource, notify: NotifyMode) -> Self {
        Self::with_settings(source, notify, PipelineSettings::default())
    }

    pub fn with_settings(source: ScriptedSource, notify: NotifyMode, settings: PipelineSettings) -> Self {
        let source = Arc::new(source);
        let store = Arc::new(InMemoryRecordStore::new());
        let cache = Arc::new(InMemorySnapshotCache::default());
        let notifier = Arc::new(RecordingNotifier::new(notify));
        let pipeline = Arc::new(IngestionPipeline::new(
            source.clone(),
            store.clone(),
            cache.clone(),
            notifier.clone(),
            settings,
        ));
        Self {
            source,
            store,
            cache,
            notifier,
            pipeline,
        }
    }
}
