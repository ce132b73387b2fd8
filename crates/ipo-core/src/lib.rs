//! Core domain model, cycle result and error taxonomy for IPO Watch.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ipo-core";

/// Dedup identity of an offering: `(name, group)`, compared byte-for-byte.
///
/// Values come straight from scraped text. No trimming or case folding happens here, so
/// `"Alpha Hydro"` and `"alpha hydro"` are two different offerings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OfferingKey {
    pub name: String,
    pub group: String,
}

impl OfferingKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

/// Offering record as handed over by a source client, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOffering {
    pub name: String,
    pub kind: String,
    pub group: String,
}

impl RawOffering {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            group: group.into(),
        }
    }

    pub fn key(&self) -> OfferingKey {
        OfferingKey::new(self.name.clone(), self.group.clone())
    }
}

/// Persisted offering. Serialized with the field names readers of the snapshot expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    #[serde(rename = "company_name")]
    pub name: String,
    #[serde(rename = "share_type")]
    pub kind: String,
    #[serde(rename = "share_group")]
    pub group: String,
    #[serde(rename = "issue_date")]
    pub observed_date: NaiveDate,
}

impl Offering {
    pub fn key(&self) -> OfferingKey {
        OfferingKey::new(self.name.clone(), self.group.clone())
    }
}

/// Result of a single keyed upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub offering: Offering,
    pub was_created: bool,
}

/// Snapshot published to the cache: a bare JSON array of offerings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheSnapshot {
    pub offerings: Vec<Offering>,
}

impl CacheSnapshot {
    pub fn new(offerings: Vec<Offering>) -> Self {
        Self { offerings }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn len(&self) -> usize {
        self.offerings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offerings.is_empty()
    }
}

/// Portal credentials: depository participant id, username and password.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub dp_id: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(dp_id: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            dp_id: dp_id.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.dp_id.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn ensure_complete(&self) -> Result<(), AuthError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(AuthError::MissingCredentials)
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("dp_id", &self.dp_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Inputs of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct CycleRequest {
    pub credentials: Credentials,
    pub recipients: Vec<String>,
}

impl CycleRequest {
    pub fn new(credentials: Credentials, recipients: Vec<String>) -> Self {
        Self {
            credentials,
            recipients,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Persist,
    Cache,
    Notify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Persist => "persist",
            Stage::Cache => "cache",
            Stage::Notify => "notify",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Skipped { reason: String },
    Failed { reason: String },
}

impl StageStatus {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStages {
    pub fetch: StageStatus,
    pub persist: StageStatus,
    pub cache: StageStatus,
    pub notify: StageStatus,
}

/// Outcome of a cycle that got past the fatal boundary (authenticate, fetch, persist).
#[derive(Debug, Clone, Serialize)]
pub struct SyncCycleResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub saved_offerings: Vec<Offering>,
    pub new_offerings: Vec<Offering>,
    pub stages: CycleStages,
}

impl SyncCycleResult {
    /// True when the non-fatal stages also went through.
    pub fn fully_succeeded(&self) -> bool {
        !self.stages.cache.is_failed() && !self.stages.notify.is_failed()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing source credentials (dp id, username and password are required)")]
    MissingCredentials,
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("authentication timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source unreachable: {0}")]
    Transport(String),
    #[error("could not parse source listing: {0}")]
    Parse(String),
    #[error("session is closed")]
    SessionClosed,
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("record store write failed: {0}")]
    Write(String),
    #[error("record store read failed: {0}")]
    Read(String),
}

#[derive(Debug, Error)]
pub enum CachePublishError {
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cache backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CacheReadError {
    #[error("cache backend: {0}")]
    Backend(String),
    #[error("cached payload is not a snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport: {0}")]
    Transport(String),
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure inside the fatal boundary of a cycle. No cache publish or notification
/// happened for the run that returned it.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl CycleError {
    pub fn stage(&self) -> Stage {
        match self {
            CycleError::Auth(_) | CycleError::Fetch(_) => Stage::Fetch,
            CycleError::Persistence(_) => Stage::Persist,
        }
    }

    pub fn is_missing_credentials(&self) -> bool {
        matches!(self, CycleError::Auth(AuthError::MissingCredentials))
    }
}
