use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Directory,
    File,
    DiskImage,
    SeedIso,
    Domain,
    Network,
}

/// An element in a live transaction. Ordering in the owning transaction's
/// artifact list reflects creation order; cleanup is strictly reverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Path for filesystem artifacts, domain/network name otherwise.
    pub identifier: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    InProgress,
    Committed,
    RolledBack,
    FailedRollback,
}

/// Persisted per-transaction record. Created on transaction open, updated
/// on each artifact registration, deleted on commit, retained on
/// rollback/failure for audit and crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionJournal {
    pub transaction_id: String,
    pub target_name: String,
    pub state: TransactionState,
    pub artifacts: Vec<Artifact>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
