//! Operations Registry.
//!
//! In-memory mapping operation-id -> Operation Record, plus a parallel
//! mapping operation-id -> worker task handle. Writers never hold the lock
//! across an `.await`, so the critical section stays small and hot even
//! though the process as a whole is a single-threaded cooperative scheduler.

pub mod orchestrator;
pub mod progress;

use crate::error::{KtrdrError, KtrdrResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    DataLoad,
    Training,
    Backtesting,
    Other,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataLoad => "data-load",
            Self::Training => "training",
            Self::Backtesting => "backtesting",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for OperationKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Cancelling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Serialize for OperationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub percentage: f64,
    pub current_step: String,
    pub context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationError {
    pub message: String,
    pub category: String,
    pub detail: HashMap<String, String>,
}

impl From<&KtrdrError> for OperationError {
    fn from(e: &KtrdrError) -> Self {
        Self {
            message: e.to_string(),
            category: e.category().to_string(),
            detail: e.detail(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
    pub progress: Progress,
    pub result_summary: Option<serde_json::Value>,
    pub error: Option<OperationError>,
    pub cancellation_reason: Option<String>,
}

impl OperationRecord {
    /// Exactly one of {result-summary, error} is populated in any terminal
    /// state; this asserts that invariant for tests and debug builds.
    pub fn terminal_invariant_holds(&self) -> bool {
        if !self.status.is_terminal() {
            return true;
        }
        match self.status {
            OperationStatus::Completed => self.result_summary.is_some() && self.error.is_none(),
            OperationStatus::Failed => self.error.is_some() && self.result_summary.is_none(),
            OperationStatus::Cancelled => {
                self.result_summary.is_none() && self.cancellation_reason.is_some()
            }
            _ => unreachable!(),
        }
    }
}

/// Narrow control-channel capability for a training/backtesting worker
/// running in a detached host process, reached via its own channel — a
/// collaborator implements this, the Registry only consumes `status` for
/// live-progress amendment.
pub trait DetachedHostHandle: Send + Sync {
    fn status(&self, session_id: &str) -> KtrdrResult<DetachedStatus>;
}

#[derive(Debug, Clone, Default)]
pub struct DetachedStatus {
    pub epoch: usize,
    pub batch: usize,
    pub metrics: HashMap<String, String>,
}

#[derive(Debug, Default, Clone)]
pub struct ListFilters {
    pub kind: Option<OperationKind>,
    pub status: Option<OperationStatus>,
    pub active_only: bool,
}

struct Entry {
    record: OperationRecord,
    handle: Option<JoinHandle<()>>,
    seq: u64,
}

struct RegistryInner {
    entries: HashMap<String, Entry>,
}

/// Durable-within-process store of operation records, progress, results, and
/// concurrent task handles.
#[derive(Clone)]
pub struct OperationsRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    seq: Arc<AtomicU64>,
    detached_host: Arc<RwLock<Option<Arc<dyn DetachedHostHandle>>>>,
}

impl Default for OperationsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                entries: HashMap::new(),
            })),
            seq: Arc::new(AtomicU64::new(0)),
            detached_host: Arc::new(RwLock::new(None)),
        }
    }

    /// Wires the channel used for live-status amendment on `get`. Metadata
    /// key `detached_session_id` on a record marks it as backed by that
    /// channel; records without the key are never queried.
    pub fn set_detached_host_handle(&self, handle: Arc<dyn DetachedHostHandle>) {
        *self.detached_host.write() = Some(handle);
    }

    /// IDs encode the creation sequence as a zero-padded prefix so that
    /// lexicographic id order matches creation order — the tie-break the
    /// listing contract relies on when two records share a `created_at`.
    fn next_id(&self) -> (String, u64) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        (format!("{seq:020}-{}", Uuid::new_v4()), seq)
    }

    #[tracing::instrument(skip(self, metadata))]
    pub fn create(&self, kind: OperationKind, metadata: HashMap<String, String>) -> String {
        let (id, seq) = self.next_id();
        let record = OperationRecord {
            id: id.clone(),
            kind,
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata,
            progress: Progress::default(),
            result_summary: None,
            error: None,
            cancellation_reason: None,
        };
        self.inner.write().entries.insert(
            id.clone(),
            Entry {
                record,
                handle: None,
                seq,
            },
        );
        tracing::info!(operation_id = %id, kind = %kind, "operation created");
        id
    }

    pub fn start(&self, id: &str, handle: JoinHandle<()>) -> KtrdrResult<()> {
        let mut inner = self.inner.write();
        let entry = entry_mut(&mut inner, id)?;
        transition(&mut entry.record, OperationStatus::Running)?;
        entry.record.started_at = Some(Utc::now());
        entry.handle = Some(handle);
        Ok(())
    }

    /// Non-blocking, lock-free from the caller's point of view: the write
    /// lock is held only long enough to copy in the new values, never across
    /// an await. Percentage is clamped to be monotonically non-decreasing.
    pub fn update_progress(
        &self,
        id: &str,
        percentage: f64,
        current_step: impl Into<String>,
        context: HashMap<String, String>,
    ) -> KtrdrResult<()> {
        let mut inner = self.inner.write();
        let entry = entry_mut(&mut inner, id)?;
        let clamped = percentage.max(entry.record.progress.percentage).min(100.0);
        entry.record.progress = Progress {
            percentage: clamped,
            current_step: current_step.into(),
            context,
        };
        Ok(())
    }

    pub fn complete(&self, id: &str, result_summary: serde_json::Value) -> KtrdrResult<()> {
        let mut inner = self.inner.write();
        let entry = entry_mut(&mut inner, id)?;
        transition(&mut entry.record, OperationStatus::Completed)?;
        entry.record.result_summary = Some(result_summary);
        entry.record.completed_at = Some(Utc::now());
        entry.record.progress.percentage = 100.0;
        Ok(())
    }

    pub fn fail(&self, id: &str, error: impl Into<OperationError>) -> KtrdrResult<()> {
        let mut inner = self.inner.write();
        let entry = entry_mut(&mut inner, id)?;
        transition(&mut entry.record, OperationStatus::Failed)?;
        entry.record.error = Some(error.into());
        entry.record.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Requests cancellation. From `pending`/`running` this enters the
    /// transient `cancelling` state; a worker (or the orchestrator, once the
    /// detached host confirms) later calls `finalize_cancelled`.
    pub fn request_cancel(&self, id: &str, reason: impl Into<String>) -> KtrdrResult<()> {
        let mut inner = self.inner.write();
        let entry = entry_mut(&mut inner, id)?;
        let reason = reason.into();
        if entry.record.status.is_terminal() {
            return Err(KtrdrError::IllegalTransition {
                from: entry.record.status.as_str().to_string(),
                to: "cancelling".to_string(),
            });
        }
        if entry.record.status != OperationStatus::Cancelling {
            transition(&mut entry.record, OperationStatus::Cancelling)?;
        }
        entry.record.cancellation_reason = Some(reason);
        Ok(())
    }

    pub fn finalize_cancelled(&self, id: &str) -> KtrdrResult<()> {
        let mut inner = self.inner.write();
        let entry = entry_mut(&mut inner, id)?;
        transition(&mut entry.record, OperationStatus::Cancelled)?;
        entry.record.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Returns the stored record, amended at read-time with the detached
    /// host's latest epoch/batch/metrics when the operation is a running
    /// training session backed by one. The stored record is only mutated to
    /// the extent `update_progress` itself would mutate it; a failed or
    /// absent channel just serves the last known progress.
    pub fn get(&self, id: &str) -> Option<OperationRecord> {
        let mut record = self.inner.read().entries.get(id).map(|e| e.record.clone())?;
        self.amend_live_status(&mut record);
        Some(record)
    }

    fn amend_live_status(&self, record: &mut OperationRecord) {
        if record.kind != OperationKind::Training || record.status != OperationStatus::Running {
            return;
        }
        let Some(session_id) = record.metadata.get("detached_session_id").cloned() else {
            return;
        };
        let Some(handle) = self.detached_host.read().clone() else {
            return;
        };
        match handle.status(&session_id) {
            Ok(status) => {
                let mut context = status.metrics;
                context.insert("epoch_index".to_string(), status.epoch.to_string());
                context.insert("batch_number".to_string(), status.batch.to_string());
                let current_step = format!("Epoch {} (detached)", status.epoch);
                let _ = self.update_progress(
                    &record.id,
                    record.progress.percentage,
                    current_step.clone(),
                    context.clone(),
                );
                record.progress.current_step = current_step;
                record.progress.context = context;
            }
            Err(e) => {
                tracing::warn!(operation_id = %record.id, error = %e, "detached host status query failed; serving last known progress");
            }
        }
    }

    /// Sorted by created-at descending; ties broken by id descending (see
    /// [`Self::next_id`] for why that matches insertion order).
    pub fn list(
        &self,
        filters: &ListFilters,
        limit: usize,
        offset: usize,
    ) -> (Vec<OperationRecord>, usize, usize) {
        let inner = self.inner.read();
        let active_count = inner
            .entries
            .values()
            .filter(|e| e.record.status.is_active())
            .count();

        let mut matching: Vec<(u64, &OperationRecord)> = inner
            .entries
            .values()
            .map(|e| (e.seq, &e.record))
            .filter(|(_, r)| filters.kind.map_or(true, |k| k == r.kind))
            .filter(|(_, r)| {
                if filters.active_only {
                    r.status.is_active()
                } else {
                    filters.status.map_or(true, |s| s == r.status)
                }
            })
            .collect();

        // Ties broken by sequence number, which is what the id prefix
        // encodes; comparing it directly avoids relying on string ordering.
        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect();
        (page, total, active_count)
    }

    /// Permitted only for terminal records; the retried operation is
    /// independent of the one it was retried from.
    pub fn retry(&self, id: &str) -> KtrdrResult<String> {
        let (kind, metadata) = {
            let inner = self.inner.read();
            let entry = inner
                .entries
                .get(id)
                .ok_or_else(|| KtrdrError::invalid_input(format!("unknown operation {id}")))?;
            if !entry.record.status.is_terminal() {
                return Err(KtrdrError::IllegalTransition {
                    from: entry.record.status.as_str().to_string(),
                    to: "pending (retry)".to_string(),
                });
            }
            (entry.record.kind, entry.record.metadata.clone())
        };
        Ok(self.create(kind, metadata))
    }

    /// Removes terminal records older than `threshold`; never removes
    /// non-terminal records. Returns the number removed.
    pub fn cleanup_older_than(&self, threshold: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_default();
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| {
            !(e.record.status.is_terminal()
                && e.record.completed_at.map_or(false, |c| c < cutoff))
        });
        before - inner.entries.len()
    }
}

fn entry_mut<'a>(inner: &'a mut RegistryInner, id: &str) -> KtrdrResult<&'a mut Entry> {
    inner
        .entries
        .get_mut(id)
        .ok_or_else(|| KtrdrError::invalid_input(format!("unknown operation {id}")))
}

fn transition(record: &mut OperationRecord, to: OperationStatus) -> KtrdrResult<()> {
    let legal = matches!(
        (record.status, to),
        (OperationStatus::Pending, OperationStatus::Running)
            | (OperationStatus::Pending, OperationStatus::Cancelling)
            | (OperationStatus::Pending, OperationStatus::Completed)
            | (OperationStatus::Pending, OperationStatus::Failed)
            | (OperationStatus::Running, OperationStatus::Cancelling)
            | (OperationStatus::Running, OperationStatus::Completed)
            | (OperationStatus::Running, OperationStatus::Failed)
            | (OperationStatus::Cancelling, OperationStatus::Cancelled)
    );
    if !legal {
        return Err(KtrdrError::IllegalTransition {
            from: record.status.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    record.status = to;
    Ok(())
}
