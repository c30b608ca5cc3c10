use std::{collections::BTreeSet, sync::Arc};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{get_epoch_time_in_ms, UploadError, UploadResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Receiving,
    /// Every index in `0..total` is present and nobody has claimed the merge.
    Complete,
    Merging,
    Done,
    /// The last merge attempt failed. Chunks are kept so it can be retried.
    Failed { reason: String },
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Receiving => "receiving",
            SessionState::Complete => "complete",
            SessionState::Merging => "merging",
            SessionState::Done => "done",
            SessionState::Failed { .. } => "failed",
        }
    }
}

/// Result of recording one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub received_count: u32,
    pub total: Option<u32>,
    /// True only for the call whose insertion completed the set.
    pub is_complete: bool,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: String,
    pub state: SessionState,
    pub total: Option<u32>,
    pub received: Vec<u32>,
    pub missing: Vec<u32>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    total: Option<u32>,
    received: BTreeSet<u32>,
    state: SessionState,
    // Set once the entry has left the registry. Holders of a stale handle
    // must treat the session as closed.
    removed: bool,
    created_at: u64,
    updated_at: u64,
}

impl Session {
    pub fn new(id: &str) -> Self {
        let now = get_epoch_time_in_ms();
        Self {
            id: id.to_string(),
            total: None,
            received: BTreeSet::new(),
            state: SessionState::Receiving,
            removed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total(&self) -> Option<u32> {
        self.total
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Whether the sweep may drop this session: still open, not merging and
    /// untouched since `cutoff_ms`.
    pub fn is_idle_since(&self, cutoff_ms: u64) -> bool {
        !self.removed && self.state != SessionState::Merging && self.updated_at <= cutoff_ms
    }

    pub fn received_indices(&self) -> Vec<u32> {
        self.received.iter().copied().collect()
    }

    fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    fn closed(&self) -> UploadError {
        UploadError::SessionClosed {
            session: self.id.clone(),
        }
    }

    fn has_full_set(&self) -> bool {
        match self.total {
            // Indices are bounded by `total`, so the sizes matching means the
            // set is exactly `0..total`.
            Some(total) => {
                self.received_count() == total
                    && self.received.last().map_or(true, |last| *last < total)
            }
            None => false,
        }
    }

    pub fn missing_indices(&self) -> Vec<u32> {
        match self.total {
            Some(total) => (0..total).filter(|i| !self.received.contains(i)).collect(),
            None => Vec::new(),
        }
    }

    fn check_total(&self, total: u32, max_total: u32) -> UploadResult<()> {
        if total == 0 || total > max_total {
            return Err(UploadError::invalid_input(format!(
                "totalChunks must be between 1 and {max_total}, got {total}"
            )));
        }
        match self.total {
            Some(established) if established != total => Err(UploadError::TotalMismatch {
                session: self.id.clone(),
                established,
                declared: total,
            }),
            Some(_) => Ok(()),
            None => match self.received.last() {
                Some(&index) if index >= total => Err(UploadError::IndexOutOfRange {
                    session: self.id.clone(),
                    index,
                    bound: total,
                }),
                _ => Ok(()),
            },
        }
    }

    fn check_index(&self, index: u32, total: Option<u32>, max_total: u32) -> UploadResult<()> {
        if let Some(total) = total {
            self.check_total(total, max_total)?;
        }
        let bound = total.or(self.total).unwrap_or(max_total);
        if index >= bound {
            return Err(UploadError::IndexOutOfRange {
                session: self.id.clone(),
                index,
                bound,
            });
        }
        Ok(())
    }

    /// Validates a submission before its bytes are stored.
    ///
    /// Returns `Some` when the chunk was already received and the submission
    /// can be acknowledged without touching storage. A failed session always
    /// accepts re-uploads so a damaged chunk can be replaced.
    pub fn admit_chunk(
        &self,
        index: u32,
        total: Option<u32>,
        max_total: u32,
    ) -> UploadResult<Option<RecordOutcome>> {
        if self.removed || self.state == SessionState::Done {
            return Err(self.closed());
        }
        self.check_index(index, total, max_total)?;

        let failed = matches!(self.state, SessionState::Failed { .. });
        if self.received.contains(&index) && !failed {
            return Ok(Some(RecordOutcome {
                received_count: self.received_count(),
                total: total.or(self.total),
                is_complete: false,
                duplicate: true,
            }));
        }
        if self.state == SessionState::Merging {
            return Err(UploadError::FinalizeInProgress {
                session: self.id.clone(),
            });
        }
        Ok(None)
    }

    /// Records a stored chunk and detects the completeness event.
    ///
    /// Validation is repeated because the session may have changed while the
    /// chunk was being written.
    pub fn record_chunk(
        &mut self,
        index: u32,
        total: Option<u32>,
        max_total: u32,
    ) -> UploadResult<RecordOutcome> {
        if self.removed || self.state == SessionState::Done {
            return Err(self.closed());
        }
        self.check_index(index, total, max_total)?;
        if self.state == SessionState::Merging && !self.received.contains(&index) {
            return Err(UploadError::FinalizeInProgress {
                session: self.id.clone(),
            });
        }

        if total.is_some() {
            self.total = total;
        }
        let duplicate = !self.received.insert(index);
        self.updated_at = get_epoch_time_in_ms();

        let may_complete = matches!(
            self.state,
            SessionState::Receiving | SessionState::Failed { .. }
        );
        let is_complete = may_complete && self.has_full_set();
        if is_complete {
            self.state = SessionState::Complete;
        }

        Ok(RecordOutcome {
            received_count: self.received_count(),
            total: self.total,
            is_complete,
            duplicate,
        })
    }

    /// Fixes the total for an explicit finalize.
    pub fn establish_total(&mut self, total: u32, max_total: u32) -> UploadResult<()> {
        if self.removed || self.state == SessionState::Done {
            return Err(self.closed());
        }
        self.check_total(total, max_total)?;
        self.total = Some(total);
        Ok(())
    }

    /// Claims the merge. At most one caller succeeds until the session fails.
    pub fn begin_merge(&mut self) -> UploadResult<u32> {
        if self.removed {
            return Err(self.closed());
        }
        match self.state {
            SessionState::Merging => Err(UploadError::FinalizeInProgress {
                session: self.id.clone(),
            }),
            SessionState::Done => Err(self.closed()),
            SessionState::Receiving | SessionState::Complete | SessionState::Failed { .. } => {
                match self.total {
                    Some(total) if self.has_full_set() => {
                        self.state = SessionState::Merging;
                        self.updated_at = get_epoch_time_in_ms();
                        Ok(total)
                    }
                    _ => Err(UploadError::Incomplete {
                        session: self.id.clone(),
                        missing: self.missing_indices(),
                    }),
                }
            }
        }
    }

    pub fn mark_done(&mut self) {
        self.state = SessionState::Done;
        self.removed = true;
        self.updated_at = get_epoch_time_in_ms();
    }

    /// Moves a merging session to `Failed`. A chunk that turned out to be
    /// missing is forgotten so that re-uploading it completes the set again.
    pub fn mark_failed(&mut self, reason: String, missing_chunk: Option<u32>) {
        if let Some(index) = missing_chunk {
            self.received.remove(&index);
        }
        self.state = SessionState::Failed { reason };
        self.updated_at = get_epoch_time_in_ms();
    }

    pub fn mark_removed(&mut self) {
        self.removed = true;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.id.clone(),
            state: self.state.clone(),
            total: self.total,
            received: self.received_indices(),
            missing: self.missing_indices(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Live sessions keyed by id, each behind its own lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session, creating it on first use.
    pub fn entry(&self, id: &str) -> SessionHandle {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(id))))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Removes `id` only if it still maps to `handle`, so a stale handle
    /// never evicts a newer session with the same id.
    pub fn remove(&self, id: &str, handle: &SessionHandle) -> bool {
        self.sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn status(&self, id: &str) -> UploadResult<SessionSnapshot> {
        let handle = self.get(id).ok_or_else(|| UploadError::SessionNotFound {
            session: id.to_string(),
        })?;
        let session = handle.lock().await;
        Ok(session.snapshot())
    }

    /// Sessions untouched since `cutoff_ms`, excluding ones being merged.
    pub async fn idle_sessions(&self, cutoff_ms: u64) -> Vec<(String, SessionHandle)> {
        // Collect first; shard guards must not be held across an await.
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut idle = Vec::new();
        for (id, handle) in handles {
            let is_idle = handle.lock().await.is_idle_since(cutoff_ms);
            if is_idle {
                idle.push((id, handle));
            }
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 1000;

    #[test]
    fn test_duplicate_is_counted_once() {
        let mut session = Session::new("s1");
        let first = session.record_chunk(0, Some(3), MAX).unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.received_count, 1);

        let admitted = session.admit_chunk(0, Some(3), MAX).unwrap().unwrap();
        assert!(admitted.duplicate);
        assert_eq!(admitted.received_count, 1);

        let again = session.record_chunk(0, Some(3), MAX).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.received_count, 1);
        assert!(!again.is_complete);
    }

    #[test]
    fn test_total_mismatch_mutates_nothing() {
        let mut session = Session::new("s1");
        session.record_chunk(0, Some(3), MAX).unwrap();

        let err = session.record_chunk(1, Some(4), MAX).unwrap_err();
        assert!(matches!(
            err,
            UploadError::TotalMismatch {
                established: 3,
                declared: 4,
                ..
            }
        ));
        assert_eq!(session.received_indices(), vec![0]);
        assert_eq!(session.total(), Some(3));
    }

    #[test]
    fn test_index_out_of_range() {
        let mut session = Session::new("s1");
        let err = session.record_chunk(3, Some(3), MAX).unwrap_err();
        assert!(matches!(
            err,
            UploadError::IndexOutOfRange {
                index: 3,
                bound: 3,
                ..
            }
        ));

        // Unknown total falls back to the configured maximum.
        let err = session.admit_chunk(MAX, None, MAX).unwrap_err();
        assert!(matches!(err, UploadError::IndexOutOfRange { .. }));
        assert!(session.received_indices().is_empty());
    }

    #[test]
    fn test_zero_total_rejected() {
        let session = Session::new("s1");
        let err = session.admit_chunk(0, Some(0), MAX).unwrap_err();
        assert!(matches!(err, UploadError::InvalidInput { .. }));
    }

    #[test]
    fn test_late_total_must_cover_recorded_indices() {
        let mut session = Session::new("rec");
        session.record_chunk(0, None, MAX).unwrap();
        session.record_chunk(5, None, MAX).unwrap();

        let err = session.establish_total(4, MAX).unwrap_err();
        assert!(matches!(
            err,
            UploadError::IndexOutOfRange {
                index: 5,
                bound: 4,
                ..
            }
        ));
        assert_eq!(session.total(), None);
    }

    #[test]
    fn test_completeness_requires_exact_set() {
        let mut session = Session::new("s1");
        assert!(!session.record_chunk(2, Some(3), MAX).unwrap().is_complete);
        assert!(!session.record_chunk(0, Some(3), MAX).unwrap().is_complete);
        assert_eq!(session.missing_indices(), vec![1]);

        let outcome = session.record_chunk(1, Some(3), MAX).unwrap();
        assert!(outcome.is_complete);
        assert_eq!(outcome.received_count, 3);
        assert_eq!(session.state(), &SessionState::Complete);
    }

    #[test]
    fn test_completeness_reported_once() {
        let mut session = Session::new("s1");
        session.record_chunk(0, Some(2), MAX).unwrap();
        assert!(session.record_chunk(1, Some(2), MAX).unwrap().is_complete);
        assert!(!session.record_chunk(1, Some(2), MAX).unwrap().is_complete);
        assert!(!session.record_chunk(0, None, MAX).unwrap().is_complete);
    }

    #[test]
    fn test_begin_merge_is_exclusive() {
        let mut session = Session::new("s1");
        session.record_chunk(0, Some(1), MAX).unwrap();

        assert_eq!(session.begin_merge().unwrap(), 1);
        assert!(matches!(
            session.begin_merge().unwrap_err(),
            UploadError::FinalizeInProgress { .. }
        ));
        assert!(matches!(
            session.admit_chunk(0, Some(1), MAX).unwrap(),
            Some(RecordOutcome {
                duplicate: true,
                ..
            })
        ));

        session.mark_done();
        assert!(matches!(
            session.admit_chunk(0, Some(1), MAX).unwrap_err(),
            UploadError::SessionClosed { .. }
        ));
    }

    #[test]
    fn test_begin_merge_incomplete() {
        let mut session = Session::new("s1");
        session.record_chunk(1, Some(3), MAX).unwrap();
        match session.begin_merge().unwrap_err() {
            UploadError::Incomplete { missing, .. } => assert_eq!(missing, vec![0, 2]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.state(), &SessionState::Receiving);
    }

    #[test]
    fn test_failed_missing_chunk_completes_again() {
        let mut session = Session::new("s1");
        session.record_chunk(0, Some(2), MAX).unwrap();
        session.record_chunk(1, Some(2), MAX).unwrap();
        session.begin_merge().unwrap();
        session.mark_failed("chunk 1 missing".to_string(), Some(1));

        assert_eq!(session.missing_indices(), vec![1]);
        // Failed sessions accept re-uploads even of present chunks.
        assert!(session.admit_chunk(0, Some(2), MAX).unwrap().is_none());

        let outcome = session.record_chunk(1, Some(2), MAX).unwrap();
        assert!(outcome.is_complete);
        assert_eq!(session.state(), &SessionState::Complete);
    }

    #[tokio::test]
    async fn test_registry_remove_is_handle_checked() {
        let registry = SessionRegistry::new();
        let stale = registry.entry("s1");
        assert!(registry.remove("s1", &stale));
        assert!(registry.is_empty());

        let fresh = registry.entry("s1");
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(!registry.remove("s1", &stale));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_status() {
        let registry = SessionRegistry::new();
        let err = registry.status("nope").await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound { .. }));

        let handle = registry.entry("s1");
        handle.lock().await.record_chunk(1, Some(2), MAX).unwrap();

        let snapshot = registry.status("s1").await.unwrap();
        assert_eq!(snapshot.received, vec![1]);
        assert_eq!(snapshot.missing, vec![0]);
        assert_eq!(snapshot.total, Some(2));
        assert_eq!(snapshot.state, SessionState::Receiving);
    }

    #[tokio::test]
    async fn test_idle_sessions_skip_merging() {
        let registry = SessionRegistry::new();
        registry.entry("idle");
        let merging = registry.entry("merging");
        {
            let mut session = merging.lock().await;
            session.record_chunk(0, Some(1), MAX).unwrap();
            session.begin_merge().unwrap();
        }

        let idle = registry.idle_sessions(get_epoch_time_in_ms()).await;
        let ids: Vec<_> = idle.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["idle".to_string()]);

        let an_hour_ago = get_epoch_time_in_ms() - 3_600_000;
        assert!(registry.idle_sessions(an_hour_ago).await.is_empty());
    }
}
