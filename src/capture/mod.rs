//! Capture ledger.
//!
//! Photos taken during a session are appended to the session's single pending
//! entry. When an instrument completes, that entry is stamped with the new
//! instrument instance id and the next capture starts a fresh pending entry.
//! Pending entries abandoned for longer than the orphan age are swept along
//! with their files.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::files::FileStore;
use crate::session::InstrumentKind;
use crate::storage::{
    CaptureEntry, CaptureFile, CaptureParams, Session, SettingsProvider, SqliteStorage, Storage,
};

/// Default trigger label for timed captures.
pub const TRIGGER_INTERVAL: &str = "interval";

/// One photo to store as part of a pre-linked batch.
#[derive(Debug, Clone)]
pub struct CaptureUpload {
    /// Raw image bytes.
    pub bytes: Vec<u8>,
    /// What caused the capture.
    pub trigger: String,
}

impl CaptureUpload {
    /// Create an upload.
    pub fn new(bytes: impl Into<Vec<u8>>, trigger: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            trigger: trigger.into(),
        }
    }
}

/// Outcome of an orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanSweepReport {
    /// Pending entries removed.
    pub entries_removed: usize,
    /// Files removed from the file store.
    pub files_removed: usize,
    /// Files that could not be removed.
    pub file_errors: usize,
}

/// Outcome of removing a set of capture files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilePurge {
    pub removed: usize,
    pub failed: usize,
}

/// Capture ledger over the session store and the file store.
#[derive(Clone)]
pub struct CaptureLedger {
    storage: SqliteStorage,
    files: Arc<dyn FileStore>,
}

impl CaptureLedger {
    /// Create a new ledger.
    pub fn new(storage: SqliteStorage, files: Arc<dyn FileStore>) -> Self {
        Self { storage, files }
    }

    /// The file store captures are written to.
    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    /// Store a photo and append it to the session's pending entry.
    ///
    /// The file is written first; if the ledger update fails the file is
    /// removed again so no file outlives a failed append.
    pub async fn append_capture(
        &self,
        session_id: &str,
        bytes: &[u8],
        trigger: &str,
    ) -> AppResult<CaptureEntry> {
        if bytes.is_empty() {
            return Err(AppError::Validation {
                field: "bytes".to_string(),
                reason: "capture is empty".to_string(),
            });
        }

        let session = self.load_capturable(session_id).await?;
        let file_id = self.files.save(bytes).await?;

        let now = Utc::now();
        let file = CaptureFile {
            file_id,
            trigger: normalize_trigger(trigger),
            captured_at: now,
            session_elapsed_secs: session.elapsed_secs(now),
        };

        match self.storage.append_pending_capture(session_id, &file).await {
            Ok(entry) => {
                debug!(
                    session_id = %session_id,
                    entry_id = %entry.id,
                    files = entry.files.len(),
                    "Capture appended"
                );
                Ok(entry)
            }
            Err(e) => {
                self.discard_file(&file.file_id).await;
                Err(e.into())
            }
        }
    }

    /// Store a batch of photos as one entry already linked to an instrument instance.
    pub async fn append_linked_batch(
        &self,
        session_id: &str,
        instance_id: &str,
        kind: InstrumentKind,
        uploads: Vec<CaptureUpload>,
    ) -> AppResult<CaptureEntry> {
        if uploads.is_empty() || uploads.iter().any(|u| u.bytes.is_empty()) {
            return Err(AppError::Validation {
                field: "uploads".to_string(),
                reason: "batch must contain non-empty captures".to_string(),
            });
        }

        let session = self.load_capturable(session_id).await?;
        self.check_instance(session_id, instance_id, kind).await?;

        let mut files = Vec::with_capacity(uploads.len());
        for upload in uploads {
            match self.files.save(&upload.bytes).await {
                Ok(file_id) => {
                    let now = Utc::now();
                    files.push(CaptureFile {
                        file_id,
                        trigger: normalize_trigger(&upload.trigger),
                        captured_at: now,
                        session_elapsed_secs: session.elapsed_secs(now),
                    });
                }
                Err(e) => {
                    self.discard_files(&files).await;
                    return Err(e.into());
                }
            }
        }

        let entry = CaptureEntry::linked(session_id, instance_id, kind, files);
        if let Err(e) = self.storage.create_capture(&entry).await {
            self.discard_files(&entry.files).await;
            return Err(e.into());
        }

        info!(
            session_id = %session_id,
            instance_id = %instance_id,
            files = entry.files.len(),
            "Linked capture batch stored"
        );
        Ok(entry)
    }

    /// Link the session's pending entry to an instrument instance.
    ///
    /// Idempotent: with nothing pending this returns `None`.
    pub async fn link_pending_captures(
        &self,
        session_id: &str,
        instance_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<Option<CaptureEntry>> {
        if self.storage.get_session(session_id).await?.is_none() {
            return Err(AppError::session_not_found(session_id));
        }
        self.check_instance(session_id, instance_id, kind).await?;
        self.link_pending(session_id, instance_id, kind).await
    }

    /// Link without validating the instance. The caller has just committed it.
    pub(crate) async fn link_pending(
        &self,
        session_id: &str,
        instance_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<Option<CaptureEntry>> {
        let linked = self
            .storage
            .link_pending_capture(session_id, instance_id, kind)
            .await?;

        match &linked {
            Some(entry) => info!(
                session_id = %session_id,
                instance_id = %instance_id,
                kind = %kind,
                files = entry.files.len(),
                "Pending captures linked"
            ),
            None => debug!(session_id = %session_id, "No pending captures to link"),
        }

        Ok(linked)
    }

    /// All capture entries of a session.
    pub async fn get_captures(&self, session_id: &str) -> AppResult<Vec<CaptureEntry>> {
        Ok(self.storage.get_session_captures(session_id).await?)
    }

    /// Remove pending entries not appended to within `max_age`, then their files.
    pub async fn sweep_orphans(&self, max_age: Duration) -> AppResult<OrphanSweepReport> {
        let cutoff = Utc::now() - max_age;
        let candidates = self.storage.get_stale_pending_captures(cutoff).await?;
        let mut report = OrphanSweepReport::default();

        for candidate in candidates {
            // Re-checked in the delete; an append since the scan keeps the entry.
            let deleted = self
                .storage
                .delete_stale_pending_capture(&candidate.id, cutoff)
                .await?;

            if let Some(entry) = deleted {
                let purge = self.purge_files(&[entry]).await;
                report.entries_removed += 1;
                report.files_removed += purge.removed;
                report.file_errors += purge.failed;
            }
        }

        if report.entries_removed > 0 {
            info!(
                entries = report.entries_removed,
                files = report.files_removed,
                file_errors = report.file_errors,
                "Orphan captures swept"
            );
        }
        Ok(report)
    }

    /// Remove the files of already deleted entries.
    pub async fn purge_files(&self, entries: &[CaptureEntry]) -> FilePurge {
        let mut purge = FilePurge::default();
        for file in entries.iter().flat_map(|e| e.files.iter()) {
            match self.files.delete(&file.file_id).await {
                Ok(()) => purge.removed += 1,
                Err(e) => {
                    warn!(file_id = %file.file_id, error = %e, "Failed to remove capture file");
                    purge.failed += 1;
                }
            }
        }
        purge
    }

    async fn load_capturable(&self, session_id: &str) -> AppResult<Session> {
        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::session_not_found(session_id))?;

        if session.status.is_terminal() {
            return Err(AppError::precondition(format!(
                "session {} is {} and accepts no captures",
                session.id, session.status
            )));
        }

        let params: CaptureParams = match self.storage.get_bundle(&session.settings.capture).await? {
            Some(bundle) => bundle.params().map_err(|e| AppError::Internal {
                message: format!("Invalid capture bundle {}: {}", bundle.id, e),
            })?,
            None => {
                warn!(
                    session_id = %session.id,
                    bundle_id = %session.settings.capture,
                    "Pinned capture bundle missing, using defaults"
                );
                CaptureParams::default()
            }
        };
        if !params.enabled {
            return Err(AppError::precondition(format!(
                "capture is disabled for session {}",
                session.id
            )));
        }

        Ok(session)
    }

    async fn check_instance(
        &self,
        session_id: &str,
        instance_id: &str,
        kind: InstrumentKind,
    ) -> AppResult<()> {
        let record = self
            .storage
            .get_instrument_record_by_id(instance_id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                entity: "Instrument instance",
                id: instance_id.to_string(),
            })?;

        if record.session_id != session_id || record.kind() != kind {
            return Err(AppError::Validation {
                field: "instance_id".to_string(),
                reason: format!(
                    "instance {} is not the {} instance of session {}",
                    instance_id, kind, session_id
                ),
            });
        }
        Ok(())
    }

    async fn discard_file(&self, file_id: &str) {
        if let Err(e) = self.files.delete(file_id).await {
            warn!(file_id = %file_id, error = %e, "Failed to discard capture file");
        }
    }

    async fn discard_files(&self, files: &[CaptureFile]) {
        for file in files {
            self.discard_file(&file.file_id).await;
        }
    }
}

fn normalize_trigger(trigger: &str) -> String {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        TRIGGER_INTERVAL.to_string()
    } else {
        trigger.to_string()
    }
}
