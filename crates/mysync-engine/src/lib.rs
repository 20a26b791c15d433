//! Backup and restore engines over a [`mysync_core::SqlConnection`] and a
//! [`mysync_core::CheckpointStore`].
//!
//! A backup run captures, per table, the rows inserted above the stored key cursor and the
//! rows updated since the stored watermark, writes them to `backup.<table>.<stamp>.json`, and
//! then advances the checkpoint. A restore run replays those files into another database,
//! creating or widening tables from the paired `scheme.<table>.<stamp>.json` first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod backup;
mod capture;
mod files;
mod introspect;
mod replay;
mod restore;

#[cfg(test)]
mod testing;

pub use backup::{BackupConfig, BackupReport, BackupRunner, TableOutcome, TableStatus};
pub use capture::{CaptureOptions, CaptureOutcome, ChangeCaptureEngine, ScanPhase, ScanState};
pub use introspect::SchemaIntrospector;
pub use replay::{discover_backup_files, ReplayEngine, ReplayReport};
pub use restore::{FileFailure, RestoreConfig, RestoreReport, RestoredFile, RestoreRunner};

/// Cooperative stop request, checked between scan pages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
