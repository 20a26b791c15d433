use std::path::PathBuf;
use std::time::Duration;

use mysync_core::{
    row_key, row_text, BackupFileName, ChangeLogEntry, ChangeOp, CheckpointRecord,
    ColumnDescriptor, Row, RowFilter, SqlConnection, SyncError, UpdateWindow,
};
use serde::Serialize;
use time::PrimitiveDateTime;

use crate::files::{write_schema_snapshot, ChangeLogWriter};
use crate::CancelFlag;

/// Paging and pacing of a capture scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub page_size: usize,
    /// Wait before reading the capture instant so in-flight writes can land.
    pub settle_pause: Duration,
    /// Wait between two full pages.
    pub page_pause: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            page_size: 1000,
            settle_pause: Duration::from_secs(1),
            page_pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Rows above the stored key cursor.
    New,
    /// Already exported rows touched inside the update window.
    Updated,
    Done,
}

/// Position of a two-phase table scan.
///
/// The new-row phase walks keys above `origin`; the updated-row phase walks keys up to and
/// including `origin`, starting from the bottom of the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanState {
    pub phase: ScanPhase,
    pub cursor: i64,
    pub page_index: u64,
    origin: i64,
    scan_updates: bool,
}

impl ScanState {
    #[must_use]
    pub fn new(origin: i64, scan_new: bool, scan_updates: bool) -> Self {
        let mut state = Self { phase: ScanPhase::New, cursor: origin, page_index: 0, origin, scan_updates };
        if !scan_new {
            state.finish_phase();
        }
        state
    }

    /// Row selection for the next page, `None` once the scan is done.
    #[must_use]
    pub fn next_filter(&self, key_field: &str, window: Option<&UpdateWindow>) -> Option<RowFilter> {
        match self.phase {
            ScanPhase::New => Some(RowFilter::keys_after(key_field, self.cursor)),
            ScanPhase::Updated => window.map(|window| RowFilter {
                key_field: key_field.to_string(),
                key_after: self.cursor,
                key_through: Some(self.origin),
                updated: Some(window.clone()),
            }),
            ScanPhase::Done => None,
        }
    }

    /// Record a fetched page. A short page ends the current phase.
    pub fn record_page(&mut self, fetched: usize, last_key: Option<i64>, page_size: usize) {
        self.page_index += 1;
        if let Some(key) = last_key {
            self.cursor = key;
        }
        if fetched < page_size {
            self.finish_phase();
        }
    }

    fn finish_phase(&mut self) {
        self.page_index = 0;
        match self.phase {
            ScanPhase::New if self.scan_updates => {
                self.phase = ScanPhase::Updated;
                self.cursor = i64::MIN;
            }
            ScanPhase::New | ScanPhase::Updated => self.phase = ScanPhase::Done,
            ScanPhase::Done => {}
        }
    }
}

/// What one table capture produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureOutcome {
    pub inserted: u64,
    pub updated: u64,
    /// `max(stored cursor, highest new key)`.
    pub new_cursor: i64,
    pub file: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
}

impl CaptureOutcome {
    #[must_use]
    pub fn delta_count(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Exports the delta of one table since its checkpoint into a change-log file.
#[derive(Debug, Clone)]
pub struct ChangeCaptureEngine {
    options: CaptureOptions,
    out_dir: PathBuf,
    cancel: CancelFlag,
}

impl ChangeCaptureEngine {
    #[must_use]
    pub fn new(options: CaptureOptions, out_dir: impl Into<PathBuf>, cancel: CancelFlag) -> Self {
        Self { options, out_dir: out_dir.into(), cancel }
    }

    /// Capture rows inserted above `checkpoint.cursor_id` and rows updated inside
    /// `(checkpoint.watermark, instant]`.
    ///
    /// No file is written when both counts are zero. When `snapshot` is given it is written
    /// next to the change log under the same run stamp. The checkpoint is not touched here.
    ///
    /// # Errors
    /// Returns [`SyncError::Cancelled`] when the cancel flag is raised between pages, and any
    /// connection, encoding or file error. Partial output is removed on every error.
    pub fn capture_table<C: SqlConnection + ?Sized>(
        &self,
        conn: &mut C,
        checkpoint: &CheckpointRecord,
        instant: PrimitiveDateTime,
        name: &BackupFileName,
        snapshot: Option<&[ColumnDescriptor]>,
    ) -> Result<CaptureOutcome, SyncError> {
        let table = checkpoint.table_name.as_str();
        let Some(key_field) = checkpoint.fields.primary_key_field.as_deref() else {
            return Err(SyncError::Validation(format!("table {table} has no primary key field")));
        };

        let window = checkpoint
            .fields
            .update_time_field
            .as_ref()
            .filter(|_| checkpoint.watermark < instant)
            .map(|field| UpdateWindow { field: field.clone(), after: checkpoint.watermark, until: instant });

        let pending_new = conn.count_rows(table, &RowFilter::keys_after(key_field, checkpoint.cursor_id))?;
        let pending_updated = match &window {
            Some(window) => conn.count_rows(
                table,
                &RowFilter {
                    key_field: key_field.to_string(),
                    key_after: i64::MIN,
                    key_through: Some(checkpoint.cursor_id),
                    updated: Some(window.clone()),
                },
            )?,
            None => 0,
        };

        let mut outcome = CaptureOutcome {
            inserted: 0,
            updated: 0,
            new_cursor: checkpoint.cursor_id,
            file: None,
            snapshot: None,
        };
        if pending_new == 0 && pending_updated == 0 {
            tracing::debug!(table, "no pending changes");
            return Ok(outcome);
        }
        tracing::info!(table, pending_new, pending_updated, "capturing table delta");

        let path = self.out_dir.join(name.backup_file_name());
        let mut writer = ChangeLogWriter::create(table, path)?;
        let mut state = ScanState::new(checkpoint.cursor_id, pending_new > 0, pending_updated > 0);

        if let Err(err) = self.scan(conn, checkpoint, key_field, window.as_ref(), &mut state, &mut writer, &mut outcome) {
            writer.discard();
            return Err(err);
        }

        if let Some(columns) = snapshot {
            let snapshot_path = self.out_dir.join(name.schema_file_name());
            if let Err(err) = write_schema_snapshot(&snapshot_path, columns) {
                writer.discard();
                return Err(err);
            }
            outcome.snapshot = Some(snapshot_path);
        }

        let entries = writer.entries();
        match writer.finish() {
            Ok(file) => {
                tracing::info!(table, entries, file = %file.display(), "change log written");
                outcome.file = Some(file);
                Ok(outcome)
            }
            Err(err) => {
                if let Some(snapshot_path) = &outcome.snapshot {
                    if let Err(remove_err) = std::fs::remove_file(snapshot_path) {
                        tracing::warn!(path = %snapshot_path.display(), error = %remove_err, "failed to remove orphaned schema snapshot");
                    }
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan<C: SqlConnection + ?Sized>(
        &self,
        conn: &mut C,
        checkpoint: &CheckpointRecord,
        key_field: &str,
        window: Option<&UpdateWindow>,
        state: &mut ScanState,
        writer: &mut ChangeLogWriter,
        outcome: &mut CaptureOutcome,
    ) -> Result<(), SyncError> {
        let table = checkpoint.table_name.as_str();
        let page_size = self.options.page_size.max(1);

        while let Some(filter) = state.next_filter(key_field, window) {
            if self.cancel.is_cancelled() {
                tracing::warn!(table, phase = ?state.phase, "capture cancelled");
                return Err(SyncError::Cancelled);
            }

            let phase = state.phase;
            let rows = conn.fetch_rows(table, &filter, page_size)?;
            let mut last_key = None;
            for row in &rows {
                let key = row_key(row, key_field).ok_or_else(|| {
                    SyncError::Validation(format!("table {table} returned a row without an integer {key_field}"))
                })?;
                writer.append(&entry_for(phase, checkpoint, key, row))?;
                last_key = Some(key);
                match phase {
                    ScanPhase::New => {
                        outcome.inserted += 1;
                        outcome.new_cursor = outcome.new_cursor.max(key);
                    }
                    ScanPhase::Updated => outcome.updated += 1,
                    ScanPhase::Done => {}
                }
            }

            tracing::debug!(table, phase = ?phase, page = state.page_index, rows = rows.len(), "fetched page");
            state.record_page(rows.len(), last_key, page_size);
            if rows.len() == page_size && !self.options.page_pause.is_zero() {
                std::thread::sleep(self.options.page_pause);
            }
        }
        Ok(())
    }
}

fn entry_for(phase: ScanPhase, checkpoint: &CheckpointRecord, key: i64, row: &Row) -> ChangeLogEntry {
    let (op, time_field) = match phase {
        ScanPhase::Updated => (ChangeOp::Update, checkpoint.fields.update_time_field.as_deref()),
        ScanPhase::New | ScanPhase::Done => (ChangeOp::Insert, checkpoint.fields.create_time_field.as_deref()),
    };
    ChangeLogEntry {
        op,
        key,
        timestamp: time_field.map(|field| row_text(row, field)).unwrap_or_default(),
        payload: row.clone(),
    }
}

#[cfg(test)]
mod tests {
    use mysync_core::{RunStamp, RunType, TableRoleFields};
    use time::macros::datetime;

    use super::*;
    use crate::testing::{orders_columns, MemoryDatabase};

    fn options(page_size: usize) -> CaptureOptions {
        CaptureOptions { page_size, settle_pause: Duration::ZERO, page_pause: Duration::ZERO }
    }

    fn checkpoint(cursor_id: i64, watermark: PrimitiveDateTime) -> CheckpointRecord {
        let mut record = CheckpointRecord::new(
            RunType::Backup,
            "orders",
            TableRoleFields {
                primary_key_field: Some("id".to_string()),
                create_time_field: Some("create_at".to_string()),
                update_time_field: Some("update_at".to_string()),
            },
        );
        record.cursor_id = cursor_id;
        record.watermark = watermark;
        record
    }

    #[test]
    fn scan_state_walks_new_then_updated_then_done() {
        let mut state = ScanState::new(10, true, true);
        assert_eq!(state.phase, ScanPhase::New);
        assert_eq!(state.next_filter("id", None), Some(RowFilter::keys_after("id", 10)));

        state.record_page(2, Some(12), 2);
        assert_eq!((state.phase, state.cursor, state.page_index), (ScanPhase::New, 12, 1));

        state.record_page(1, Some(13), 2);
        assert_eq!((state.phase, state.cursor, state.page_index), (ScanPhase::Updated, i64::MIN, 0));

        let window = UpdateWindow {
            field: "update_at".to_string(),
            after: datetime!(2024-01-01 0:00),
            until: datetime!(2024-01-02 0:00),
        };
        let filter = state.next_filter("id", Some(&window));
        assert_eq!(filter.as_ref().map(|f| f.key_through), Some(Some(10)));

        state.record_page(0, None, 2);
        assert_eq!(state.phase, ScanPhase::Done);
        assert_eq!(state.next_filter("id", Some(&window)), None);
    }

    #[test]
    fn scan_state_skips_phases_with_nothing_pending() {
        assert_eq!(ScanState::new(5, false, true).phase, ScanPhase::Updated);
        assert_eq!(ScanState::new(5, false, false).phase, ScanPhase::Done);
        let mut state = ScanState::new(5, true, false);
        state.record_page(0, None, 10);
        assert_eq!(state.phase, ScanPhase::Done);
    }

    #[test]
    fn pages_through_new_rows_in_key_order() -> Result<(), SyncError> {
        let dir = tempfile::tempdir().map_err(|err| SyncError::io("tempdir", err))?;
        let mut db = MemoryDatabase::new(datetime!(2024-06-01 12:00));
        db.create_table("orders", orders_columns());
        for id in 1..=5 {
            db.insert_at("orders", id, datetime!(2024-06-01 10:00));
        }

        let engine = ChangeCaptureEngine::new(options(2), dir.path(), CancelFlag::new());
        let name = BackupFileName::new("orders", RunStamp(datetime!(2024-06-01 12:00)))?;
        let outcome = engine.capture_table(
            &mut db,
            &checkpoint(-1, datetime!(1970-01-01 0:00)),
            datetime!(2024-06-01 12:00),
            &name,
            None,
        )?;

        assert_eq!((outcome.inserted, outcome.updated, outcome.new_cursor), (5, 0, 5));
        // 2 + 2 + 1 rows, the short page ends the scan.
        assert_eq!(db.fetches(), 3);
        let body = std::fs::read_to_string(dir.path().join(name.backup_file_name()))
            .map_err(|err| SyncError::io("log", err))?;
        let keys: Vec<i64> = body
            .lines()
            .enumerate()
            .map(|(index, line)| ChangeLogEntry::parse_line(line, index + 1).map(|entry| entry.key))
            .collect::<Result<_, _>>()?;
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        assert!(outcome.snapshot.is_none());
        Ok(())
    }

    #[test]
    fn refuses_to_overwrite_an_existing_log() -> Result<(), SyncError> {
        let dir = tempfile::tempdir().map_err(|err| SyncError::io("tempdir", err))?;
        let mut db = MemoryDatabase::new(datetime!(2024-06-01 12:00));
        db.create_table("orders", orders_columns());
        db.insert_at("orders", 1, datetime!(2024-06-01 10:00));

        let name = BackupFileName::new("orders", RunStamp(datetime!(2024-06-01 12:00)))?;
        let existing = dir.path().join(name.backup_file_name());
        std::fs::write(&existing, "keep me").map_err(|err| SyncError::io(&existing, err))?;

        let engine = ChangeCaptureEngine::new(options(10), dir.path(), CancelFlag::new());
        let result = engine.capture_table(
            &mut db,
            &checkpoint(-1, datetime!(1970-01-01 0:00)),
            datetime!(2024-06-01 12:00),
            &name,
            None,
        );

        assert!(matches!(result, Err(SyncError::Validation(_))));
        let body = std::fs::read_to_string(&existing).map_err(|err| SyncError::io(&existing, err))?;
        assert_eq!(body, "keep me");
        Ok(())
    }
}
