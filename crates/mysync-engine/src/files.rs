use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use mysync_core::{ChangeLogEntry, ColumnDescriptor, SyncError, CONSUMED_SUFFIX, PARTIAL_SUFFIX};

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Writes a change log under a `.partial` name and moves it into place on `finish`.
pub(crate) struct ChangeLogWriter {
    table: String,
    path: PathBuf,
    partial_path: PathBuf,
    writer: BufWriter<File>,
    entries: u64,
}

impl ChangeLogWriter {
    pub(crate) fn create(table: &str, path: PathBuf) -> Result<Self, SyncError> {
        if path.exists() {
            return Err(SyncError::Validation(format!(
                "refusing to overwrite existing backup file {}",
                path.display()
            )));
        }

        let partial_path = with_suffix(&path, PARTIAL_SUFFIX);
        let file = File::create(&partial_path).map_err(|err| SyncError::io(&partial_path, err))?;

        Ok(Self { table: table.to_string(), path, partial_path, writer: BufWriter::new(file), entries: 0 })
    }

    pub(crate) fn append(&mut self, entry: &ChangeLogEntry) -> Result<(), SyncError> {
        let line = entry
            .to_line()
            .map_err(|source| SyncError::Encode { table: self.table.clone(), source })?;
        self.writer
            .write_all(line.as_bytes())
            .map_err(|err| SyncError::io(&self.partial_path, err))?;
        self.entries += 1;
        Ok(())
    }

    pub(crate) fn entries(&self) -> u64 {
        self.entries
    }

    pub(crate) fn finish(mut self) -> Result<PathBuf, SyncError> {
        self.writer.flush().map_err(|err| SyncError::io(&self.partial_path, err))?;
        self.writer.get_ref().sync_all().map_err(|err| SyncError::io(&self.partial_path, err))?;
        fs::rename(&self.partial_path, &self.path).map_err(|err| SyncError::io(&self.path, err))?;
        Ok(self.path)
    }

    pub(crate) fn discard(self) {
        let partial_path = self.partial_path.clone();
        drop(self.writer);
        if let Err(err) = fs::remove_file(&partial_path) {
            tracing::warn!(path = %partial_path.display(), error = %err, "failed to remove partial backup file");
        }
    }
}

pub(crate) fn write_schema_snapshot(path: &Path, columns: &[ColumnDescriptor]) -> Result<(), SyncError> {
    let body = serde_json::to_vec(columns).map_err(|source| SyncError::Snapshot {
        path: path.to_path_buf(),
        reason: source.to_string(),
    })?;
    let partial_path = with_suffix(path, PARTIAL_SUFFIX);
    fs::write(&partial_path, body).map_err(|err| SyncError::io(&partial_path, err))?;
    fs::rename(&partial_path, path).map_err(|err| SyncError::io(path, err))
}

/// `None` when no snapshot was written for this run.
pub(crate) fn read_schema_snapshot(path: &Path) -> Result<Option<Vec<ColumnDescriptor>>, SyncError> {
    let body = match fs::read(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(SyncError::io(path, err)),
    };
    let columns = serde_json::from_slice(&body).map_err(|source| SyncError::Snapshot {
        path: path.to_path_buf(),
        reason: source.to_string(),
    })?;
    Ok(Some(columns))
}

/// Rename a fully replayed file so discovery never matches it again.
pub(crate) fn mark_consumed(path: &Path) -> Result<PathBuf, SyncError> {
    let consumed = with_suffix(path, CONSUMED_SUFFIX);
    fs::rename(path, &consumed).map_err(|err| SyncError::io(path, err))?;
    Ok(consumed)
}
