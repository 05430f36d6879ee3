//! Persistence for the sync high-water mark.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// File-backed store for the most recent successfully synced `updated_at`.
///
/// The watermark is the only state surviving across runs. Reads never fail:
/// an absent, empty, or malformed file means "no prior sync" and yields the
/// epoch start.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    /// Creates a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted watermark, or epoch start when none is readable.
    pub fn read(&self) -> DateTime<Utc> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return DateTime::UNIX_EPOCH;
        };
        match serde_json::from_str::<WatermarkFile>(&raw) {
            Ok(WatermarkFile {
                last_updated: Some(timestamp),
            }) => timestamp,
            _ => DateTime::UNIX_EPOCH,
        }
    }

    /// Replaces the watermark with `timestamp`.
    ///
    /// Writes through a sibling temp file and renames it over the target so
    /// a crash mid-write never leaves a torn value behind.
    pub fn write(&self, timestamp: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
        }
        let body = serde_json::to_string(&WatermarkFile {
            last_updated: Some(timestamp),
        })?;
        let staged = self.path.with_extension("tmp");
        fs::write(&staged, body)
            .with_context(|| format!("failed to write watermark {:?}", staged))?;
        fs::rename(&staged, &self.path)
            .with_context(|| format!("failed to replace watermark {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store_in(dir: &tempfile::TempDir) -> WatermarkStore {
        WatermarkStore::new(dir.path().join("watermark.json"))
    }

    #[test]
    fn absent_file_reads_as_epoch_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(store_in(&dir).read(), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn written_watermark_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 0).unwrap();
        store.write(timestamp).expect("write");
        assert_eq!(store.read(), timestamp);
    }

    #[test]
    fn write_overwrites_prior_value_entirely() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store
            .write(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .expect("first write");
        let newer = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        store.write(newer).expect("second write");
        assert_eq!(store.read(), newer);
    }

    #[test]
    fn malformed_file_reads_as_epoch_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        fs::write(store.path(), "{ not json").expect("write garbage");
        assert_eq!(store.read(), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn missing_key_reads_as_epoch_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        fs::write(store.path(), "{}").expect("write empty object");
        assert_eq!(store.read(), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn empty_file_reads_as_epoch_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        fs::write(store.path(), "").expect("write empty file");
        assert_eq!(store.read(), DateTime::UNIX_EPOCH);
    }
}
