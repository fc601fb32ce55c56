//! Period-rotated audit log
//!
//! Every event is appended and synced on its own: the device can lose power
//! at any moment and an acknowledged decision must already be on storage.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, info};

use hg_protocol::{events_csv_name, events_manifest_name, EVENTS_CSV_HEADER};

use crate::clock::period_tag;
use crate::config::DeviceConfig;
use crate::durable;
use crate::error::Result;
use crate::journal::record::{format_line, AccessEvent, Stamp};

pub struct EventJournal {
    data_dir: PathBuf,
    monthly_rotation: bool,
    pub(crate) stamp: Stamp,
}

impl EventJournal {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            monthly_rotation: config.monthly_rotation,
            stamp: Stamp {
                tz: config.tz.clone(),
                checkpoint: config.checkpoint.clone(),
                version: config.firmware_version,
            },
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Period tag of `at`, empty when rotation is disabled
    pub fn period_for(&self, at: &NaiveDateTime) -> String {
        if self.monthly_rotation {
            period_tag(at)
        } else {
            String::new()
        }
    }

    pub fn csv_path(&self, period: &str) -> PathBuf {
        self.data_dir.join(events_csv_name(period))
    }

    pub fn manifest_path(&self, period: &str) -> PathBuf {
        self.data_dir.join(events_manifest_name(period))
    }

    /// Make sure the period file exists and starts with the header
    pub fn ensure_period_file(&self, period: &str) -> Result<PathBuf> {
        durable::ensure_dir(&self.data_dir)?;
        let path = self.csv_path(period);
        if durable::write_header_if_empty(&path, EVENTS_CSV_HEADER)? {
            durable::sync_filesystem();
            info!(period, path = ?path, "Started audit log period");
        }
        Ok(path)
    }

    /// Append one event to the period of its timestamp. Returns the period.
    pub fn append(&self, event: &AccessEvent) -> Result<String> {
        let period = self.period_for(&event.timestamp);
        let path = self.ensure_period_file(&period)?;
        durable::append_line_durable(&path, &format_line(&self.stamp, event))?;
        durable::sync_filesystem();
        debug!(
            period = %period,
            site = event.card.site,
            user = event.card.user,
            autorizado = event.authorized,
            casco = event.helmet,
            "Event appended"
        );
        Ok(period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::CardKey;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    fn journal(dir: &TempDir, monthly_rotation: bool) -> EventJournal {
        let config = DeviceConfig {
            data_dir: dir.path().join("data"),
            monthly_rotation,
            ..DeviceConfig::default()
        };
        EventJournal::new(&config)
    }

    fn at(month: u32, day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, month, day).unwrap().and_hms_opt(8, 0, 0).unwrap()
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir, true);
        j.append(&AccessEvent::denied(at(8, 1), 1, CardKey::new(1, 1))).unwrap();
        j.append(&AccessEvent::denied(at(8, 2), 2, CardKey::new(1, 2))).unwrap();

        let text = fs::read_to_string(j.csv_path("202508")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], EVENTS_CSV_HEADER);
    }

    #[test]
    fn test_append_rotates_by_event_month() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir, true);
        assert_eq!(j.append(&AccessEvent::denied(at(8, 31), 1, CardKey::new(1, 1))).unwrap(), "202508");
        assert_eq!(j.append(&AccessEvent::denied(at(9, 1), 1, CardKey::new(1, 1))).unwrap(), "202509");
        assert!(j.csv_path("202508").exists());
        assert!(j.csv_path("202509").exists());
    }

    #[test]
    fn test_non_rotating_log() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir, false);
        let period = j.append(&AccessEvent::denied(at(8, 1), 1, CardKey::new(1, 1))).unwrap();
        assert_eq!(period, "");
        assert!(dir.path().join("data").join("events.csv").exists());
    }
}
