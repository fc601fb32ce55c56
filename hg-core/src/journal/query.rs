//! Reading the audit log back

use std::fs::File;
use std::io::{BufRead, BufReader};

use tracing::debug;

use crate::error::{HelmgateError, Result};
use crate::journal::record::{parse_line, EventRecord};
use crate::journal::EventJournal;

/// Conjunctive filter; `None` fields match everything
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub site: Option<u8>,
    pub user: Option<u16>,
    pub helmet: Option<bool>,
}

impl EventFilter {
    pub fn matches(&self, rec: &EventRecord) -> bool {
        if let Some(site) = self.site {
            if rec.site_code != Some(site) {
                return false;
            }
        }
        if let Some(user) = self.user {
            if rec.user_code != Some(user) {
                return false;
            }
        }
        self.helmet.map_or(true, |helmet| rec.casco == helmet)
    }
}

impl EventJournal {
    /// Events of `period` matching `filter`, in append order.
    ///
    /// Lines that are not UTF-8 or have the wrong column count are skipped;
    /// a missing period file yields no events.
    pub fn query(&self, period: &str, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let path = self.csv_path(period);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(HelmgateError::FileRead { path, source }),
        };

        let mut out = Vec::new();
        let mut skipped = 0usize;
        for raw in BufReader::new(file).split(b'\n').skip(1) {
            let raw = raw.map_err(|source| HelmgateError::FileRead { path: path.clone(), source })?;
            let Ok(line) = std::str::from_utf8(&raw) else {
                skipped += 1;
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(rec) if filter.matches(&rec) => out.push(rec),
                Some(_) => {}
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(period, skipped, "Skipped corrupt audit log lines");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::journal::AccessEvent;
    use crate::reader::CardKey;
    use chrono::NaiveDate;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn seeded() -> (TempDir, EventJournal) {
        let dir = TempDir::new().unwrap();
        let j = EventJournal::new(&DeviceConfig {
            data_dir: dir.path().to_path_buf(),
            ..DeviceConfig::default()
        });
        let ts = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let mk = |site, user, helmet| AccessEvent {
            timestamp: ts,
            raw: 1,
            card: CardKey::new(site, user),
            name: "X".into(),
            authorized: true,
            helmet,
            score: 0.9,
            image: String::new(),
        };
        j.append(&mk(1, 100, true)).unwrap();
        j.append(&mk(1, 100, false)).unwrap();
        j.append(&mk(2, 100, true)).unwrap();
        j.append(&AccessEvent::denied(ts, 5, CardKey::new(1, 200))).unwrap();
        (dir, j)
    }

    #[test]
    fn test_filters_combine() {
        let (_dir, j) = seeded();
        let all = j.query("202508", &EventFilter::default()).unwrap();
        assert_eq!(all.len(), 4);

        let f = EventFilter { user: Some(100), ..Default::default() };
        assert_eq!(j.query("202508", &f).unwrap().len(), 3);

        let f = EventFilter { site: Some(1), user: Some(100), helmet: Some(true) };
        let hits = j.query("202508", &f).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].casco);

        let f = EventFilter { helmet: Some(false), ..Default::default() };
        assert_eq!(j.query("202508", &f).unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_line_skipped() {
        let (_dir, j) = seeded();
        let mut f = OpenOptions::new().append(true).open(j.csv_path("202508")).unwrap();
        f.write_all(b"15-08-2025T09:00:00,Europe/Madrid,A,7,1,1\n").unwrap();

        assert_eq!(j.query("202508", &EventFilter::default()).unwrap().len(), 4);
    }

    #[test]
    fn test_non_utf8_line_skipped() {
        let (_dir, j) = seeded();
        let mut f = OpenOptions::new().append(true).open(j.csv_path("202508")).unwrap();
        f.write_all(b"15-08-2025T09:00:00,Europe/Madrid,A,7,1,1,1,\xff\xfe,1,1,0.50,\n").unwrap();

        let all = j.query("202508", &EventFilter::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|r| r.user_code != Some(1)));
    }

    #[test]
    fn test_missing_period_is_empty() {
        let (_dir, j) = seeded();
        assert!(j.query("202401", &EventFilter::default()).unwrap().is_empty());
    }
}
