//! Authorization table
//!
//! `cards.csv` is the source of truth: a header line followed by
//! `site_code,user_code,nombre,enabled` rows. The in-memory copy is an
//! immutable map behind an `Arc`; reload and append build a new map and swap
//! the pointer, so a lookup sees either the old table or the new one in full.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use hg_protocol::CARDS_CSV_HEADER;

use crate::constants::DEFAULT_HOLDER_NAME;
use crate::durable;
use crate::error::{HelmgateError, Result};
use crate::reader::CardKey;

/// Enabled cards and their holder names
pub type CardTable = HashMap<CardKey, String>;

/// One parsed row of the table file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRow {
    pub key: CardKey,
    pub name: String,
    pub enabled: bool,
}

impl CardRow {
    fn to_line(&self) -> String {
        format!(
            "{},{},{},{}",
            self.key.site,
            self.key.user,
            sanitize_field(&self.name),
            if self.enabled { 1 } else { 0 }
        )
    }
}

/// Strip characters that would break the line-oriented CSV layout
pub fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, ',' | '\n' | '\r') { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parse one data line; `None` for anything malformed
pub fn parse_row(line: &str) -> Option<CardRow> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 2 {
        return None;
    }
    let site = parts[0].trim().parse::<u8>().ok()?;
    let user = parts[1].trim().parse::<u16>().ok()?;
    let name = parts.get(2).map(|s| s.trim()).unwrap_or_default();
    let enabled = parts.get(3).map_or(true, |flag| flag.trim() != "0");
    let name = if name.is_empty() { DEFAULT_HOLDER_NAME } else { name };

    Some(CardRow {
        key: CardKey::new(site, user),
        name: name.to_string(),
        enabled,
    })
}

/// Build the table from file contents; later rows override earlier ones
pub fn parse_table(text: &str) -> CardTable {
    let mut table = CardTable::new();
    for (lineno, line) in text.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_row(line) {
            Some(row) if row.enabled => {
                table.insert(row.key, row.name);
            }
            Some(row) => {
                table.remove(&row.key);
            }
            None => debug!(line = lineno + 1, "Skipping unparsable card row"),
        }
    }
    table
}

/// Create a header-only table if none exists. Returns true when created.
pub fn ensure_template(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        durable::ensure_dir(parent)?;
    }
    durable::atomic_replace(path, format!("{}\n", CARDS_CSV_HEADER).as_bytes())?;
    info!(path = ?path, "Created empty authorization table");
    Ok(true)
}

/// Identity of the file contents last applied to memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self { modified: meta.modified().ok(), len: meta.len() })
    }
}

pub struct AuthorizationStore {
    path: PathBuf,
    table: RwLock<Arc<CardTable>>,
    loaded: Mutex<Option<FileStamp>>,
}

impl AuthorizationStore {
    /// Open the table at `path`, creating the header-only template if absent
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            table: RwLock::new(Arc::new(CardTable::new())),
            loaded: Mutex::new(None),
        };
        ensure_template(&store.path)?;
        store.reload()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the whole file and swap the table in one step
    pub fn reload(&self) -> Result<usize> {
        let stamp = FileStamp::of(&self.path);
        let text = fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HelmgateError::FileNotFound(self.path.clone())
            } else {
                HelmgateError::FileRead { path: self.path.clone(), source: e }
            }
        })?;
        let table = parse_table(&text);
        let count = table.len();
        *self.table.write() = Arc::new(table);
        *self.loaded.lock() = stamp;
        info!(path = ?self.path, cards = count, "Authorization table loaded");
        Ok(count)
    }

    /// Reload only if the file changed since it was last applied.
    ///
    /// Picks up edits made by another process (operator CLI, manual copy).
    pub fn reload_if_changed(&self) -> Result<Option<usize>> {
        let current = FileStamp::of(&self.path);
        if current.is_some() && current == *self.loaded.lock() {
            return Ok(None);
        }
        debug!(path = ?self.path, "Authorization table changed on storage");
        self.reload().map(Some)
    }

    /// Holder name of an enabled card
    pub fn lookup(&self, key: CardKey) -> Option<String> {
        self.table.read().get(&key).cloned()
    }

    pub fn is_authorized(&self, key: CardKey) -> bool {
        self.table.read().contains_key(&key)
    }

    /// Current table; stays valid across later reloads
    pub fn snapshot(&self) -> Arc<CardTable> {
        self.table.read().clone()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Append a row durably, then apply it to the in-memory table
    pub fn append(&self, key: CardKey, name: &str, enabled: bool) -> Result<()> {
        let name = sanitize_field(name);
        let row = CardRow {
            key,
            name: if name.is_empty() { DEFAULT_HOLDER_NAME.to_string() } else { name },
            enabled,
        };

        durable::write_header_if_empty(&self.path, CARDS_CSV_HEADER)?;
        durable::append_line_durable(&self.path, &row.to_line())?;
        durable::sync_filesystem();

        let mut guard = self.table.write();
        let mut next = CardTable::clone(&guard);
        if row.enabled {
            next.insert(row.key, row.name);
        } else {
            next.remove(&row.key);
        }
        *guard = Arc::new(next);
        *self.loaded.lock() = FileStamp::of(&self.path);
        info!(site = key.site, user = key.user, enabled, "Card row appended");
        Ok(())
    }
}

impl std::fmt::Debug for AuthorizationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationStore")
            .field("path", &self.path)
            .field("cards", &self.len())
            .finish()
    }
}

/// Log and swallow a failed reload so the previous table stays in effect
pub fn reload_or_keep(store: &AuthorizationStore) {
    if let Err(e) = store.reload() {
        warn!(error = %e, "Reload failed, keeping previous authorization table");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(contents: &str) -> (TempDir, AuthorizationStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cards.csv");
        fs::write(&path, contents).unwrap();
        let store = AuthorizationStore::open(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn test_later_row_wins() {
        let (_dir, store) = store_with(
            "site_code,user_code,nombre,enabled\n\
             10,1234,Ana,1\n\
             10,1234,Ana Maria,1\n\
             11,5,Luis,1\n\
             11,5,Luis,0\n",
        );
        assert_eq!(store.lookup(CardKey::new(10, 1234)).as_deref(), Some("Ana Maria"));
        assert!(!store.is_authorized(CardKey::new(11, 5)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_missing_flag_and_name_defaults() {
        let (_dir, store) = store_with("h\n1,2\n3,4,,\n5,6,Eva,yes\n\n");
        assert_eq!(store.lookup(CardKey::new(1, 2)).as_deref(), Some(DEFAULT_HOLDER_NAME));
        assert_eq!(store.lookup(CardKey::new(3, 4)).as_deref(), Some(DEFAULT_HOLDER_NAME));
        assert_eq!(store.lookup(CardKey::new(5, 6)).as_deref(), Some("Eva"));
    }

    #[test]
    fn test_unparsable_rows_skipped() {
        let (_dir, store) = store_with("h\nabc,1,X,1\n300,1,Big,1\n1,70000,Big,1\n2,2,Ok,1\n");
        assert_eq!(store.len(), 1);
        assert!(store.is_authorized(CardKey::new(2, 2)));
    }

    #[test]
    fn test_header_line_never_parsed_as_row() {
        let (_dir, store) = store_with("1,1,Header,1\n2,2,Row,1\n");
        assert!(!store.is_authorized(CardKey::new(1, 1)));
        assert!(store.is_authorized(CardKey::new(2, 2)));
    }

    #[test]
    fn test_template_created_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("cards.csv");
        let store = AuthorizationStore::open(&path).unwrap();

        assert!(store.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n", CARDS_CSV_HEADER));
    }

    #[test]
    fn test_append_is_visible_and_persisted() {
        let (_dir, store) = store_with(&format!("{}\n", CARDS_CSV_HEADER));
        store.append(CardKey::new(7, 77), "Perez, Juan", true).unwrap();

        assert_eq!(store.lookup(CardKey::new(7, 77)).as_deref(), Some("Perez  Juan"));
        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.ends_with("7,77,Perez  Juan,1\n"));

        store.append(CardKey::new(7, 77), "", false).unwrap();
        assert!(!store.is_authorized(CardKey::new(7, 77)));
        store.reload().unwrap();
        assert!(!store.is_authorized(CardKey::new(7, 77)));
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let (_dir, store) = store_with("h\n1,1,A,1\n");
        let before = store.snapshot();
        fs::write(store.path(), "h\n2,2,B,1\n").unwrap();
        store.reload().unwrap();

        assert!(before.contains_key(&CardKey::new(1, 1)));
        assert!(store.is_authorized(CardKey::new(2, 2)));
        assert!(!store.is_authorized(CardKey::new(1, 1)));
    }

    #[test]
    fn test_reload_or_keep_retains_table() {
        let (_dir, store) = store_with("h\n1,1,A,1\n");
        fs::remove_file(store.path()).unwrap();
        reload_or_keep(&store);
        assert!(store.is_authorized(CardKey::new(1, 1)));
    }

    #[test]
    fn test_reload_if_changed_tracks_external_edits() {
        let (_dir, store) = store_with("h\n1,1,A,1\n");
        assert_eq!(store.reload_if_changed().unwrap(), None);

        store.append(CardKey::new(2, 2), "B", true).unwrap();
        assert_eq!(store.reload_if_changed().unwrap(), None);

        fs::write(store.path(), "h\n1,1,A,1\n2,2,B,1\n3,3,C,1\n").unwrap();
        assert_eq!(store.reload_if_changed().unwrap(), Some(3));
        assert!(store.is_authorized(CardKey::new(3, 3)));
    }
}
