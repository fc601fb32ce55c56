//! Audit log line format
//!
//! `timestamp,tz,checkpoint,version,raw26,site_code,user_code,nombre,autorizado,casco,score,img_path`

use chrono::NaiveDateTime;
use serde::Serialize;

use hg_protocol::EVENTS_CSV_COLUMNS;

use crate::access::sanitize_field;
use crate::clock::format_timestamp;
use crate::reader::CardKey;

/// One access decision, as appended to the audit log
#[derive(Debug, Clone, PartialEq)]
pub struct AccessEvent {
    pub timestamp: NaiveDateTime,
    pub raw: u32,
    pub card: CardKey,
    /// Holder name, empty for unknown cards
    pub name: String,
    pub authorized: bool,
    pub helmet: bool,
    pub score: f32,
    /// Proof image reference, empty when none was kept
    pub image: String,
}

impl AccessEvent {
    /// A card that is not in the authorization table
    pub fn denied(timestamp: NaiveDateTime, raw: u32, card: CardKey) -> Self {
        Self {
            timestamp,
            raw,
            card,
            name: String::new(),
            authorized: false,
            helmet: false,
            score: 0.0,
            image: String::new(),
        }
    }
}

/// Device identity stamped on every line
#[derive(Debug, Clone)]
pub struct Stamp {
    pub tz: String,
    pub checkpoint: String,
    pub version: u32,
}

pub(crate) fn format_line(stamp: &Stamp, event: &AccessEvent) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},{:.2},{}",
        format_timestamp(&event.timestamp),
        stamp.tz,
        stamp.checkpoint,
        stamp.version,
        event.raw,
        event.card.site,
        event.card.user,
        sanitize_field(&event.name),
        event.authorized as u8,
        event.helmet as u8,
        event.score,
        sanitize_field(&event.image),
    )
}

/// A line read back from the audit log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub tz: String,
    pub checkpoint: String,
    pub version: String,
    pub raw26: Option<u32>,
    pub site_code: Option<u8>,
    pub user_code: Option<u16>,
    pub nombre: String,
    pub autorizado: bool,
    pub casco: bool,
    pub score: f32,
    pub img_path: String,
}

fn optional<T: std::str::FromStr>(field: &str) -> Option<Option<T>> {
    let field = field.trim();
    if field.is_empty() {
        return Some(None);
    }
    field.parse().ok().map(Some)
}

fn flag(field: &str) -> Option<bool> {
    match field.trim() {
        "" | "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// Parse a data line; `None` when the column count or a numeric field is off
pub(crate) fn parse_line(line: &str) -> Option<EventRecord> {
    let cols: Vec<&str> = line.trim_end_matches(&['\r', '\n'][..]).split(',').collect();
    if cols.len() != EVENTS_CSV_COLUMNS {
        return None;
    }
    Some(EventRecord {
        timestamp: cols[0].to_string(),
        tz: cols[1].to_string(),
        checkpoint: cols[2].to_string(),
        version: cols[3].to_string(),
        raw26: optional(cols[4])?,
        site_code: optional(cols[5])?,
        user_code: optional(cols[6])?,
        nombre: cols[7].to_string(),
        autorizado: flag(cols[8])?,
        casco: flag(cols[9])?,
        score: optional::<f32>(cols[10])?.unwrap_or(0.0),
        img_path: cols[11].to_string(),
    })
}
