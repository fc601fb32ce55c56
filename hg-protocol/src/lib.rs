use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Header carrying the shared secret on every request to the edge functions
pub const EDGE_KEY_HEADER: &str = "x-edge-key";

/// Multipart field holding the period tag
pub const UPLOAD_FIELD_PERIOD: &str = "yyyymm";

/// Multipart file part holding the period CSV
pub const UPLOAD_PART_CSV: &str = "csv";

/// Multipart file part holding the period manifest
pub const UPLOAD_PART_MANIFEST: &str = "manifest";

/// Maximum number of body characters kept for diagnostics on unparsable replies
pub const MAX_BODY_EXCERPT: usize = 256;

/// Header line of every audit log file
pub const EVENTS_CSV_HEADER: &str =
    "timestamp,tz,checkpoint,version,raw26,site_code,user_code,nombre,autorizado,casco,score,img_path";

/// Number of columns in an audit log line
pub const EVENTS_CSV_COLUMNS: usize = 12;

/// Header line of the authorization table
pub const CARDS_CSV_HEADER: &str = "site_code,user_code,nombre,enabled";

/// Class label of the "helmet present" detections
pub const LABEL_HELMET: &str = "casco";

/// Class label of the "helmet absent" detections
pub const LABEL_NO_HELMET: &str = "nocasco";

/// File name of a period's audit log (`events_<period>.csv`, or `events.csv`
/// when rotation is disabled and the tag is empty)
pub fn events_csv_name(period: &str) -> String {
    if period.is_empty() {
        "events.csv".to_string()
    } else {
        format!("events_{}.csv", period)
    }
}

/// File name of a period's manifest
pub fn events_manifest_name(period: &str) -> String {
    if period.is_empty() {
        "events.manifest.json".to_string()
    } else {
        format!("events_{}.manifest.json", period)
    }
}

// ============================================================================
// Period manifest
// ============================================================================

/// Integrity and summary record of one rotation period's audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodManifest {
    /// Period tag (`YYYYMM`, empty when rotation is disabled)
    pub month: String,
    /// Path of the audit log the manifest describes
    pub csv: String,
    /// Number of data lines (header excluded)
    pub count: u64,
    /// Lowercase hex SHA-256 of the whole file
    pub sha256: String,
    pub checkpoint: String,
    pub version: u32,
    pub tz: String,
    pub updated_at: String,
}

// ============================================================================
// Authorization list sync
// ============================================================================

/// Last successfully applied authorization list update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Manifest published by the remote authorization list endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCardsManifest {
    /// Usually an epoch in seconds, sometimes a string
    #[serde(default)]
    pub version: serde_json::Value,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<serde_json::Value>,
}

impl RemoteCardsManifest {
    /// Version rendered the way it is persisted in the sync state
    pub fn version_string(&self) -> String {
        match &self.version {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.url.as_deref() {
            None | Some("") => return Err("manifest has no 'url'".into()),
            Some(_) => {}
        }
        if !self.sha256.is_empty() {
            validate_sha256_hex(&self.sha256)?;
        }
        Ok(())
    }
}

// ============================================================================
// Event upload
// ============================================================================

/// Reply of the upload endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub ok: bool,
    /// Server recomputed the digest and it matched the manifest
    #[serde(default)]
    pub verified: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UploadResponse {
    pub fn is_verified(&self) -> bool {
        self.ok && self.verified
    }
}

// ============================================================================
// External classifier
// ============================================================================

/// One detection reported by the external single-frame classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub w: i32,
    #[serde(default)]
    pub h: i32,
    pub score: f32,
}

/// Output of the external classifier for one captured frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifierFrame {
    #[serde(default)]
    pub detections: Vec<Detection>,
    /// Saved proof image of this frame, if the classifier keeps one
    #[serde(default)]
    pub image: Option<String>,
}

// ============================================================================
// Tolerant response decoding
// ============================================================================

/// Unwrap a `Transfer-Encoding: chunked` body that reached us undecoded.
///
/// Anything that does not look like a complete chunked body is returned
/// unchanged.
pub fn dechunk(body: &str) -> Cow<'_, str> {
    let mut out = String::new();
    let mut i = 0usize;
    loop {
        let Some(rel) = body.get(i..).and_then(|rest| rest.find("\r\n")) else {
            return Cow::Borrowed(body);
        };
        let j = i + rel;
        let size = match usize::from_str_radix(body[i..j].trim(), 16) {
            Ok(size) => size,
            Err(_) => return Cow::Borrowed(body),
        };
        i = j + 2;
        if size == 0 {
            return Cow::Owned(out);
        }
        let Some(end) = i.checked_add(size) else {
            return Cow::Borrowed(body);
        };
        match body.get(i..end) {
            Some(chunk) => out.push_str(chunk),
            None => return Cow::Borrowed(body),
        }
        // skip the CRLF that terminates the chunk
        i = end.saturating_add(2).min(body.len());
    }
}

/// Parse a JSON body directly, falling back to dechunking it first
pub fn parse_tolerant<T: DeserializeOwned>(body: &[u8]) -> Option<T> {
    if let Ok(v) = serde_json::from_slice::<T>(body) {
        return Some(v);
    }
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        return None;
    }
    serde_json::from_str::<T>(&dechunk(&text)).ok()
}

/// First characters of a body, for logging replies we could not parse
pub fn body_excerpt(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(body);
    Some(text.chars().take(MAX_BODY_EXCERPT).collect())
}

// ============================================================================
// Validation
// ============================================================================

/// Period tags are `YYYYMM`; the empty tag stands for the non-rotating log
pub fn validate_period_tag(tag: &str) -> Result<(), &'static str> {
    if tag.is_empty() {
        return Ok(());
    }
    if tag.len() != 6 || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return Err("Period tag must be six digits (YYYYMM)");
    }
    let month: u32 = tag[4..].parse().map_err(|_| "Invalid month")?;
    if !(1..=12).contains(&month) {
        return Err("Period month must be 01-12");
    }
    Ok(())
}

pub fn validate_sha256_hex(digest: &str) -> Result<(), String> {
    if digest.len() != 64 {
        return Err(format!("SHA-256 digest must be 64 hex chars, got {}", digest.len()));
    }
    if !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err("SHA-256 digest contains non-hex characters".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(parts: &[&str]) -> String {
        let mut body = String::new();
        for part in parts {
            body.push_str(&format!("{:x}\r\n{}\r\n", part.len(), part));
        }
        body.push_str("0\r\n\r\n");
        body
    }

    #[test]
    fn test_dechunk_plain_body_untouched() {
        let body = r#"{"ok":true}"#;
        assert_eq!(dechunk(body), body);
    }

    #[test]
    fn test_dechunk_chunked_body() {
        let body = chunked(&["{\"ok\":t", "rue}"]);
        assert_eq!(dechunk(&body), "{\"ok\":true}");
    }

    #[test]
    fn test_dechunk_truncated_body_untouched() {
        let body = "ff\r\n{\"ok\":true}\r\n";
        assert_eq!(dechunk(body), body);
    }

    #[test]
    fn test_dechunk_oversize_chunk_length() {
        let body = "ffffffffffffffff\r\nx";
        assert_eq!(dechunk(body), body);
        assert!(parse_tolerant::<UploadResponse>(body.as_bytes()).is_none());
    }

    #[test]
    fn test_parse_tolerant_chunked_upload_reply() {
        let body = chunked(&["{\"ok\":true,\"verifi", "ed\":true,\"n\":3", "}"]);
        let resp: UploadResponse = parse_tolerant(body.as_bytes()).unwrap();
        assert!(resp.is_verified());
        assert_eq!(resp.extra.get("n"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_parse_tolerant_garbage() {
        assert!(parse_tolerant::<UploadResponse>(b"<html>502</html>").is_none());
        assert!(parse_tolerant::<UploadResponse>(b"").is_none());
    }

    #[test]
    fn test_body_excerpt_truncates() {
        let body = vec![b'x'; 1000];
        assert_eq!(body_excerpt(&body).unwrap().len(), MAX_BODY_EXCERPT);
        assert_eq!(body_excerpt(b""), None);
    }

    #[test]
    fn test_remote_manifest_version_string() {
        let m: RemoteCardsManifest = serde_json::from_str(
            r#"{"version":1723731000,"sha256":"","url":"https://x/cards.csv"}"#,
        )
        .unwrap();
        assert_eq!(m.version_string(), "1723731000");
        assert!(m.validate().is_ok());

        let m: RemoteCardsManifest =
            serde_json::from_str(r#"{"version":"v7","sha256":"abc"}"#).unwrap();
        assert_eq!(m.version_string(), "v7");
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_validate_period_tag() {
        assert!(validate_period_tag("202508").is_ok());
        assert!(validate_period_tag("").is_ok());
        assert!(validate_period_tag("202513").is_err());
        assert!(validate_period_tag("2025-08").is_err());
    }

    #[test]
    fn test_file_names() {
        assert_eq!(events_csv_name("202508"), "events_202508.csv");
        assert_eq!(events_manifest_name("202508"), "events_202508.manifest.json");
        assert_eq!(events_csv_name(""), "events.csv");
    }
}
