//! Core domain types shared by the producer and consumer sides.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CtiRelayError, Result};

/// Longest accepted client identifier.
const MAX_CLIENT_ID_LEN: usize = 255;

// ---------------------------------------------------------------------------
// ClientId
// ---------------------------------------------------------------------------

/// Queue key for one producer: the bearer token it authenticated with.
///
/// The value doubles as a file name inside the data directory, so only a
/// conservative character set is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Validate and wrap a client identifier.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_CLIENT_ID_LEN {
            return Err(CtiRelayError::validation(format!(
                "client id must be 1..={MAX_CLIENT_ID_LEN} characters"
            )));
        }
        if raw.starts_with('.') {
            return Err(CtiRelayError::validation(
                "client id must not start with '.'",
            ));
        }
        if let Some(bad) = raw.chars().find(|c| !is_client_id_char(*c)) {
            return Err(CtiRelayError::validation(format!(
                "client id contains unsupported character {bad:?}"
            )));
        }
        Ok(Self(raw))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_client_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~' | '+' | '=' | '-')
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ClientId {
    type Err = CtiRelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ClientId {
    type Error = CtiRelayError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// One producer-submitted record, exactly as it sits in the queue.
///
/// Kept as untyped JSON so that a single malformed element never makes the
/// whole queue file unreadable. Shape checks happen in the record validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Value);

impl RawRecord {
    /// Look up a top-level field. Returns `None` for non-object records.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.as_object().and_then(|obj| obj.get(name))
    }

    /// Whether the record is a JSON object at all.
    pub fn is_object(&self) -> bool {
        self.0.is_object()
    }
}

impl From<Value> for RawRecord {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Parse a producer body into records.
///
/// The body must be a JSON array; elements are accepted as-is.
pub fn parse_records(body: &str) -> Result<Vec<RawRecord>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| CtiRelayError::validation(format!("body is not valid JSON: {e}")))?;

    match value {
        Value::Array(items) => Ok(items.into_iter().map(RawRecord).collect()),
        _ => Err(CtiRelayError::validation("data is not list format")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_id_accepts_token_characters() {
        let id = ClientId::new("a1b2-C3_d4.e5~f+g=").expect("valid id");
        assert_eq!(id.as_str(), "a1b2-C3_d4.e5~f+g=");
    }

    #[test]
    fn client_id_rejects_path_tricks() {
        assert!(ClientId::new("").is_err());
        assert!(ClientId::new("../etc/passwd").is_err());
        assert!(ClientId::new(".hidden").is_err());
        assert!(ClientId::new("a/b").is_err());
        assert!(ClientId::new("a b").is_err());
        assert!(ClientId::new("x".repeat(256)).is_err());
    }

    #[test]
    fn client_id_serde_validates() {
        let ok: ClientId = serde_json::from_str("\"tok-1\"").expect("deserialize");
        assert_eq!(ok.to_string(), "tok-1");
        assert!(serde_json::from_str::<ClientId>("\"../x\"").is_err());
    }

    #[test]
    fn parse_records_requires_array() {
        let records = parse_records(r#"[{"value":"example.com"}, 42]"#).expect("array");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("value"), Some(&json!("example.com")));
        assert!(!records[1].is_object());
        assert!(records[1].field("value").is_none());

        let err = parse_records(r#"{"value":"example.com"}"#).unwrap_err();
        assert!(err.to_string().contains("not list format"));

        assert!(parse_records("not json").is_err());
    }

    #[test]
    fn raw_record_roundtrips_verbatim() {
        let original = json!({"value": "http://a.example/x", "label": ["t"], "extra": true});
        let record = RawRecord(original.clone());
        let text = serde_json::to_string(&record).expect("serialize");
        let back: RawRecord = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.0, original);
    }
}
