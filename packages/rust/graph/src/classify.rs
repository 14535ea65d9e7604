//! Record validation and observable classification.
//!
//! [`classify`] is a pure function of one raw record plus the configured
//! default confidence. Checks run in a fixed order: shape, labels, value,
//! score; the value is then matched as URL, domain, IPv4, IPv6 (first match
//! wins).

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use url::Url;

use ctirelay_shared::{MAX_CONFIDENCE, RawRecord};

/// Longest domain name accepted.
const MAX_DOMAIN_LEN: usize = 253;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a record's principal value turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservableKind {
    Url,
    Domain,
    Ipv4,
    Ipv6,
}

impl std::fmt::Display for ObservableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Url => "url",
            Self::Domain => "domain",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
        })
    }
}

/// A record that passed validation, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRecord {
    pub kind: ObservableKind,
    pub value: String,
    pub description: String,
    pub labels: Vec<String>,
    pub score: u8,
}

/// Why a record produced no objects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no label")]
    MissingLabel,

    #[error("label is not a sequence of strings")]
    LabelNotSequence,

    #[error("record has no string value")]
    MissingValue,

    #[error("description is not a string")]
    InvalidDescription,

    #[error("score is not an integer")]
    InvalidScore,

    #[error("score {0} is outside 0..=100")]
    ScoreOutOfRange(i64),

    #[error("value {0:?} is not a URL, domain, IPv4 or IPv6 address")]
    Unclassifiable(String),

    #[error("no object builder for {0} observables")]
    UnsupportedKind(ObservableKind),
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Validate one record and classify its value.
///
/// `Err` is the "Invalid" class: the caller drops the record and moves on.
pub fn classify(
    record: &RawRecord,
    default_confidence: u8,
) -> Result<ValidatedRecord, SkipReason> {
    if !record.is_object() {
        return Err(SkipReason::NotAnObject);
    }

    let labels = match record.field("label") {
        None | Some(Value::Null) => return Err(SkipReason::MissingLabel),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or(SkipReason::LabelNotSequence)?,
        Some(_) => return Err(SkipReason::LabelNotSequence),
    };

    // `url` is the key early producers used.
    let value = record
        .field("value")
        .or_else(|| record.field("url"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(SkipReason::MissingValue)?;

    let description = match record.field("description") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(SkipReason::InvalidDescription),
    };

    let score = match record.field("score") {
        None | Some(Value::Null) => default_confidence,
        Some(v) => {
            let n = v.as_i64().ok_or(SkipReason::InvalidScore)?;
            u8::try_from(n)
                .ok()
                .filter(|s| *s <= MAX_CONFIDENCE)
                .ok_or(SkipReason::ScoreOutOfRange(n))?
        }
    };

    let kind = classify_value(value).ok_or_else(|| SkipReason::Unclassifiable(value.to_string()))?;
    // Same normalization the URL parser applies to hosts.
    let value = match kind {
        ObservableKind::Domain => value.to_ascii_lowercase(),
        _ => value.to_string(),
    };

    Ok(ValidatedRecord {
        kind,
        value,
        description,
        labels,
        score,
    })
}

/// Match a bare value against the four observable kinds, in order.
pub fn classify_value(value: &str) -> Option<ObservableKind> {
    if is_url(value) {
        Some(ObservableKind::Url)
    } else if is_domain(value) {
        Some(ObservableKind::Domain)
    } else if value.parse::<Ipv4Addr>().is_ok() {
        Some(ObservableKind::Ipv4)
    } else if value.parse::<Ipv6Addr>().is_ok() {
        Some(ObservableKind::Ipv6)
    } else {
        None
    }
}

/// Whether `value` is an absolute http(s)/ftp URL with a host.
pub fn is_url(value: &str) -> bool {
    static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^(?:https?|ftp)://[^\s/?#]+(?:[/?#]\S*)?$").expect("valid regex")
    });

    if !URL_RE.is_match(value) {
        return false;
    }
    Url::parse(value)
        .ok()
        .and_then(|u| u.host_str().map(|h| !h.is_empty()))
        .unwrap_or(false)
}

/// Whether `value` is a syntactically valid domain name.
pub fn is_domain(value: &str) -> bool {
    static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)^(?:[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?\.)+(?:[a-z]{2,63}|xn--[a-z0-9-]{1,59})$",
        )
        .expect("valid regex")
    });

    value.len() <= MAX_DOMAIN_LEN && DOMAIN_RE.is_match(value)
}

/// Hostname of a URL, if it has one and it is a valid domain.
pub fn url_domain(value: &str) -> Option<String> {
    let url = Url::parse(value).ok()?;
    let host = url.host_str()?;
    is_domain(host).then(|| host.to_string())
}
