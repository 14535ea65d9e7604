//! STIX 2.1 object model for the objects this relay emits.
//!
//! Only the shapes needed downstream are modelled: URL and domain-name
//! observables, pattern indicators, relationships, the producer identity, and
//! the bundle envelope. Platform-specific custom properties are fixed typed
//! fields rather than open maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids;

/// STIX specification version written on every object.
pub const SPEC_VERSION: &str = "2.1";

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// STIX timestamps: RFC 3339, UTC, millisecond precision, `Z` suffix.
mod stix_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Observables
// ---------------------------------------------------------------------------

/// Cyber observable types this relay can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservableType {
    #[serde(rename = "url")]
    Url,
    #[serde(rename = "domain-name")]
    DomainName,
}

impl ObservableType {
    /// STIX type name (`url`, `domain-name`).
    pub fn stix_type(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::DomainName => "domain-name",
        }
    }

    /// Observable type name used by the downstream platform.
    pub fn main_observable_type(self) -> &'static str {
        match self {
            Self::Url => "Url",
            Self::DomainName => "Domain-Name",
        }
    }
}

/// Custom properties carried by every observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCtiExtensions {
    /// Producer identity id.
    pub x_opencti_created_by_ref: String,
    /// Free-text description from the record.
    pub x_opencti_description: String,
    /// Record labels.
    pub x_opencti_labels: Vec<String>,
    /// Record score.
    pub x_opencti_score: u8,
}

/// A URL or domain-name cyber observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observable {
    #[serde(rename = "type")]
    pub object_type: ObservableType,
    pub spec_version: String,
    pub id: String,
    pub value: String,
    pub object_marking_refs: Vec<String>,
    #[serde(flatten)]
    pub extensions: OpenCtiExtensions,
}

impl Observable {
    /// Build an observable; its id is derived from type and value.
    pub fn new(
        object_type: ObservableType,
        value: impl Into<String>,
        marking_ref: &str,
        extensions: OpenCtiExtensions,
    ) -> Self {
        let value = value.into();
        Self {
            id: ids::observable_id(object_type.stix_type(), &value),
            object_type,
            spec_version: SPEC_VERSION.into(),
            value,
            object_marking_refs: vec![marking_ref.to_string()],
            extensions,
        }
    }
}

// ---------------------------------------------------------------------------
// Indicator
// ---------------------------------------------------------------------------

/// Marker for the `type` field of SDO/SRO structs with a single fixed type.
macro_rules! fixed_type {
    ($name:ident, $value:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub enum $name {
            #[default]
            #[serde(rename = $value)]
            Tag,
        }
    };
}

fixed_type!(IndicatorType, "indicator");
fixed_type!(RelationshipObjectType, "relationship");
fixed_type!(IdentityType, "identity");
fixed_type!(BundleType, "bundle");

/// A STIX-pattern detection rule for one observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    #[serde(rename = "type")]
    pub object_type: IndicatorType,
    pub spec_version: String,
    pub id: String,
    #[serde(with = "stix_time")]
    pub created: DateTime<Utc>,
    #[serde(with = "stix_time")]
    pub modified: DateTime<Utc>,
    pub name: String,
    pub description: String,
    pub pattern: String,
    pub pattern_type: String,
    #[serde(with = "stix_time")]
    pub valid_from: DateTime<Utc>,
    pub labels: Vec<String>,
    pub confidence: u8,
    pub created_by_ref: String,
    pub object_marking_refs: Vec<String>,
    pub x_opencti_score: u8,
    pub x_opencti_main_observable_type: String,
}

// ---------------------------------------------------------------------------
// Relationship
// ---------------------------------------------------------------------------

/// The two edge kinds this relay emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipType {
    /// Indicator → the observable it detects.
    BasedOn,
    /// Two observables (or two indicators) seen together.
    RelatedTo,
}

impl RelationshipType {
    /// STIX relationship type name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BasedOn => "based-on",
            Self::RelatedTo => "related-to",
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, directed edge between two objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    pub object_type: RelationshipObjectType,
    pub spec_version: String,
    pub id: String,
    #[serde(with = "stix_time")]
    pub created: DateTime<Utc>,
    #[serde(with = "stix_time")]
    pub modified: DateTime<Utc>,
    pub relationship_type: RelationshipType,
    pub source_ref: String,
    pub target_ref: String,
    pub description: String,
    pub labels: Vec<String>,
    pub confidence: u8,
    pub created_by_ref: String,
    pub object_marking_refs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The organization credited as creator of every emitted object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "type")]
    pub object_type: IdentityType,
    pub spec_version: String,
    pub id: String,
    pub name: String,
    pub description: String,
    pub identity_class: String,
}

impl Identity {
    /// Build an identity; its id is derived from name and class.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        identity_class: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let identity_class = identity_class.into();
        Self {
            object_type: IdentityType::Tag,
            spec_version: SPEC_VERSION.into(),
            id: ids::identity_id(&name, &identity_class),
            name,
            description: description.into(),
            identity_class,
        }
    }
}

// ---------------------------------------------------------------------------
// Object references
// ---------------------------------------------------------------------------

/// Borrowed view of any emitted object, used to serialize bundles without
/// copying the builder's objects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StixObjectRef<'a> {
    Observable(&'a Observable),
    Indicator(&'a Indicator),
    Relationship(&'a Relationship),
}

impl<'a> StixObjectRef<'a> {
    /// The referenced object's id.
    pub fn id(&self) -> &'a str {
        match *self {
            Self::Observable(o) => &o.id,
            Self::Indicator(i) => &i.id,
            Self::Relationship(r) => &r.id,
        }
    }

    /// The referenced object's STIX type name.
    pub fn stix_type(&self) -> &'static str {
        match self {
            Self::Observable(o) => o.object_type.stix_type(),
            Self::Indicator(_) => "indicator",
            Self::Relationship(_) => "relationship",
        }
    }
}
