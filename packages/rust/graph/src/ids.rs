//! Deterministic, content-derived STIX identifiers.
//!
//! Ids are `<type>--<uuid v5>` over the compact JSON of the properties that
//! define an object's identity, keys in lexicographic order. Re-deriving an id
//! from the same inputs always yields the same value, so the downstream
//! platform merges repeated submissions instead of duplicating them.

use std::collections::BTreeMap;

use uuid::Uuid;

/// Namespace shared by every content-derived id.
pub const ID_NAMESPACE: Uuid = Uuid::from_u128(0x00abedb4_aa42_466c_9c01_fed23315a9b7);

/// Hash `fields` (sorted by key) into a `<prefix>--<uuid v5>` id.
fn derive(prefix: &str, fields: &[(&str, &str)]) -> String {
    let sorted: BTreeMap<&str, &str> = fields.iter().copied().collect();
    // Serializing a map of strings cannot fail.
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();
    format!("{prefix}--{}", Uuid::new_v5(&ID_NAMESPACE, canonical.as_bytes()))
}

/// Id of a cyber observable keyed by its `value` (url, domain-name).
pub fn observable_id(stix_type: &str, value: &str) -> String {
    derive(stix_type, &[("value", value)])
}

/// Id of an indicator keyed by its detection pattern.
pub fn indicator_id(pattern: &str) -> String {
    derive("indicator", &[("pattern", pattern)])
}

/// Id of a relationship keyed by `(type, source, target)`.
pub fn relationship_id(relationship_type: &str, source_ref: &str, target_ref: &str) -> String {
    derive(
        "relationship",
        &[
            ("relationship_type", relationship_type),
            ("source_ref", source_ref),
            ("target_ref", target_ref),
        ],
    )
}

/// Id of an identity keyed by its normalized name and class.
pub fn identity_id(name: &str, identity_class: &str) -> String {
    let normalized = name.trim().to_lowercase();
    derive(
        "identity",
        &[("name", normalized.as_str()), ("identity_class", identity_class)],
    )
}
