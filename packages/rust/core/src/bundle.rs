//! Bundle assembly: every object of one cycle in a single envelope.

use std::collections::HashSet;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use ctirelay_graph::{BundleType, RecordGraph, StixObjectRef};
use ctirelay_shared::Result;

/// A STIX bundle borrowing its objects from the cycle's record graphs.
#[derive(Debug, Clone, Serialize)]
pub struct Bundle<'a> {
    #[serde(rename = "type")]
    object_type: BundleType,
    id: String,
    objects: Vec<StixObjectRef<'a>>,
}

impl<'a> Bundle<'a> {
    /// Bundle id (`bundle--<uuid v7>`), unique per assembly.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn objects(&self) -> &[StixObjectRef<'a>] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Serialize to the JSON bytes handed to the dispatcher.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Hex SHA-256 of serialized bundle bytes.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Flatten record graphs, in order, into one bundle.
///
/// Objects whose id already appeared earlier are dropped. Returns `None`
/// when there is nothing to send.
pub fn assemble<'a, I>(graphs: I) -> Option<Bundle<'a>>
where
    I: IntoIterator<Item = &'a RecordGraph>,
{
    let mut seen: HashSet<&'a str> = HashSet::new();
    let mut objects = Vec::new();
    let mut duplicates = 0usize;

    for graph in graphs {
        for object in graph.objects() {
            if seen.insert(object.id()) {
                objects.push(object);
            } else {
                duplicates += 1;
            }
        }
    }

    if duplicates > 0 {
        debug!(duplicates, "dropped objects already present in this bundle");
    }
    if objects.is_empty() {
        return None;
    }

    Some(Bundle {
        object_type: BundleType::Tag,
        id: format!("bundle--{}", Uuid::now_v7()),
        objects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ctirelay_graph::{GraphBuilder, IngestContext, RecordOutcome};
    use ctirelay_shared::{AppConfig, RawRecord};
    use serde_json::{Value, json};

    fn build(ctx: &IngestContext, records: &[Value]) -> Vec<RecordGraph> {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let builder = GraphBuilder::new(ctx, now);
        records
            .iter()
            .filter_map(|r| match builder.build(&RawRecord(r.clone())) {
                RecordOutcome::Built(g) => Some(g),
                RecordOutcome::Skipped(_) => None,
            })
            .collect()
    }

    fn ctx() -> IngestContext {
        IngestContext::from_config(&AppConfig::default()).unwrap()
    }

    #[test]
    fn nothing_to_send() {
        assert!(assemble(Vec::<RecordGraph>::new().iter()).is_none());

        let ctx = ctx();
        let graphs = build(&ctx, &[json!({"value": "10.0.0.1", "label": ["x"]})]);
        assert!(graphs.is_empty());
        assert!(assemble(&graphs).is_none());
    }

    #[test]
    fn objects_keep_record_order() {
        let ctx = ctx();
        let graphs = build(
            &ctx,
            &[
                json!({"value": "http://example.com/abc", "description": "d", "label": ["t1"], "score": 50}),
                json!({"value": "other.example", "label": ["t2"]}),
            ],
        );
        let bundle = assemble(&graphs).unwrap();

        assert_eq!(bundle.len(), 11);
        let types: Vec<_> = bundle.objects().iter().map(|o| o.stix_type()).collect();
        assert_eq!(
            types,
            vec![
                "url", "indicator", "relationship",
                "domain-name", "indicator", "relationship",
                "relationship", "relationship",
                "domain-name", "indicator", "relationship",
            ]
        );
        assert!(bundle.id().starts_with("bundle--"));
    }

    #[test]
    fn duplicate_records_collapse() {
        let ctx = ctx();
        let record = json!({"value": "http://example.com/abc", "label": ["t1"]});
        let graphs = build(&ctx, &[record.clone(), record]);
        assert_eq!(graphs.len(), 2);

        let bundle = assemble(&graphs).unwrap();
        assert_eq!(bundle.len(), 8);

        let ids: HashSet<_> = bundle.objects().iter().map(|o| o.id()).collect();
        assert_eq!(ids.len(), bundle.len());
    }

    #[test]
    fn serializes_as_stix_bundle() {
        let ctx = ctx();
        let graphs = build(&ctx, &[json!({"value": "example.com", "label": []})]);
        let bundle = assemble(&graphs).unwrap();

        let bytes = bundle.to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "bundle");
        assert_eq!(value["id"], bundle.id());
        assert_eq!(value["objects"].as_array().unwrap().len(), 3);
        assert_eq!(value["objects"][0]["type"], "domain-name");

        assert_eq!(digest(&bytes).len(), 64);
        assert_eq!(digest(&bytes), digest(&bytes));
    }
}
