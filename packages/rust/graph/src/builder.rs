//! Object graph builder: one validated record in, linked STIX objects out.
//!
//! ```text
//! URL record:
//!   url ◄── based-on ── indicator(url)
//!    ▲                      ▲
//!    │ related-to           │ related-to
//!    │                      │
//!   domain-name ◄─ based-on ─ indicator(domain)
//! ```
//!
//! Domain records produce only the lower row. Indicators and their based-on
//! edges exist only when indicator creation is enabled.

use chrono::{DateTime, Utc};
use tracing::debug;

use ctirelay_shared::RawRecord;

use crate::classify::{self, ObservableKind, SkipReason, ValidatedRecord};
use crate::context::IngestContext;
use crate::ids;
use crate::pattern::{self, IndicatorPattern};
use crate::stix::{
    Indicator, IndicatorType, Observable, ObservableType, OpenCtiExtensions, Relationship,
    RelationshipObjectType, RelationshipType, SPEC_VERSION, StixObjectRef,
};

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// An indicator together with the based-on edge to its observable.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    indicator: Indicator,
    based_on: Relationship,
}

/// One observable plus, optionally, its indicator and based-on edge.
///
/// The indicator and the edge are present together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    observable: Observable,
    detection: Option<Detection>,
}

impl Observation {
    pub fn observable(&self) -> &Observable {
        &self.observable
    }

    pub fn indicator(&self) -> Option<&Indicator> {
        self.detection.as_ref().map(|d| &d.indicator)
    }

    /// The based-on edge from the indicator to the observable.
    pub fn relationship(&self) -> Option<&Relationship> {
        self.detection.as_ref().map(|d| &d.based_on)
    }

    /// Observable, indicator, relationship, in that order, skipping absent ones.
    pub fn objects(&self) -> impl Iterator<Item = StixObjectRef<'_>> {
        std::iter::once(StixObjectRef::Observable(&self.observable)).chain(
            self.detection.iter().flat_map(|d| {
                [
                    StixObjectRef::Indicator(&d.indicator),
                    StixObjectRef::Relationship(&d.based_on),
                ]
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// RecordGraph / RecordOutcome
// ---------------------------------------------------------------------------

/// Everything built from one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordGraph {
    kind: ObservableKind,
    observations: Vec<Observation>,
    relationships: Vec<Relationship>,
}

impl RecordGraph {
    /// Classification of the source record.
    pub fn kind(&self) -> ObservableKind {
        self.kind
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Edges between this record's observations (related-to).
    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// All objects in bundle order: each observation's members, then the
    /// cross-observation edges.
    pub fn objects(&self) -> impl Iterator<Item = StixObjectRef<'_>> {
        self.observations
            .iter()
            .flat_map(|o| o.objects())
            .chain(self.relationships.iter().map(StixObjectRef::Relationship))
    }
}

/// Per-record result: objects, or the reason there are none.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Built(RecordGraph),
    Skipped(SkipReason),
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

/// Builds record graphs against a fixed context and timestamp.
#[derive(Debug, Clone, Copy)]
pub struct GraphBuilder<'a> {
    ctx: &'a IngestContext,
    now: DateTime<Utc>,
}

impl<'a> GraphBuilder<'a> {
    /// `now` becomes `created`/`modified`/`valid_from` of every SDO/SRO.
    pub fn new(ctx: &'a IngestContext, now: DateTime<Utc>) -> Self {
        Self { ctx, now }
    }

    /// Validate, classify, and build one raw record.
    pub fn build(&self, record: &RawRecord) -> RecordOutcome {
        match classify::classify(record, self.ctx.default_confidence) {
            Ok(validated) => self.build_validated(&validated),
            Err(reason) => RecordOutcome::Skipped(reason),
        }
    }

    /// Build one already-validated record.
    pub fn build_validated(&self, record: &ValidatedRecord) -> RecordOutcome {
        match record.kind {
            ObservableKind::Url => {
                let url = self.observation(ObservableType::Url, &record.value, record);
                let mut graph = RecordGraph {
                    kind: record.kind,
                    observations: vec![url],
                    relationships: Vec::new(),
                };

                match classify::url_domain(&record.value) {
                    Some(host) => {
                        let domain = self.observation(ObservableType::DomainName, &host, record);
                        graph.relationships =
                            self.observation_relationships(&domain, &graph.observations[0], record);
                        graph.observations.push(domain);
                    }
                    None => debug!(value = %record.value, "URL host is not a domain, emitting URL only"),
                }

                RecordOutcome::Built(graph)
            }
            ObservableKind::Domain => RecordOutcome::Built(RecordGraph {
                kind: record.kind,
                observations: vec![self.observation(
                    ObservableType::DomainName,
                    &record.value,
                    record,
                )],
                relationships: Vec::new(),
            }),
            ObservableKind::Ipv4 | ObservableKind::Ipv6 => {
                RecordOutcome::Skipped(SkipReason::UnsupportedKind(record.kind))
            }
        }
    }

    /// Observable, plus indicator and based-on edge when enabled.
    fn observation(
        &self,
        object_type: ObservableType,
        value: &str,
        record: &ValidatedRecord,
    ) -> Observation {
        let labels = self.ctx.labels_for(&record.labels);
        let observable = Observable::new(
            object_type,
            value,
            self.ctx.marking.id(),
            OpenCtiExtensions {
                x_opencti_created_by_ref: self.ctx.identity.id.clone(),
                x_opencti_description: record.description.clone(),
                x_opencti_labels: labels.clone(),
                x_opencti_score: record.score,
            },
        );

        let detection = self.ctx.create_indicators.then(|| {
            let pattern = pattern::indicator_pattern(object_type, value);
            let indicator = self.indicator(value, &pattern, labels, record);
            let based_on = self.relationship(
                RelationshipType::BasedOn,
                &indicator.id,
                &observable.id,
                record,
            );
            Detection {
                indicator,
                based_on,
            }
        });

        Observation {
            observable,
            detection,
        }
    }

    fn indicator(
        &self,
        value: &str,
        pattern: &IndicatorPattern,
        labels: Vec<String>,
        record: &ValidatedRecord,
    ) -> Indicator {
        Indicator {
            object_type: IndicatorType::Tag,
            spec_version: SPEC_VERSION.into(),
            id: ids::indicator_id(&pattern.pattern),
            created: self.now,
            modified: self.now,
            name: value.to_string(),
            description: record.description.clone(),
            pattern: pattern.pattern.clone(),
            pattern_type: "stix".into(),
            valid_from: self.now,
            labels,
            confidence: record.score,
            created_by_ref: self.ctx.identity.id.clone(),
            object_marking_refs: vec![self.ctx.marking.id().to_string()],
            x_opencti_score: record.score,
            x_opencti_main_observable_type: pattern.main_observable_type.clone(),
        }
    }

    /// A relationship whose id depends only on `(type, source, target)`.
    pub fn relationship(
        &self,
        relationship_type: RelationshipType,
        source_id: &str,
        target_id: &str,
        record: &ValidatedRecord,
    ) -> Relationship {
        Relationship {
            object_type: RelationshipObjectType::Tag,
            spec_version: SPEC_VERSION.into(),
            id: ids::relationship_id(relationship_type.as_str(), source_id, target_id),
            created: self.now,
            modified: self.now,
            relationship_type,
            source_ref: source_id.to_string(),
            target_ref: target_id.to_string(),
            description: record.description.clone(),
            labels: self.ctx.labels_for(&record.labels),
            confidence: record.score,
            created_by_ref: self.ctx.identity.id.clone(),
            object_marking_refs: vec![self.ctx.marking.id().to_string()],
        }
    }

    /// related-to edges from `source` to `target`: observables always,
    /// indicators when both sides have one.
    fn observation_relationships(
        &self,
        source: &Observation,
        target: &Observation,
        record: &ValidatedRecord,
    ) -> Vec<Relationship> {
        let mut edges = vec![self.relationship(
            RelationshipType::RelatedTo,
            &source.observable.id,
            &target.observable.id,
            record,
        )];

        if let (Some(src), Some(dst)) = (source.indicator(), target.indicator()) {
            edges.push(self.relationship(RelationshipType::RelatedTo, &src.id, &dst.id, record));
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marking::TlpMarking;
    use chrono::TimeZone;
    use ctirelay_shared::AppConfig;
    use serde_json::json;

    fn ctx(create_indicators: bool) -> IngestContext {
        let mut config = AppConfig::default();
        config.graph.create_indicators = create_indicators;
        config.graph.default_marking = "amber".into();
        IngestContext::from_config(&config).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    fn scenario_record() -> RawRecord {
        RawRecord(json!({
            "value": "http://example.com/abc",
            "description": "d",
            "label": ["t1"],
            "score": 50
        }))
    }

    fn built(outcome: RecordOutcome) -> RecordGraph {
        match outcome {
            RecordOutcome::Built(graph) => graph,
            RecordOutcome::Skipped(reason) => panic!("expected Built, got Skipped({reason})"),
        }
    }

    fn count_type(graph: &RecordGraph, stix_type: &str) -> usize {
        graph.objects().filter(|o| o.stix_type() == stix_type).count()
    }

    #[test]
    fn url_record_with_indicators() {
        let ctx = ctx(true);
        let graph = built(GraphBuilder::new(&ctx, now()).build(&scenario_record()));

        assert_eq!(graph.kind(), ObservableKind::Url);
        assert_eq!(graph.observations().len(), 2);
        assert_eq!(graph.observations()[0].observable().value, "http://example.com/abc");
        assert_eq!(graph.observations()[1].observable().value, "example.com");

        assert_eq!(count_type(&graph, "url"), 1);
        assert_eq!(count_type(&graph, "domain-name"), 1);
        assert_eq!(count_type(&graph, "indicator"), 2);
        // 2 based-on + 2 related-to
        assert_eq!(count_type(&graph, "relationship"), 4);
        assert_eq!(graph.objects().count(), 8);

        let related: Vec<_> = graph.relationships().iter().collect();
        assert_eq!(related.len(), 2);
        assert!(related.iter().all(|r| r.relationship_type == RelationshipType::RelatedTo));

        let url_obs = &graph.observations()[0];
        let domain_obs = &graph.observations()[1];
        assert_eq!(related[0].source_ref, domain_obs.observable().id);
        assert_eq!(related[0].target_ref, url_obs.observable().id);
        assert_eq!(related[1].source_ref, domain_obs.indicator().unwrap().id);
        assert_eq!(related[1].target_ref, url_obs.indicator().unwrap().id);
    }

    #[test]
    fn url_record_without_indicators() {
        let ctx = ctx(false);
        let graph = built(GraphBuilder::new(&ctx, now()).build(&scenario_record()));

        assert_eq!(graph.objects().count(), 3);
        assert_eq!(graph.relationships().len(), 1);
        for obs in graph.observations() {
            assert!(obs.indicator().is_none());
            assert!(obs.relationship().is_none());
        }
    }

    #[test]
    fn based_on_links_indicator_to_observable() {
        let ctx = ctx(true);
        let graph = built(GraphBuilder::new(&ctx, now()).build(&scenario_record()));

        for obs in graph.observations() {
            let indicator = obs.indicator().expect("indicator");
            let rel = obs.relationship().expect("based-on");
            assert_eq!(rel.relationship_type, RelationshipType::BasedOn);
            assert_eq!(rel.source_ref, indicator.id);
            assert_eq!(rel.target_ref, obs.observable().id);
            assert_eq!(indicator.name, obs.observable().value);
        }

        let url_ind = graph.observations()[0].indicator().unwrap();
        assert_eq!(url_ind.pattern, "[url:value = 'http://example.com/abc']");
        assert_eq!(url_ind.x_opencti_main_observable_type, "Url");
        let dom_ind = graph.observations()[1].indicator().unwrap();
        assert_eq!(dom_ind.pattern, "[domain-name:value = 'example.com']");
        assert_eq!(dom_ind.x_opencti_main_observable_type, "Domain-Name");
    }

    #[test]
    fn objects_carry_context_and_record_metadata() {
        let ctx = ctx(true);
        let graph = built(GraphBuilder::new(&ctx, now()).build(&scenario_record()));
        let amber = TlpMarking::Amber.id();

        let obs = graph.observations()[0].observable();
        assert_eq!(obs.object_marking_refs, vec![amber]);
        assert_eq!(obs.extensions.x_opencti_created_by_ref, ctx.identity.id);
        assert_eq!(obs.extensions.x_opencti_description, "d");
        assert_eq!(obs.extensions.x_opencti_labels, vec!["t1"]);
        assert_eq!(obs.extensions.x_opencti_score, 50);

        let ind = graph.observations()[0].indicator().unwrap();
        assert_eq!(ind.confidence, 50);
        assert_eq!(ind.created, now());
        assert_eq!(ind.labels, vec!["t1"]);

        for rel in graph.relationships() {
            assert_eq!(rel.created_by_ref, ctx.identity.id);
            assert_eq!(rel.object_marking_refs, vec![amber]);
            assert_eq!(rel.description, "d");
        }
    }

    #[test]
    fn rebuilding_yields_identical_ids() {
        let ctx = ctx(true);
        let later = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let first = built(GraphBuilder::new(&ctx, now()).build(&scenario_record()));
        let second = built(GraphBuilder::new(&ctx, later).build(&scenario_record()));

        let ids = |g: &RecordGraph| g.objects().map(|o| o.id().to_string()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn relationship_id_is_deterministic() {
        let ctx = ctx(true);
        let builder = GraphBuilder::new(&ctx, now());
        let record = classify::classify(&scenario_record(), 50).unwrap();

        let a = builder.relationship(RelationshipType::BasedOn, "indicator--a", "url--b", &record);
        let b = builder.relationship(RelationshipType::BasedOn, "indicator--a", "url--b", &record);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn domain_ids_agree_across_record_kinds() {
        let ctx = ctx(true);
        let builder = GraphBuilder::new(&ctx, now());

        let from_url = built(builder.build(&RawRecord(json!({
            "value": "http://Example.COM/x",
            "label": ["t"]
        }))));
        let direct = built(builder.build(&RawRecord(json!({
            "value": "Example.COM",
            "label": ["t"]
        }))));

        let via_url = &from_url.observations()[1];
        let own = &direct.observations()[0];
        assert_eq!(via_url.observable().value, own.observable().value);
        assert_eq!(via_url.observable().id, own.observable().id);
        assert_eq!(via_url.indicator().unwrap().id, own.indicator().unwrap().id);
        assert_eq!(via_url.relationship().unwrap().id, own.relationship().unwrap().id);
    }

    #[test]
    fn domain_record_builds_single_observation() {
        let ctx = ctx(true);
        let record = RawRecord(json!({"value": "evil.example", "description": "", "label": ["x"]}));
        let graph = built(GraphBuilder::new(&ctx, now()).build(&record));

        assert_eq!(graph.kind(), ObservableKind::Domain);
        assert_eq!(graph.observations().len(), 1);
        assert!(graph.relationships().is_empty());
        assert_eq!(graph.objects().count(), 3);
        // Default confidence substituted.
        assert_eq!(graph.observations()[0].observable().extensions.x_opencti_score, 50);
    }

    #[test]
    fn url_with_ip_host_emits_url_only() {
        let ctx = ctx(true);
        let record = RawRecord(json!({"value": "http://10.0.0.1/login", "label": ["x"]}));
        let graph = built(GraphBuilder::new(&ctx, now()).build(&record));

        assert_eq!(graph.observations().len(), 1);
        assert!(graph.relationships().is_empty());
        assert_eq!(graph.objects().count(), 3);
    }

    #[test]
    fn ip_records_are_unsupported() {
        let ctx = ctx(true);
        let builder = GraphBuilder::new(&ctx, now());

        let v4 = RawRecord(json!({"value": "203.0.113.7", "label": ["x"]}));
        assert_eq!(
            builder.build(&v4),
            RecordOutcome::Skipped(SkipReason::UnsupportedKind(ObservableKind::Ipv4))
        );

        let v6 = RawRecord(json!({"value": "2001:db8::7", "label": ["x"]}));
        assert_eq!(
            builder.build(&v6),
            RecordOutcome::Skipped(SkipReason::UnsupportedKind(ObservableKind::Ipv6))
        );
    }

    #[test]
    fn invalid_records_build_nothing() {
        let ctx = ctx(true);
        let builder = GraphBuilder::new(&ctx, now());

        let no_label = RawRecord(json!({"value": "http://example.com/abc", "description": "d"}));
        assert_eq!(builder.build(&no_label), RecordOutcome::Skipped(SkipReason::MissingLabel));

        let bad_label = RawRecord(json!({"value": "http://example.com/abc", "label": "t1"}));
        assert_eq!(
            builder.build(&bad_label),
            RecordOutcome::Skipped(SkipReason::LabelNotSequence)
        );
    }
}
