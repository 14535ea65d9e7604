//! Record classification and STIX object graph construction.
//!
//! [`classify`] validates one raw record and decides whether its value is a
//! URL, a domain, or an IP address. [`GraphBuilder`] turns the result into
//! linked observables, indicators and relationships from the [`stix`] model,
//! all carrying content-derived [`ids`]. [`IngestContext`] holds the identity
//! and marking stamped on every object.

pub mod builder;
pub mod classify;
pub mod context;
pub mod ids;
pub mod marking;
pub mod pattern;
pub mod stix;

pub use builder::{Detection, GraphBuilder, Observation, RecordGraph, RecordOutcome};
pub use classify::{ObservableKind, SkipReason, ValidatedRecord, classify};
pub use context::IngestContext;
pub use marking::TlpMarking;
pub use stix::{
    BundleType, Identity, Indicator, Observable, ObservableType, Relationship, RelationshipType,
    StixObjectRef,
};
