//! Producer identity and marking context.
//!
//! Built once at startup from [`AppConfig`] and passed by reference into every
//! graph build. Construction is where misconfiguration becomes fatal.

use ctirelay_shared::{AppConfig, Result};

use crate::marking::TlpMarking;
use crate::stix::Identity;

/// Constants stamped onto every object the graph builder creates.
#[derive(Debug, Clone)]
pub struct IngestContext {
    /// Organization credited as creator.
    pub identity: Identity,
    /// Marking applied to every object.
    pub marking: TlpMarking,
    /// Score for records that carry none.
    pub default_confidence: u8,
    /// Whether observables get an indicator and a based-on edge.
    pub create_indicators: bool,
    /// Labels appended to every record's own labels.
    pub default_labels: Vec<String>,
}

impl IngestContext {
    /// Resolve the context from config. Fails on an unknown marking.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let marking: TlpMarking = config.graph.default_marking.parse()?;
        let identity = Identity::new(
            config.identity.name.clone(),
            config.identity.description.clone(),
            config.identity.identity_class.clone(),
        );

        Ok(Self {
            identity,
            marking,
            default_confidence: config.connector.confidence_level,
            create_indicators: config.graph.create_indicators,
            default_labels: config.graph.default_labels.clone(),
        })
    }

    /// Record labels followed by the default labels, first occurrence kept.
    pub fn labels_for(&self, record_labels: &[String]) -> Vec<String> {
        let mut merged: Vec<String> = Vec::with_capacity(record_labels.len() + self.default_labels.len());
        for label in record_labels.iter().chain(&self.default_labels) {
            if !merged.contains(label) {
                merged.push(label.clone());
            }
        }
        merged
    }
}
