//! STIX detection patterns for observables.

use crate::stix::ObservableType;

/// A detection pattern plus the observable type it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorPattern {
    /// STIX pattern expression.
    pub pattern: String,
    /// Platform name of the observable type (`Url`, `Domain-Name`).
    pub main_observable_type: String,
}

/// Escape a value for use inside a single-quoted STIX pattern literal.
fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Pattern matching an observable of `kind` with exactly `value`.
pub fn indicator_pattern(kind: ObservableType, value: &str) -> IndicatorPattern {
    IndicatorPattern {
        pattern: format!("[{}:value = '{}']", kind.stix_type(), escape_literal(value)),
        main_observable_type: kind.main_observable_type().to_string(),
    }
}
