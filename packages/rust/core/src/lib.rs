//! Cycle orchestration for ctirelay.
//!
//! This crate ties the queue and the graph builder together into polling
//! cycles: drain every client queue, build objects per record, assemble one
//! bundle, and hand it to a [`Dispatcher`].

pub mod bundle;
pub mod dispatch;
pub mod poller;

pub use bundle::{Bundle, assemble};
pub use dispatch::{BundleMeta, DirectorySink, Dispatcher, HttpSink, Sink, WorkId};
pub use poller::{CycleOutcome, CycleReport, Poller, PollerConfig, work_label};
