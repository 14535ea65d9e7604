//! The polling loop: drain → classify → build → assemble → dispatch.
//!
//! ```text
//!        tick                       cycle finished (always)
//!  Idle ──────► Draining ─────────────────────────────────► Idle
//!   │
//!   └── shutdown signal (only observed here)
//! ```
//!
//! A cycle never fails as a whole: queue and dispatch problems abort the
//! cycle, drained records that built objects go back to their queues, and the
//! next tick retries. The producer identity is registered with the dispatcher
//! before the first bundle and again after any failed registration.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use ctirelay_graph::{GraphBuilder, IngestContext, RecordOutcome, SkipReason};
use ctirelay_queue::QueueStore;
use ctirelay_shared::{AppConfig, ClientId, CtiRelayError, RawRecord, Result};

use crate::bundle::{self, Bundle};
use crate::dispatch::{Dispatcher, WorkId};

// ---------------------------------------------------------------------------
// PollerConfig
// ---------------------------------------------------------------------------

/// Runtime settings of the polling loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Source name used in work labels.
    pub connector_name: String,
    /// Time between cycle starts.
    pub interval: Duration,
    /// Passed through to [`Dispatcher::send`].
    pub update_existing: bool,
    /// Upper bound for each dispatcher call.
    pub dispatch_timeout: Duration,
}

impl PollerConfig {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        if config.connector.poll_interval_secs == 0 {
            return Err(CtiRelayError::config(
                "connector.poll_interval_secs must be greater than zero",
            ));
        }
        Ok(Self {
            connector_name: config.connector.name.clone(),
            interval: Duration::from_secs(config.connector.poll_interval_secs),
            update_existing: config.connector.update_existing_data,
            dispatch_timeout: Duration::from_secs(config.sink.timeout_secs),
        })
    }
}

/// `"<name> run @ <RFC 3339 UTC>"`.
pub fn work_label(connector_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{connector_name} run @ {}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

// ---------------------------------------------------------------------------
// CycleReport
// ---------------------------------------------------------------------------

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// One bundle handed to the dispatcher.
    Dispatched { work_id: WorkId },
    /// No objects were built; the dispatcher was not called.
    NothingToSend,
    /// Queue, registration or dispatch failure; records that built objects
    /// were requeued.
    Aborted { reason: String },
}

/// Counters and outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub label: String,
    pub started_at: DateTime<Utc>,
    /// Clients that had pending records.
    pub clients: usize,
    pub records: usize,
    pub built: usize,
    /// Records rejected by validation.
    pub skipped: usize,
    /// Valid records of a kind with no object builder (IPv4, IPv6).
    pub unsupported: usize,
    /// Objects in the assembled bundle.
    pub objects: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(label: String, started_at: DateTime<Utc>) -> Self {
        Self {
            label,
            started_at,
            clients: 0,
            records: 0,
            built: 0,
            skipped: 0,
            unsupported: 0,
            objects: 0,
            outcome: CycleOutcome::NothingToSend,
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Drives cycles over a queue store and a dispatcher.
pub struct Poller<Q, D> {
    queue: Q,
    dispatcher: D,
    ctx: IngestContext,
    config: PollerConfig,
    identity_registered: AtomicBool,
}

impl<Q: QueueStore, D: Dispatcher> Poller<Q, D> {
    pub fn new(queue: Q, dispatcher: D, ctx: IngestContext, config: PollerConfig) -> Self {
        Self {
            queue,
            dispatcher,
            ctx,
            config,
            identity_registered: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Run cycles on the configured interval until `shutdown` flips to
    /// `true` or its sender is dropped. A running cycle always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            "polling loop started"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            // Outside the select: never cancelled by shutdown.
            self.run_cycle().await;
        }

        info!("polling loop stopped");
    }

    /// Run exactly one cycle.
    #[instrument(skip_all, fields(connector = %self.config.connector_name))]
    pub async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let label = work_label(&self.config.connector_name, started_at);
        let mut report = CycleReport::new(label, started_at);

        if let Err(e) = self.ensure_identity().await {
            error!(error = %e, "identity registration failed, leaving queues untouched");
            report.outcome = CycleOutcome::Aborted {
                reason: e.to_string(),
            };
            return report;
        }

        let clients = match self.queue.clients() {
            Ok(clients) => clients,
            Err(e) => {
                error!(error = %e, "listing queues failed, aborting cycle");
                report.outcome = CycleOutcome::Aborted {
                    reason: e.to_string(),
                };
                return report;
            }
        };

        let drained = self.drain_all(clients);
        report.clients = drained.len();

        let builder = GraphBuilder::new(&self.ctx, started_at);
        let mut graphs = Vec::new();
        // Only records that built objects are worth retrying.
        let mut retry: Vec<(ClientId, Vec<RawRecord>)> = Vec::new();
        for (client, records) in drained {
            let mut built = Vec::new();
            for (index, record) in records.into_iter().enumerate() {
                report.records += 1;
                match builder.build(&record) {
                    RecordOutcome::Built(graph) => {
                        report.built += 1;
                        graphs.push(graph);
                        built.push(record);
                    }
                    RecordOutcome::Skipped(SkipReason::UnsupportedKind(kind)) => {
                        report.unsupported += 1;
                        debug!(%client, index, %kind, "no builder for observable kind");
                    }
                    RecordOutcome::Skipped(reason) => {
                        report.skipped += 1;
                        warn!(%client, index, %reason, "skipping invalid record");
                    }
                }
            }
            if !built.is_empty() {
                retry.push((client, built));
            }
        }

        match bundle::assemble(&graphs) {
            None => {
                report.outcome = CycleOutcome::NothingToSend;
            }
            Some(bundle) => {
                report.objects = bundle.len();
                report.outcome = match self.dispatch(&bundle, &report.label).await {
                    Ok(work_id) => CycleOutcome::Dispatched { work_id },
                    Err(e) if e.is_cycle_abort() => {
                        error!(error = %e, "dispatch failed, requeueing built records");
                        self.requeue_all(retry);
                        CycleOutcome::Aborted {
                            reason: e.to_string(),
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "bundle cannot be dispatched, dropping cycle");
                        CycleOutcome::Aborted {
                            reason: e.to_string(),
                        }
                    }
                };
            }
        }

        info!(
            label = %report.label,
            clients = report.clients,
            records = report.records,
            built = report.built,
            skipped = report.skipped,
            unsupported = report.unsupported,
            objects = report.objects,
            outcome = ?report.outcome,
            "cycle finished"
        );
        report
    }

    /// Drain every client; a failing client is logged and left for next time.
    fn drain_all(&self, clients: Vec<ClientId>) -> Vec<(ClientId, Vec<RawRecord>)> {
        let mut drained = Vec::new();
        for client in clients {
            match self.queue.drain(&client) {
                Ok(records) if records.is_empty() => {}
                Ok(records) => {
                    debug!(%client, count = records.len(), "drained queue");
                    drained.push((client, records));
                }
                Err(e) => warn!(%client, error = %e, "drain failed, skipping client"),
            }
        }
        drained
    }

    /// Register the producer identity unless an earlier call succeeded.
    async fn ensure_identity(&self) -> Result<()> {
        if self.identity_registered.load(Ordering::Acquire) {
            return Ok(());
        }
        self.bounded(
            "register identity",
            self.dispatcher.register_identity(&self.ctx.identity),
        )
        .await?;
        self.identity_registered.store(true, Ordering::Release);
        info!(identity = %self.ctx.identity.id, "producer identity registered");
        Ok(())
    }

    fn requeue_all(&self, drained: Vec<(ClientId, Vec<RawRecord>)>) {
        for (client, records) in drained {
            let count = records.len();
            if let Err(e) = self.queue.requeue(&client, records) {
                error!(%client, count, error = %e, "requeue failed, records lost");
            }
        }
    }

    async fn dispatch(&self, bundle: &Bundle<'_>, label: &str) -> Result<WorkId> {
        let bytes = bundle.to_bytes()?;
        let work_id = self
            .bounded("initiate work", self.dispatcher.initiate_work(label))
            .await?;
        self.bounded(
            "send bundle",
            self.dispatcher
                .send(&bytes, &work_id, self.config.update_existing),
        )
        .await?;

        info!(%work_id, bundle_id = bundle.id(), objects = bundle.len(), "bundle dispatched");
        Ok(work_id)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.config.dispatch_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| CtiRelayError::Timeout {
                operation: operation.to_string(),
                secs: limit.as_secs(),
            })?
    }
}
