use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use booksync_core::{DataSource, EntitySchema, EntitySchemaRegistry, SyncConfig};
use booksync_import::{read_csv_records, IngestError, RecordFetcher, RecordIngestor};
use booksync_storage::{DbPool, MergedView, ReconcileError, ReconciliationViewBuilder, UpsertWriter};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::SyncStateTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Fetching,
    Ingesting,
    Writing,
    Advancing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    Failed { phase: CyclePhase, error: String },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Completed)
    }
}

/// Structured counters for one incremental sync cycle. A cycle that
/// fetched zero records completes with all-zero counts; a cycle that
/// failed to fetch reports `Failed`; the two are never conflated.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub entity: String,
    /// Furthest phase the cycle reached.
    pub phase: CyclePhase,
    /// Upper bound of this cycle's fetch window, captured before the
    /// fetch began. On success the sync state advances to exactly this
    /// value.
    pub cutoff: DateTime<Utc>,
    /// Lower bound handed to the fetcher; `None` on a first run.
    pub since: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub ingested: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_stale: usize,
    pub skipped_invalid: usize,
    pub warnings: usize,
    /// Row count of the recomputed merged view, when reconciliation ran.
    pub reconciled_rows: Option<usize>,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(entity: &str, cutoff: DateTime<Utc>) -> Self {
        Self {
            entity: entity.to_string(),
            phase: CyclePhase::Fetching,
            cutoff,
            since: None,
            fetched: 0,
            ingested: 0,
            inserted: 0,
            updated: 0,
            skipped_stale: 0,
            skipped_invalid: 0,
            warnings: 0,
            reconciled_rows: None,
            outcome: CycleOutcome::Completed,
        }
    }

    fn fail(&mut self, phase: CyclePhase, error: impl ToString) {
        let error = error.to_string();
        tracing::error!(entity = %self.entity, ?phase, %error, "sync cycle failed");
        self.phase = phase;
        self.outcome = CycleOutcome::Failed { phase, error };
    }
}

/// Counters for one bulk CSV import pass.
#[derive(Debug, Clone, Serialize)]
pub struct CsvImportReport {
    pub entity: String,
    pub rows_read: usize,
    pub ingested: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_stale: usize,
    pub skipped_invalid: usize,
    pub warnings: usize,
    pub outcome: CycleOutcome,
}

/// Drives sync cycles: cutoff from the state tracker, records from the
/// fetch capability, rows through the ingestor and upsert writer, state
/// advanced only after a fully successful write.
///
/// At most one cycle per entity runs at a time, enforced by a mutex
/// keyed on the entity name; different entities may run concurrently
/// against the same pool.
pub struct SyncOrchestrator<F> {
    config: SyncConfig,
    pool: DbPool,
    tracker: SyncStateTracker,
    fetcher: F,
    registry: EntitySchemaRegistry,
    ingestor: RecordIngestor,
    entity_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancelled: AtomicBool,
}

impl<F: RecordFetcher> SyncOrchestrator<F> {
    pub fn new(config: SyncConfig, pool: DbPool, tracker: SyncStateTracker, fetcher: F) -> Self {
        Self {
            config,
            pool,
            tracker,
            fetcher,
            registry: EntitySchemaRegistry::new(),
            ingestor: RecordIngestor::new(),
            entity_locks: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &EntitySchemaRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &SyncStateTracker {
        &self.tracker
    }

    /// Requests abortion of in-flight cycles. Honored between batches;
    /// a batch that has begun writing runs to commit or rollback.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn clear_cancellation(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// One incremental cycle for one entity, with the cycle cutoff
    /// taken as the current time.
    pub async fn run_cycle(&self, entity: &str) -> CycleReport {
        self.run_cycle_at(entity, Utc::now()).await
    }

    /// One incremental cycle with an explicit cutoff: fetches records
    /// modified since the stored cutoff, upserts them, and on success
    /// advances the stored cutoff to `cutoff`, not to "now", which
    /// would skip records created while the fetch was running.
    pub async fn run_cycle_at(&self, entity: &str, cutoff: DateTime<Utc>) -> CycleReport {
        let _guard = self.entity_lock(entity).await;
        let mut report = CycleReport::new(entity, cutoff);

        let Some(schema) = self.registry.get(entity) else {
            report.fail(CyclePhase::Fetching, format!("unknown entity '{entity}'"));
            return report;
        };

        let timed_out = {
            let cycle = self.cycle_inner(schema, &mut report);
            match self.config.cycle_timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), cycle)
                    .await
                    .is_err(),
                None => {
                    cycle.await;
                    false
                }
            }
        };
        if timed_out {
            // Dropping the cycle future rolls back any in-flight batch
            // transaction; the window is re-fetched next invocation.
            let phase = report.phase;
            report.fail(phase, "cycle exceeded timeout");
        }
        report
    }

    async fn cycle_inner(&self, schema: &EntitySchema, report: &mut CycleReport) {
        let entity = schema.name();
        let cutoff = report.cutoff;
        let since = self.tracker.get_last_sync_time(Some(entity));
        report.since = since;

        report.phase = CyclePhase::Fetching;
        tracing::info!(entity, ?since, %cutoff, "starting sync cycle");
        let records = match self.fetcher.fetch(entity, since).await {
            Ok(records) => records,
            Err(err) => return report.fail(CyclePhase::Fetching, err),
        };
        report.fetched = records.len();

        let writer = UpsertWriter::new(&self.pool);
        for batch in records.chunks(self.config.batch_size.max(1)) {
            if self.cancelled.load(Ordering::SeqCst) {
                return report.fail(CyclePhase::Ingesting, "cycle cancelled between batches");
            }

            report.phase = CyclePhase::Ingesting;
            let mut rows = Vec::new();
            for raw in batch {
                match self.ingestor.ingest(schema, DataSource::Json, raw) {
                    Ok(outcome) => {
                        report.ingested += 1;
                        report.warnings += outcome.warnings;
                        rows.extend(outcome.rows);
                    }
                    Err(err @ IngestError::MissingBusinessKey { .. }) => {
                        tracing::warn!(entity, %err, "skipping invalid record");
                        report.skipped_invalid += 1;
                    }
                }
            }

            report.phase = CyclePhase::Writing;
            match writer.write(schema, DataSource::Json, &rows).await {
                Ok(counts) => {
                    report.inserted += counts.inserted;
                    report.updated += counts.updated;
                    report.skipped_stale += counts.skipped;
                }
                Err(err) => return report.fail(CyclePhase::Writing, err),
            }
        }

        report.phase = CyclePhase::Advancing;
        if !self.tracker.update_last_sync_time(Some(entity), cutoff) {
            // The window will be re-fetched next cycle; re-processing
            // is idempotent, losing the window would not be.
            return report.fail(CyclePhase::Advancing, "could not persist sync state");
        }

        tracing::info!(
            entity,
            fetched = report.fetched,
            inserted = report.inserted,
            updated = report.updated,
            skipped_stale = report.skipped_stale,
            skipped_invalid = report.skipped_invalid,
            "sync cycle complete"
        );
    }

    /// Runs one cycle per registered entity, sequentially, then
    /// recomputes the merged view for every entity whose cycle touched
    /// data. One entity failing never stops the others.
    pub async fn run_all(&self) -> Vec<CycleReport> {
        let entities = self.registry.entity_names();
        let mut reports = Vec::with_capacity(entities.len());
        for entity in entities {
            let mut report = self.run_cycle(entity).await;
            if report.outcome.is_success() && report.fetched > 0 {
                match self.reconcile(entity).await {
                    Ok(view) => report.reconciled_rows = Some(view.rows.len()),
                    Err(err) => {
                        // Fatal for this entity's reconciliation only.
                        tracing::error!(entity, %err, "reconciliation failed");
                    }
                }
            }
            reports.push(report);
        }
        reports
    }

    /// Recomputes and materializes the merged view for one entity,
    /// using the configured precedence for it.
    pub async fn reconcile(&self, entity: &str) -> Result<MergedView, ReconcileError> {
        let schema = self
            .registry
            .get(entity)
            .ok_or_else(|| ReconcileError::UnknownEntity(entity.to_string()))?;
        let precedence = self.config.precedence_for(entity);
        ReconciliationViewBuilder::new(&self.pool, precedence)
            .materialize(schema)
            .await
    }

    /// Bulk-imports one entity's CSV export. The export is a periodic
    /// full replace, so there is no cutoff involved; rows flow through
    /// the same ingest and upsert path as API records.
    pub async fn import_csv<R: Read>(&self, entity: &str, data: R) -> CsvImportReport {
        let _guard = self.entity_lock(entity).await;
        let mut report = CsvImportReport {
            entity: entity.to_string(),
            rows_read: 0,
            ingested: 0,
            inserted: 0,
            updated: 0,
            skipped_stale: 0,
            skipped_invalid: 0,
            warnings: 0,
            outcome: CycleOutcome::Completed,
        };

        let Some(schema) = self.registry.get(entity) else {
            report.outcome = CycleOutcome::Failed {
                phase: CyclePhase::Ingesting,
                error: format!("unknown entity '{entity}'"),
            };
            return report;
        };

        let records = match read_csv_records(data) {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(entity, %err, "csv import failed to read");
                report.outcome = CycleOutcome::Failed {
                    phase: CyclePhase::Ingesting,
                    error: err.to_string(),
                };
                return report;
            }
        };
        report.rows_read = records.len();

        let writer = UpsertWriter::new(&self.pool);
        for batch in records.chunks(self.config.batch_size.max(1)) {
            let mut rows = Vec::new();
            for raw in batch {
                match self.ingestor.ingest(schema, DataSource::Csv, raw) {
                    Ok(outcome) => {
                        report.ingested += 1;
                        report.warnings += outcome.warnings;
                        rows.extend(outcome.rows);
                    }
                    Err(err @ IngestError::MissingBusinessKey { .. }) => {
                        tracing::warn!(entity, %err, "skipping invalid csv row");
                        report.skipped_invalid += 1;
                    }
                }
            }
            match writer.write(schema, DataSource::Csv, &rows).await {
                Ok(counts) => {
                    report.inserted += counts.inserted;
                    report.updated += counts.updated;
                    report.skipped_stale += counts.skipped;
                }
                Err(err) => {
                    report.outcome = CycleOutcome::Failed {
                        phase: CyclePhase::Writing,
                        error: err.to_string(),
                    };
                    return report;
                }
            }
        }

        report
    }

    async fn entity_lock(&self, entity: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.entity_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(entity.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
