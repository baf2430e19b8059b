//! Ingestion pass: feed files -> region filter -> reconciler
//!
//! Sequential: satellite by satellite, file by file, row by row. Every file
//! produces an immutable `FileReport`; the pass folds them into an
//! `IngestionSummary`. Failures are recorded at the smallest safe scope:
//! - `ParseError` abandons the rest of that file
//! - `SpatialQueryError` / `ReconciliationWriteError` skip that candidate
//!
//! A deadline stops the pass from starting new files or candidates. The
//! candidate in flight when it passes is finished first.

use super::error::ParseError;
use super::feed_reader::{FeedFile, FeedReader};
use super::reconciler::{ReconcileError, ReconcileOutcome, RecordReconciler};
use super::region::RegionFilter;
use super::snapshot::SnapshotBuilder;
use super::types::{DetectionKey, SatelliteId};
use serde::Serialize;
use std::path::PathBuf;
use tokio::time::Instant;

/// Where a recorded failure happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureScope {
    File { path: PathBuf },
    Candidate { satellite: String, key: String },
    Pass,
}

/// A recorded, non-fatal failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub scope: FailureScope,
    pub message: String,
}

/// Counters for one feed file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub candidates_seen: u64,
    pub in_region: u64,
    pub added: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub links_created: u64,
    pub failed: bool,
    pub failures: Vec<RunFailure>,
}

/// Counters for one ingestion pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionSummary {
    pub files_processed: u64,
    pub files_failed: u64,
    pub candidates_seen: u64,
    pub in_region: u64,
    pub added: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub links_created: u64,
    pub snapshot_keys: u64,
    pub deadline_reached: bool,
    pub failures: Vec<RunFailure>,
}

impl IngestionSummary {
    pub fn absorb(mut self, file: FileReport) -> Self {
        self.files_processed += 1;
        if file.failed {
            self.files_failed += 1;
        }
        self.candidates_seen += file.candidates_seen;
        self.in_region += file.in_region;
        self.added += file.added;
        self.updated += file.updated;
        self.unchanged += file.unchanged;
        self.links_created += file.links_created;
        self.failures.extend(file.failures);
        self
    }

    pub fn record(mut self, failure: RunFailure) -> Self {
        self.failures.push(failure);
        self
    }
}

pub struct IngestionPass<'a> {
    reader: &'a FeedReader,
    region: &'a RegionFilter,
    reconciler: &'a RecordReconciler,
    deadline: Option<Instant>,

    /// Clock checked against the deadline; injectable for tests
    now_fn: Box<dyn Fn() -> Instant + Send + Sync>,
}

impl<'a> IngestionPass<'a> {
    pub fn new(
        reader: &'a FeedReader,
        region: &'a RegionFilter,
        reconciler: &'a RecordReconciler,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            reader,
            region,
            reconciler,
            deadline,
            now_fn: Box::new(Instant::now),
        }
    }

    pub fn with_clock(mut self, now_fn: Box<dyn Fn() -> Instant + Send + Sync>) -> Self {
        self.now_fn = now_fn;
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| (self.now_fn)() >= d)
    }

    /// Processes every discovered file; returns the folded summary and the
    /// keys observed along the way
    pub async fn run(&self) -> (IngestionSummary, SnapshotBuilder) {
        let mut summary = IngestionSummary::default();
        let mut snapshot = SnapshotBuilder::new();

        let discovery = self.reader.discover();
        for err in discovery.errors {
            log::error!("❌ Feed discovery: {}", err);
            summary = summary.record(file_failure(&err));
        }
        log::info!(
            "🔍 Found {} feed files under {}",
            discovery.files.len(),
            self.reader.root().display()
        );

        for file in &discovery.files {
            if self.deadline_passed() {
                log::warn!("⚠️  Run deadline reached, not starting {}", file.path.display());
                summary.deadline_reached = true;
                break;
            }

            let (report, stopped) = self.process_file(file, &mut snapshot).await;
            summary = summary.absorb(report);
            if stopped {
                summary.deadline_reached = true;
                break;
            }
        }

        summary.snapshot_keys = snapshot.len() as u64;
        (summary, snapshot)
    }

    /// Returns the file's report and whether the deadline cut it short
    async fn process_file(
        &self,
        file: &FeedFile,
        snapshot: &mut SnapshotBuilder,
    ) -> (FileReport, bool) {
        log::info!("Processing file: {} ({})", file.path.display(), file.satellite);
        let mut report = FileReport::default();

        let rows = match self.reader.open(file) {
            Ok(rows) => rows,
            Err(err) => {
                log::error!("❌ Failed to process file {}: {}", file.path.display(), err);
                report.failed = true;
                report.failures.push(file_failure(&err));
                return (report, false);
            }
        };

        for row in rows {
            if self.deadline_passed() {
                log::warn!(
                    "⚠️  Run deadline reached mid-file, {} left unfinished",
                    file.path.display()
                );
                return (report, true);
            }

            let fire = match row {
                Ok(fire) => fire,
                Err(err) => {
                    log::error!("❌ Abandoning file {}: {}", file.path.display(), err);
                    report.failed = true;
                    report.failures.push(file_failure(&err));
                    break;
                }
            };

            report.candidates_seen += 1;
            snapshot.observe(&fire.key);

            match self.region.contains(&fire.key).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    log::warn!("Region check failed for {}: {}", fire.key, err);
                    report.failures.push(candidate_failure(&file.satellite, &fire.key, &err));
                    continue;
                }
            }
            report.in_region += 1;

            match self.reconciler.reconcile(&fire, &file.satellite).await {
                Ok(ReconcileOutcome::Added { links, .. }) => {
                    report.added += 1;
                    report.links_created += links as u64;
                }
                Ok(ReconcileOutcome::Updated { .. }) => report.updated += 1,
                Ok(ReconcileOutcome::Unchanged { .. }) => report.unchanged += 1,
                Err(err) => {
                    match &err {
                        ReconcileError::Spatial(_) => {
                            log::warn!("Forestry lookup failed for {}: {}", fire.key, err)
                        }
                        ReconcileError::Write(_) => {
                            log::error!("Error inserting or updating point: {}", err)
                        }
                    }
                    report.failures.push(candidate_failure(&file.satellite, &fire.key, &err));
                }
            }
        }

        log::info!(
            "Finished processing file: {} | seen: {}, in region: {}, added: {}, updated: {}",
            file.path.display(),
            report.candidates_seen,
            report.in_region,
            report.added,
            report.updated
        );
        (report, false)
    }
}

fn file_failure(err: &ParseError) -> RunFailure {
    let path = match err {
        ParseError::Io { path, .. }
        | ParseError::Csv { path, .. }
        | ParseError::Row { path, .. } => path.clone(),
        ParseError::EmptyFile(path) => path.clone(),
    };
    RunFailure {
        scope: FailureScope::File { path },
        message: err.to_string(),
    }
}

fn candidate_failure(
    satellite: &SatelliteId,
    key: &DetectionKey,
    err: &dyn std::error::Error,
) -> RunFailure {
    RunFailure {
        scope: FailureScope::Candidate {
            satellite: satellite.to_string(),
            key: key.to_string(),
        },
        message: err.to_string(),
    }
}
