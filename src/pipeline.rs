// 🔄 Pipeline Orchestrator
// detect period → download → extract → enrich → normalize → review
// ... reviewer decides ... → integrate
//
// Every failure is reported with the stage it happened in. Nothing before
// `integrate` touches the historical store.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::approval::{ApprovalGate, ApprovalState, ApprovalStatus, Decision, Event, StagedBatch};
use crate::config::PipelineConfig;
use crate::data_quality::{ConsistencyReport, DataQualityEngine, ReviewSummary};
use crate::db::{HistoricalStore, IntegrationResult};
use crate::error::{PipelineError, Stage, StageContext, StageFailure};
use crate::fx::{enrich, resolve_rate, BanxicoFileSource, FxSource};
use crate::normalize::normalize;
use crate::notify::{LogNotifier, Notifier};
use crate::parser::{extract_all, RawDocument};
use crate::period::Period;
use crate::record::Fund;
use crate::source::{DirectoryDocumentSource, DocumentSource, HistorySource, StoreHistorySource};

pub type StageResult<T> = std::result::Result<T, StageFailure>;

const ACTOR: &str = "siefore-update";

// ============================================================================
// OPTIONS & OUTCOMES
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Open a new review revision even if the period was already decided
    pub force_rereview: bool,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Source has nothing newer than the history; nothing was downloaded
    UpToDate {
        source: Period,
        stored: Option<Period>,
    },
    /// Period already approved or rejected and no re-review was requested
    AlreadyDecided { status: ApprovalStatus },
    /// Batch staged and reviewer notified
    AwaitingApproval {
        status: ApprovalStatus,
        summary: ReviewSummary,
        consistency: Option<ConsistencyReport>,
    },
}

/// The four external seams
pub struct Collaborators {
    pub documents: Box<dyn DocumentSource>,
    pub history: Box<dyn HistorySource>,
    pub fx: Box<dyn FxSource>,
    pub notifier: Box<dyn Notifier>,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    collaborators: Collaborators,
    gate: ApprovalGate,
    store: HistoricalStore,
    quality: DataQualityEngine,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, gate: ApprovalGate, store: HistoricalStore) -> Self {
        Pipeline {
            collaborators,
            gate,
            store,
            quality: DataQualityEngine::new(),
        }
    }

    pub fn with_quality(mut self, quality: DataQualityEngine) -> Self {
        self.quality = quality;
        self
    }

    /// Wire the filesystem collaborators described by `config`
    pub fn from_config(config: &PipelineConfig) -> crate::error::Result<Self> {
        for path in [&config.history_db, &config.state_db] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }

        let mut store = HistoricalStore::open(&config.history_db, &config.backup_dir)?;
        if let Some(range) = config.checks.sanity_range() {
            store = store.with_sanity_range(range);
        }
        let gate = ApprovalGate::open(&config.state_db)?;

        let notifier = match &config.review_dir {
            Some(dir) => LogNotifier::with_review_dir(dir),
            None => LogNotifier::new(),
        };

        let collaborators = Collaborators {
            documents: Box::new(DirectoryDocumentSource::new(&config.documents_dir)),
            history: Box::new(StoreHistorySource::new(store.clone())),
            fx: Box::new(BanxicoFileSource::new(&config.fx_series)),
            notifier: Box::new(notifier),
        };

        Ok(Pipeline::new(collaborators, gate, store)
            .with_quality(DataQualityEngine::with_threshold(config.checks.variance_threshold_pct)))
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn store(&self) -> &HistoricalStore {
        &self.store
    }

    // ========================================================================
    // RUN (up to the approval gate)
    // ========================================================================

    pub fn run(&mut self, options: RunOptions) -> StageResult<RunOutcome> {
        let (period, stored) = self.detect_period()?;

        if let Some(stored) = stored {
            if !period.is_newer_than(&stored) {
                info!(source = %period, %stored, "history is up to date");
                return Ok(RunOutcome::UpToDate {
                    source: period,
                    stored: Some(stored),
                });
            }
        }
        info!(%period, stored = ?stored, "new period available");

        if let Some(status) = self.gate.current(period).stage(Stage::Review)? {
            if status.state.is_terminal() && !options.force_rereview {
                info!(%period, state = %status.state, "period already decided, skipping");
                return Ok(RunOutcome::AlreadyDecided { status });
            }
        }

        let documents = self.download(period)?;
        let records = extract_all(&documents, period).stage(Stage::Extract)?;

        let fx = resolve_rate(self.collaborators.fx.as_ref(), period).stage(Stage::Enrich)?;
        let records = enrich(records, &fx).stage(Stage::Enrich)?;

        let records = normalize(records).stage(Stage::Normalize)?;

        self.review(StagedBatch::new(period, fx, records), options)
    }

    /// Parse both periods; a bad source period stops before any download
    fn detect_period(&self) -> StageResult<(Period, Option<Period>)> {
        let raw = self
            .collaborators
            .documents
            .fetch_latest_period()
            .stage(Stage::DetectPeriod)?;
        let period = Period::parse(&raw).stage(Stage::DetectPeriod)?;

        let stored = self
            .collaborators
            .history
            .fetch_latest_integrated_period()
            .stage(Stage::DetectPeriod)?
            .map(|raw| Period::parse(&raw))
            .transpose()
            .stage(Stage::DetectPeriod)?;

        Ok((period, stored))
    }

    /// One document per fund; a fund that fails is skipped unless all fail
    fn download(&self, period: Period) -> StageResult<Vec<(Fund, RawDocument)>> {
        let mut documents = Vec::with_capacity(Fund::ALL.len());
        let mut last_error = None;

        for fund in Fund::ALL {
            match self.collaborators.documents.fetch_document(fund, period) {
                Ok(document) => documents.push((fund, document)),
                Err(err) => {
                    warn!(%fund, %period, error = %format!("{:#}", err), "document unavailable, skipping fund");
                    last_error = Some(err);
                }
            }
        }

        match (documents.is_empty(), last_error) {
            (true, Some(err)) => Err(PipelineError::from(err).at(Stage::Download)),
            _ => {
                info!(%period, documents = documents.len(), "documents downloaded");
                Ok(documents)
            }
        }
    }

    fn review(&mut self, batch: StagedBatch, options: RunOptions) -> StageResult<RunOutcome> {
        let period = batch.period;
        let summary = ReviewSummary::from_records(period, &batch.records);
        let consistency = self.consistency(period, &batch).stage(Stage::Review)?;

        let status = self
            .gate
            .open_review(&batch, options.force_rereview)
            .stage(Stage::Review)?;

        self.collaborators
            .notifier
            .pending(period, &batch.records, &summary, consistency.as_ref())
            .stage(Stage::Review)?;

        self.gate
            .record_event(&Event::new(
                "review_opened",
                period,
                serde_json::json!({
                    "revision": status.revision,
                    "records": status.record_count,
                    "digest": status.batch_digest,
                    "fx_rate": batch.fx.rate_value.to_string(),
                }),
                ACTOR,
            ))
            .stage(Stage::Review)?;

        Ok(RunOutcome::AwaitingApproval {
            status,
            summary,
            consistency,
        })
    }

    /// Compare against the stored month before, when the history has it
    fn consistency(
        &self,
        period: Period,
        batch: &StagedBatch,
    ) -> crate::error::Result<Option<ConsistencyReport>> {
        let previous_period = period.previous();
        let previous = self.store.records_for_period(previous_period)?;
        if previous.is_empty() {
            return Ok(None);
        }

        let report = self
            .quality
            .compare(period, &batch.records, previous_period, &previous);
        if report.has_warnings() {
            warn!(%period, "consistency check flagged: {}", report.summary());
        }
        Ok(Some(report))
    }

    // ========================================================================
    // DECISIONS
    // ========================================================================

    pub fn approve(&mut self, period: Period) -> StageResult<ApprovalStatus> {
        self.decide(period, Decision::Approve)
    }

    pub fn reject(&mut self, period: Period) -> StageResult<ApprovalStatus> {
        let status = self.decide(period, Decision::Reject)?;
        self.collaborators
            .notifier
            .rejected(period)
            .stage(Stage::Approve)?;
        Ok(status)
    }

    fn decide(&mut self, period: Period, decision: Decision) -> StageResult<ApprovalStatus> {
        let status = self.gate.decide(period, decision).stage(Stage::Approve)?;
        self.gate
            .record_event(&Event::new(
                "review_decided",
                period,
                serde_json::json!({
                    "revision": status.revision,
                    "state": status.state.as_str(),
                }),
                ACTOR,
            ))
            .stage(Stage::Approve)?;
        Ok(status)
    }

    // ========================================================================
    // INTEGRATE
    // ========================================================================

    /// Merge the staged batch of an approved period into the history
    pub fn integrate(&mut self, period: Period) -> StageResult<IntegrationResult> {
        let status = self
            .gate
            .current(period)
            .stage(Stage::Integrate)?
            .ok_or(PipelineError::NoApproval(period))
            .stage(Stage::Integrate)?;

        if status.state != ApprovalState::Approved {
            return Err(PipelineError::NotApproved {
                period,
                state: status.state,
            }
            .at(Stage::Integrate));
        }

        let batch = self.gate.staged_batch(period).stage(Stage::Integrate)?;
        if batch.digest().stage(Stage::Integrate)? != status.batch_digest {
            return Err(PipelineError::DigestMismatch(period).at(Stage::Integrate));
        }

        let result = self
            .store
            .integrate(&status, period, &batch.records)
            .stage(Stage::Integrate)?;

        // The history is committed from here on; later failures are reported, not returned
        if let Err(err) = self.gate.record_event(&Event::new(
            "integrated",
            period,
            serde_json::json!({
                "revision": status.revision,
                "removed": result.removed,
                "added": result.added,
                "store_size": result.store_size,
                "backup": result.backup_path.display().to_string(),
            }),
            ACTOR,
        )) {
            warn!(%period, error = %err, "integrated, but the event could not be recorded");
        }

        if let Err(err) = self.collaborators.notifier.approved(period, &result) {
            warn!(%period, error = %format!("{:#}", err), "integrated, but the approval notice failed");
        }

        Ok(result)
    }

    /// Export the history as the published JSON dataset
    pub fn export(&self, path: &Path) -> crate::error::Result<usize> {
        let file = fs::File::create(path)?;
        self.store.export_json(std::io::BufWriter::new(file))
    }
}
