// 🚨 Error taxonomy for the update pipeline
//
// Every fatal condition a stage can hit has its own variant so callers can
// match on it. Row-level problems never show up here: the extractor logs and
// skips them.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::period::Period;
use crate::approval::ApprovalState;

#[derive(Error, Debug)]
pub enum PipelineError {
    // ========================================================================
    // DOMAIN ERRORS
    // ========================================================================
    #[error("unparsable period string: '{0}'")]
    Format(String),

    #[error("no valid rows found for {0} across all documents")]
    ExtractionEmpty(Period),

    #[error("no FX rate available for {0}")]
    MissingRate(Period),

    #[error("record {0} is already in store units; refusing to normalize twice")]
    DoubleNormalization(String),

    #[error("record {0} was never normalized; refusing to integrate the batch")]
    UnnormalizedRecord(String),

    #[error("period {period} is not approved (state: {state})")]
    NotApproved { period: Period, state: ApprovalState },

    #[error("period {period} was already decided ({state})")]
    AlreadyDecided { period: Period, state: ApprovalState },

    #[error("arithmetic overflow while converting {0}")]
    Overflow(String),

    #[error("no approval record exists for {0}")]
    NoApproval(Period),

    #[error("no staged batch exists for {0}")]
    NothingStaged(Period),

    #[error("record for {found} does not belong to batch period {expected}")]
    PeriodMismatch { expected: Period, found: Period },

    #[error("staged batch for {0} changed after it was sent for review")]
    DigestMismatch(Period),

    #[error("no records stored for {0}")]
    PeriodNotStored(Period),

    // ========================================================================
    // INFRASTRUCTURE ERRORS
    // ========================================================================
    #[error("backup of {path} failed: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("restore from {backup} failed after '{cause}': {source}")]
    RestoreFailed {
        backup: PathBuf,
        cause: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("collaborator failed: {0:#}")]
    Source(#[from] anyhow::Error),
}

impl PipelineError {
    /// Attach the stage that produced this error
    pub fn at(self, stage: Stage) -> StageFailure {
        StageFailure { stage, source: self }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// STAGE REPORTING
// ============================================================================

/// Pipeline stage, used to report where a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DetectPeriod,
    Download,
    Extract,
    Enrich,
    Normalize,
    Review,
    Approve,
    Integrate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::DetectPeriod => "detect-period",
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Enrich => "enrich",
            Stage::Normalize => "normalize",
            Stage::Review => "review",
            Stage::Approve => "approve",
            Stage::Integrate => "integrate",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

/// Tag any failure convertible to `PipelineError` with the stage it came from
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> std::result::Result<T, StageFailure>;
}

impl<T, E> StageContext<T> for std::result::Result<T, E>
where
    E: Into<PipelineError>,
{
    fn stage(self, stage: Stage) -> std::result::Result<T, StageFailure> {
        self.map_err(|e| e.into().at(stage))
    }
}
