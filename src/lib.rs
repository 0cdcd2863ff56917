// Siefore Update Pipeline - Core Library
// Monthly CONSAR Siefore data → reviewed, normalized historical dataset

pub mod approval;
pub mod config;
pub mod data_quality;
pub mod db;
pub mod error;
pub mod fx;
pub mod normalize;
pub mod notify;
pub mod parser;
pub mod period;
pub mod pipeline;
pub mod record;
pub mod source;

// Re-export commonly used types
pub use approval::{ApprovalGate, ApprovalState, ApprovalStatus, Decision, Event, StagedBatch};
pub use config::{default_log_filter, CheckConfig, PipelineConfig, DEFAULT_CONFIG_FILE};
pub use data_quality::{
    AforeChange, Amounts, ConsistencyReport, DataQualityEngine, Growth, GrowthLine, GrowthReport,
    ReviewSummary, Severity, ValidationResult, GROWTH_CONCEPTS,
};
pub use db::{AforeTotal, ExportRow, HistoricalStore, IntegrationResult, SanityRange};
pub use error::{PipelineError, Result, Stage, StageContext, StageFailure};
pub use fx::{enrich, resolve_rate, BanxicoFileSource, FxRate, FxSeries, FxSource};
pub use normalize::{normalize, SCALE_FACTOR};
pub use notify::{LogNotifier, Notifier};
pub use parser::{
    extract, extract_all, extract_with_stats, parse_value, DeclaredUnit, ExtractionStats,
    RawDocument, RawRow,
};
pub use period::Period;
pub use pipeline::{Collaborators, Pipeline, RunOptions, RunOutcome, StageResult};
pub use record::{Afore, Concept, Fund, RecordKey, SieforeRecord, ValueUnit};
pub use source::{DirectoryDocumentSource, DocumentSource, HistorySource, StoreHistorySource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
