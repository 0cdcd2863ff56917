// 📣 Notifier
// Tells the reviewer a batch is waiting, and reports decisions

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::data_quality::{ConsistencyReport, ReviewSummary};
use crate::db::IntegrationResult;
use crate::period::Period;
use crate::record::SieforeRecord;

pub trait Notifier {
    fn pending(
        &self,
        period: Period,
        records: &[SieforeRecord],
        summary: &ReviewSummary,
        consistency: Option<&ConsistencyReport>,
    ) -> Result<()>;

    fn approved(&self, period: Period, result: &IntegrationResult) -> Result<()>;

    fn rejected(&self, period: Period) -> Result<()>;
}

/// What the reviewer receives for a pending period
#[derive(Debug, Serialize)]
struct ReviewPacket<'a> {
    period: Period,
    title: String,
    summary: &'a ReviewSummary,
    consistency: Option<&'a ConsistencyReport>,
    records: &'a [SieforeRecord],
}

/// Logs every notification; optionally drops a review packet (JSON) per period
#[derive(Debug, Default)]
pub struct LogNotifier {
    review_dir: Option<PathBuf>,
}

impl LogNotifier {
    pub fn new() -> Self {
        LogNotifier { review_dir: None }
    }

    pub fn with_review_dir(dir: impl AsRef<Path>) -> Self {
        LogNotifier {
            review_dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    pub fn packet_path(dir: &Path, period: Period) -> PathBuf {
        dir.join(format!("review_{}.json", period))
    }
}

impl Notifier for LogNotifier {
    fn pending(
        &self,
        period: Period,
        records: &[SieforeRecord],
        summary: &ReviewSummary,
        consistency: Option<&ConsistencyReport>,
    ) -> Result<()> {
        info!(%period, records = records.len(), "review pending: {}", summary.summary());
        if let Some(report) = consistency {
            info!(%period, warnings = report.has_warnings(), "{}", report.summary());
        }

        if let Some(dir) = &self.review_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create review directory: {}", dir.display()))?;

            let packet = ReviewPacket {
                period,
                title: format!(
                    "CONSAR Data Review: {} - {} records",
                    period.human(),
                    records.len()
                ),
                summary,
                consistency,
                records,
            };
            let path = Self::packet_path(dir, period);
            let json = serde_json::to_string_pretty(&packet)?;
            fs::write(&path, json)
                .with_context(|| format!("Failed to write review packet: {}", path.display()))?;
            info!(path = %path.display(), "review packet written");
        }

        Ok(())
    }

    fn approved(&self, period: Period, result: &IntegrationResult) -> Result<()> {
        info!(%period, "approved and integrated: {}", result.summary());
        Ok(())
    }

    fn rejected(&self, period: Period) -> Result<()> {
        info!(%period, "rejected; history left unchanged");
        Ok(())
    }
}
