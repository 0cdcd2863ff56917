// 📥 Collaborator seams: where documents and the stored period come from
//
// The pipeline only sees these traits. The directory source reads CSV
// exports of the regulator's spreadsheets; a scraper would implement the
// same trait.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::db::HistoricalStore;
use crate::parser::RawDocument;
use crate::period::Period;
use crate::record::Fund;

/// Where the regulator's latest publication comes from
pub trait DocumentSource {
    /// Latest period the source claims to publish, in the source's own wording
    fn fetch_latest_period(&self) -> Result<String>;

    fn fetch_document(&self, fund: Fund, period: Period) -> Result<RawDocument>;
}

/// Where the latest already-published period comes from
pub trait HistorySource {
    /// `None` when nothing was ever integrated
    fn fetch_latest_integrated_period(&self) -> Result<Option<String>>;
}

// ============================================================================
// DIRECTORY DOCUMENT SOURCE
// ============================================================================

/// Reads `PERIODO.txt` and one `<fund-slug>.csv` per fund from a directory
///
/// A missing fund file is an error for that fund only; the orchestrator
/// decides whether partial downloads are acceptable.
pub struct DirectoryDocumentSource {
    dir: PathBuf,
}

impl DirectoryDocumentSource {
    pub const PERIOD_FILE: &'static str = "PERIODO.txt";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        DirectoryDocumentSource {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn document_path(&self, fund: Fund) -> PathBuf {
        self.dir.join(format!("{}.csv", fund.slug()))
    }
}

impl DocumentSource for DirectoryDocumentSource {
    fn fetch_latest_period(&self) -> Result<String> {
        let path = self.dir.join(Self::PERIOD_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read period marker: {}", path.display()))?;
        Ok(text.trim().to_string())
    }

    fn fetch_document(&self, fund: Fund, _period: Period) -> Result<RawDocument> {
        let path = self.document_path(fund);
        let file = File::open(&path)
            .with_context(|| format!("Failed to open document for {}: {}", fund, path.display()))?;
        let document = RawDocument::from_csv(file)
            .with_context(|| format!("Failed to parse document: {}", path.display()))?;
        Ok(document)
    }
}

// ============================================================================
// STORE-BACKED HISTORY SOURCE
// ============================================================================

/// Reports the latest period of the local historical store as a release tag
pub struct StoreHistorySource {
    store: HistoricalStore,
}

impl StoreHistorySource {
    pub fn new(store: HistoricalStore) -> Self {
        StoreHistorySource { store }
    }
}

impl HistorySource for StoreHistorySource {
    fn fetch_latest_integrated_period(&self) -> Result<Option<String>> {
        let latest = self.store.latest_period()?;
        Ok(latest.map(|p| p.release_tag()))
    }
}
