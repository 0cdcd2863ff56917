use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::approval::{ApprovalState, ApprovalStatus};
use crate::data_quality::GrowthReport;
use crate::error::{PipelineError, Result};
use crate::period::Period;
use crate::record::{Afore, Concept, Fund, SieforeRecord};

// ============================================================================
// INTEGRATION RESULT
// ============================================================================

/// Total Assets of one afore across all its funds, store units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AforeTotal {
    pub afore: Afore,
    pub value_mxn: Decimal,
    pub value_usd: Decimal,
}

/// Expected industry-wide Total Assets for a period (MXN, store units)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SanityRange {
    pub min_mxn: Decimal,
    pub max_mxn: Decimal,
}

impl SanityRange {
    pub fn contains(&self, value: Decimal) -> bool {
        value >= self.min_mxn && value <= self.max_mxn
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResult {
    pub period: Period,
    pub removed: usize,
    pub added: usize,
    pub store_size: usize,
    pub backup_path: PathBuf,
    pub totals: Vec<AforeTotal>,
    pub industry_total_mxn: Decimal,
    /// None when no range is configured
    pub within_expected_range: Option<bool>,
}

impl IntegrationResult {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} removed, {} added, {} records in store",
            self.period, self.removed, self.added, self.store_size
        )
    }
}

// ============================================================================
// EXPORT ROW (published JSON dataset)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRow {
    #[serde(rename = "PeriodYear")]
    pub period_year: i32,

    #[serde(rename = "PeriodMonth")]
    pub period_month: u32,

    #[serde(rename = "Afore")]
    pub afore: String,

    #[serde(rename = "Siefore")]
    pub siefore: String,

    #[serde(rename = "Concept")]
    pub concept: String,

    #[serde(rename = "valueMXN", with = "rust_decimal::serde::float")]
    pub value_mxn: Decimal,

    #[serde(rename = "FX_EOM", with = "rust_decimal::serde::float_option")]
    pub fx_eom: Option<Decimal>,

    #[serde(rename = "valueUSD", with = "rust_decimal::serde::float_option")]
    pub value_usd: Option<Decimal>,
}

impl From<&SieforeRecord> for ExportRow {
    fn from(record: &SieforeRecord) -> Self {
        ExportRow {
            period_year: record.period.year(),
            period_month: record.period.month(),
            afore: record.afore.label().to_string(),
            siefore: record.fund.label().to_string(),
            concept: record.concept.label().to_string(),
            value_mxn: record.value_mxn,
            fx_eom: record.fx_rate,
            value_usd: record.value_usd,
        }
    }
}

// ============================================================================
// HISTORICAL STORE
// ============================================================================

/// The published history, one SQLite file
///
/// Rollback-journal mode and no long-lived connection: between operations
/// the file on disk is the whole store, so copying it is a snapshot and
/// copying it back is a restore.
#[derive(Debug, Clone)]
pub struct HistoricalStore {
    path: PathBuf,
    backup_dir: PathBuf,
    sanity_range: Option<SanityRange>,
}

impl HistoricalStore {
    /// Open (creating if needed) the store at `path`
    pub fn open(path: impl AsRef<Path>, backup_dir: impl AsRef<Path>) -> Result<Self> {
        let store = HistoricalStore {
            path: path.as_ref().to_path_buf(),
            backup_dir: backup_dir.as_ref().to_path_buf(),
            sanity_range: None,
        };
        store.connect()?;
        Ok(store)
    }

    pub fn with_sanity_range(mut self, range: SanityRange) -> Self {
        self.sanity_range = Some(range);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        // No WAL: a -wal sidecar would make a plain file copy incomplete
        conn.pragma_update(None, "journal_mode", "DELETE")?;
        setup_history_database(&conn)?;
        Ok(conn)
    }

    /// Most recent period in the store, None when empty
    pub fn latest_period(&self) -> Result<Option<Period>> {
        let conn = self.connect()?;
        let latest: Option<(i32, u32)> = conn
            .query_row(
                "SELECT year, month FROM history ORDER BY year DESC, month DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        latest.map(|(year, month)| Period::new(year, month)).transpose()
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn records_for_period(&self, period: Period) -> Result<Vec<SieforeRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT period, fund, concept, afore, value_mxn, value_usd, fx_rate
             FROM history
             WHERE period = ?1
             ORDER BY id",
        )?;
        let records = stmt
            .query_map(params![period.to_string()], record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn all_records(&self) -> Result<Vec<SieforeRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT period, fund, concept, afore, value_mxn, value_usd, fx_rate
             FROM history
             ORDER BY year, month, id",
        )?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Year-to-date and year-over-year growth of `period` per afore
    pub fn growth(&self, period: Period) -> Result<GrowthReport> {
        let current = self.records_for_period(period)?;
        if current.is_empty() {
            return Err(PipelineError::PeriodNotStored(period));
        }
        let ytd_base = self.records_for_period(period.prior_year_end())?;
        let yoy_base = self.records_for_period(period.year_earlier())?;

        Ok(GrowthReport::build(period, &current, &ytd_base, &yoy_base))
    }

    /// Write the whole store as the published JSON dataset
    pub fn export_json<W: Write>(&self, writer: W) -> Result<usize> {
        let rows: Vec<ExportRow> = self.all_records()?.iter().map(ExportRow::from).collect();
        serde_json::to_writer_pretty(writer, &rows)?;
        Ok(rows.len())
    }

    // ========================================================================
    // INTEGRATION
    // ========================================================================

    /// Merge an approved, normalized batch into the store
    ///
    /// Every check runs before the backup; every failure after the backup
    /// restores it, leaving the file byte-for-byte as it was.
    pub fn integrate(
        &self,
        approval: &ApprovalStatus,
        period: Period,
        records: &[SieforeRecord],
    ) -> Result<IntegrationResult> {
        if approval.period != period || approval.state != ApprovalState::Approved {
            return Err(PipelineError::NotApproved {
                period,
                state: if approval.period == period {
                    approval.state
                } else {
                    ApprovalState::Pending
                },
            });
        }

        if let Some(stray) = records.iter().find(|r| r.period != period) {
            return Err(PipelineError::PeriodMismatch {
                expected: period,
                found: stray.period,
            });
        }

        if let Some(raw) = records.iter().find(|r| !r.is_normalized()) {
            return Err(PipelineError::UnnormalizedRecord(raw.describe()));
        }

        let backup_path = self.backup(period)?;

        let (removed, added, store_size) = match self.replace_period_keys(records) {
            Ok(counts) => counts,
            Err(err) => {
                warn!(%period, error = %err, backup = %backup_path.display(), "integration failed, restoring backup");
                self.restore(&backup_path, &err)?;
                return Err(err);
            }
        };

        let totals = afore_totals(records);
        let industry_total_mxn: Decimal = totals.iter().map(|t| t.value_mxn).sum();
        let within_expected_range = self.sanity_range.map(|range| range.contains(industry_total_mxn));

        if within_expected_range == Some(false) {
            warn!(
                %period,
                total = %industry_total_mxn,
                "industry Total Assets outside the expected range"
            );
        }

        info!(%period, removed, added, store_size, "integrated into history");

        Ok(IntegrationResult {
            period,
            removed,
            added,
            store_size,
            backup_path,
            totals,
            industry_total_mxn,
            within_expected_range,
        })
    }

    /// Copy the store file into the backup directory
    fn backup(&self, period: Period) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let backup_path = self
            .backup_dir
            .join(format!("history_{}_{}.db", period, stamp));

        fs::create_dir_all(&self.backup_dir)
            .and_then(|_| fs::copy(&self.path, &backup_path))
            .map_err(|source| PipelineError::BackupFailed {
                path: backup_path.clone(),
                source,
            })?;

        info!(backup = %backup_path.display(), "history backed up");
        Ok(backup_path)
    }

    fn restore(&self, backup_path: &Path, cause: &PipelineError) -> Result<()> {
        let restore_failed = |source: std::io::Error| PipelineError::RestoreFailed {
            backup: backup_path.to_path_buf(),
            cause: cause.to_string(),
            source,
        };

        // A leftover hot journal would be replayed over the restored file
        let journal = journal_path(&self.path);
        if journal.exists() {
            fs::remove_file(&journal).map_err(restore_failed)?;
        }
        fs::copy(backup_path, &self.path).map_err(restore_failed)?;

        info!(backup = %backup_path.display(), "history restored from backup");
        Ok(())
    }

    /// Delete every stored record sharing a key with the batch, then append the batch
    fn replace_period_keys(&self, records: &[SieforeRecord]) -> Result<(usize, usize, usize)> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let mut removed = 0;
        {
            let mut delete = tx.prepare(
                "DELETE FROM history WHERE period = ?1 AND fund = ?2 AND concept = ?3 AND afore = ?4",
            )?;
            for record in records {
                removed += delete.execute(params![
                    record.period.to_string(),
                    record.fund.label(),
                    record.concept.label(),
                    record.afore.label(),
                ])?;
            }

            let mut insert = tx.prepare(
                "INSERT INTO history (period, year, month, fund, concept, afore, value_mxn, value_usd, fx_rate, integrated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for record in records {
                insert.execute(params![
                    record.period.to_string(),
                    record.period.year(),
                    record.period.month(),
                    record.fund.label(),
                    record.concept.label(),
                    record.afore.label(),
                    record.value_mxn.to_string(),
                    record.value_usd.map(|v| v.to_string()),
                    record.fx_rate.map(|v| v.to_string()),
                    now,
                ])?;
            }
        }

        let store_size: i64 = tx.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        tx.commit()?;

        Ok((removed, records.len(), store_size as usize))
    }
}

fn setup_history_database(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            period TEXT NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            fund TEXT NOT NULL,
            concept TEXT NOT NULL,
            afore TEXT NOT NULL,
            value_mxn TEXT NOT NULL,
            value_usd TEXT,
            fx_rate TEXT,
            integrated_at TEXT NOT NULL,
            UNIQUE (period, fund, concept, afore)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_history_year_month ON history(year, month)",
        [],
    )?;

    Ok(())
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

/// Per-afore Total Assets, summed across funds
fn afore_totals(records: &[SieforeRecord]) -> Vec<AforeTotal> {
    let mut totals: BTreeMap<Afore, (Decimal, Decimal)> = BTreeMap::new();

    for record in records.iter().filter(|r| r.concept == Concept::TotalAssets) {
        let entry = totals.entry(record.afore).or_default();
        entry.0 += record.value_mxn;
        entry.1 += record.value_usd.unwrap_or_default();
    }

    totals
        .into_iter()
        .map(|(afore, (value_mxn, value_usd))| AforeTotal {
            afore,
            value_mxn,
            value_usd,
        })
        .collect()
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn decimal_column(idx: usize, text: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(text).map_err(|e| invalid_column(idx, format!("bad decimal '{}': {}", text, e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SieforeRecord> {
    let period: String = row.get(0)?;
    let fund: String = row.get(1)?;
    let concept: String = row.get(2)?;
    let afore: String = row.get(3)?;
    let value_mxn: String = row.get(4)?;
    let value_usd: Option<String> = row.get(5)?;
    let fx_rate: Option<String> = row.get(6)?;

    Ok(SieforeRecord::from_store(
        Period::parse(&period).map_err(|e| invalid_column(0, e.to_string()))?,
        Fund::from_label(&fund).ok_or_else(|| invalid_column(1, format!("unknown fund '{}'", fund)))?,
        Concept::from_label(&concept)
            .ok_or_else(|| invalid_column(2, format!("unknown concept '{}'", concept)))?,
        Afore::from_label(&afore).ok_or_else(|| invalid_column(3, format!("unknown afore '{}'", afore)))?,
        decimal_column(4, &value_mxn)?,
        value_usd.map(|v| decimal_column(5, &v)).transpose()?,
        fx_rate.map(|v| decimal_column(6, &v)).transpose()?,
    ))
}
