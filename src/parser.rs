// 🏗️ Record Extractor
// Turns one fund's raw tabular report into canonical records for one period
//
// CONSAR reports are time series: each document carries several months,
// but only the target month is kept.

use std::collections::HashSet;
use std::io::Read;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::period::Period;
use crate::record::{fold, Afore, Concept, Fund, SieforeRecord};

// ============================================================================
// CORE TYPES
// ============================================================================

/// Unit declared by a document ("Unidad: Miles de Pesos")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclaredUnit {
    ThousandsOfPesos,
    MillionsOfPesos,
    Pesos,
    Other(String),
}

impl DeclaredUnit {
    fn detect(cell: &str) -> Option<DeclaredUnit> {
        let folded = fold(cell);
        if folded.contains("miles de pesos") {
            Some(DeclaredUnit::ThousandsOfPesos)
        } else if folded.contains("millones de pesos") {
            Some(DeclaredUnit::MillionsOfPesos)
        } else if folded.starts_with("unidad") {
            if folded.contains("pesos") {
                Some(DeclaredUnit::Pesos)
            } else {
                Some(DeclaredUnit::Other(cell.trim().to_string()))
            }
        } else {
            None
        }
    }
}

/// RawRow - one line of a document before any interpretation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub period: String,
    pub afore: String,
    pub concept: String,
    pub value: String,
    pub line_number: usize,
}

/// RawDocument - what a document source hands to the extractor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub rows: Vec<RawRow>,
    pub declared_unit: Option<DeclaredUnit>,
    /// Fund named in the document header, when there is one
    pub header_fund: Option<String>,
}

impl RawDocument {
    pub fn new(rows: Vec<RawRow>) -> Self {
        RawDocument {
            rows,
            declared_unit: None,
            header_fund: None,
        }
    }

    /// Long form CSV with header `period,afore,concept,value`
    pub fn from_long_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut rows = Vec::new();
        for (idx, result) in rdr.records().enumerate() {
            let record = result?;
            rows.push(RawRow {
                period: record.get(0).unwrap_or("").to_string(),
                afore: record.get(1).unwrap_or("").to_string(),
                concept: record.get(2).unwrap_or("").to_string(),
                value: record.get(3).unwrap_or("").to_string(),
                line_number: idx + 2, // 1-indexed + header row
            });
        }

        Ok(RawDocument::new(rows))
    }

    /// CSV export of the regulator's spreadsheet grid
    pub fn from_grid_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut cells: Vec<Vec<String>> = Vec::new();
        for result in rdr.records() {
            let record = result?;
            cells.push(record.iter().map(|c| c.to_string()).collect());
        }

        Ok(RawDocument::from_grid(&cells))
    }

    /// Read either CSV shape, sniffing the first line
    pub fn from_csv<R: Read>(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;

        let first_line = text.lines().next().unwrap_or("").to_lowercase();
        let header: Vec<&str> = first_line.split(',').map(str::trim).collect();
        if header.starts_with(&["period", "afore", "concept", "value"]) {
            RawDocument::from_long_csv(text.as_bytes())
        } else {
            RawDocument::from_grid_csv(text.as_bytes())
        }
    }

    /// Flatten the regulator's grid layout into long-form rows
    ///
    /// # Layout
    /// ```text
    ///  | Siefore Básica 60-64 |   |   |                  <- header (fund)
    ///  | Unidad: Miles de Pesos                          <- unit
    ///  |                     |   |   | ene-2025 | feb-2025 ...  <- periods, col E onward
    ///  | Total de Activo     |                           <- concept section
    ///  | Azteca              |   |   | 1,234.5  | 1,240.1      <- afore rows
    /// ```
    pub fn from_grid(cells: &[Vec<String>]) -> Self {
        const FIRST_PERIOD_COL: usize = 4;

        fn cell(row: &[String], col: usize) -> &str {
            row.get(col).map(|c| c.trim()).unwrap_or("")
        }

        let mut document = RawDocument::default();

        let mut period_columns: Vec<(usize, String)> = Vec::new();
        let mut current_concept: Option<String> = None;

        for (idx, row) in cells.iter().enumerate() {
            let line_number = idx + 1;

            if document.declared_unit.is_none() {
                if let Some(unit) = row.iter().find_map(|c| DeclaredUnit::detect(c)) {
                    document.declared_unit = Some(unit);
                    continue;
                }
            }

            if document.header_fund.is_none() {
                if let Some(header) = row.iter().find(|c| fold(c).starts_with("siefore")) {
                    document.header_fund = Some(header.trim().to_string());
                    continue;
                }
            }

            if period_columns.is_empty() {
                let found: Vec<(usize, String)> = row
                    .iter()
                    .enumerate()
                    .skip(FIRST_PERIOD_COL)
                    .filter(|(_, c)| Period::parse(c).is_ok())
                    .map(|(col, c)| (col, c.trim().to_string()))
                    .collect();
                // Rows above the period header carry no data
                period_columns = found;
                continue;
            }

            let label = cell(row, 1);
            if label.is_empty() {
                continue;
            }

            // A section header: a known concept, or any non-afore label with no figures.
            // Unknown sections still replace the concept so their rows are skipped later.
            let no_figures = period_columns.iter().all(|(col, _)| cell(row, *col).is_empty());
            if Afore::from_label(label).is_none()
                && (Concept::from_label(label).is_some() || no_figures)
            {
                current_concept = Some(label.to_string());
                continue;
            }

            // Rows before the first section have no concept to attach to
            let Some(concept) = current_concept.as_ref() else {
                continue;
            };

            for (col, period) in &period_columns {
                document.rows.push(RawRow {
                    period: period.clone(),
                    afore: label.to_string(),
                    concept: concept.clone(),
                    value: cell(row, *col).to_string(),
                    line_number,
                });
            }
        }

        document
    }
}

// ============================================================================
// VALUE PARSING
// ============================================================================

/// Parse a published figure: `1,234.56`, `-12.5`, ` 0 `
///
/// Anything that is not a finite decimal (N/E, footnote text, blanks) is None.
pub fn parse_value(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned
        .parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(&cleaned).ok())
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// Per-document extraction counters, logged after each document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub kept: usize,
    pub other_periods: usize,
    pub non_numeric: usize,
    pub unknown_concept: usize,
    pub unknown_afore: usize,
}

/// Extract the records of `target` from one fund's document
///
/// Never fails on bad rows: they are counted, logged and skipped. Whether an
/// empty result is fatal is decided across all documents by `extract_all`.
pub fn extract(document: &RawDocument, fund: Fund, target: Period) -> Vec<SieforeRecord> {
    extract_with_stats(document, fund, target).0
}

pub fn extract_with_stats(
    document: &RawDocument,
    fund: Fund,
    target: Period,
) -> (Vec<SieforeRecord>, ExtractionStats) {
    let mut stats = ExtractionStats::default();
    let mut records = Vec::new();

    if let Some(unit) = &document.declared_unit {
        if *unit != DeclaredUnit::ThousandsOfPesos {
            warn!(%fund, ?unit, "document is not in thousands of pesos; skipping it");
            return (records, stats);
        }
    }

    if let Some(header) = &document.header_fund {
        if Fund::from_label(header) != Some(fund) {
            warn!(%fund, header = %header, "document header names a different fund");
        }
    }

    for row in &document.rows {
        match Period::parse(&row.period) {
            Ok(p) if p == target => {}
            _ => {
                stats.other_periods += 1;
                continue;
            }
        }

        let Some(value) = parse_value(&row.value) else {
            stats.non_numeric += 1;
            debug!(line = row.line_number, value = %row.value, "non-numeric value row skipped");
            continue;
        };

        let Some(concept) = Concept::from_label(&row.concept) else {
            stats.unknown_concept += 1;
            warn!(%fund, line = row.line_number, concept = %row.concept, "unrecognized concept label, row skipped");
            continue;
        };

        let Some(afore) = Afore::from_label(&row.afore) else {
            stats.unknown_afore += 1;
            debug!(line = row.line_number, afore = %row.afore, "not an afore row, skipped");
            continue;
        };

        records.push(SieforeRecord::new(target, fund, concept, afore, value));
        stats.kept += 1;
    }

    (records, stats)
}

/// Extract every fund's document; an empty result across all of them is fatal
pub fn extract_all(documents: &[(Fund, RawDocument)], target: Period) -> Result<Vec<SieforeRecord>> {
    let mut all = Vec::new();
    let mut seen = HashSet::new();

    for (fund, document) in documents {
        let (records, stats) = extract_with_stats(document, *fund, target);
        info!(
            %fund,
            kept = stats.kept,
            other_periods = stats.other_periods,
            non_numeric = stats.non_numeric,
            unknown_concept = stats.unknown_concept,
            "extracted document"
        );
        if records.is_empty() {
            warn!(%fund, period = %target, "no rows for target period in document");
        }
        for record in records {
            // One record per key; a repeated row keeps its first value
            if seen.insert(record.key()) {
                all.push(record);
            } else {
                warn!(record = %record.describe(), "duplicate row for the same key, skipped");
            }
        }
    }

    if all.is_empty() {
        return Err(PipelineError::ExtractionEmpty(target));
    }

    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn row(period: &str, afore: &str, concept: &str, value: &str) -> RawRow {
        RawRow {
            period: period.to_string(),
            afore: afore.to_string(),
            concept: concept.to_string(),
            value: value.to_string(),
            line_number: 0,
        }
    }

    fn nov() -> Period {
        Period::new(2025, 11).unwrap()
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("31,319,202.025"), Some(Decimal::from_str("31319202.025").unwrap()));
        assert_eq!(parse_value(" 0 "), Some(Decimal::ZERO));
        assert_eq!(parse_value("-12.5"), Some(Decimal::from_str("-12.5").unwrap()));
        assert_eq!(parse_value("1.5e3"), Some(Decimal::from(1500)));
        assert_eq!(parse_value("N/E"), None);
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value("NaN"), None);
        assert_eq!(parse_value("inf"), None);
        assert_eq!(parse_value("Fuente: CONSAR"), None);
    }

    #[test]
    fn test_extract_keeps_only_target_period() {
        let doc = RawDocument::new(vec![
            row("oct-2025", "Azteca", "Total de Activo", "100"),
            row("nov-2025", "Azteca", "Total de Activo", "110"),
            row("2025.11", "Coppel", "Total de Activo", "210"),
        ]);

        let records = extract(&doc, Fund::Pensiones, nov());

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.period == nov()));
        assert!(records.iter().all(|r| !r.is_normalized()));
        assert!(records.iter().all(|r| r.value_usd.is_none() && r.fx_rate.is_none()));
        assert_eq!(records[0].value_mxn, Decimal::from(110));
    }

    #[test]
    fn test_extract_skips_junk_rows() {
        let doc = RawDocument::new(vec![
            row("nov-2025", "Azteca", "Total de Activo", "N/E"),
            row("nov-2025", "Azteca", "Plusvalías", "5"),
            row("nov-2025", "Fuente: CONSAR", "Total de Activo", "7"),
            row("nov-2025", "SURA", "Inversiones Tercerizadas", "1,000.5"),
        ]);

        let (records, stats) = extract_with_stats(&doc, Fund::Basica6064, nov());

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].afore, Afore::Sura);
        assert_eq!(records[0].concept, Concept::OutsourcedInvestments);
        assert_eq!(stats.non_numeric, 1);
        assert_eq!(stats.unknown_concept, 1);
        assert_eq!(stats.unknown_afore, 1);
    }

    #[test]
    fn test_extract_all_empty_is_fatal() {
        let docs = vec![(
            Fund::Pensiones,
            RawDocument::new(vec![row("oct-2025", "Azteca", "Total de Activo", "1")]),
        )];

        let err = extract_all(&docs, nov()).unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionEmpty(p) if p == nov()));
    }

    #[test]
    fn test_extract_all_accepts_partial() {
        let docs = vec![
            (Fund::Pensiones, RawDocument::new(vec![])),
            (
                Fund::Basica6569,
                RawDocument::new(vec![row("nov-2025", "Inbursa", "Total de Activo", "9")]),
            ),
        ];

        let records = extract_all(&docs, nov()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fund, Fund::Basica6569);
    }

    #[test]
    fn test_extract_all_drops_repeated_keys() {
        let docs = vec![(
            Fund::Pensiones,
            RawDocument::new(vec![
                row("nov-2025", "Coppel", "Total de Activo", "10"),
                row("nov-2025", "Coppel", "Total de Activo", "99"),
            ]),
        )];

        let records = extract_all(&docs, nov()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value_mxn, Decimal::from(10));
    }

    const GRID: &str = "\
,,,,
,Siefore Básica 60-64,,,
,Unidad: Miles de Pesos,,,
,,,,oct-2025,nov-2025
,Total de Activo,,,,
,Azteca,,,\"1,000.5\",\"1,100.25\"
,XXI Banorte,,,\"31,000,000\",\"31,319,202.025\"
,Inversión en Fondos Mutuos,,,,
,Azteca,,,0,0
,Total,,,5,6
,Fuente: CONSAR con información de las Afores,,,,
";

    #[test]
    fn test_grid_document() {
        let doc = RawDocument::from_csv(GRID.as_bytes()).unwrap();

        assert_eq!(doc.declared_unit, Some(DeclaredUnit::ThousandsOfPesos));
        assert_eq!(doc.header_fund.as_deref(), Some("Siefore Básica 60-64"));

        let records = extract(&doc, Fund::Basica6064, nov());
        assert_eq!(records.len(), 3);

        let banorte = records
            .iter()
            .find(|r| r.afore == Afore::XxiBanorte && r.concept == Concept::TotalAssets)
            .unwrap();
        assert_eq!(banorte.value_mxn, Decimal::from_str("31319202.025").unwrap());

        let mutual = records
            .iter()
            .find(|r| r.concept == Concept::MutualFundInvestments)
            .unwrap();
        assert_eq!(mutual.value_mxn, Decimal::ZERO);
    }

    #[test]
    fn test_grid_unknown_section_does_not_inherit_concept() {
        let grid = "\
,Siefore Básica 60-64,,,
,Unidad: Miles de Pesos,,,
,,,,oct-2025,nov-2025
,Total de Activo,,,,
,Azteca,,,1,2
,Plusvalías,,,,
,Coppel,,,998,999
";
        let doc = RawDocument::from_csv(grid.as_bytes()).unwrap();

        let (records, stats) = extract_with_stats(&doc, Fund::Basica6064, nov());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].afore, Afore::Azteca);
        assert_eq!(records[0].value_mxn, Decimal::from(2));
        assert!(records.iter().all(|r| r.afore != Afore::Coppel));
        assert_eq!(stats.unknown_concept, 1);
        assert!(doc.rows.iter().any(|r| r.afore == "Coppel" && r.concept == "Plusvalías"));
    }

    #[test]
    fn test_grid_in_millions_is_rejected() {
        let grid = GRID.replace("Miles de Pesos", "Millones de Pesos");
        let doc = RawDocument::from_csv(grid.as_bytes()).unwrap();

        assert_eq!(doc.declared_unit, Some(DeclaredUnit::MillionsOfPesos));
        assert!(extract(&doc, Fund::Basica6064, nov()).is_empty());
    }

    #[test]
    fn test_long_csv_document() {
        let csv = "period,afore,concept,value\n\
                   nov-2025,Profuturo,Total de Activo,\"2,500\"\n\
                   nov-2025,Profuturo,Inversión en Títulos Fiduciarios,12\n";
        let doc = RawDocument::from_csv(csv.as_bytes()).unwrap();

        assert_eq!(doc.rows.len(), 2);
        assert_eq!(doc.rows[0].line_number, 2);

        let records = extract(&doc, Fund::Basica9094, nov());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value_mxn, Decimal::from(2500));
        assert_eq!(records[1].concept, Concept::TrustTitleInvestments);
    }
}
