// 💱 FX Enricher
// Attaches the end-of-month USD/MXN rate and derives valueUSD
//
// The division happens on the thousands-scaled figure, before the unit
// normalizer runs, so valueUSD is also in source units until normalization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::parser::parse_value;
use crate::period::Period;
use crate::record::SieforeRecord;

// ============================================================================
// FX RATE
// ============================================================================

/// End-of-period exchange rate: pesos per one US dollar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FxRate {
    pub period: Period,
    pub rate_value: Decimal,
    pub source_timestamp: DateTime<Utc>,
}

/// FxSource - where end-of-month rates come from
///
/// `Ok(None)` means the source answered but has no rate for the period.
pub trait FxSource {
    fn fetch_rate(&self, period: Period) -> anyhow::Result<Option<FxRate>>;
}

/// Ask the source for `period` and insist on an exact, usable answer
///
/// A rate for any other period (stale cache) counts as missing.
pub fn resolve_rate(source: &dyn FxSource, period: Period) -> Result<FxRate> {
    let rate = source
        .fetch_rate(period)?
        .ok_or(PipelineError::MissingRate(period))?;

    if rate.period != period {
        warn!(requested = %period, returned = %rate.period, "FX source answered for another period");
        return Err(PipelineError::MissingRate(period));
    }

    if rate.rate_value <= Decimal::ZERO {
        warn!(%period, rate = %rate.rate_value, "FX source returned a non-positive rate");
        return Err(PipelineError::MissingRate(period));
    }

    Ok(rate)
}

// ============================================================================
// ENRICHMENT
// ============================================================================

/// Set fx_rate and value_usd on every record
///
/// Zero pesos stay zero dollars; nothing is divided in that case.
pub fn enrich(records: Vec<SieforeRecord>, fx: &FxRate) -> Result<Vec<SieforeRecord>> {
    if fx.rate_value <= Decimal::ZERO {
        warn!(period = %fx.period, rate = %fx.rate_value, "refusing to enrich with a non-positive rate");
        return Err(PipelineError::MissingRate(fx.period));
    }

    let mut enriched = Vec::with_capacity(records.len());
    let mut converted = 0usize;

    for mut record in records {
        if record.period != fx.period {
            return Err(PipelineError::MissingRate(record.period));
        }

        let value_usd = if record.value_mxn.is_zero() {
            Decimal::ZERO
        } else {
            converted += 1;
            record
                .value_mxn
                .checked_div(fx.rate_value)
                .ok_or_else(|| PipelineError::Overflow(record.describe()))?
        };

        record.fx_rate = Some(fx.rate_value);
        record.value_usd = Some(value_usd);
        enriched.push(record);
    }

    info!(
        period = %fx.period,
        rate = %fx.rate_value,
        records = enriched.len(),
        converted,
        "enriched records with FX"
    );

    Ok(enriched)
}

// ============================================================================
// BANXICO SERIES (SF43718)
// ============================================================================

#[derive(Debug, Deserialize)]
struct BanxicoResponse {
    bmx: BanxicoBody,
}

#[derive(Debug, Deserialize)]
struct BanxicoBody {
    series: Vec<BanxicoSeries>,
}

#[derive(Debug, Deserialize)]
struct BanxicoSeries {
    #[serde(default, rename = "idSerie")]
    id: String,
    #[serde(default)]
    datos: Vec<BanxicoObservation>,
}

#[derive(Debug, Deserialize)]
struct BanxicoObservation {
    fecha: String,
    dato: String,
}

/// Daily observations of the FIX rate, as returned by Banxico's SIE API
#[derive(Debug, Clone, Default)]
pub struct FxSeries {
    pub series_id: String,
    pub observations: Vec<(NaiveDate, Decimal)>,
}

impl FxSeries {
    /// Parse the SIE JSON body; unparsable dates and "N/E" values are dropped
    pub fn from_json(json: &str) -> Result<Self> {
        let response: BanxicoResponse = serde_json::from_str(json)?;
        let series = response
            .bmx
            .series
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Config("Banxico response has no series".to_string()))?;

        let observations = series
            .datos
            .iter()
            .filter_map(|obs| {
                let date = NaiveDate::parse_from_str(obs.fecha.trim(), "%d/%m/%Y").ok()?;
                let value = parse_value(&obs.dato)?;
                Some((date, value))
            })
            .collect();

        Ok(FxSeries {
            series_id: series.id,
            observations,
        })
    }

    /// Last observation inside the period
    pub fn end_of_month(&self, period: Period) -> Option<FxRate> {
        let (date, value) = self
            .observations
            .iter()
            .filter(|(d, _)| d.year() == period.year() && d.month() == period.month())
            .max_by_key(|(d, _)| *d)?;

        let midnight = date.and_hms_opt(0, 0, 0)?;
        Some(FxRate {
            period,
            rate_value: *value,
            source_timestamp: Utc.from_utc_datetime(&midnight),
        })
    }
}

/// FX source backed by a saved SIE response on disk
pub struct BanxicoFileSource {
    path: PathBuf,
}

impl BanxicoFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        BanxicoFileSource {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl FxSource for BanxicoFileSource {
    fn fetch_rate(&self, period: Period) -> anyhow::Result<Option<FxRate>> {
        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read FX series: {}", self.path.display()))?;
        let series = FxSeries::from_json(&json)?;
        Ok(series.end_of_month(period))
    }
}
