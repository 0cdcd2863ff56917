// ✅ Review & Data Quality
// Summary shown to the reviewer, plus a consistency check against the
// previously integrated period. Findings are warnings for the reviewer;
// nothing here blocks the pipeline.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::period::Period;
use crate::record::{Afore, Concept, Fund, SieforeRecord};

// ============================================================================
// REVIEW SUMMARY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub period: Period,
    pub record_count: usize,
    pub non_zero_count: usize,
    pub afores: BTreeSet<Afore>,
    pub funds: BTreeSet<Fund>,
    pub concepts: BTreeSet<Concept>,
    pub total_mxn: Decimal,
    pub total_usd: Decimal,
    /// Total Assets only, so sub-lines are not double counted
    pub total_assets_mxn: Decimal,
    pub total_assets_usd: Decimal,
    pub fx_rate: Option<Decimal>,
}

impl ReviewSummary {
    pub fn from_records(period: Period, records: &[SieforeRecord]) -> Self {
        let mut summary = ReviewSummary {
            period,
            record_count: records.len(),
            non_zero_count: 0,
            afores: BTreeSet::new(),
            funds: BTreeSet::new(),
            concepts: BTreeSet::new(),
            total_mxn: Decimal::ZERO,
            total_usd: Decimal::ZERO,
            total_assets_mxn: Decimal::ZERO,
            total_assets_usd: Decimal::ZERO,
            fx_rate: records.iter().find_map(|r| r.fx_rate),
        };

        for record in records {
            let usd = record.value_usd.unwrap_or_default();
            if !record.value_mxn.is_zero() {
                summary.non_zero_count += 1;
            }
            summary.afores.insert(record.afore);
            summary.funds.insert(record.fund);
            summary.concepts.insert(record.concept);
            summary.total_mxn += record.value_mxn;
            summary.total_usd += usd;
            if record.concept == Concept::TotalAssets {
                summary.total_assets_mxn += record.value_mxn;
                summary.total_assets_usd += usd;
            }
        }

        summary
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} records ({} non-zero), {} afores, {} funds, Total Assets MXN {} / USD {}",
            self.period.human(),
            self.record_count,
            self.non_zero_count,
            self.afores.len(),
            self.funds.len(),
            self.total_assets_mxn.round_dp(0),
            self.total_assets_usd.round_dp(0),
        )
    }
}

// ============================================================================
// CONSISTENCY REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub rule_name: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationResult {
    pub fn pass(rule_name: &str, message: &str) -> Self {
        ValidationResult {
            passed: true,
            rule_name: rule_name.to_string(),
            message: message.to_string(),
            severity: Severity::Info,
        }
    }

    pub fn fail(rule_name: &str, message: &str, severity: Severity) -> Self {
        ValidationResult {
            passed: false,
            rule_name: rule_name.to_string(),
            message: message.to_string(),
            severity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Severity {
    Warning, // Reviewer should look before approving
    Info,    // Worth knowing, expected from time to time
}

/// Total Assets change for one afore, USD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AforeChange {
    pub afore: Afore,
    pub previous_usd: Decimal,
    pub current_usd: Decimal,
    /// None when the afore had no assets in the previous period
    pub pct_change: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub period: Period,
    pub previous_period: Period,
    pub checks: Vec<ValidationResult>,
    pub afore_changes: Vec<AforeChange>,
}

impl ConsistencyReport {
    pub fn summary(&self) -> String {
        let failed = self.checks.iter().filter(|c| !c.passed).count();
        format!(
            "{} vs {}: {} checks, {} flagged",
            self.period,
            self.previous_period,
            self.checks.len(),
            failed
        )
    }

    pub fn has_warnings(&self) -> bool {
        self.checks
            .iter()
            .any(|c| !c.passed && c.severity == Severity::Warning)
    }
}

// ============================================================================
// DATA QUALITY ENGINE
// ============================================================================

pub struct DataQualityEngine {
    /// Largest acceptable Total Assets change, in percent
    variance_threshold_pct: Decimal,
}

impl DataQualityEngine {
    pub fn new() -> Self {
        DataQualityEngine {
            variance_threshold_pct: Decimal::from(10),
        }
    }

    pub fn with_threshold(variance_threshold_pct: Decimal) -> Self {
        DataQualityEngine { variance_threshold_pct }
    }

    /// Compare a new batch against the previous period's stored records
    pub fn compare(
        &self,
        period: Period,
        current: &[SieforeRecord],
        previous_period: Period,
        previous: &[SieforeRecord],
    ) -> ConsistencyReport {
        let mut checks = vec![self.check_record_count(current, previous)];

        checks.extend(check_set_diff("afores", current, previous, |r| r.afore.label()));
        checks.extend(check_set_diff("siefores", current, previous, |r| r.fund.label()));
        checks.extend(check_set_diff("concepts", current, previous, |r| r.concept.label()));

        let now = ReviewSummary::from_records(period, current);
        let before = ReviewSummary::from_records(previous_period, previous);
        checks.push(self.check_total_assets(now.total_assets_usd, before.total_assets_usd));

        ConsistencyReport {
            period,
            previous_period,
            checks,
            afore_changes: afore_changes(current, previous),
        }
    }

    fn check_record_count(&self, current: &[SieforeRecord], previous: &[SieforeRecord]) -> ValidationResult {
        if current.len() == previous.len() {
            ValidationResult::pass("record_count", &format!("record counts match: {}", current.len()))
        } else {
            ValidationResult::fail(
                "record_count",
                &format!("record count {} vs {} in the previous period", current.len(), previous.len()),
                Severity::Warning,
            )
        }
    }

    fn check_total_assets(&self, current_usd: Decimal, previous_usd: Decimal) -> ValidationResult {
        let Some(pct) = pct_change(current_usd, previous_usd) else {
            return ValidationResult::fail(
                "total_assets_variance",
                "previous period has no Total Assets to compare against",
                Severity::Info,
            );
        };

        let message = format!("Total Assets USD changed {}%", pct.round_dp(2));
        if pct.abs() > self.variance_threshold_pct {
            ValidationResult::fail("total_assets_variance", &message, Severity::Warning)
        } else {
            ValidationResult::pass("total_assets_variance", &message)
        }
    }
}

impl Default for DataQualityEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Missing entries are a warning, new ones only informational
fn check_set_diff<F>(
    name: &str,
    current: &[SieforeRecord],
    previous: &[SieforeRecord],
    label: F,
) -> Vec<ValidationResult>
where
    F: Fn(&SieforeRecord) -> &'static str,
{
    let now: BTreeSet<&str> = current.iter().map(&label).collect();
    let before: BTreeSet<&str> = previous.iter().map(&label).collect();

    let missing: Vec<&str> = before.difference(&now).copied().collect();
    let added: Vec<&str> = now.difference(&before).copied().collect();
    let rule = format!("{}_completeness", name);

    let mut results = Vec::new();
    if missing.is_empty() && added.is_empty() {
        results.push(ValidationResult::pass(&rule, &format!("{} match", name)));
    }
    if !missing.is_empty() {
        results.push(ValidationResult::fail(
            &rule,
            &format!("missing {}: {}", name, missing.join(", ")),
            Severity::Warning,
        ));
    }
    if !added.is_empty() {
        results.push(ValidationResult::fail(
            &rule,
            &format!("new {}: {}", name, added.join(", ")),
            Severity::Info,
        ));
    }
    results
}

fn pct_change(current: Decimal, previous: Decimal) -> Option<Decimal> {
    if previous.is_zero() {
        return None;
    }
    (current - previous)
        .checked_div(previous)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
}

fn afore_changes(current: &[SieforeRecord], previous: &[SieforeRecord]) -> Vec<AforeChange> {
    let mut by_afore: BTreeMap<Afore, (Decimal, Decimal)> = BTreeMap::new();

    for record in previous.iter().filter(|r| r.concept == Concept::TotalAssets) {
        by_afore.entry(record.afore).or_default().0 += record.value_usd.unwrap_or_default();
    }
    for record in current.iter().filter(|r| r.concept == Concept::TotalAssets) {
        by_afore.entry(record.afore).or_default().1 += record.value_usd.unwrap_or_default();
    }

    by_afore
        .into_iter()
        .map(|(afore, (previous_usd, current_usd))| AforeChange {
            afore,
            previous_usd,
            current_usd,
            pct_change: pct_change(current_usd, previous_usd),
        })
        .collect()
}

// ============================================================================
// GROWTH ANALYSIS
// ============================================================================

/// Concepts covered by the growth tables
pub const GROWTH_CONCEPTS: [Concept; 3] = [
    Concept::TotalAssets,
    Concept::MutualFundInvestments,
    Concept::OutsourcedInvestments,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Amounts {
    pub mxn: Decimal,
    pub usd: Decimal,
}

impl Amounts {
    fn add(&mut self, record: &SieforeRecord) {
        self.mxn += record.value_mxn;
        self.usd += record.value_usd.unwrap_or_default();
    }
}

/// Change from a base period to the report period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Growth {
    pub base: Amounts,
    pub change_mxn: Decimal,
    pub change_usd: Decimal,
    /// None when the base is zero
    pub pct_mxn: Option<Decimal>,
    pub pct_usd: Option<Decimal>,
}

impl Growth {
    fn between(current: Amounts, base: Amounts) -> Self {
        Growth {
            base,
            change_mxn: current.mxn - base.mxn,
            change_usd: current.usd - base.usd,
            pct_mxn: pct_change(current.mxn, base.mxn),
            pct_usd: pct_change(current.usd, base.usd),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthLine {
    pub concept: Concept,
    /// None for the industry total
    pub afore: Option<Afore>,
    pub current: Amounts,
    /// Against December of the previous year; None when that month is not stored
    pub ytd: Option<Growth>,
    /// Against the same month a year earlier; None when that month is not stored
    pub yoy: Option<Growth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowthReport {
    pub period: Period,
    pub ytd_base: Period,
    pub yoy_base: Period,
    pub lines: Vec<GrowthLine>,
}

impl GrowthReport {
    /// Per-afore growth for each concept, summed across funds
    ///
    /// An empty base slice means the base month is not in the history.
    pub fn build(
        period: Period,
        current: &[SieforeRecord],
        ytd_base: &[SieforeRecord],
        yoy_base: &[SieforeRecord],
    ) -> Self {
        let now = amounts_by_afore(current);
        let ytd = amounts_by_afore(ytd_base);
        let yoy = amounts_by_afore(yoy_base);

        let mut lines = Vec::new();
        for concept in GROWTH_CONCEPTS {
            let afores: BTreeSet<Afore> = [&now, &ytd, &yoy]
                .into_iter()
                .flat_map(|m| m.keys())
                .filter(|(c, _)| *c == concept)
                .map(|(_, a)| *a)
                .collect();

            let mut total = (Amounts::default(), Amounts::default(), Amounts::default());
            for afore in afores {
                let key = (concept, afore);
                let current = now.get(&key).copied().unwrap_or_default();
                let ytd_amounts = ytd.get(&key).copied().unwrap_or_default();
                let yoy_amounts = yoy.get(&key).copied().unwrap_or_default();

                total.0.mxn += current.mxn;
                total.0.usd += current.usd;
                total.1.mxn += ytd_amounts.mxn;
                total.1.usd += ytd_amounts.usd;
                total.2.mxn += yoy_amounts.mxn;
                total.2.usd += yoy_amounts.usd;

                lines.push(GrowthLine {
                    concept,
                    afore: Some(afore),
                    current,
                    ytd: (!ytd_base.is_empty()).then(|| Growth::between(current, ytd_amounts)),
                    yoy: (!yoy_base.is_empty()).then(|| Growth::between(current, yoy_amounts)),
                });
            }

            lines.push(GrowthLine {
                concept,
                afore: None,
                current: total.0,
                ytd: (!ytd_base.is_empty()).then(|| Growth::between(total.0, total.1)),
                yoy: (!yoy_base.is_empty()).then(|| Growth::between(total.0, total.2)),
            });
        }

        GrowthReport {
            period,
            ytd_base: period.prior_year_end(),
            yoy_base: period.year_earlier(),
            lines,
        }
    }

    pub fn lines_for(&self, concept: Concept) -> impl Iterator<Item = &GrowthLine> {
        self.lines
            .iter()
            .filter(move |l| l.concept == concept && l.afore.is_some())
    }

    /// Industry total line for a concept
    pub fn total(&self, concept: Concept) -> Option<&GrowthLine> {
        self.lines
            .iter()
            .find(|l| l.concept == concept && l.afore.is_none())
    }
}

fn amounts_by_afore(records: &[SieforeRecord]) -> BTreeMap<(Concept, Afore), Amounts> {
    let mut by_afore: BTreeMap<(Concept, Afore), Amounts> = BTreeMap::new();
    for record in records.iter().filter(|r| GROWTH_CONCEPTS.contains(&r.concept)) {
        by_afore.entry((record.concept, record.afore)).or_default().add(record);
    }
    by_afore
}
