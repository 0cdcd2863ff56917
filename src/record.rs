// 🧾 Siefore records - one observation per (period, fund, concept, afore)
//
// Funds, concepts and afores are closed sets published by CONSAR, so they are
// enums with a fixed label lookup instead of free-form strings.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::period::Period;

// ============================================================================
// FUND (SIEFORE)
// ============================================================================

/// The ten Siefore fund categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Fund {
    Pensiones,
    Basica6064,
    Basica6569,
    Basica7074,
    Basica7579,
    Basica8084,
    Basica8589,
    Basica9094,
    Basica9599,
    BasicaInicial,
}

impl Fund {
    pub const ALL: [Fund; 10] = [
        Fund::Pensiones,
        Fund::Basica6064,
        Fund::Basica6569,
        Fund::Basica7074,
        Fund::Basica7579,
        Fund::Basica8084,
        Fund::Basica8589,
        Fund::Basica9094,
        Fund::Basica9599,
        Fund::BasicaInicial,
    ];

    /// Name as stored in the historical dataset
    pub fn label(&self) -> &'static str {
        match self {
            Fund::Pensiones => "Pensiones",
            Fund::Basica6064 => "60-64",
            Fund::Basica6569 => "65-69",
            Fund::Basica7074 => "70-74",
            Fund::Basica7579 => "75-79",
            Fund::Basica8084 => "80-84",
            Fund::Basica8589 => "85-89",
            Fund::Basica9094 => "90-94",
            Fund::Basica9599 => "95-99",
            Fund::BasicaInicial => "Basica Inicial",
        }
    }

    /// File-name friendly form, e.g. `60-64` or `basica-inicial`
    pub fn slug(&self) -> String {
        self.label().to_lowercase().replace(' ', "-")
    }

    /// Accepts the stored label, its slug, or the spreadsheet header
    /// ("Siefore Básica 60-64", "Siefore Básica de Pensiones")
    pub fn from_label(label: &str) -> Option<Fund> {
        let folded = fold(label);
        if let Some(fund) = Fund::ALL
            .iter()
            .find(|f| fold(f.label()) == folded || f.slug() == folded)
        {
            return Some(*fund);
        }

        let mut rest = folded.as_str();
        for prefix in ["siefore", "basica", "de"] {
            rest = rest.strip_prefix(prefix).map(str::trim_start).unwrap_or(rest);
        }
        match rest {
            "" => None,
            "inicial" => Some(Fund::BasicaInicial),
            other => Fund::ALL.iter().find(|f| fold(f.label()) == other).copied(),
        }
    }
}

impl fmt::Display for Fund {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// CONCEPT
// ============================================================================

/// Reported financial metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Concept {
    TotalAssets,
    OutsourcedInvestments,
    TrustTitleInvestments,
    MutualFundInvestments,
}

impl Concept {
    pub const ALL: [Concept; 4] = [
        Concept::TotalAssets,
        Concept::OutsourcedInvestments,
        Concept::TrustTitleInvestments,
        Concept::MutualFundInvestments,
    ];

    /// Label as published by CONSAR and stored in history
    pub fn label(&self) -> &'static str {
        match self {
            Concept::TotalAssets => "Total de Activo",
            Concept::OutsourcedInvestments => "Inversiones Tercerizadas",
            Concept::TrustTitleInvestments => "Inversión en Títulos Fiduciarios",
            Concept::MutualFundInvestments => "Inversión en Fondos Mutuos",
        }
    }

    /// Keyword lookup; tolerant to accents, case and footnote markers
    pub fn from_label(label: &str) -> Option<Concept> {
        let folded = fold(label);
        if folded.contains("activo") {
            Some(Concept::TotalAssets)
        } else if folded.contains("tercerizad") {
            Some(Concept::OutsourcedInvestments)
        } else if folded.contains("fiduciari") {
            Some(Concept::TrustTitleInvestments)
        } else if folded.contains("fondos mutuos") {
            Some(Concept::MutualFundInvestments)
        } else {
            None
        }
    }
}

impl fmt::Display for Concept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// AFORE
// ============================================================================

/// Pension-fund administrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Afore {
    Azteca,
    Banamex,
    Coppel,
    Inbursa,
    Invercap,
    PensionIssste,
    Principal,
    Profuturo,
    Sura,
    XxiBanorte,
}

impl Afore {
    pub const ALL: [Afore; 10] = [
        Afore::Azteca,
        Afore::Banamex,
        Afore::Coppel,
        Afore::Inbursa,
        Afore::Invercap,
        Afore::PensionIssste,
        Afore::Principal,
        Afore::Profuturo,
        Afore::Sura,
        Afore::XxiBanorte,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Afore::Azteca => "Azteca",
            Afore::Banamex => "Banamex",
            Afore::Coppel => "Coppel",
            Afore::Inbursa => "Inbursa",
            Afore::Invercap => "Invercap",
            Afore::PensionIssste => "PensionISSSTE",
            Afore::Principal => "Principal",
            Afore::Profuturo => "Profuturo",
            Afore::Sura => "SURA",
            Afore::XxiBanorte => "XXI Banorte",
        }
    }

    /// Exact (case-insensitive) match; footer rows and totals return None
    pub fn from_label(label: &str) -> Option<Afore> {
        let folded = fold(label);
        if folded == "banorte" {
            return Some(Afore::XxiBanorte);
        }
        Afore::ALL
            .iter()
            .find(|a| fold(a.label()) == folded)
            .copied()
    }
}

impl fmt::Display for Afore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lowercase, strip Spanish accents and footnote markers, squash spaces
pub(crate) fn fold(label: &str) -> String {
    let folded: String = label
        .trim()
        .trim_end_matches('*')
        .chars()
        .map(|c| match c {
            'á' | 'Á' => 'a',
            'é' | 'É' => 'e',
            'í' | 'Í' => 'i',
            'ó' | 'Ó' => 'o',
            'ú' | 'Ú' | 'ü' | 'Ü' => 'u',
            'ñ' | 'Ñ' => 'n',
            other => other.to_ascii_lowercase(),
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// SIEFORE RECORD
// ============================================================================

/// Scale of `value_mxn` / `value_usd`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueUnit {
    /// Thousands of pesos, as published ("Miles de Pesos")
    SourceThousands,
    /// Actual currency units, as kept in the historical store
    StorePesos,
}

/// Identity of a record inside the historical store
pub type RecordKey = (Period, Fund, Concept, Afore);

/// One observation
///
/// Values start in source units. Only `normalize` moves them to store units,
/// and `unit` records which side of that transition the record is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SieforeRecord {
    pub period: Period,
    pub fund: Fund,
    pub concept: Concept,
    pub afore: Afore,
    pub value_mxn: Decimal,
    pub value_usd: Option<Decimal>,
    pub fx_rate: Option<Decimal>,
    unit: ValueUnit,
}

impl SieforeRecord {
    /// New record in source units, not yet enriched
    pub fn new(period: Period, fund: Fund, concept: Concept, afore: Afore, value_mxn: Decimal) -> Self {
        SieforeRecord {
            period,
            fund,
            concept,
            afore,
            value_mxn,
            value_usd: None,
            fx_rate: None,
            unit: ValueUnit::SourceThousands,
        }
    }

    /// Rebuild a record read back from the historical store
    pub(crate) fn from_store(
        period: Period,
        fund: Fund,
        concept: Concept,
        afore: Afore,
        value_mxn: Decimal,
        value_usd: Option<Decimal>,
        fx_rate: Option<Decimal>,
    ) -> Self {
        SieforeRecord {
            period,
            fund,
            concept,
            afore,
            value_mxn,
            value_usd,
            fx_rate,
            unit: ValueUnit::StorePesos,
        }
    }

    pub fn key(&self) -> RecordKey {
        (self.period, self.fund, self.concept, self.afore)
    }

    pub fn unit(&self) -> ValueUnit {
        self.unit
    }

    pub fn is_normalized(&self) -> bool {
        self.unit == ValueUnit::StorePesos
    }

    /// Only the normalizer flips the marker
    pub(crate) fn mark_normalized(&mut self) {
        self.unit = ValueUnit::StorePesos;
    }

    /// Short identifier for logs and errors
    pub fn describe(&self) -> String {
        format!("{}/{}/{}/{}", self.period, self.fund, self.concept, self.afore)
    }
}
