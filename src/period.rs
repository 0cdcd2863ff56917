// 📅 Period Model
//
// A reporting period is one calendar month. The regulator and the history
// repository spell it differently ("Ene 19-Nov 25", "nov-2025", "v2025.11"),
// so every textual form is folded into the same (year, month) pair before
// anything is compared.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Spanish and English month names, indexed by month - 1
const MONTH_NAMES: [(&str, &str); 12] = [
    ("enero", "january"),
    ("febrero", "february"),
    ("marzo", "march"),
    ("abril", "april"),
    ("mayo", "may"),
    ("junio", "june"),
    ("julio", "july"),
    ("agosto", "august"),
    ("septiembre", "september"),
    ("octubre", "october"),
    ("noviembre", "november"),
    ("diciembre", "december"),
];

const SPANISH_ABBREVIATIONS: [&str; 12] = [
    "ene", "feb", "mar", "abr", "may", "jun", "jul", "ago", "sep", "oct", "nov", "dic",
];

/// One reporting month. Ordered by year, then month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) || !(1900..=9999).contains(&year) {
            return Err(PipelineError::Format(format!("{}.{:02}", year, month)));
        }
        Ok(Period { year, month })
    }

    /// Parse any of the accepted textual forms
    ///
    /// # Accepted forms
    /// ```text
    /// 2025.11  v2025.11  2025-11  11/2025  30/11/2025
    /// nov-2025  noviembre-2025  Nov 2025  November 2025
    /// Ene 19-Nov 25   (availability range, the end wins)
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        let text = raw.trim().to_lowercase();
        let fail = || PipelineError::Format(raw.to_string());

        let (year, month) = parse_availability_range(&text)
            .or_else(|| parse_year_first(&text))
            .or_else(|| parse_slashed(&text))
            .or_else(|| parse_month_name(&text))
            .ok_or_else(fail)?;

        Period::new(year, month).map_err(|_| fail())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn compare(&self, other: &Period) -> Ordering {
        self.cmp(other)
    }

    /// True when this (candidate) period is strictly after the stored latest
    pub fn is_newer_than(&self, stored_latest: &Period) -> bool {
        self.compare(stored_latest) == Ordering::Greater
    }

    pub fn previous(&self) -> Period {
        if self.month == 1 {
            Period { year: self.year - 1, month: 12 }
        } else {
            Period { year: self.year, month: self.month - 1 }
        }
    }

    /// December of the year before, the base for year-to-date growth
    pub fn prior_year_end(&self) -> Period {
        Period { year: self.year - 1, month: 12 }
    }

    /// Same month one year earlier
    pub fn year_earlier(&self) -> Period {
        Period { year: self.year - 1, month: self.month }
    }

    /// Release tag form used by the history repository, e.g. `v2025.11`
    pub fn release_tag(&self) -> String {
        format!("v{}", self)
    }

    /// Human-readable form, e.g. `November 2025`
    pub fn human(&self) -> String {
        let english = MONTH_NAMES[(self.month - 1) as usize].1;
        let mut chars = english.chars();
        let capitalized = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        };
        format!("{} {}", capitalized, self.year)
    }

    /// Column label used by the regulator's spreadsheets, e.g. `nov-2025`
    pub fn spanish_label(&self) -> String {
        format!("{}-{}", SPANISH_ABBREVIATIONS[(self.month - 1) as usize], self.year)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Period::parse(s)
    }
}

impl TryFrom<String> for Period {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Period::parse(&value)
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

// ============================================================================
// FORMAT PARSERS
// ============================================================================

fn month_from_name(token: &str) -> Option<u32> {
    if token.len() < 3 || !token.chars().all(|c| c.is_alphabetic()) {
        return None;
    }
    MONTH_NAMES
        .iter()
        .position(|(es, en)| es.starts_with(token) || en.starts_with(token))
        .map(|idx| idx as u32 + 1)
}

fn all_digits(token: &str, len: usize) -> bool {
    token.len() == len && token.chars().all(|c| c.is_ascii_digit())
}

/// `2025.11`, `v2025.11`, `2025-11`
fn parse_year_first(text: &str) -> Option<(i32, u32)> {
    let text = text.strip_prefix('v').unwrap_or(text);
    let (year, month) = text.split_once(['.', '-'])?;
    if !all_digits(year, 4) || !(all_digits(month, 1) || all_digits(month, 2)) {
        return None;
    }
    Some((year.parse().ok()?, month.parse().ok()?))
}

/// `11/2025` and `30/11/2025`
fn parse_slashed(text: &str) -> Option<(i32, u32)> {
    let parts: Vec<&str> = text.split('/').collect();
    let (month, year) = match parts.as_slice() {
        [month, year] => (*month, *year),
        [day, month, year] if all_digits(day, 1) || all_digits(day, 2) => (*month, *year),
        _ => return None,
    };
    if !all_digits(year, 4) || !(all_digits(month, 1) || all_digits(month, 2)) {
        return None;
    }
    Some((year.parse().ok()?, month.parse().ok()?))
}

/// `nov-2025`, `noviembre de 2025`, `November 2025`
fn parse_month_name(text: &str) -> Option<(i32, u32)> {
    let tokens: Vec<&str> = text
        .split(|c: char| c == '-' || c.is_whitespace())
        .filter(|t| !t.is_empty() && *t != "de")
        .collect();
    match tokens.as_slice() {
        [name, year] if all_digits(year, 4) => Some((year.parse().ok()?, month_from_name(name)?)),
        _ => None,
    }
}

/// `Ene 19-Nov 25` as printed next to "Periodo Disponible"
fn parse_availability_range(text: &str) -> Option<(i32, u32)> {
    let text = text
        .strip_prefix("periodo disponible")
        .map(|rest| rest.trim_start_matches([':', ' ']))
        .unwrap_or(text);
    let (_start, end) = text.split_once('-')?;
    let tokens: Vec<&str> = end.split_whitespace().collect();
    match tokens.as_slice() {
        [name, year] if all_digits(year, 2) => {
            let month = month_from_name(name)?;
            let year: i32 = year.parse().ok()?;
            Some((2000 + year, month))
        }
        _ => None,
    }
}
