// ⚙️ Pipeline configuration
// TOML file (every field optional) + SIEFORE_* environment overrides

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::db::SanityRange;
use crate::error::{PipelineError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "siefore.toml";

/// Default tracing filter when neither RUST_LOG nor SIEFORE_LOG is set
pub fn default_log_filter() -> &'static str {
    "siefore_update=info,warn"
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub history_db: PathBuf,
    pub state_db: PathBuf,
    pub backup_dir: PathBuf,
    pub documents_dir: PathBuf,
    pub fx_series: PathBuf,
    /// Where review packets are written; none means log only
    pub review_dir: Option<PathBuf>,
    pub log_filter: String,
    pub checks: CheckConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            history_db: PathBuf::from("data/history.db"),
            state_db: PathBuf::from("data/state.db"),
            backup_dir: PathBuf::from("data/backups"),
            documents_dir: PathBuf::from("data/documents"),
            fx_series: PathBuf::from("data/sf43718.json"),
            review_dir: None,
            log_filter: default_log_filter().to_string(),
            checks: CheckConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Reviewer-facing sanity checks; none of these block integration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Expected industry Total Assets, MXN in store units
    pub min_total_assets_mxn: Option<Decimal>,
    pub max_total_assets_mxn: Option<Decimal>,
    /// Month-over-month Total Assets change that gets flagged, percent
    pub variance_threshold_pct: Decimal,
}

impl Default for CheckConfig {
    fn default() -> Self {
        CheckConfig {
            min_total_assets_mxn: Some(Decimal::from(3_000_000_000_000i64)),
            max_total_assets_mxn: Some(Decimal::from(15_000_000_000_000i64)),
            variance_threshold_pct: Decimal::from(10),
        }
    }
}

impl CheckConfig {
    pub fn sanity_range(&self) -> Option<SanityRange> {
        match (self.min_total_assets_mxn, self.max_total_assets_mxn) {
            (Some(min_mxn), Some(max_mxn)) => Some(SanityRange { min_mxn, max_mxn }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl PipelineConfig {
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(input).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit path must exist; otherwise `siefore.toml` is used when present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml(&fs::read_to_string(path)?)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_toml(&fs::read_to_string(DEFAULT_CONFIG_FILE)?)?
            }
            None => PipelineConfig::default(),
        };

        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment wins over the file
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let paths: [(&str, &mut PathBuf); 5] = [
            ("SIEFORE_HISTORY_DB", &mut self.history_db),
            ("SIEFORE_STATE_DB", &mut self.state_db),
            ("SIEFORE_BACKUP_DIR", &mut self.backup_dir),
            ("SIEFORE_DOCUMENTS_DIR", &mut self.documents_dir),
            ("SIEFORE_FX_SERIES", &mut self.fx_series),
        ];
        for (key, slot) in paths {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = PathBuf::from(value);
            }
        }

        if let Some(dir) = lookup("SIEFORE_REVIEW_DIR").filter(|v| !v.trim().is_empty()) {
            self.review_dir = Some(PathBuf::from(dir));
        }
        if let Some(filter) = lookup("SIEFORE_LOG").filter(|v| !v.trim().is_empty()) {
            self.log_filter = filter;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(range) = self.checks.sanity_range() {
            if range.min_mxn > range.max_mxn {
                return Err(PipelineError::Config(format!(
                    "min_total_assets_mxn ({}) is above max_total_assets_mxn ({})",
                    range.min_mxn, range.max_mxn
                )));
            }
        }

        if self.checks.variance_threshold_pct <= Decimal::ZERO {
            return Err(PipelineError::Config(
                "variance_threshold_pct must be positive".to_string(),
            ));
        }

        if self.history_db == self.state_db {
            return Err(PipelineError::Config(
                "history_db and state_db must be different files".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert!(config.checks.sanity_range().is_some());
    }

    #[test]
    fn test_partial_file() {
        let config = PipelineConfig::from_toml(
            r#"
history_db = "/srv/siefore/history.db"
review_dir = "/srv/siefore/reviews"

[checks]
min_total_assets_mxn = 5000000000000
variance_threshold_pct = "7.5"
"#,
        )
        .unwrap();

        assert_eq!(config.history_db, PathBuf::from("/srv/siefore/history.db"));
        assert_eq!(config.state_db, PathBuf::from("data/state.db"));
        assert_eq!(config.review_dir, Some(PathBuf::from("/srv/siefore/reviews")));
        assert_eq!(config.checks.min_total_assets_mxn, Some(Decimal::from(5_000_000_000_000i64)));
        assert_eq!(config.checks.variance_threshold_pct, Decimal::new(75, 1));
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("SIEFORE_HISTORY_DB", "/tmp/h.db"),
            ("SIEFORE_FX_SERIES", "/tmp/fx.json"),
            ("SIEFORE_LOG", "debug"),
            ("SIEFORE_STATE_DB", "  "),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.history_db, PathBuf::from("/tmp/h.db"));
        assert_eq!(config.fx_series, PathBuf::from("/tmp/fx.json"));
        assert_eq!(config.log_filter, "debug");
        // Blank values are ignored
        assert_eq!(config.state_db, PathBuf::from("data/state.db"));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let err = PipelineConfig::from_toml(
            "[checks]\nmin_total_assets_mxn = 10\nmax_total_assets_mxn = 5\n",
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_unknown_type_is_config_error() {
        let err = PipelineConfig::from_toml("history_db = 5").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
