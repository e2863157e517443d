// ⚙️ Configuration - engine knobs and variant rules, loaded from JSON
//
// Every field has a default, so `{}` is a valid config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ReconciliationError, ReconciliationResult};
use crate::normalize::VariantRule;
use crate::stats::{StatsAggregator, DEFAULT_POPULARITY_BONUS, MAX_POPULARITY};

pub const DEFAULT_MERGE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_DATABASE_PATH: &str = "locations.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Added to the group's best popularity when merging
    pub popularity_bonus: u8,

    /// Deadline for one merge; `null` disables it
    pub merge_timeout_ms: Option<u64>,

    /// Known spelling variants, applied in order
    pub variant_rules: Vec<VariantRule>,

    pub database_path: PathBuf,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        ReconciliationConfig {
            popularity_bonus: DEFAULT_POPULARITY_BONUS,
            merge_timeout_ms: Some(DEFAULT_MERGE_TIMEOUT_MS),
            variant_rules: Vec::new(),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

impl ReconciliationConfig {
    /// Load and validate a JSON config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: ReconciliationConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path.as_ref()))?;

        Ok(config)
    }

    pub fn validate(&self) -> ReconciliationResult<()> {
        if self.popularity_bonus > MAX_POPULARITY {
            return Err(ReconciliationError::Config(format!(
                "popularity_bonus must be at most {}, got {}",
                MAX_POPULARITY, self.popularity_bonus
            )));
        }

        for (i, rule) in self.variant_rules.iter().enumerate() {
            rule.validate().map_err(|e| {
                ReconciliationError::Config(format!("variant_rules[{}]: {}", i, e))
            })?;
        }

        Ok(())
    }

    pub fn merge_timeout(&self) -> Option<Duration> {
        self.merge_timeout_ms.map(Duration::from_millis)
    }

    pub fn stats_aggregator(&self) -> StatsAggregator {
        StatsAggregator::with_bonus(self.popularity_bonus)
    }
}

/// Load a bare JSON array of variant rules (a standalone rules file)
pub fn load_variant_rules<P: AsRef<Path>>(path: P) -> Result<Vec<VariantRule>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

    let rules: Vec<VariantRule> =
        serde_json::from_str(&content).context("Failed to parse rules JSON")?;

    for (i, rule) in rules.iter().enumerate() {
        rule.validate()
            .with_context(|| format!("Invalid rule #{} in {:?}", i, path.as_ref()))?;
    }

    Ok(rules)
}
