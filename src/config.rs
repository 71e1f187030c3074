use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::normalize::DEFAULT_NO_DETECTION_LABEL;
use crate::DEFAULT_DEBOUNCE_MS;

const DEFAULT_HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Deserialize, Default)]
struct AggregatorConfigFile {
    debounce_ms: Option<u64>,
    history: Option<HistoryConfigFile>,
    normalizer: Option<NormalizerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct NormalizerConfigFile {
    no_detection_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Quiet period after the latest arrival before a batch is finalized. Also the
    /// maximum gap inside one fallback lineage.
    pub debounce_window: Duration,
    pub history_capacity: usize,
    pub no_detection_label: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            no_detection_label: DEFAULT_NO_DETECTION_LABEL.to_string(),
        }
    }
}

impl AggregatorConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("INSPECTION_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AggregatorConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            debounce_window: file
                .debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce_window),
            history_capacity: file
                .history
                .and_then(|history| history.capacity)
                .unwrap_or(defaults.history_capacity),
            no_detection_label: file
                .normalizer
                .and_then(|normalizer| normalizer.no_detection_label)
                .unwrap_or(defaults.no_detection_label),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(ms) = std::env::var("INSPECTION_DEBOUNCE_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                anyhow!("INSPECTION_DEBOUNCE_MS must be an integer number of milliseconds")
            })?;
            self.debounce_window = Duration::from_millis(ms);
        }
        if let Ok(capacity) = std::env::var("INSPECTION_HISTORY_CAPACITY") {
            self.history_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("INSPECTION_HISTORY_CAPACITY must be an integer"))?;
        }
        if let Ok(label) = std::env::var("INSPECTION_NO_DETECTION_LABEL") {
            self.no_detection_label = label;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.debounce_window.is_zero() {
            return Err(anyhow!("debounce window must be greater than zero"));
        }
        if self.history_capacity == 0 {
            return Err(anyhow!("history capacity must be greater than zero"));
        }
        self.no_detection_label = self.no_detection_label.trim().to_string();
        if self.no_detection_label.is_empty() {
            return Err(anyhow!("no-detection label must not be blank"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<AggregatorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
