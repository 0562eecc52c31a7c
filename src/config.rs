use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::aggregation::HourWindow;
use crate::error::StrainError;
use crate::heat_strain::LinearStrainModel;
use crate::logging::LogConfig;
use crate::survey::SurveyPolicy;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Configuration metadata
    pub metadata: ConfigMetadata,

    /// Sample ingestion and cycle timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Group warning rate limiting
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Hourly history windowing
    #[serde(default)]
    pub observations: ObservationConfig,

    /// Self-report survey quotas
    #[serde(default)]
    pub survey: SurveyPolicy,

    /// Feature extraction and strain model
    #[serde(default)]
    pub heat_strain: HeatStrainConfig,

    /// Group notification server
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Document and local state locations
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum elapsed sample time between assessment cycles
    pub cycle_interval_secs: u64,

    /// Extra delay before the first cycle after connecting
    pub initial_cycle_delay_secs: u64,

    /// Bounded sensor channel size
    pub channel_capacity: usize,

    /// Heart-rate jump from the running average that is discarded
    pub outlier_threshold_bpm: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub min_interval_secs: u64,
    pub warning_threshold: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    pub window_start_hour: u32,
    pub window_width: u32,

    /// Fixed offset for "local hour"; the host offset when absent
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatStrainConfig {
    pub enabled: bool,

    /// Inference service URL; features are computed locally when absent
    pub endpoint: Option<String>,

    pub timeout_secs: u64,
    pub bvp_sampling_rate: u32,
    pub eda_sampling_rate: u32,
    pub model: LinearStrainModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Notification server base URL; warnings are only logged when absent
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub local_state_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let now = Utc::now();

        EngineConfig {
            metadata: ConfigMetadata {
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            },
            session: SessionConfig::default(),
            alerts: AlertConfig::default(),
            observations: ObservationConfig::default(),
            survey: SurveyPolicy::default(),
            heat_strain: HeatStrainConfig::default(),
            notifications: NotificationConfig::default(),
            storage: StorageConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            cycle_interval_secs: 60,
            initial_cycle_delay_secs: 10,
            channel_capacity: crate::feed::DEFAULT_CHANNEL_CAPACITY,
            outlier_threshold_bpm: crate::buffer::DEFAULT_OUTLIER_THRESHOLD_BPM,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            min_interval_secs: crate::alerts::DEFAULT_MIN_INTERVAL_SECS as u64,
            warning_threshold: crate::alerts::DEFAULT_WARNING_THRESHOLD,
        }
    }
}

impl Default for ObservationConfig {
    fn default() -> Self {
        let window = HourWindow::default();
        ObservationConfig {
            window_start_hour: window.start_hour,
            window_width: window.width,
            utc_offset_minutes: None,
        }
    }
}

impl Default for HeatStrainConfig {
    fn default() -> Self {
        HeatStrainConfig {
            enabled: true,
            endpoint: None,
            timeout_secs: 10,
            bvp_sampling_rate: crate::heat_strain::DEFAULT_BVP_SAMPLING_RATE,
            eda_sampling_rate: crate::heat_strain::DEFAULT_EDA_SAMPLING_RATE,
            model: LinearStrainModel::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig {
            endpoint: None,
            timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = EngineConfig::data_dir();
        StorageConfig {
            database_path: base.join("strainguard.db"),
            local_state_path: base.join("local_state.json"),
        }
    }
}

impl ObservationConfig {
    pub fn window(&self) -> HourWindow {
        HourWindow {
            start_hour: self.window_start_hour,
            width: self.window_width,
        }
    }

    /// Offset used to turn timestamps into local hours and days
    pub fn offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .and_then(|minutes| minutes.checked_mul(60))
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| *Local::now().offset())
    }
}

/// Configuration management implementation
impl EngineConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;

        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Directory holding the config file and default stores
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".strainguard")
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path = %config_path.display(), error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |reason: &str| Err(StrainError::Configuration(reason.to_string()));

        if self.session.cycle_interval_secs == 0 {
            return invalid("session.cycle_interval_secs must be greater than zero");
        }
        if self.observations.window_start_hour > 23 {
            return invalid("observations.window_start_hour must be between 0 and 23");
        }
        if self.observations.window_width == 0 || self.observations.window_width > 24 {
            return invalid("observations.window_width must be between 1 and 24");
        }
        if self.survey.required_per_day > self.survey.max_per_day {
            return invalid("survey.required_per_day cannot exceed survey.max_per_day");
        }
        if self.heat_strain.bvp_sampling_rate == 0 || self.heat_strain.eda_sampling_rate == 0 {
            return invalid("heat_strain sampling rates must be greater than zero");
        }
        if let Some(minutes) = self.observations.utc_offset_minutes {
            if minutes.checked_mul(60).and_then(FixedOffset::east_opt).is_none() {
                return invalid("observations.utc_offset_minutes is out of range");
            }
        }
        self.heat_strain
            .model
            .validate()
            .map_err(|e| StrainError::Configuration(format!("heat_strain.model: {}", e)))?;
        Ok(())
    }
}
