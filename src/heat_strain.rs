//! Heat-strain estimation
//!
//! Each cycle the auxiliary channels are packed into a [`FeaturePayload`], turned into
//! summary statistics by a [`FeatureExtractor`] (remote inference service or the local
//! equivalent) and scored by a [`StrainModel`] on the physiological strain index scale.
//! Any failure along the way makes the cycle's score unavailable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::buffer::SampleBuffer;
use crate::error::HeatStrainError;

pub const DEFAULT_BVP_SAMPLING_RATE: u32 = 64;
pub const DEFAULT_EDA_SAMPLING_RATE: u32 = 4;

/// Statistics the strain model consumes, in model input order
pub const FEATURE_KEYS: [&str; 18] = [
    "PPG_Mean",
    "PPG_var",
    "PPG_median",
    "PPG_min",
    "PPG_max_min_diff",
    "PPG_amplitude",
    "PPG_baseline_shift",
    "PPG_rss",
    "EDL_Mean",
    "EDL_var",
    "EDL_std",
    "EDL_median",
    "EDR_Mean",
    "EDR_var",
    "EDR_std",
    "EDR_median",
    "Temp_Mean",
    "Temp_Var",
];

/// Raw channel arrays sent for feature extraction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeaturePayload {
    #[serde(rename = "BVP")]
    pub bvp: Vec<f64>,
    #[serde(rename = "BVP_sampling_rate")]
    pub bvp_sampling_rate: u32,
    #[serde(rename = "EDA")]
    pub eda: Vec<f64>,
    /// Declared locally only; the service assumes 4 Hz
    #[serde(skip)]
    pub eda_sampling_rate: u32,
    #[serde(rename = "TEMP")]
    pub temp: Vec<f64>,
    /// Heart-rate series standing in for an ECG channel
    #[serde(rename = "ECG")]
    pub ecg: Vec<f64>,
}

impl FeaturePayload {
    pub fn from_buffer(buffer: &SampleBuffer, bvp_sampling_rate: u32, eda_sampling_rate: u32) -> Self {
        Self {
            bvp: buffer.bvp().values().copied().collect(),
            bvp_sampling_rate,
            eda: buffer.gsr().values().copied().collect(),
            eda_sampling_rate,
            temp: buffer.skin_temperature().values().copied().collect(),
            ecg: buffer.heart_rates().iter().map(|s| s.bpm as f64).collect(),
        }
    }

    /// No auxiliary channel carried any data
    pub fn is_empty(&self) -> bool {
        self.bvp.is_empty() && self.eda.is_empty() && self.temp.is_empty()
    }
}

/// Complete set of named feature statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureStatistics {
    values: BTreeMap<String, f64>,
}

impl FeatureStatistics {
    /// Build from a map, requiring every key in [`FEATURE_KEYS`]
    pub fn from_map(values: BTreeMap<String, f64>) -> Result<Self, HeatStrainError> {
        for key in FEATURE_KEYS {
            match values.get(key) {
                Some(v) if v.is_finite() => {}
                _ => {
                    return Err(HeatStrainError::MissingFeature {
                        key: key.to_string(),
                    })
                }
            }
        }
        Ok(Self { values })
    }

    /// Parse a service response; extra keys are ignored
    pub fn from_json(body: &Value) -> Result<Self, HeatStrainError> {
        let object = body.as_object();
        let mut values = BTreeMap::new();
        for key in FEATURE_KEYS {
            let value = object
                .and_then(|o| o.get(key))
                .and_then(Value::as_f64)
                .ok_or_else(|| HeatStrainError::MissingFeature {
                    key: key.to_string(),
                })?;
            values.insert(key.to_string(), value);
        }
        Self::from_map(values)
    }

    pub fn get(&self, key: &str) -> Result<f64, HeatStrainError> {
        self.values
            .get(key)
            .copied()
            .ok_or_else(|| HeatStrainError::MissingFeature {
                key: key.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Turns raw channel arrays into feature statistics
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    async fn extract(&self, payload: &FeaturePayload) -> Result<FeatureStatistics, HeatStrainError>;
}

/// Scores a feature vector on the strain index scale
pub trait StrainModel: Send + Sync {
    fn predict(&self, features: &FeatureStatistics) -> Result<f64, HeatStrainError>;
}

/// Remote inference service client
pub struct HttpFeatureExtractor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFeatureExtractor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, HeatStrainError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl FeatureExtractor for HttpFeatureExtractor {
    async fn extract(&self, payload: &FeaturePayload) -> Result<FeatureStatistics, HeatStrainError> {
        let response = self.client.post(&self.endpoint).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HeatStrainError::Status {
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        let body: Value = serde_json::from_str(&body)?;
        FeatureStatistics::from_json(&body)
    }
}

/// Offline feature extraction.
///
/// BVP and EDA are z-scored first. EDA is split into a tonic level (centred moving
/// average over four seconds) and a phasic response (the residual).
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFeatureExtractor;

impl LocalFeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, payload: &FeaturePayload) -> Result<FeatureStatistics, HeatStrainError> {
        require_samples("BVP", &payload.bvp)?;
        require_samples("EDA", &payload.eda)?;
        require_samples("TEMP", &payload.temp)?;

        let ppg = zscore(&payload.bvp);
        let eda = zscore(&payload.eda);
        let window = (payload.eda_sampling_rate as usize * 4).max(1);
        let tonic = moving_average(&eda, window);
        let phasic: Vec<f64> = eda.iter().zip(&tonic).map(|(e, t)| e - t).collect();

        let mut values = BTreeMap::new();
        let mut put = |key: &str, value: f64| {
            values.insert(key.to_string(), value);
        };

        let ppg_min = Statistics::min(&ppg);
        put("PPG_Mean", Statistics::mean(&ppg));
        put("PPG_var", Statistics::variance(&ppg));
        put("PPG_median", median(&ppg));
        put("PPG_min", ppg_min);
        put("PPG_max_min_diff", Statistics::max(&ppg) - ppg_min);
        put("PPG_amplitude", percentile(&ppg, 95) - percentile(&ppg, 5));
        put("PPG_baseline_shift", baseline_shift(&ppg));
        put("PPG_rss", linear_fit_rss(&ppg));

        for (prefix, series) in [("EDL", &tonic), ("EDR", &phasic)] {
            put(&format!("{}_Mean", prefix), Statistics::mean(series));
            put(&format!("{}_var", prefix), Statistics::variance(series));
            put(&format!("{}_std", prefix), Statistics::std_dev(series));
            put(&format!("{}_median", prefix), median(series));
        }

        put("Temp_Mean", Statistics::mean(&payload.temp));
        put("Temp_Var", Statistics::variance(&payload.temp));

        FeatureStatistics::from_map(values)
    }
}

#[async_trait]
impl FeatureExtractor for LocalFeatureExtractor {
    async fn extract(&self, payload: &FeaturePayload) -> Result<FeatureStatistics, HeatStrainError> {
        self.compute(payload)
    }
}

fn require_samples(channel: &str, values: &[f64]) -> Result<(), HeatStrainError> {
    if values.len() < 2 {
        return Err(HeatStrainError::InsufficientData {
            channel: channel.to_string(),
            reason: format!("need at least 2 samples, got {}", values.len()),
        });
    }
    Ok(())
}

/// Standardise a series; a flat series is only centred
fn zscore(values: &[f64]) -> Vec<f64> {
    let mean = Statistics::mean(values);
    let std = Statistics::std_dev(values);
    let scale = if std > 0.0 && std.is_finite() { std } else { 1.0 };
    values.iter().map(|v| (v - mean) / scale).collect()
}

fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            Statistics::mean(&values[lo..hi])
        })
        .collect()
}

fn median(values: &[f64]) -> f64 {
    Data::new(values.to_vec()).quantile(0.5)
}

fn percentile(values: &[f64], p: usize) -> f64 {
    Data::new(values.to_vec()).percentile(p)
}

/// Mean of the last quarter minus mean of the first quarter
fn baseline_shift(values: &[f64]) -> f64 {
    let quarter = (values.len() / 4).max(1);
    Statistics::mean(&values[values.len() - quarter..]) - Statistics::mean(&values[..quarter])
}

/// Residual sum of squares around a least-squares line over sample index
fn linear_fit_rss(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = Statistics::mean(values);
    let (sxy, sxx) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(sxy, sxx), (i, y)| {
            let dx = i as f64 - x_mean;
            (sxy + dx * (y - y_mean), sxx + dx * dx)
        });
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    values
        .iter()
        .enumerate()
        .map(|(i, y)| {
            let fitted = y_mean + slope * (i as f64 - x_mean);
            (y - fitted).powi(2)
        })
        .sum()
}

/// Intercept plus per-feature weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearStrainModel {
    pub intercept: f64,
    pub weights: BTreeMap<String, f64>,
}

impl Default for LinearStrainModel {
    /// Skin temperature dominated placeholder coefficients
    fn default() -> Self {
        let weights = [
            ("Temp_Mean", 1.7),
            ("PPG_amplitude", 0.3),
            ("EDR_std", 0.5),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            intercept: -55.0,
            weights,
        }
    }
}

impl LinearStrainModel {
    pub fn new(intercept: f64, weights: BTreeMap<String, f64>) -> Result<Self, HeatStrainError> {
        let model = Self { intercept, weights };
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<(), HeatStrainError> {
        match self.weights.keys().find(|k| !FEATURE_KEYS.contains(&k.as_str())) {
            Some(key) => Err(HeatStrainError::UnknownFeature { key: key.clone() }),
            None => Ok(()),
        }
    }
}

impl StrainModel for LinearStrainModel {
    fn predict(&self, features: &FeatureStatistics) -> Result<f64, HeatStrainError> {
        self.validate()?;
        let mut score = self.intercept;
        for (key, weight) in &self.weights {
            score += weight * features.get(key)?;
        }
        if !score.is_finite() {
            return Err(HeatStrainError::InvalidScore(score));
        }
        Ok(score)
    }
}

/// Heat-strain stage of the assessment cycle
pub struct HeatStrainEstimator {
    extractor: Arc<dyn FeatureExtractor>,
    model: Arc<dyn StrainModel>,
    bvp_sampling_rate: u32,
    eda_sampling_rate: u32,
}

impl HeatStrainEstimator {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, model: Arc<dyn StrainModel>) -> Self {
        Self {
            extractor,
            model,
            bvp_sampling_rate: DEFAULT_BVP_SAMPLING_RATE,
            eda_sampling_rate: DEFAULT_EDA_SAMPLING_RATE,
        }
    }

    pub fn with_sampling_rates(mut self, bvp: u32, eda: u32) -> Self {
        self.bvp_sampling_rate = bvp;
        self.eda_sampling_rate = eda;
        self
    }

    /// Score the buffered auxiliary channels; `Ok(None)` when there was nothing to score
    pub async fn try_assess(&self, buffer: &SampleBuffer) -> Result<Option<f64>, HeatStrainError> {
        let payload = FeaturePayload::from_buffer(buffer, self.bvp_sampling_rate, self.eda_sampling_rate);
        if payload.is_empty() {
            return Ok(None);
        }
        let features = self.extractor.extract(&payload).await?;
        let score = self.model.predict(&features)?;
        Ok(Some(score))
    }

    /// Score or "unavailable"; failures are logged, never propagated
    pub async fn assess(&self, buffer: &SampleBuffer) -> Option<f64> {
        match self.try_assess(buffer).await {
            Ok(Some(score)) => {
                debug!(score, "heat strain assessed");
                Some(score)
            }
            Ok(None) => {
                debug!("no auxiliary data this cycle");
                None
            }
            Err(e @ HeatStrainError::InsufficientData { .. }) => {
                info!(error = %e, "heat strain unavailable");
                None
            }
            Err(e) => {
                warn!(error = %e, "heat strain unavailable");
                None
            }
        }
    }
}
