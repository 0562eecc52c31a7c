use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Physiological channels delivered by the wristband
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// Heart-rate channel; the value is the inter-beat interval in seconds
    InterBeatInterval,
    /// Galvanic skin response (electrodermal activity) in microsiemens
    Gsr,
    /// Blood-volume pulse
    Bvp,
    /// Skin temperature in degrees Celsius
    SkinTemperature,
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleKind::InterBeatInterval => write!(f, "ibi"),
            SampleKind::Gsr => write!(f, "gsr"),
            SampleKind::Bvp => write!(f, "bvp"),
            SampleKind::SkinTemperature => write!(f, "skin_temperature"),
        }
    }
}

impl std::str::FromStr for SampleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ibi" | "inter_beat_interval" | "heart_rate" | "hr" => Ok(SampleKind::InterBeatInterval),
            "gsr" | "eda" => Ok(SampleKind::Gsr),
            "bvp" | "ppg" => Ok(SampleKind::Bvp),
            "temp" | "skin_temperature" | "temperature" => Ok(SampleKind::SkinTemperature),
            _ => Err(format!("Unknown sample kind: {}", s)),
        }
    }
}

/// A single physiological reading from the sensor feed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub kind: SampleKind,
    pub value: f64,
    /// Capture time in epoch seconds
    pub timestamp: f64,
}

impl Sample {
    pub fn new(kind: SampleKind, value: f64, timestamp: f64) -> Self {
        Self {
            kind,
            value,
            timestamp,
        }
    }

    pub fn ibi(ibi_seconds: f64, timestamp: f64) -> Self {
        Self::new(SampleKind::InterBeatInterval, ibi_seconds, timestamp)
    }
}

/// Calibration constants for the work-capacity model, read once per session.
///
/// A missing field in a stored profile reads as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationProfile {
    #[serde(default)]
    pub resting_heart_rate: i32,
    #[serde(default)]
    pub hr_reserve_critical_power: i32,
    #[serde(default)]
    pub total_anaerobic_work_capacity: i32,
    #[serde(default)]
    pub k_value: i32,
    #[serde(default)]
    pub age: u32,
}

impl Default for CalibrationProfile {
    /// Placeholder used when no profile document exists at all
    fn default() -> Self {
        Self {
            resting_heart_rate: 65,
            hr_reserve_critical_power: 16,
            total_anaerobic_work_capacity: 200,
            k_value: 15,
            age: 0,
        }
    }
}

impl CalibrationProfile {
    /// Age-predicted maximum heart rate: 208 - 0.7 x age, truncated
    pub fn max_heart_rate(&self) -> i64 {
        208 - (0.7 * self.age as f64) as i64
    }

    /// True when the profile cannot produce a meaningful fatigue score
    pub fn is_degenerate(&self) -> bool {
        self.total_anaerobic_work_capacity == 0
            || self.max_heart_rate() == self.resting_heart_rate as i64
    }
}

/// Person document: identity, group membership and calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonProfile {
    pub person_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(flatten)]
    pub calibration: CalibrationProfile,
}

impl PersonProfile {
    pub fn new(person_id: impl Into<String>, display_name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            person_id: person_id.into(),
            display_name: display_name.into(),
            group_id: group_id.into(),
            calibration: CalibrationProfile::default(),
        }
    }
}

/// Persisted per-cycle fatigue observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FatigueRecord {
    pub person_id: String,
    /// Uncapped score; values above 100 are clamped only for display and alerts
    pub fatigue_score: i64,
    pub timestamp: f64,
}

/// Persisted per-cycle heat-strain observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatStrainRecord {
    pub person_id: String,
    pub heat_strain_score: f64,
    pub timestamp: f64,
}

/// Outbound warning produced by the alert arbiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub person_id: String,
    pub display_name: String,
    /// Already clamped to 0..=100
    pub fatigue_score: i64,
    pub group_id: String,
    pub timestamp: f64,
}

impl AlertEvent {
    pub fn title(&self) -> String {
        format!("High Fatigue: {}", self.display_name)
    }

    pub fn body(&self) -> String {
        format!(
            "{} may need a break. (fatigue level {}%)",
            self.display_name, self.fatigue_score
        )
    }

    /// Text stored on the group-visible highlight record
    pub fn highlight_content(&self) -> String {
        format!("may need a break (fatigue {}%)", self.fatigue_score)
    }

    pub fn to_highlight(&self) -> Highlight {
        Highlight {
            person_id: self.person_id.clone(),
            group_id: self.group_id.clone(),
            display_name: self.display_name.clone(),
            timestamp: self.timestamp,
            content: self.highlight_content(),
        }
    }
}

/// Durable, group-visible trace of an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub person_id: String,
    pub group_id: String,
    pub display_name: String,
    pub timestamp: f64,
    pub content: String,
}

impl Highlight {
    /// Relative age of the highlight for feed display
    pub fn time_ago(&self, now: f64) -> String {
        let diff = (now - self.timestamp).max(0.0) as i64;
        match diff {
            d if d < 60 => "Just now".to_string(),
            d if d < 3600 => plural(d / 60, "minute"),
            d if d < 86_400 => plural(d / 3600, "hour"),
            d => plural(d / 86_400, "day"),
        }
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}

/// Raw `[low, high]` band of an hourly bucket; hours without data carry `0..0`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub low: f64,
    pub high: f64,
}

impl ValueRange {
    pub const EMPTY: ValueRange = ValueRange { low: 0.0, high: 0.0 };

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// One hour of aggregated fatigue or heat-strain history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyObservation {
    /// Local hour, 0-23
    pub hour_of_day: u32,
    pub value_range: ValueRange,
    pub average: f64,
    /// Number of records folded into this hour
    pub count: usize,
}

impl HourlyObservation {
    pub fn placeholder(hour_of_day: u32) -> Self {
        Self {
            hour_of_day,
            value_range: ValueRange::EMPTY,
            average: 0.0,
            count: 0,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.count == 0
    }
}

/// Hourly history of one group member, for crew comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerObservations {
    pub person_id: String,
    pub display_name: String,
    pub observations: Vec<HourlyObservation>,
}

/// Coarse heat-strain banding on the physiological strain index scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeatStrainLevel {
    Unknown,
    Low,
    Moderate,
    High,
}

impl HeatStrainLevel {
    pub fn from_score(score: Option<f64>) -> Self {
        match score {
            Some(s) if !s.is_finite() => HeatStrainLevel::Unknown,
            Some(s) if s < 3.0 => HeatStrainLevel::Low,
            Some(s) if s < 7.0 => HeatStrainLevel::Moderate,
            Some(_) => HeatStrainLevel::High,
            None => HeatStrainLevel::Unknown,
        }
    }
}

impl fmt::Display for HeatStrainLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeatStrainLevel::Unknown => write!(f, "Unknown"),
            HeatStrainLevel::Low => write!(f, "Low"),
            HeatStrainLevel::Moderate => write!(f, "Moderate"),
            HeatStrainLevel::High => write!(f, "High"),
        }
    }
}

/// Self-reported fatigue survey
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyResponse {
    pub person_id: String,
    pub fatigue_level: i32,
    pub timestamp: f64,
}

/// Ecological momentary assessment: free-form answers keyed by question id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmaResponse {
    pub person_id: String,
    pub answers: BTreeMap<String, serde_json::Value>,
    pub timestamp: f64,
}

/// Convert epoch seconds to a UTC datetime, clamping unrepresentable values to the epoch
pub fn to_datetime(timestamp: f64) -> DateTime<Utc> {
    let secs = timestamp.floor() as i64;
    let nanos = ((timestamp - timestamp.floor()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}

/// Sortable document name / channel key derived from a timestamp (UTC, millisecond resolution)
pub fn timestamp_label(timestamp: f64) -> String {
    to_datetime(timestamp)
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}
