//! Hourly observation history
//!
//! Stored fatigue or heat-strain records are bucketed by local hour of day and emitted
//! as a dense, fixed-width window of [`HourlyObservation`]s anchored at a start hour.
//! Hours without data become zero placeholders so a chart always has one slot per hour.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Timelike};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::models::{to_datetime, FatigueRecord, HeatStrainRecord, HourlyObservation, PeerObservations, ValueRange};
use crate::storage::{self, Collection, Document, DocumentStore};

pub const DEFAULT_WINDOW_START_HOUR: u32 = 7;
pub const DEFAULT_WINDOW_WIDTH: u32 = 9;

/// Fatigue values above this are capped before averaging
pub const FATIGUE_AVERAGE_CAP: f64 = 100.0;

/// Which record series to aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Fatigue,
    HeatStrain,
}

impl Metric {
    pub fn collection(&self) -> Collection {
        match self {
            Metric::Fatigue => Collection::FatigueLevels,
            Metric::HeatStrain => Collection::HeatStrainLevels,
        }
    }

    fn value(&self, document: &Document) -> Result<f64, StorageError> {
        match self {
            Metric::Fatigue => Ok(document.decode::<FatigueRecord>()?.fatigue_score as f64),
            Metric::HeatStrain => Ok(document.decode::<HeatStrainRecord>()?.heat_strain_score),
        }
    }

    fn averaged(&self, value: f64) -> f64 {
        match self {
            Metric::Fatigue => value.min(FATIGUE_AVERAGE_CAP),
            Metric::HeatStrain => value,
        }
    }

    fn average(&self, sum: f64, count: usize) -> f64 {
        match self {
            // integer scores, truncating division
            Metric::Fatigue => (sum / count as f64).trunc(),
            Metric::HeatStrain => sum / count as f64,
        }
    }
}

/// Displayed hour range: `start_hour .. start_hour + width`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourWindow {
    pub start_hour: u32,
    pub width: u32,
}

impl Default for HourWindow {
    fn default() -> Self {
        Self {
            start_hour: DEFAULT_WINDOW_START_HOUR,
            width: DEFAULT_WINDOW_WIDTH,
        }
    }
}

impl HourWindow {
    /// Full window end, exclusive, never past midnight
    pub fn end_hour(&self) -> u32 {
        self.start_hour.saturating_add(self.width).min(24)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    min: f64,
    max: f64,
    sum: f64,
    count: usize,
}

impl Bucket {
    fn new(raw: f64, averaged: f64) -> Self {
        Self {
            min: raw,
            max: raw,
            sum: averaged,
            count: 1,
        }
    }

    fn add(&mut self, raw: f64, averaged: f64) {
        self.min = self.min.min(raw);
        self.max = self.max.max(raw);
        self.sum += averaged;
        self.count += 1;
    }
}

/// On-demand hourly aggregation over stored records
pub struct ObservationAggregator {
    store: Arc<dyn DocumentStore>,
    metric: Metric,
    window: HourWindow,
    offset: FixedOffset,
}

impl ObservationAggregator {
    pub fn new(store: Arc<dyn DocumentStore>, metric: Metric, window: HourWindow, offset: FixedOffset) -> Self {
        Self {
            store,
            metric,
            window,
            offset,
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    fn local(&self, timestamp: f64) -> DateTime<FixedOffset> {
        to_datetime(timestamp).with_timezone(&self.offset)
    }

    /// Hours to emit for a query, given the current time
    pub fn hour_range(&self, start: f64, end: f64, now: f64) -> std::ops::Range<u32> {
        let lower = self.window.start_hour;
        if start > now {
            // Nothing can exist yet: the range collapses onto its lower bound
            return lower..lower;
        }
        if end > now {
            let current_hour = self.local(now).hour();
            let upper = self.window.end_hour().min(current_hour + 1);
            return lower..upper.max(lower);
        }
        lower..self.window.end_hour()
    }

    /// Hourly observations for one person over `[start, end]`
    pub async fn aggregate(
        &self,
        person_id: &str,
        start: f64,
        end: f64,
        now: f64,
    ) -> Result<Vec<HourlyObservation>, StorageError> {
        let documents = self
            .store
            .range(self.metric.collection(), person_id, start, end)
            .await?;

        let mut buckets: BTreeMap<u32, Bucket> = BTreeMap::new();
        for document in &documents {
            let raw = match self.metric.value(document) {
                Ok(v) => v,
                Err(e) => {
                    warn!(person_id, name = %document.name, error = %e, "skipping unreadable record");
                    continue;
                }
            };
            let hour = self.local(document.timestamp).hour();
            let averaged = self.metric.averaged(raw);
            buckets
                .entry(hour)
                .and_modify(|b| b.add(raw, averaged))
                .or_insert_with(|| Bucket::new(raw, averaged));
        }

        let observations: Vec<HourlyObservation> = self
            .hour_range(start, end, now)
            .map(|hour| match buckets.get(&hour) {
                Some(bucket) => HourlyObservation {
                    hour_of_day: hour,
                    value_range: ValueRange {
                        low: bucket.min,
                        high: bucket.max,
                    },
                    average: self.metric.average(bucket.sum, bucket.count),
                    count: bucket.count,
                },
                None => HourlyObservation::placeholder(hour),
            })
            .collect();

        debug!(
            person_id,
            records = documents.len(),
            hours = observations.len(),
            "observations aggregated"
        );
        Ok(observations)
    }

    /// Hourly observations for every member of a group
    pub async fn aggregate_group(
        &self,
        group_id: &str,
        start: f64,
        end: f64,
        now: f64,
    ) -> Result<Vec<PeerObservations>, StorageError> {
        let members = storage::group_members(self.store.as_ref(), group_id).await?;
        let mut peers = Vec::with_capacity(members.len());
        for member in members {
            let observations = self.aggregate(&member.person_id, start, end, now).await?;
            peers.push(PeerObservations {
                person_id: member.person_id,
                display_name: member.display_name,
                observations,
            });
        }
        Ok(peers)
    }
}

/// Epoch-second bounds of a local calendar day, `[midnight, next midnight - 1ms]`
pub fn local_day_range(date: NaiveDate, offset: FixedOffset) -> (f64, f64) {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or_default();
    (midnight, midnight + 86_400.0 - 0.001)
}
