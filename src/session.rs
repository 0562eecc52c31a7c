//! Per-person sensor session
//!
//! A session owns the sample buffer and the work-capacity accumulator for one person.
//! Samples are ingested one at a time; an assessment cycle runs inline once more than
//! the cycle interval of sample time has passed since the previous one. Persistence,
//! highlight and notification side effects are best effort: a failure is logged and the
//! cycle carries on with the accumulator already committed.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::alerts::{self, AlertArbiter, AlertDecision};
use crate::buffer::{Admission, SampleBuffer};
use crate::config::{EngineConfig, SessionConfig};
use crate::error::{Result, StorageError, StrainError};
use crate::fatigue::{AccumulatorState, FatigueEstimator, FatigueOutcome};
use crate::heat_strain::{FeatureExtractor, HeatStrainEstimator, HttpFeatureExtractor, LocalFeatureExtractor};
use crate::logging;
use crate::models::{timestamp_label, FatigueRecord, HeatStrainLevel, HeatStrainRecord, PersonProfile, Sample};
use crate::notify::{HttpNotifier, LogNotifier, NotificationMessage, Notifier};
use crate::storage::{Collection, Document, DocumentStore, LocalStore};

/// Outcome of one assessment cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub timestamp: f64,
    pub fatigue: FatigueOutcome,
    pub heat_strain: Option<f64>,
    pub alert: Option<AlertDecision>,
}

impl CycleReport {
    pub fn heat_strain_level(&self) -> HeatStrainLevel {
        HeatStrainLevel::from_score(self.heat_strain)
    }
}

/// Running totals for a session consumed from a channel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub samples_received: usize,
    pub samples_rejected: usize,
    pub cycles: usize,
    pub alerts_emitted: usize,
    pub last_fatigue_score: Option<i64>,
    pub last_heat_strain: Option<f64>,
}

/// Local-store key for a person's committed accumulator value
pub fn accumulator_key(person_id: &str) -> String {
    format!("accumulated_work_expenditure.{}", person_id)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelBatch<'a, T: Serialize> {
    person_id: &'a str,
    values: &'a BTreeMap<String, T>,
    timestamp: f64,
}

pub struct Session {
    profile: PersonProfile,
    settings: SessionConfig,
    buffer: SampleBuffer,
    state: AccumulatorState,
    fatigue: FatigueEstimator,
    heat_strain: Option<HeatStrainEstimator>,
    arbiter: AlertArbiter,
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    last_cycle: Option<f64>,
    summary: SessionSummary,
}

impl Session {
    pub fn new(
        profile: PersonProfile,
        settings: SessionConfig,
        store: Arc<dyn DocumentStore>,
        arbiter: AlertArbiter,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let state = AccumulatorState::new(profile.calibration);
        if profile.calibration.is_degenerate() {
            warn!(
                person_id = %profile.person_id,
                total_awc = profile.calibration.total_anaerobic_work_capacity,
                resting_hr = profile.calibration.resting_heart_rate,
                "calibration cannot produce meaningful fatigue scores"
            );
        }
        let buffer = SampleBuffer::with_outlier_threshold(state.max_heart_rate(), settings.outlier_threshold_bpm);
        Self {
            profile,
            settings,
            buffer,
            state,
            fatigue: FatigueEstimator::new(),
            heat_strain: None,
            arbiter,
            store,
            notifier,
            last_cycle: None,
            summary: SessionSummary::default(),
        }
    }

    pub fn with_heat_strain(mut self, estimator: HeatStrainEstimator) -> Self {
        self.heat_strain = Some(estimator);
        self
    }

    /// Resume a previously committed accumulator value
    pub fn with_accumulated_expenditure(mut self, expenditure: f64) -> Self {
        self.state = AccumulatorState::with_expenditure(self.profile.calibration, expenditure);
        self
    }

    /// Wire a session from configuration: remote collaborators when endpoints are set,
    /// local fallbacks otherwise
    pub fn from_config(
        profile: PersonProfile,
        config: &EngineConfig,
        store: Arc<dyn DocumentStore>,
        local: Arc<dyn LocalStore>,
    ) -> Result<Self> {
        let arbiter = AlertArbiter::new(local)
            .with_min_interval(config.alerts.min_interval_secs as f64)
            .with_threshold(config.alerts.warning_threshold);

        let notifier: Arc<dyn Notifier> = match &config.notifications.endpoint {
            Some(url) => Arc::new(HttpNotifier::new(url, Duration::from_secs(config.notifications.timeout_secs))?),
            None => Arc::new(LogNotifier),
        };

        let mut session = Session::new(profile, config.session.clone(), store, arbiter, notifier);

        if config.heat_strain.enabled {
            let hs = &config.heat_strain;
            let extractor: Arc<dyn FeatureExtractor> = match &hs.endpoint {
                Some(url) => Arc::new(HttpFeatureExtractor::new(url, Duration::from_secs(hs.timeout_secs))?),
                None => Arc::new(LocalFeatureExtractor::new()),
            };
            hs.model.validate()?;
            let estimator = HeatStrainEstimator::new(extractor, Arc::new(hs.model.clone()))
                .with_sampling_rates(hs.bvp_sampling_rate, hs.eda_sampling_rate);
            session = session.with_heat_strain(estimator);
        }

        Ok(session)
    }

    /// Commit the accumulator so the next session continues from it
    pub fn save_accumulator(&self, local: &dyn LocalStore) -> std::result::Result<(), StorageError> {
        local.set_f64(
            &accumulator_key(&self.profile.person_id),
            self.state.accumulated_work_expenditure(),
        )
    }

    pub fn profile(&self) -> &PersonProfile {
        &self.profile
    }

    pub fn accumulator(&self) -> &AccumulatorState {
        &self.state
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn last_cycle(&self) -> Option<f64> {
        self.last_cycle
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    /// Offer one sample; runs an assessment cycle when one is due
    pub async fn ingest(&mut self, sample: Sample) -> Option<CycleReport> {
        self.summary.samples_received += 1;
        if self.buffer.observe(&sample) != Admission::Accepted {
            self.summary.samples_rejected += 1;
        }

        let initial_delay = self.settings.initial_cycle_delay_secs as f64;
        let last_cycle = *self
            .last_cycle
            .get_or_insert(sample.timestamp + initial_delay);

        if sample.timestamp - last_cycle > self.settings.cycle_interval_secs as f64 {
            Some(self.run_cycle(sample.timestamp).await)
        } else {
            None
        }
    }

    /// Consume samples until the producer closes the channel
    pub async fn run(&mut self, receiver: mpsc::Receiver<Sample>) -> SessionSummary {
        let span = logging::session_span(&self.profile);
        self.consume(receiver).instrument(span).await
    }

    async fn consume(&mut self, mut receiver: mpsc::Receiver<Sample>) -> SessionSummary {
        while let Some(sample) = receiver.recv().await {
            self.ingest(sample).await;
        }
        info!(
            samples = self.summary.samples_received,
            rejected = self.summary.samples_rejected,
            cycles = self.summary.cycles,
            "sensor feed closed"
        );
        self.summary.clone()
    }

    /// One assessment cycle at `now`; the buffer is always reset afterwards
    pub async fn run_cycle(&mut self, now: f64) -> CycleReport {
        let span = info_span!("assessment_cycle", person_id = %self.profile.person_id, timestamp = now);
        self.cycle(now).instrument(span).await
    }

    async fn cycle(&mut self, now: f64) -> CycleReport {
        self.last_cycle = Some(now);

        let fatigue = self.fatigue.assess(&self.buffer, &mut self.state);
        let heat_strain = match &self.heat_strain {
            Some(estimator) => estimator.assess(&self.buffer).await,
            None => None,
        };

        let mut alert = None;
        if let FatigueOutcome::Assessed(result) = &fatigue {
            let record = FatigueRecord {
                person_id: self.profile.person_id.clone(),
                fatigue_score: result.fatigue_score,
                timestamp: now,
            };
            self.persist(Collection::FatigueLevels, now, &record).await;
            self.summary.last_fatigue_score = Some(result.fatigue_score);
            alert = self.arbitrate(result.fatigue_score, now).await;
        }

        if let Some(score) = heat_strain {
            let record = HeatStrainRecord {
                person_id: self.profile.person_id.clone(),
                heat_strain_score: score,
                timestamp: now,
            };
            self.persist(Collection::HeatStrainLevels, now, &record).await;
            self.summary.last_heat_strain = Some(score);
        }

        self.persist_raw_channels(now).await;
        self.buffer.reset();
        self.summary.cycles += 1;

        info!(
            fatigue_score = ?fatigue.result().map(|r| r.fatigue_score),
            heat_strain = ?heat_strain,
            "assessment cycle complete"
        );

        CycleReport {
            timestamp: now,
            fatigue,
            heat_strain,
            alert,
        }
    }

    async fn arbitrate(&mut self, fatigue_score: i64, now: f64) -> Option<AlertDecision> {
        let decision = match self.arbiter.maybe_alert(
            &self.profile.person_id,
            &self.profile.display_name,
            fatigue_score,
            &self.profile.group_id,
            now,
        ) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "alert state unavailable, skipping alert");
                return None;
            }
        };

        if let AlertDecision::Emitted(event) = &decision {
            self.summary.alerts_emitted += 1;
            if let Err(e) = alerts::record_highlight(self.store.as_ref(), event).await {
                warn!(error = %e, "failed to store highlight");
            }
            let message = NotificationMessage::new(event.title(), event.body(), &event.group_id);
            if let Err(e) = self.notifier.send(&message).await {
                let err = StrainError::from(e);
                warn!(error = %err, retryable = err.is_retryable(), "group notification failed");
            }
        }
        Some(decision)
    }

    async fn persist<T: Serialize + Sync>(&self, collection: Collection, now: f64, body: &T) {
        let document = match Document::new(collection, &self.profile.person_id, timestamp_label(now), now, body) {
            Ok(document) => document,
            Err(e) => {
                warn!(%collection, error = %e, "failed to encode record");
                return;
            }
        };
        if let Err(e) = self.store.put(document).await {
            warn!(%collection, error = %e, "failed to persist record");
        }
    }

    async fn persist_raw_channels(&self, now: f64) {
        let person_id = self.profile.person_id.as_str();
        let heart_rates = self.buffer.heart_rate_map();

        let batches: [(Collection, std::result::Result<Option<Document>, StorageError>); 4] = [
            (Collection::HeartRates, self.channel_document(Collection::HeartRates, person_id, &heart_rates, now)),
            (Collection::GsrData, self.channel_document(Collection::GsrData, person_id, self.buffer.gsr(), now)),
            (Collection::BvpData, self.channel_document(Collection::BvpData, person_id, self.buffer.bvp(), now)),
            (
                Collection::SkinTemperatures,
                self.channel_document(Collection::SkinTemperatures, person_id, self.buffer.skin_temperature(), now),
            ),
        ];

        for (collection, document) in batches {
            let result = match document {
                Ok(Some(document)) => self.store.put(document).await,
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(%collection, error = %e, "failed to persist raw channel");
            }
        }
    }

    fn channel_document<T: Serialize>(
        &self,
        collection: Collection,
        person_id: &str,
        values: &BTreeMap<String, T>,
        now: f64,
    ) -> std::result::Result<Option<Document>, StorageError> {
        if values.is_empty() {
            return Ok(None);
        }
        let batch = ChannelBatch {
            person_id,
            values,
            timestamp: now,
        };
        debug!(%collection, samples = values.len(), "persisting raw channel");
        Document::new(collection, person_id, timestamp_label(now), now, &batch).map(Some)
    }
}
