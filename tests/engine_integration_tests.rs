use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tempfile::{tempdir, NamedTempFile};

use strainguard::aggregation::{local_day_range, HourWindow, Metric, ObservationAggregator};
use strainguard::alerts::{recent_highlights, AlertArbiter};
use strainguard::config::{EngineConfig, SessionConfig};
use strainguard::error::HeatStrainError;
use strainguard::feed;
use strainguard::heat_strain::{
    FeatureExtractor, FeaturePayload, FeatureStatistics, HeatStrainEstimator, StrainModel, FEATURE_KEYS,
};
use strainguard::models::{CalibrationProfile, FatigueRecord, HeatStrainLevel, PersonProfile, Sample, SampleKind};
use strainguard::notify::RecordingNotifier;
use strainguard::session::{accumulator_key, Session};
use strainguard::storage::{
    self, Collection, DocumentStore, FileLocalStore, LocalStore, MemoryLocalStore, SqliteDocumentStore,
};
use strainguard::survey::{SurveyBlock, SurveyGate, SurveyPolicy};

// Monday 2024-03-04 00:00:00 UTC
const DAY: f64 = 1_709_510_400.0;
const NINE_AM: f64 = DAY + 9.0 * 3600.0;

struct ScriptedExtractor;

#[async_trait]
impl FeatureExtractor for ScriptedExtractor {
    async fn extract(&self, payload: &FeaturePayload) -> Result<FeatureStatistics, HeatStrainError> {
        let temp_mean = payload.temp.iter().sum::<f64>() / payload.temp.len().max(1) as f64;
        let values: BTreeMap<String, f64> = FEATURE_KEYS
            .iter()
            .map(|k| (k.to_string(), if *k == "Temp_Mean" { temp_mean } else { 0.0 }))
            .collect();
        FeatureStatistics::from_map(values)
    }
}

/// Strain equals skin temperature minus 30
struct TemperatureModel;

impl StrainModel for TemperatureModel {
    fn predict(&self, features: &FeatureStatistics) -> Result<f64, HeatStrainError> {
        Ok(features.get("Temp_Mean")? - 30.0)
    }
}

fn worker(id: &str, name: &str) -> PersonProfile {
    let mut profile = PersonProfile::new(id, name, "crew-a");
    profile.calibration = CalibrationProfile {
        resting_heart_rate: 65,
        hr_reserve_critical_power: 16,
        total_anaerobic_work_capacity: 200,
        k_value: 15,
        age: 30,
    };
    profile
}

/// 200 seconds of a steady 120 bpm shift with skin temperature and GSR
fn shift(start: f64) -> Vec<Sample> {
    let mut samples = Vec::new();
    for i in 0..200 {
        let t = start + i as f64;
        samples.push(Sample::ibi(0.5, t));
        if i % 4 == 0 {
            samples.push(Sample::new(SampleKind::SkinTemperature, 35.5, t + 0.1));
            samples.push(Sample::new(SampleKind::Gsr, 0.4, t + 0.2));
        }
    }
    samples
}

fn session_for(
    profile: PersonProfile,
    store: Arc<SqliteDocumentStore>,
    local: Arc<dyn LocalStore>,
    notifier: Arc<RecordingNotifier>,
) -> Session {
    let arbiter = AlertArbiter::new(local);
    let estimator = HeatStrainEstimator::new(Arc::new(ScriptedExtractor), Arc::new(TemperatureModel));
    Session::new(profile, SessionConfig::default(), store, arbiter, notifier).with_heat_strain(estimator)
}

async fn drive(session: &mut Session, samples: Vec<Sample>) {
    let (sender, receiver) = feed::sensor_channel(16);
    let producer = tokio::spawn(feed::replay(samples, sender));
    session.run(receiver).await;
    producer.await.unwrap();
}

#[tokio::test]
async fn test_shift_produces_records_alert_and_history() {
    let store = Arc::new(SqliteDocumentStore::in_memory().unwrap());
    let notifier = Arc::new(RecordingNotifier::new());
    let mut session = session_for(
        worker("w1", "Alex"),
        store.clone(),
        Arc::new(MemoryLocalStore::new()),
        notifier.clone(),
    );

    drive(&mut session, shift(NINE_AM)).await;

    // Cycles at +71, +132 and +193 seconds
    let summary = session.summary().clone();
    assert_eq!(summary.cycles, 3);
    assert_eq!(summary.samples_rejected, 0);
    assert_eq!(store.count(Collection::FatigueLevels).unwrap(), 3);
    assert_eq!(store.count(Collection::HeatStrainLevels).unwrap(), 3);
    assert_eq!(store.count(Collection::HeartRates).unwrap(), 3);
    assert_eq!(store.count(Collection::SkinTemperatures).unwrap(), 3);
    assert_eq!(store.count(Collection::BvpData).unwrap(), 0);

    // Only the first cycle alerts inside the rate-limit interval
    assert_eq!(summary.alerts_emitted, 1);
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "High Fatigue: Alex");
    assert_eq!(sent[0].group_id, "crew-a");

    let records: Vec<FatigueRecord> = store
        .range(Collection::FatigueLevels, "w1", DAY, DAY + 86_400.0)
        .await
        .unwrap()
        .iter()
        .map(|d| d.decode().unwrap())
        .collect();
    assert!(records.windows(2).all(|w| w[0].fatigue_score < w[1].fatigue_score));
    assert_eq!(summary.last_fatigue_score, Some(records[2].fatigue_score));

    let strain = summary.last_heat_strain.unwrap();
    assert!((strain - 5.5).abs() < 1e-9);
    assert_eq!(HeatStrainLevel::from_score(Some(strain)), HeatStrainLevel::Moderate);

    let utc = FixedOffset::east_opt(0).unwrap();
    let (start, end) = local_day_range(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(), utc);
    let aggregator = ObservationAggregator::new(store.clone(), Metric::Fatigue, HourWindow::default(), utc);
    let hours = aggregator.aggregate("w1", start, end, DAY + 2.0 * 86_400.0).await.unwrap();
    assert_eq!(hours.len(), 9);
    assert_eq!(hours[0].hour_of_day, 7);
    let nine = &hours[2];
    assert_eq!(nine.hour_of_day, 9);
    assert_eq!(nine.count, 3);
    assert!(hours.iter().filter(|h| h.hour_of_day != 9).all(|h| h.is_placeholder()));

    let highlights = recent_highlights(store.as_ref(), "crew-a", 10).await.unwrap();
    assert_eq!(highlights.len(), 1);
    assert_eq!(highlights[0].person_id, "w1");
}

#[tokio::test]
async fn test_crew_view_lists_members_sorted() {
    let store = Arc::new(SqliteDocumentStore::in_memory().unwrap());
    for (id, name) in [("w2", "Blake"), ("w1", "Alex")] {
        let profile = worker(id, name);
        storage::save_person(store.as_ref(), &profile, DAY).await.unwrap();
        let mut session = session_for(
            profile,
            store.clone(),
            Arc::new(MemoryLocalStore::new()),
            Arc::new(RecordingNotifier::new()),
        );
        drive(&mut session, shift(NINE_AM)).await;
    }

    let utc = FixedOffset::east_opt(0).unwrap();
    let (start, end) = local_day_range(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(), utc);
    let aggregator = ObservationAggregator::new(store.clone(), Metric::HeatStrain, HourWindow::default(), utc);
    let peers = aggregator.aggregate_group("crew-a", start, end, end + 1.0).await.unwrap();

    let ids: Vec<&str> = peers.iter().map(|p| p.person_id.as_str()).collect();
    assert_eq!(ids, vec!["w1", "w2"]);
    for peer in &peers {
        let nine = peer.observations.iter().find(|o| o.hour_of_day == 9).unwrap();
        assert_eq!(nine.count, 3);
        assert!((nine.average - 5.5).abs() < 1e-9);
    }
}

#[tokio::test]
async fn test_alert_rate_limit_is_shared_per_installation() {
    let store = Arc::new(SqliteDocumentStore::in_memory().unwrap());
    let local: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let mut first = session_for(worker("w1", "Alex"), store.clone(), local.clone(), notifier.clone());
    drive(&mut first, shift(NINE_AM)).await;
    let mut second = session_for(worker("w2", "Blake"), store.clone(), local.clone(), notifier.clone());
    drive(&mut second, shift(NINE_AM + 300.0)).await;

    assert_eq!(first.summary().alerts_emitted, 1);
    assert_eq!(second.summary().alerts_emitted, 0);
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_csv_replay_with_file_backed_stores() {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.storage.database_path = dir.path().join("data").join("strainguard.db");
    config.storage.local_state_path = dir.path().join("state.json");
    config.heat_strain.enabled = false;

    let mut csv = NamedTempFile::new().unwrap();
    writeln!(csv, "kind,value,timestamp").unwrap();
    for sample in shift(NINE_AM) {
        writeln!(csv, "{},{},{}", sample.kind, sample.value, sample.timestamp).unwrap();
    }
    let samples = feed::read_samples_csv(csv.path()).unwrap();

    let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::open(&config.storage.database_path).unwrap());
    let local = Arc::new(FileLocalStore::open(&config.storage.local_state_path).unwrap());

    let mut session = Session::from_config(worker("w1", "Alex"), &config, store.clone(), local.clone()).unwrap();
    drive(&mut session, samples).await;
    session.save_accumulator(local.as_ref()).unwrap();
    let committed = session.accumulator().accumulated_work_expenditure();
    assert!(committed > 0.0);
    assert_eq!(session.summary().last_heat_strain, None);

    // A fresh process resumes from the committed accumulator
    let reopened = FileLocalStore::open(&config.storage.local_state_path).unwrap();
    assert_eq!(reopened.get_f64(&accumulator_key("w1")).unwrap(), Some(committed));
    assert!(reopened.get_f64("last_fatigue_warning_sent").unwrap().is_some());

    let resumed = Session::from_config(worker("w1", "Alex"), &config, store, Arc::new(reopened))
        .unwrap()
        .with_accumulated_expenditure(committed);
    assert_eq!(resumed.accumulator().accumulated_work_expenditure(), committed);
}

#[tokio::test]
async fn test_survey_gate_against_sqlite() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteDocumentStore::open(dir.path().join("surveys.db")).unwrap());
    let gate = SurveyGate::new(
        Arc::new(MemoryLocalStore::new()),
        store.clone(),
        SurveyPolicy::default(),
        FixedOffset::east_opt(0).unwrap(),
    );
    gate.set_start_date(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()).unwrap();

    gate.submit("w1", 3, NINE_AM).await.unwrap();
    let err = gate.submit("w1", 4, NINE_AM + 600.0).await.unwrap_err();
    assert!(err.to_string().contains("TooSoon"));

    gate.submit("w1", 4, NINE_AM + 3_600.0).await.unwrap();
    assert_eq!(store.count(Collection::SurveyResponses).unwrap(), 2);

    let status = gate.status(NINE_AM + 3_700.0).unwrap();
    assert_eq!(status.submitted_today, 2);
    assert_eq!(status.required_remaining, 3);
    assert_eq!(status.eligibility.blocked_by, Some(SurveyBlock::TooSoon));

    // Wednesday is two working days after the start date
    let wednesday = NINE_AM + 2.0 * 86_400.0;
    assert_eq!(
        gate.eligible_today(wednesday).unwrap().blocked_by,
        Some(SurveyBlock::NotSurveyDay)
    );
}
