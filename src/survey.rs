//! Self-report survey gating and submission

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::aggregation::local_day_range;
use crate::error::{Result, StorageError, StrainError};
use crate::models::{timestamp_label, to_datetime, EmaResponse, SurveyResponse};
use crate::storage::{Collection, Document, DocumentStore, LocalStore};

pub const SUBMITTED_TIMESTAMPS_KEY: &str = "submitted_survey_timestamps";
pub const START_DATE_KEY: &str = "user_start_date";

/// Quota and spacing rules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyPolicy {
    pub max_per_day: usize,
    /// The first submissions of the day; the rest up to the maximum are optional
    pub required_per_day: usize,
    pub min_spacing_secs: f64,
    /// Tolerance before the next eligible time for timer drift
    pub grace_secs: f64,
}

impl Default for SurveyPolicy {
    fn default() -> Self {
        Self {
            max_per_day: 8,
            required_per_day: 5,
            min_spacing_secs: 3_600.0,
            grace_secs: 60.0,
        }
    }
}

/// Why a survey cannot be taken right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SurveyBlock {
    NotSurveyDay,
    QuotaReached,
    TooSoon,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SurveyEligibility {
    pub eligible: bool,
    /// Earliest time the spacing rule allows; `None` before the first submission
    pub next_eligible_time: Option<f64>,
    pub blocked_by: Option<SurveyBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SurveyStatus {
    pub survey_day: bool,
    pub submitted_today: usize,
    pub required_remaining: usize,
    pub optional_remaining: usize,
    pub eligibility: SurveyEligibility,
}

/// Next date `days` weekdays later; a Saturday or Sunday landing rolls to Monday
pub fn add_days_excluding_weekends(date: NaiveDate, days: u32) -> NaiveDate {
    let mut result = date;
    for _ in 0..days {
        result += Duration::days(1);
        match result.weekday() {
            Weekday::Sat => result += Duration::days(2),
            Weekday::Sun => result += Duration::days(1),
            _ => {}
        }
    }
    result
}

pub struct SurveyGate {
    local: Arc<dyn LocalStore>,
    store: Arc<dyn DocumentStore>,
    policy: SurveyPolicy,
    offset: FixedOffset,
}

impl SurveyGate {
    pub fn new(
        local: Arc<dyn LocalStore>,
        store: Arc<dyn DocumentStore>,
        policy: SurveyPolicy,
        offset: FixedOffset,
    ) -> Self {
        Self {
            local,
            store,
            policy,
            offset,
        }
    }

    fn local_date(&self, timestamp: f64) -> NaiveDate {
        to_datetime(timestamp).with_timezone(&self.offset).date_naive()
    }

    /// Record the trial start; stored as local midnight of that day
    pub fn set_start_date(&self, date: NaiveDate) -> std::result::Result<(), StorageError> {
        let (midnight, _) = local_day_range(date, self.offset);
        self.local.set_f64(START_DATE_KEY, midnight)
    }

    /// Trial start date; an unset start reads as the epoch
    pub fn start_date(&self) -> std::result::Result<NaiveDate, StorageError> {
        let start = self.local.get_f64(START_DATE_KEY)?.unwrap_or(0.0);
        Ok(self.local_date(start))
    }

    /// Surveys run on the start date and on the next weekday after it
    pub fn is_survey_day(&self, now: f64) -> std::result::Result<bool, StorageError> {
        let start = self.start_date()?;
        let today = self.local_date(now);
        Ok(today == start || today == add_days_excluding_weekends(start, 1))
    }

    pub fn submitted_today(&self, now: f64) -> std::result::Result<usize, StorageError> {
        let (midnight, _) = local_day_range(self.local_date(now), self.offset);
        let end = midnight + 86_400.0;
        Ok(self
            .local
            .get_f64_list(SUBMITTED_TIMESTAMPS_KEY)?
            .into_iter()
            .filter(|ts| *ts > midnight && *ts < end)
            .count())
    }

    pub fn eligible_today(&self, now: f64) -> std::result::Result<SurveyEligibility, StorageError> {
        let next_eligible_time = self
            .local
            .get_f64_list(SUBMITTED_TIMESTAMPS_KEY)?
            .last()
            .map(|last| last + self.policy.min_spacing_secs);

        let blocked_by = if !self.is_survey_day(now)? {
            Some(SurveyBlock::NotSurveyDay)
        } else if self.submitted_today(now)? >= self.policy.max_per_day {
            Some(SurveyBlock::QuotaReached)
        } else if next_eligible_time.is_some_and(|next| next - self.policy.grace_secs >= now) {
            Some(SurveyBlock::TooSoon)
        } else {
            None
        };

        Ok(SurveyEligibility {
            eligible: blocked_by.is_none(),
            next_eligible_time,
            blocked_by,
        })
    }

    pub fn status(&self, now: f64) -> std::result::Result<SurveyStatus, StorageError> {
        let submitted_today = self.submitted_today(now)?;
        let required = self.policy.required_per_day;
        let optional = self.policy.max_per_day.saturating_sub(required);
        Ok(SurveyStatus {
            survey_day: self.is_survey_day(now)?,
            submitted_today,
            required_remaining: required.saturating_sub(submitted_today),
            optional_remaining: optional.saturating_sub(submitted_today.saturating_sub(required)),
            eligibility: self.eligible_today(now)?,
        })
    }

    /// Append a submission time to the local list
    pub fn record_submission(&self, timestamp: f64) -> std::result::Result<(), StorageError> {
        self.local.push_f64(SUBMITTED_TIMESTAMPS_KEY, timestamp)
    }

    /// Gate, store and count a fatigue self-report
    pub async fn submit(&self, person_id: &str, fatigue_level: i32, now: f64) -> Result<SurveyResponse> {
        let eligibility = self.eligible_today(now)?;
        if let Some(block) = eligibility.blocked_by {
            return Err(StrainError::Validation(format!("survey not available: {:?}", block)));
        }

        let response = SurveyResponse {
            person_id: person_id.to_string(),
            fatigue_level,
            timestamp: now,
        };
        let document = Document::new(
            Collection::SurveyResponses,
            person_id,
            timestamp_label(now),
            now,
            &response,
        )?;
        self.store.put(document).await?;
        self.record_submission(now)?;
        info!(person_id, fatigue_level, "survey submitted");
        Ok(response)
    }

    /// Store an ecological momentary assessment; not subject to the survey gate
    pub async fn submit_ema(
        &self,
        person_id: &str,
        answers: BTreeMap<String, Value>,
        now: f64,
    ) -> Result<EmaResponse> {
        let response = EmaResponse {
            person_id: person_id.to_string(),
            answers,
            timestamp: now,
        };
        let document = Document::new(
            Collection::EmaSurveys,
            person_id,
            timestamp_label(now),
            now,
            &response,
        )?;
        self.store.put(document).await?;
        info!(person_id, "ema submitted");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryLocalStore, SqliteDocumentStore};

    // Friday 2024-03-08 00:00:00 UTC
    const FRIDAY: f64 = 1_709_856_000.0;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn gate() -> (SurveyGate, Arc<SqliteDocumentStore>) {
        let store = Arc::new(SqliteDocumentStore::in_memory().unwrap());
        let gate = SurveyGate::new(
            Arc::new(MemoryLocalStore::new()),
            store.clone(),
            SurveyPolicy::default(),
            FixedOffset::east_opt(0).unwrap(),
        );
        (gate, store)
    }

    #[test]
    fn test_add_days_skips_weekends() {
        // Friday -> Monday
        assert_eq!(add_days_excluding_weekends(date(2024, 3, 8), 1), date(2024, 3, 11));
        // Thursday -> Friday
        assert_eq!(add_days_excluding_weekends(date(2024, 3, 7), 1), date(2024, 3, 8));
        // Saturday -> Monday
        assert_eq!(add_days_excluding_weekends(date(2024, 3, 9), 1), date(2024, 3, 11));
        assert_eq!(add_days_excluding_weekends(date(2024, 3, 7), 3), date(2024, 3, 12));
    }

    #[test]
    fn test_survey_days_follow_start_date() {
        let (gate, _) = gate();
        gate.set_start_date(date(2024, 3, 8)).unwrap();
        assert!(gate.is_survey_day(FRIDAY + 3_600.0).unwrap());
        // Saturday is skipped
        assert!(!gate.is_survey_day(FRIDAY + 86_400.0).unwrap());
        // Monday is the second survey day
        assert!(gate.is_survey_day(FRIDAY + 3.0 * 86_400.0 + 10.0).unwrap());
        assert!(!gate.is_survey_day(FRIDAY + 4.0 * 86_400.0).unwrap());
    }

    #[test]
    fn test_spacing_with_grace() {
        let (gate, _) = gate();
        gate.set_start_date(date(2024, 3, 8)).unwrap();
        let first = FRIDAY + 8.0 * 3_600.0;
        gate.record_submission(first).unwrap();

        let early = gate.eligible_today(first + 3_540.0).unwrap();
        assert_eq!(early.blocked_by, Some(SurveyBlock::TooSoon));
        assert_eq!(early.next_eligible_time, Some(first + 3_600.0));

        let within_grace = gate.eligible_today(first + 3_541.0).unwrap();
        assert!(within_grace.eligible);
    }

    #[test]
    fn test_quota_and_status() {
        let (gate, _) = gate();
        gate.set_start_date(date(2024, 3, 8)).unwrap();
        for i in 0..6 {
            gate.record_submission(FRIDAY + (i as f64 + 1.0) * 3_600.0).unwrap();
        }
        let status = gate.status(FRIDAY + 12.0 * 3_600.0).unwrap();
        assert_eq!(status.submitted_today, 6);
        assert_eq!(status.required_remaining, 0);
        assert_eq!(status.optional_remaining, 2);

        gate.record_submission(FRIDAY + 13.0 * 3_600.0).unwrap();
        gate.record_submission(FRIDAY + 14.0 * 3_600.0).unwrap();
        let eligibility = gate.eligible_today(FRIDAY + 20.0 * 3_600.0).unwrap();
        assert_eq!(eligibility.blocked_by, Some(SurveyBlock::QuotaReached));
    }

    #[test]
    fn test_yesterdays_submissions_do_not_count() {
        let (gate, _) = gate();
        gate.record_submission(FRIDAY - 10.0).unwrap();
        gate.record_submission(FRIDAY).unwrap();
        assert_eq!(gate.submitted_today(FRIDAY + 100.0).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submit_writes_record_and_timestamp() {
        let (gate, store) = gate();
        gate.set_start_date(date(2024, 3, 8)).unwrap();
        let now = FRIDAY + 9.0 * 3_600.0;

        gate.submit("p1", 4, now).await.unwrap();
        assert_eq!(store.count(Collection::SurveyResponses).unwrap(), 1);
        assert_eq!(gate.submitted_today(now + 1.0).unwrap(), 1);

        let err = gate.submit("p1", 5, now + 60.0).await.unwrap_err();
        assert!(matches!(err, StrainError::Validation(_)));
    }

    #[tokio::test]
    async fn test_submit_blocked_on_non_survey_day() {
        let (gate, store) = gate();
        gate.set_start_date(date(2024, 3, 1)).unwrap();
        assert!(gate.submit("p1", 4, FRIDAY + 100.0).await.is_err());
        assert_eq!(store.count(Collection::SurveyResponses).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ema_is_not_gated() {
        let (gate, store) = gate();
        let mut answers = BTreeMap::new();
        answers.insert("sleep_hours".to_string(), Value::from(6));
        gate.submit_ema("p1", answers, FRIDAY).await.unwrap();
        assert_eq!(store.count(Collection::EmaSurveys).unwrap(), 1);
    }
}
