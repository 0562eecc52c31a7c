//! Alert arbitration and the group highlight log
//!
//! The arbiter is a two-state machine (ready / cooldown) keyed per installation: the
//! last-sent time lives in the local store, so every profile on the device shares one
//! rate limit. Events arriving during cooldown are dropped, not queued.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{AlertEvent, Highlight};
use crate::storage::{Collection, Document, DocumentStore, LocalStore};

/// Local-store key holding the last emission time
pub const LAST_WARNING_SENT_KEY: &str = "last_fatigue_warning_sent";

pub const DEFAULT_MIN_INTERVAL_SECS: f64 = 600.0;

/// Scores must exceed this to qualify; zero makes every positive score qualify
pub const DEFAULT_WARNING_THRESHOLD: i64 = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum AlertDecision {
    Emitted(AlertEvent),
    /// In cooldown until `ready_at`
    Suppressed { ready_at: f64 },
    NotQualifying,
}

impl AlertDecision {
    pub fn event(&self) -> Option<&AlertEvent> {
        match self {
            AlertDecision::Emitted(event) => Some(event),
            _ => None,
        }
    }
}

pub struct AlertArbiter {
    local: Arc<dyn LocalStore>,
    min_interval_secs: f64,
    threshold: i64,
}

impl AlertArbiter {
    pub fn new(local: Arc<dyn LocalStore>) -> Self {
        Self {
            local,
            min_interval_secs: DEFAULT_MIN_INTERVAL_SECS,
            threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }

    pub fn with_min_interval(mut self, secs: f64) -> Self {
        self.min_interval_secs = secs;
        self
    }

    pub fn with_threshold(mut self, threshold: i64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Last emission time, if any
    pub fn last_sent(&self) -> Result<Option<f64>, StorageError> {
        self.local.get_f64(LAST_WARNING_SENT_KEY)
    }

    /// Decide whether this cycle's score produces an alert.
    ///
    /// The emitted event carries the score clamped to 0..=100.
    pub fn maybe_alert(
        &self,
        person_id: &str,
        display_name: &str,
        fatigue_score: i64,
        group_id: &str,
        now: f64,
    ) -> Result<AlertDecision, StorageError> {
        if fatigue_score <= self.threshold {
            return Ok(AlertDecision::NotQualifying);
        }

        if let Some(last_sent) = self.last_sent()? {
            let ready_at = last_sent + self.min_interval_secs;
            if now < ready_at {
                debug!(person_id, ready_at, "alert suppressed by cooldown");
                return Ok(AlertDecision::Suppressed { ready_at });
            }
        }

        self.local.set_f64(LAST_WARNING_SENT_KEY, now)?;
        let event = AlertEvent {
            person_id: person_id.to_string(),
            display_name: display_name.to_string(),
            fatigue_score: fatigue_score.clamp(0, 100),
            group_id: group_id.to_string(),
            timestamp: now,
        };
        info!(person_id, fatigue_score = event.fatigue_score, group_id, "fatigue alert emitted");
        Ok(AlertDecision::Emitted(event))
    }
}

/// Persist the durable highlight for an emitted alert under a fresh document name
pub async fn record_highlight(store: &dyn DocumentStore, event: &AlertEvent) -> Result<Highlight, StorageError> {
    let highlight = event.to_highlight();
    let document = Document::new(
        Collection::FatigueWarnings,
        &event.person_id,
        Uuid::new_v4().to_string(),
        event.timestamp,
        &highlight,
    )?
    .with_group(&event.group_id);
    store.put(document).await?;
    Ok(highlight)
}

/// Newest-first highlights for a group
pub async fn recent_highlights(
    store: &dyn DocumentStore,
    group_id: &str,
    limit: usize,
) -> Result<Vec<Highlight>, StorageError> {
    let documents = store
        .by_group(Collection::FatigueWarnings, group_id, Some(limit))
        .await?;
    let mut highlights = Vec::with_capacity(documents.len());
    for document in documents {
        match document.decode::<Highlight>() {
            Ok(highlight) => highlights.push(highlight),
            Err(e) => warn!(name = %document.name, error = %e, "skipping unreadable highlight"),
        }
    }
    Ok(highlights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryLocalStore, SqliteDocumentStore};

    fn arbiter(min_interval: f64) -> AlertArbiter {
        AlertArbiter::new(Arc::new(MemoryLocalStore::new())).with_min_interval(min_interval)
    }

    #[test]
    fn test_suppression_inside_interval() {
        let arbiter = arbiter(600.0);
        let first = arbiter.maybe_alert("p1", "Sam", 40, "g", 1_000.0).unwrap();
        assert!(first.event().is_some());

        let second = arbiter.maybe_alert("p1", "Sam", 40, "g", 1_000.0 + 599.0).unwrap();
        assert_eq!(second, AlertDecision::Suppressed { ready_at: 1_600.0 });
        assert_eq!(arbiter.last_sent().unwrap(), Some(1_000.0));
    }

    #[test]
    fn test_emits_again_after_interval() {
        let arbiter = arbiter(600.0);
        assert!(arbiter.maybe_alert("p1", "Sam", 40, "g", 1_000.0).unwrap().event().is_some());
        assert!(arbiter.maybe_alert("p1", "Sam", 40, "g", 1_601.0).unwrap().event().is_some());
        // exactly at the boundary the arbiter is ready again
        assert!(arbiter.maybe_alert("p1", "Sam", 40, "g", 2_201.0).unwrap().event().is_some());
    }

    #[test]
    fn test_rate_limit_is_shared_across_people() {
        let arbiter = arbiter(600.0);
        assert!(arbiter.maybe_alert("p1", "Sam", 40, "g", 0.0).unwrap().event().is_some());
        assert!(matches!(
            arbiter.maybe_alert("p2", "Kim", 90, "g", 10.0).unwrap(),
            AlertDecision::Suppressed { .. }
        ));
    }

    #[test]
    fn test_score_is_clamped_and_zero_does_not_qualify() {
        let arbiter = arbiter(600.0);
        assert_eq!(
            arbiter.maybe_alert("p1", "Sam", 0, "g", 0.0).unwrap(),
            AlertDecision::NotQualifying
        );
        let decision = arbiter.maybe_alert("p1", "Sam", 345, "g", 0.0).unwrap();
        assert_eq!(decision.event().unwrap().fatigue_score, 100);
    }

    #[test]
    fn test_suppressed_and_non_qualifying_calls_leave_state() {
        let arbiter = arbiter(600.0);
        arbiter.maybe_alert("p1", "Sam", 0, "g", 5.0).unwrap();
        assert_eq!(arbiter.last_sent().unwrap(), None);
    }

    #[tokio::test]
    async fn test_highlights_round_trip_newest_first() {
        let store = SqliteDocumentStore::in_memory().unwrap();
        for (score, ts) in [(30, 100.0), (60, 300.0), (45, 200.0)] {
            let event = AlertEvent {
                person_id: "p1".to_string(),
                display_name: "Sam".to_string(),
                fatigue_score: score,
                group_id: "crew".to_string(),
                timestamp: ts,
            };
            record_highlight(&store, &event).await.unwrap();
        }
        let highlights = recent_highlights(&store, "crew", 2).await.unwrap();
        assert_eq!(highlights.len(), 2);
        assert_eq!(highlights[0].content, "may need a break (fatigue 60%)");
        assert_eq!(highlights[1].timestamp, 200.0);
        assert!(recent_highlights(&store, "other", 10).await.unwrap().is_empty());
    }
}
