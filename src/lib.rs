// Library interface for strainguard modules
// This allows integration tests and benches to access the engine

pub mod aggregation;
pub mod alerts;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fatigue;
pub mod feed;
pub mod heat_strain;
pub mod logging;
pub mod models;
pub mod notify;
pub mod session;
pub mod storage;
pub mod survey;

// Re-export commonly used types for convenience
pub use models::*;
pub use aggregation::{HourWindow, Metric, ObservationAggregator};
pub use alerts::{AlertArbiter, AlertDecision};
pub use buffer::{Admission, SampleBuffer};
pub use config::EngineConfig;
pub use error::{ErrorSeverity, HeatStrainError, NotifyError, Result, StorageError, StrainError};
pub use fatigue::{AccumulatorState, FatigueEstimator, FatigueOutcome, FatigueResult};
pub use heat_strain::{
    FeatureExtractor, FeaturePayload, FeatureStatistics, HeatStrainEstimator, LinearStrainModel,
    LocalFeatureExtractor, StrainModel,
};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use notify::{NotificationMessage, Notifier};
pub use session::{CycleReport, Session, SessionSummary};
pub use storage::{Collection, Document, DocumentStore, LocalStore, SqliteDocumentStore};
pub use survey::{SurveyGate, SurveyPolicy};
