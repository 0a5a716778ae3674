//! Emergency Controller
//!
//! 緊急対応・インシデント記録・プラグイン隔離

pub mod controller;
pub mod quarantine;
pub mod responder;
pub mod store;
pub mod types;

pub use controller::EmergencyController;
pub use quarantine::QuarantineRegistry;
pub use responder::{AlertSink, ForensicSource, ThreatResponder, TracingAlertSink};
pub use store::IncidentStore;
pub use types::{
    ActionOutcome, EmergencyAction, EmergencyIncident, EmergencyRequest, EmergencyResponse,
    EmergencyState, EmergencyTrigger, ForensicArtifact, IncidentSummary, QuarantineRecord,
};
