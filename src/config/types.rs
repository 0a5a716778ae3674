use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::emergency::EmergencyAction;
use crate::resource::ResourceLimits;
use crate::signature::SignatureAlgorithm;
use crate::types::{ThreatLevel, TrustLevel};

/// Top-level configuration for every security component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Isolated execution settings
    pub sandbox: SandboxConfig,

    /// Static analysis settings
    pub analyzer: AnalyzerConfig,

    /// Signature and trust store settings
    pub signature: SignatureConfig,

    /// Access control settings
    pub permission: PermissionConfig,

    /// Resource sampling and enforcement settings
    pub resource: ResourceMonitorConfig,

    /// Behavioral anomaly detection settings
    pub behavior: BehaviorConfig,

    /// Incident response settings
    pub emergency: EmergencyConfig,

    /// Assessment pipeline settings
    pub orchestrator: OrchestratorConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Sandbox executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Hard wall-clock ceiling per invocation
    pub max_execution_time_ms: u64,

    /// Ceiling for tracked memory (mediated storage + buffered I/O)
    pub max_memory_bytes: u64,

    /// Interpreter operation budget (0 = unlimited)
    pub max_operations: u64,

    /// Maximum function call depth
    pub max_call_depth: usize,

    /// Maximum expression nesting depth
    pub max_expr_depth: usize,

    /// Maximum length of a single string value
    pub max_string_size: usize,

    /// Maximum number of elements in a single array
    pub max_array_size: usize,

    /// Maximum number of entries in a single object map
    pub max_map_size: usize,

    /// Maximum size of a file read or written through the fs capability
    pub max_file_bytes: u64,

    /// Maximum number of keys per plugin in mediated storage
    pub max_storage_entries: usize,

    /// Root directory holding `<plugin>/data` subtrees
    pub fs_root: PathBuf,

    /// Time allowed for the host to service one capability call
    pub capability_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 5_000,
            max_memory_bytes: 64 * 1024 * 1024,
            max_operations: 50_000_000,
            max_call_depth: 64,
            max_expr_depth: 64,
            max_string_size: 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
            max_file_bytes: 1024 * 1024,
            max_storage_entries: 1_000,
            fs_root: std::env::temp_dir().join("plugin-sentinel").join("plugins"),
            capability_timeout_ms: 2_000,
        }
    }
}

/// Code analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Maximum accepted source size in bytes
    pub max_code_size_bytes: usize,

    /// Maximum accepted number of lines
    pub max_lines: usize,

    /// Cyclomatic complexity above which a penalty applies
    pub complexity_threshold: u32,

    /// Cognitive complexity above which a penalty applies
    pub cognitive_threshold: u32,

    /// Nesting depth above which a penalty applies
    pub nesting_threshold: u32,

    /// Obfuscation confidence (0.0-1.0) above which a threat is reported
    pub obfuscation_threshold: f64,

    /// Analysis time budget; exceeding it fails closed
    pub analysis_timeout_ms: u64,

    /// Number of cached results kept
    pub cache_capacity: usize,

    /// Extra function names treated as critical
    pub blocked_functions: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_code_size_bytes: 512 * 1024,
            max_lines: 10_000,
            complexity_threshold: 40,
            cognitive_threshold: 60,
            nesting_threshold: 6,
            obfuscation_threshold: 0.6,
            analysis_timeout_ms: 5_000,
            cache_capacity: 512,
            blocked_functions: Vec::new(),
        }
    }
}

/// Signature verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Fail closed when a plugin carries no signature
    pub require_signature: bool,

    /// Minimum publisher trust level for a valid verification
    pub minimum_trust_level: TrustLevel,

    /// Accepted algorithms
    pub allowed_algorithms: Vec<SignatureAlgorithm>,

    /// Tolerated clock skew for future timestamps
    pub max_clock_skew_secs: i64,

    /// Maximum age of a signature
    pub max_signature_age_days: i64,

    /// Persisted trust store (JSON)
    pub trust_store_path: Option<PathBuf>,

    /// Persisted revocation list (JSON)
    pub revocation_list_path: Option<PathBuf>,

    /// Lifetime of cached verification results
    pub cache_ttl_secs: u64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            require_signature: true,
            minimum_trust_level: TrustLevel::Basic,
            allowed_algorithms: vec![
                SignatureAlgorithm::Ed25519,
                SignatureAlgorithm::EcdsaP256Sha256,
                SignatureAlgorithm::RsaPkcs1Sha256,
            ],
            max_clock_skew_secs: 300,
            max_signature_age_days: 365,
            trust_store_path: None,
            revocation_list_path: None,
            cache_ttl_secs: 3_600,
        }
    }
}

/// Permission manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// TTL of cached permission decisions
    pub cache_ttl_secs: u64,

    /// Audit entries kept in memory
    pub audit_max_entries: usize,

    /// Optional append-only audit file (JSON lines)
    pub audit_log_path: Option<PathBuf>,

    /// Minimum time between escalation requests of one plugin
    pub escalation_cooldown_secs: u64,

    /// Escalation requests allowed per plugin per hour
    pub escalation_max_per_hour: u32,

    /// Highest level the default approver grants on its own
    pub auto_approve_up_to: TrustLevel,

    /// Minimum justification length for an escalation request
    pub min_justification_len: usize,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            audit_max_entries: 10_000,
            audit_log_path: None,
            escalation_cooldown_secs: 3_600,
            escalation_max_per_hour: 3,
            auto_approve_up_to: TrustLevel::Verified,
            min_justification_len: 20,
        }
    }
}

/// Resource monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceMonitorConfig {
    /// Sampling interval
    pub sample_interval_ms: u64,

    /// Samples kept per execution
    pub history_retention: usize,

    /// CPU percentage that sets the throttle flag
    pub throttle_cpu_percent: f64,

    /// How long a throttle lasts
    pub throttle_duration_ms: u64,

    /// Heap usage, as a percentage of the heap limit, that forces termination (> 100)
    pub emergency_memory_percent: f64,

    /// CPU percentage that forces termination when it also breaches the CPU limit
    pub emergency_cpu_percent: f64,

    /// System load, as a percentage of available cores, that forces termination
    pub emergency_system_load_percent: f64,

    /// System memory usage percentage that forces termination
    pub emergency_system_memory_percent: f64,

    /// Limits applied when the caller passes none
    pub default_limits: ResourceLimits,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            history_retention: 600,
            throttle_cpu_percent: 100.0,
            throttle_duration_ms: 1_000,
            emergency_memory_percent: 200.0,
            emergency_cpu_percent: 100.0,
            emergency_system_load_percent: 400.0,
            emergency_system_memory_percent: 98.0,
            default_limits: ResourceLimits::default(),
        }
    }
}

/// Behavior monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Window used for baseline counts and frequency scoring
    pub window_secs: u64,

    /// Detection sensitivity; higher values lower the z-score threshold
    pub sensitivity: f64,

    /// z-score threshold at sensitivity 1.0
    pub base_z_threshold: f64,

    /// Windows observed before anomalies are reported
    pub min_baseline_samples: u64,

    /// Events kept per execution
    pub max_events_per_execution: usize,

    /// Events older than this are pruned
    pub event_retention_secs: u64,

    /// Periodic sweep interval
    pub analysis_interval_ms: u64,

    /// Gap below which consecutive events count as a burst
    pub burst_gap_ms: u64,

    /// Consecutive short gaps that make a timing anomaly
    pub burst_threshold: usize,

    /// Dispatch automated actions to the emergency controller
    pub automated_response: bool,

    /// Lowest threat level for pattern-driven automation
    pub automation_min_level: ThreatLevel,

    /// Minimum time between automated actions of one execution
    pub action_cooldown_secs: u64,

    /// Automated actions allowed per execution
    pub max_automated_actions: u32,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            sensitivity: 1.0,
            base_z_threshold: 3.0,
            min_baseline_samples: 5,
            max_events_per_execution: 10_000,
            event_retention_secs: 3_600,
            analysis_interval_ms: 5_000,
            burst_gap_ms: 100,
            burst_threshold: 20,
            automated_response: true,
            automation_min_level: ThreatLevel::High,
            action_cooldown_secs: 30,
            max_automated_actions: 5,
        }
    }
}

/// Emergency controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    /// Actions for critical incidents
    pub critical_actions: Vec<EmergencyAction>,

    /// Actions for high severity incidents
    pub high_actions: Vec<EmergencyAction>,

    /// Actions for medium severity incidents
    pub medium_actions: Vec<EmergencyAction>,

    /// Actions for low severity incidents
    pub low_actions: Vec<EmergencyAction>,

    /// Capture forensic artifacts on trigger
    pub forensic_capture: bool,

    /// Time budget of one side action
    pub action_timeout_ms: u64,

    /// Duration of an emergency throttle
    pub throttle_duration_ms: u64,

    /// Directory for `incidents.log` and per-incident records
    pub incident_dir: Option<PathBuf>,

    /// Directory for backups
    pub backup_dir: Option<PathBuf>,

    /// Persisted quarantine registry (JSON)
    pub quarantine_path: Option<PathBuf>,

    /// Days an incident record is kept on disk
    pub incident_retention_days: u32,

    /// Incidents kept in memory
    pub max_incidents_in_memory: usize,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            critical_actions: vec![
                EmergencyAction::Terminate,
                EmergencyAction::Quarantine,
                EmergencyAction::ForensicCapture,
                EmergencyAction::Alert,
            ],
            high_actions: vec![
                EmergencyAction::Terminate,
                EmergencyAction::ForensicCapture,
                EmergencyAction::Alert,
            ],
            medium_actions: vec![EmergencyAction::Restrict, EmergencyAction::Alert],
            low_actions: vec![EmergencyAction::Monitor],
            forensic_capture: true,
            action_timeout_ms: 2_000,
            throttle_duration_ms: 5_000,
            incident_dir: None,
            backup_dir: None,
            quarantine_path: None,
            incident_retention_days: 365,
            max_incidents_in_memory: 1_000,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Block critical-risk plugins
    pub strict_mode: bool,

    /// Run the security test battery during assessment
    pub run_security_tests: bool,

    /// Allow execution despite a critical risk level
    pub emergency_override: bool,

    /// Weight of the analysis score
    pub analysis_weight: f64,

    /// Weight of the signature score
    pub signature_weight: f64,

    /// Weight of the test battery score
    pub testing_weight: f64,

    /// Weight of the behavior score
    pub behavior_weight: f64,

    /// Assessments kept in memory
    pub max_assessments: usize,

    /// Interval of the retention sweep
    pub cleanup_interval_secs: u64,

    /// Capacity of the host notification channel
    pub event_bus_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            run_security_tests: true,
            emergency_override: false,
            analysis_weight: 0.30,
            signature_weight: 0.25,
            testing_weight: 0.35,
            behavior_weight: 0.10,
            max_assessments: 1_000,
            cleanup_interval_secs: 300,
            event_bus_capacity: 1_024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error or an EnvFilter directive)
    pub level: String,

    /// Log directory; a platform default is used when unset
    pub log_dir: Option<PathBuf>,

    /// Rotation: daily, hourly or never
    pub rotation: String,

    /// Console output
    pub console: bool,

    /// File output
    pub file: bool,

    /// JSON formatted file output
    pub json: bool,

    /// Retention policy
    pub retention: LogRetentionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            rotation: "daily".to_string(),
            console: true,
            file: false,
            json: false,
            retention: LogRetentionConfig::default(),
        }
    }
}

/// Log retention configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRetentionConfig {
    /// external, days, count or size
    pub policy: Option<String>,
    pub days: Option<u32>,
    pub count: Option<u32>,
    pub size_mb: Option<u32>,
}
