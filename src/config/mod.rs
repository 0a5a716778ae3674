//! Configuration
//!
//! コンポーネントごとの設定と、ファイル・環境変数からの読み込み

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{
    AnalyzerConfig, BehaviorConfig, EmergencyConfig, LogRetentionConfig, LoggingConfig,
    OrchestratorConfig, PermissionConfig, ResourceMonitorConfig, SandboxConfig, SentinelConfig,
    SignatureConfig,
};

use crate::error::{Error, Result};

fn check_percent(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 100.0) {
        return Err(Error::InvalidConfiguration(format!(
            "{} must be in (0, 100], got {}",
            name, value
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::InvalidConfiguration(format!(
            "{} must be greater than zero",
            name
        )));
    }
    Ok(())
}

impl SentinelConfig {
    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<()> {
        check_positive(
            "sandbox.max_execution_time_ms",
            self.sandbox.max_execution_time_ms,
        )?;
        check_positive("sandbox.max_memory_bytes", self.sandbox.max_memory_bytes)?;
        check_positive(
            "sandbox.capability_timeout_ms",
            self.sandbox.capability_timeout_ms,
        )?;

        check_positive(
            "analyzer.max_code_size_bytes",
            self.analyzer.max_code_size_bytes as u64,
        )?;
        if !(0.0..=1.0).contains(&self.analyzer.obfuscation_threshold) {
            return Err(Error::InvalidConfiguration(
                "analyzer.obfuscation_threshold must be within 0.0..=1.0".to_string(),
            ));
        }

        if self.signature.allowed_algorithms.is_empty() {
            return Err(Error::InvalidConfiguration(
                "signature.allowed_algorithms must not be empty".to_string(),
            ));
        }
        if self.signature.max_clock_skew_secs < 0 || self.signature.max_signature_age_days <= 0 {
            return Err(Error::InvalidConfiguration(
                "signature time windows must be positive".to_string(),
            ));
        }

        check_positive(
            "resource.sample_interval_ms",
            self.resource.sample_interval_ms,
        )?;
        check_percent(
            "resource.throttle_cpu_percent",
            self.resource.throttle_cpu_percent,
        )?;
        if !(self.resource.emergency_memory_percent > 100.0) {
            return Err(Error::InvalidConfiguration(format!(
                "resource.emergency_memory_percent must exceed 100, got {}",
                self.resource.emergency_memory_percent
            )));
        }
        check_percent(
            "resource.emergency_cpu_percent",
            self.resource.emergency_cpu_percent,
        )?;
        if !(self.resource.emergency_system_load_percent > 0.0) {
            return Err(Error::InvalidConfiguration(
                "resource.emergency_system_load_percent must be greater than zero".to_string(),
            ));
        }
        check_percent(
            "resource.emergency_system_memory_percent",
            self.resource.emergency_system_memory_percent,
        )?;
        self.resource
            .default_limits
            .validate()
            .map_err(Error::InvalidConfiguration)?;

        if !(self.behavior.sensitivity > 0.0) {
            return Err(Error::InvalidConfiguration(
                "behavior.sensitivity must be greater than zero".to_string(),
            ));
        }
        if !(self.behavior.base_z_threshold > 0.0) {
            return Err(Error::InvalidConfiguration(
                "behavior.base_z_threshold must be greater than zero".to_string(),
            ));
        }
        check_positive("behavior.window_secs", self.behavior.window_secs)?;
        check_positive(
            "behavior.analysis_interval_ms",
            self.behavior.analysis_interval_ms,
        )?;

        let weights = [
            self.orchestrator.analysis_weight,
            self.orchestrator.signature_weight,
            self.orchestrator.testing_weight,
            self.orchestrator.behavior_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "orchestrator weights must be non-negative with a positive sum".to_string(),
            ));
        }

        match self.logging.rotation.as_str() {
            "daily" | "hourly" | "never" => {}
            other => {
                return Err(Error::InvalidConfiguration(format!(
                    "logging.rotation '{}' is not one of daily, hourly, never",
                    other
                )))
            }
        }

        Ok(())
    }
}
