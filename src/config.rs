use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::distance::{DEFAULT_MAX_ACCURACY_M, DEFAULT_SIGNAL_LOSS_MS};
use crate::error::{RResult, RecorderError};
use crate::units::UnitSystem;

/// Backoff settings for store operations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts (tests, replay)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 1.5^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1.5_f64.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Recording policy and tuning. Every field has a default so partial JSON files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Fixes with a worse accuracy are rejected (metres)
    pub max_fix_accuracy_m: f64,
    /// Seconds without an accepted fix before the signal counts as lost
    pub signal_loss_after_secs: u64,
    /// Axis modes ignore accelerations within +/- this band (m/s²)
    pub axis_dead_band: f64,
    /// Finish automatically once the maximum repetitions are reached
    pub auto_finish_at_max: bool,
    /// Finish after the proximity sensor stayed covered this long (0 = off)
    pub finish_on_covering_secs: u32,
    /// Clock tick driving signal-loss and covering checks
    pub tick_interval_ms: u64,
    pub unit_system: UnitSystem,
    pub retry: RetryConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_fix_accuracy_m: DEFAULT_MAX_ACCURACY_M,
            signal_loss_after_secs: (DEFAULT_SIGNAL_LOSS_MS / 1000) as u64,
            axis_dead_band: 1.5,
            auto_finish_at_max: true,
            finish_on_covering_secs: 0,
            tick_interval_ms: 1000,
            unit_system: UnitSystem::Metric,
            retry: RetryConfig::default(),
        }
    }
}

impl RecorderConfig {
    pub fn from_json(json: &str) -> RResult<Self> {
        let config: RecorderConfig =
            serde_json::from_str(json).map_err(|e| RecorderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> RResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| RecorderError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> RResult<()> {
        if !(self.max_fix_accuracy_m > 0.0) {
            return Err(RecorderError::Config(format!(
                "max_fix_accuracy_m must be positive, got {}",
                self.max_fix_accuracy_m
            )));
        }
        if !(self.axis_dead_band >= 0.0) {
            return Err(RecorderError::Config(format!(
                "axis_dead_band must not be negative, got {}",
                self.axis_dead_band
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(RecorderError::Config("tick_interval_ms must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(RecorderError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn signal_loss_after_ms(&self) -> i64 {
        self.signal_loss_after_secs as i64 * 1000
    }
}
