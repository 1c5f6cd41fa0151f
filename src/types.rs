use serde::{Deserialize, Serialize};

use crate::error::{RResult, RecorderError};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Standard gravity, removed from raw accelerometer readings
pub const GRAVITY: f64 = 9.81; // m/s²

/// Sensor used to count repetitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionMode {
    /// Manual counting only
    #[default]
    None,
    /// Covering the proximity sensor (push-ups)
    Proximity,
    /// Up and down movement with the device held upright (squats)
    UprightAxis,
    /// Up and down movement with the device lying flat
    FlatAxis,
}

/// Activity definition a record is created from. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTemplate {
    pub id: i64,
    pub name: String,
    pub category_id: i64,
    #[serde(default)]
    pub repetition_mode: RepetitionMode,
    #[serde(default)]
    pub sensor_delay_ms: u32,
    #[serde(default)]
    pub min_repetitions: u32,
    #[serde(default)]
    pub max_repetitions: u32,
    #[serde(default)]
    pub distance_enabled: bool,
}

impl ActivityTemplate {
    pub fn new(id: i64, name: &str, category_id: i64) -> Self {
        Self {
            id,
            name: name.to_string(),
            category_id,
            repetition_mode: RepetitionMode::None,
            sensor_delay_ms: 0,
            min_repetitions: 0,
            max_repetitions: 0,
            distance_enabled: false,
        }
    }

    pub fn with_repetitions(mut self, min: u32, max: u32, mode: RepetitionMode, delay_ms: u32) -> Self {
        self.min_repetitions = min;
        self.max_repetitions = max;
        self.repetition_mode = mode;
        self.sensor_delay_ms = delay_ms;
        self
    }

    pub fn with_distance(mut self) -> Self {
        self.distance_enabled = true;
        self
    }

    /// Repetitions are counted only when both bounds are set.
    pub fn uses_repetitions(&self) -> bool {
        self.min_repetitions > 0 && self.max_repetitions > 0
    }

    /// Both bounds zero, or `0 < min <= max`.
    pub fn validate(&self) -> RResult<()> {
        let (min, max) = (self.min_repetitions, self.max_repetitions);
        if min == 0 && max == 0 {
            return Ok(());
        }
        if min == 0 || max == 0 {
            return Err(RecorderError::InvalidTemplate(format!(
                "repetition bounds must both be set or both be zero (min={}, max={})",
                min, max
            )));
        }
        if min > max {
            return Err(RecorderError::InvalidTemplate(format!(
                "minimum repetitions {} exceeds maximum {}",
                min, max
            )));
        }
        Ok(())
    }
}

/// Satellite position sample from the positioning provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub timestamp: Timestamp,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    #[serde(default)]
    pub satellites_in_use: u32,
    #[serde(default)]
    pub satellites_in_view: u32,
}

impl PositionFix {
    pub fn new(timestamp: Timestamp, latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            accuracy,
            satellites_in_use: 0,
            satellites_in_view: 0,
        }
    }
}

/// Sensor-specific part of a motion event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MotionPayload {
    Proximity { covered: bool },
    /// Signed acceleration along the configured axis, gravity removed (m/s²)
    Axis { value: f64 },
}

/// Motion or proximity reading from the hardware sensor callback
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub timestamp: Timestamp,
    pub payload: MotionPayload,
}

impl MotionEvent {
    pub fn proximity(timestamp: Timestamp, covered: bool) -> Self {
        Self {
            timestamp,
            payload: MotionPayload::Proximity { covered },
        }
    }

    pub fn axis(timestamp: Timestamp, value: f64) -> Self {
        Self {
            timestamp,
            payload: MotionPayload::Axis { value },
        }
    }

    /// Project a raw accelerometer sample onto the axis the mode watches.
    ///
    /// Upright holds the device in portrait, so vertical motion shows on y.
    /// Flat lies the device on its front or back, so vertical motion shows on z.
    /// Returns `None` for modes that do not read the accelerometer.
    pub fn from_accelerometer(timestamp: Timestamp, mode: RepetitionMode, _x: f64, y: f64, z: f64) -> Option<Self> {
        let raw = match mode {
            RepetitionMode::UprightAxis => y,
            RepetitionMode::FlatAxis => z,
            RepetitionMode::None | RepetitionMode::Proximity => return None,
        };
        // A device lying face down reads -g on z
        let value = if raw >= 0.0 { raw - GRAVITY } else { raw + GRAVITY };
        Some(Self::axis(timestamp, value))
    }

    pub fn is_covered(&self) -> Option<bool> {
        match self.payload {
            MotionPayload::Proximity { covered } => Some(covered),
            MotionPayload::Axis { .. } => None,
        }
    }
}
