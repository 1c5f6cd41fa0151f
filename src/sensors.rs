use serde::{Deserialize, Serialize};

use crate::types::RepetitionMode;

/// Sources a session needs while it is live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRequest {
    /// Sensor feeding the repetition detector
    pub repetition_mode: RepetitionMode,
    /// Proximity sensor for finish-on-covering, independent of the repetition mode
    pub proximity_for_finish: bool,
    /// Satellite positioning
    pub positioning: bool,
}

impl SensorRequest {
    pub fn is_empty(&self) -> bool {
        self.repetition_mode == RepetitionMode::None && !self.proximity_for_finish && !self.positioning
    }

    pub fn needs_proximity(&self) -> bool {
        self.repetition_mode == RepetitionMode::Proximity || self.proximity_for_finish
    }

    pub fn needs_accelerometer(&self) -> bool {
        matches!(
            self.repetition_mode,
            RepetitionMode::UprightAxis | RepetitionMode::FlatAxis
        )
    }
}

/// Starts and stops the hardware producers feeding the engine.
///
/// The engine calls `acquire` when a session starts or resumes and `release` on
/// every transition into a terminal state and when it is dropped.
pub trait SensorHub {
    fn acquire(&mut self, request: SensorRequest);
    fn release(&mut self);
}

/// Hub that only logs. The CLI feeds events from a file instead of hardware.
#[derive(Debug, Default)]
pub struct LogSensorHub {
    active: Option<SensorRequest>,
}

impl LogSensorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<SensorRequest> {
        self.active
    }
}

impl SensorHub for LogSensorHub {
    fn acquire(&mut self, request: SensorRequest) {
        log::info!(
            "[sensors] acquire proximity={} accelerometer={} positioning={}",
            request.needs_proximity(),
            request.needs_accelerometer(),
            request.positioning
        );
        self.active = Some(request);
    }

    fn release(&mut self) {
        if self.active.take().is_some() {
            log::info!("[sensors] released");
        }
    }
}
