//! Repetition detection from motion and proximity events.
//!
//! Each sensor mode is one variant of [`RepetitionDetector`]. All variants share
//! the same debounce: a repetition closer than the activity's sensor delay to
//! the previous one is swallowed, but the edge that produced it is still
//! consumed so jitter cannot re-trigger it.

use serde::{Deserialize, Serialize};

use crate::types::{ActivityTemplate, MotionEvent, MotionPayload, RepetitionMode, Timestamp};

/// Debounce anchor shared by every counting variant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Debounce {
    pub delay_ms: u32,
    pub last_repetition: Option<Timestamp>,
}

impl Debounce {
    pub fn new(delay_ms: u32) -> Self {
        Self {
            delay_ms,
            last_repetition: None,
        }
    }

    /// Registers a repetition at `now` unless it falls inside the window.
    fn try_fire(&mut self, now: Timestamp) -> bool {
        if self.delay_ms > 0 {
            if let Some(last) = self.last_repetition {
                if now.saturating_sub(last) < self.delay_ms as i64 {
                    return false;
                }
            }
        }
        self.last_repetition = Some(now);
        true
    }
}

/// Which side of the dead band the axis was last seen on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisSide {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityState {
    pub debounce: Debounce,
    pub covered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisState {
    pub debounce: Debounce,
    pub dead_band: f64,
    pub side: Option<AxisSide>,
    /// Cleared when a repetition fires, set again on the negative side.
    pub armed: bool,
}

impl AxisState {
    fn new(delay_ms: u32, dead_band: f64) -> Self {
        Self {
            debounce: Debounce::new(delay_ms),
            dead_band: dead_band.abs(),
            side: None,
            armed: true,
        }
    }

    fn observe(&mut self, value: f64, now: Timestamp) -> bool {
        if !value.is_finite() {
            return false;
        }
        if value > self.dead_band {
            if self.side == Some(AxisSide::Positive) {
                return false;
            }
            self.side = Some(AxisSide::Positive);
            if !self.armed {
                return false;
            }
            self.armed = false;
            self.debounce.try_fire(now)
        } else if value < -self.dead_band {
            self.side = Some(AxisSide::Negative);
            self.armed = true;
            false
        } else {
            false
        }
    }
}

/// Turns motion events into repetition increments, one variant per sensor mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RepetitionDetector {
    Inert,
    Proximity(ProximityState),
    UprightAxis(AxisState),
    FlatAxis(AxisState),
}

impl RepetitionDetector {
    pub fn new(mode: RepetitionMode, delay_ms: u32, dead_band: f64) -> Self {
        match mode {
            RepetitionMode::None => RepetitionDetector::Inert,
            RepetitionMode::Proximity => RepetitionDetector::Proximity(ProximityState {
                debounce: Debounce::new(delay_ms),
                covered: false,
            }),
            RepetitionMode::UprightAxis => RepetitionDetector::UprightAxis(AxisState::new(delay_ms, dead_band)),
            RepetitionMode::FlatAxis => RepetitionDetector::FlatAxis(AxisState::new(delay_ms, dead_band)),
        }
    }

    /// Detector for a template. Templates without repetition bounds get an inert detector.
    pub fn for_template(template: &ActivityTemplate, dead_band: f64) -> Self {
        if !template.uses_repetitions() {
            return RepetitionDetector::Inert;
        }
        Self::new(template.repetition_mode, template.sensor_delay_ms, dead_band)
    }

    pub fn mode(&self) -> RepetitionMode {
        match self {
            RepetitionDetector::Inert => RepetitionMode::None,
            RepetitionDetector::Proximity(_) => RepetitionMode::Proximity,
            RepetitionDetector::UprightAxis(_) => RepetitionMode::UprightAxis,
            RepetitionDetector::FlatAxis(_) => RepetitionMode::FlatAxis,
        }
    }

    /// Feed one event. Returns true when it produced a repetition.
    ///
    /// Payloads that do not match the variant are ignored.
    pub fn observe(&mut self, event: &MotionEvent, now: Timestamp) -> bool {
        match (self, event.payload) {
            (RepetitionDetector::Proximity(state), MotionPayload::Proximity { covered }) => {
                let was_covered = state.covered;
                state.covered = covered;
                if covered && !was_covered {
                    state.debounce.try_fire(now)
                } else {
                    false
                }
            }
            (RepetitionDetector::UprightAxis(state), MotionPayload::Axis { value })
            | (RepetitionDetector::FlatAxis(state), MotionPayload::Axis { value }) => state.observe(value, now),
            _ => false,
        }
    }

    /// Whether this payload kind is meaningful for the detector.
    pub fn accepts(&self, payload: &MotionPayload) -> bool {
        matches!(
            (self, payload),
            (RepetitionDetector::Proximity(_), MotionPayload::Proximity { .. })
                | (RepetitionDetector::UprightAxis(_), MotionPayload::Axis { .. })
                | (RepetitionDetector::FlatAxis(_), MotionPayload::Axis { .. })
        )
    }

    pub fn last_repetition(&self) -> Option<Timestamp> {
        match self {
            RepetitionDetector::Inert => None,
            RepetitionDetector::Proximity(state) => state.debounce.last_repetition,
            RepetitionDetector::UprightAxis(state) | RepetitionDetector::FlatAxis(state) => {
                state.debounce.last_repetition
            }
        }
    }

    /// Manual repetitions move the debounce anchor too.
    pub fn mark_repetition(&mut self, now: Timestamp) {
        match self {
            RepetitionDetector::Inert => {}
            RepetitionDetector::Proximity(state) => state.debounce.last_repetition = Some(now),
            RepetitionDetector::UprightAxis(state) | RepetitionDetector::FlatAxis(state) => {
                state.debounce.last_repetition = Some(now)
            }
        }
    }
}
