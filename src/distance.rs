use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{PositionFix, Timestamp};

/// Mean Earth radius used for the spherical approximation
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default accuracy limit for a fix to count (metres)
pub const DEFAULT_MAX_ACCURACY_M: f64 = 50.0;

/// Default time without an accepted fix before the signal counts as lost
pub const DEFAULT_SIGNAL_LOSS_MS: i64 = 180_000;

/// Great-circle distance in metres between two lat/lon points.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Why a fix was not used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Accuracy worse than the configured limit
    LowAccuracy,
    /// Latitude/longitude not finite or out of range
    InvalidCoordinates,
    /// Older than the last accepted fix
    Stale,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::LowAccuracy => write!(f, "low accuracy"),
            RejectReason::InvalidCoordinates => write!(f, "invalid coordinates"),
            RejectReason::Stale => write!(f, "stale fix"),
        }
    }
}

/// Result of offering a fix to the tracker
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixOutcome {
    Accepted {
        /// First accepted fix of the session
        first: bool,
        /// This fix ended a signal-loss episode
        restored: bool,
        /// Distance added by this fix (metres)
        delta_m: f64,
    },
    Rejected { reason: RejectReason },
}

/// Accumulates distance and speed statistics from accepted position fixes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceTracker {
    pub max_accuracy_m: f64,
    pub signal_loss_after_ms: i64,
    distance_m: f64,
    max_speed: f64,
    average_speed: f64,
    first_fix_at: Option<Timestamp>,
    last_fix: Option<PositionFix>,
    accepted_fixes: u32,
    signal_lost: bool,
}

impl DistanceTracker {
    pub fn new(max_accuracy_m: f64, signal_loss_after_ms: i64) -> Self {
        Self {
            max_accuracy_m,
            signal_loss_after_ms,
            distance_m: 0.0,
            max_speed: 0.0,
            average_speed: 0.0,
            first_fix_at: None,
            last_fix: None,
            accepted_fixes: 0,
            signal_lost: false,
        }
    }

    fn classify(&self, fix: &PositionFix) -> Option<RejectReason> {
        let coordinates_ok = fix.latitude.is_finite()
            && fix.longitude.is_finite()
            && fix.latitude.abs() <= 90.0
            && fix.longitude.abs() <= 180.0;
        if !coordinates_ok {
            return Some(RejectReason::InvalidCoordinates);
        }
        // NaN accuracy fails the comparison and is rejected as well
        if !(fix.accuracy >= 0.0 && fix.accuracy <= self.max_accuracy_m) {
            return Some(RejectReason::LowAccuracy);
        }
        if let Some(last) = &self.last_fix {
            if fix.timestamp < last.timestamp {
                return Some(RejectReason::Stale);
            }
        }
        None
    }

    /// Offer a fix. Rejected fixes leave every statistic untouched.
    pub fn accept(&mut self, fix: &PositionFix) -> FixOutcome {
        if let Some(reason) = self.classify(fix) {
            return FixOutcome::Rejected { reason };
        }

        let restored = std::mem::replace(&mut self.signal_lost, false);
        let first = self.last_fix.is_none();
        let mut delta_m = 0.0;

        if let Some(prev) = &self.last_fix {
            delta_m = haversine_distance(prev.latitude, prev.longitude, fix.latitude, fix.longitude);
            self.distance_m += delta_m;

            let dt_secs = fix.timestamp.saturating_sub(prev.timestamp) as f64 / 1000.0;
            if dt_secs > 0.0 {
                let instant = delta_m / dt_secs;
                if instant > self.max_speed {
                    self.max_speed = instant;
                }
            }
        } else {
            self.first_fix_at = Some(fix.timestamp);
        }

        if let Some(start) = self.first_fix_at {
            let elapsed_secs = fix.timestamp.saturating_sub(start) as f64 / 1000.0;
            if elapsed_secs > 0.0 {
                self.average_speed = self.distance_m / elapsed_secs;
            }
        }

        self.last_fix = Some(fix.clone());
        self.accepted_fixes += 1;

        FixOutcome::Accepted {
            first,
            restored,
            delta_m,
        }
    }

    /// Reports a new signal-loss episode, at most once until the next accepted fix.
    pub fn check_signal(&mut self, now: Timestamp) -> bool {
        if self.signal_lost {
            return false;
        }
        match &self.last_fix {
            Some(last) if now.saturating_sub(last.timestamp) >= self.signal_loss_after_ms => {
                self.signal_lost = true;
                true
            }
            _ => false,
        }
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }

    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    pub fn average_speed(&self) -> f64 {
        self.average_speed
    }

    pub fn last_fix_timestamp(&self) -> Option<Timestamp> {
        self.last_fix.as_ref().map(|f| f.timestamp)
    }

    pub fn last_fix(&self) -> Option<&PositionFix> {
        self.last_fix.as_ref()
    }

    pub fn accepted_fixes(&self) -> u32 {
        self.accepted_fixes
    }

    pub fn is_signal_lost(&self) -> bool {
        self.signal_lost
    }
}

impl Default for DistanceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ACCURACY_M, DEFAULT_SIGNAL_LOSS_MS)
    }
}
