use serde::{Deserialize, Serialize};

/// Metres per international yard
pub const METRES_PER_YARD: f64 = 0.9144;

const MPS_TO_KMH: f64 = 3.6;
const MPS_TO_MPH: f64 = 2.236_936_292_054_402;

/// Measurement system the host displays values in. Storage is always metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

pub fn to_yards(metres: f64) -> f64 {
    metres / METRES_PER_YARD
}

impl UnitSystem {
    /// Metres into metres or yards.
    pub fn distance(&self, metres: f64) -> f64 {
        match self {
            UnitSystem::Metric => metres,
            UnitSystem::Imperial => to_yards(metres),
        }
    }

    /// Metres per second into km/h or mph.
    pub fn speed(&self, metres_per_sec: f64) -> f64 {
        match self {
            UnitSystem::Metric => metres_per_sec * MPS_TO_KMH,
            UnitSystem::Imperial => metres_per_sec * MPS_TO_MPH,
        }
    }
}
