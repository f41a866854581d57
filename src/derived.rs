use crate::catalog::{DAILY_PV_ENERGY, TOTAL_BATTERY_DISCHARGE, TOTAL_PV_ENERGY};
use crate::config;
use crate::solarman::session::DecodedSnapshot;

use serde::Serialize;

/// Figures computed from a snapshot rather than read from the inverter.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DerivedMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_co2_saved: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_co2_saved: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_cycles: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_health: Option<f64>,
}

impl DerivedMetrics {
    pub fn compute(snapshot: &DecodedSnapshot, settings: &config::Derived) -> Self {
        let energy = |name: &str| snapshot.get(name).and_then(|v| v.as_f64());

        let cycles = energy(TOTAL_BATTERY_DISCHARGE)
            .filter(|_| settings.battery_capacity_kwh > 0.0)
            .map(|discharged| discharged / settings.battery_capacity_kwh);

        Self {
            daily_co2_saved: energy(DAILY_PV_ENERGY).map(|kwh| round(kwh * settings.co2_factor, 2)),
            total_co2_saved: energy(TOTAL_PV_ENERGY).map(|kwh| round(kwh * settings.co2_factor, 1)),
            battery_cycles: cycles.map(|c| round(c, 1)),
            battery_health: cycles
                .map(|c| (100.0 * (1.0 - c / settings.rated_cycles)).max(0.0))
                .map(|h| round(h, 1)),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn round(x: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (x * factor).round() / factor
}
