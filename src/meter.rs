//! ==============================================================================
//! meter.rs - measurement source
//! ==============================================================================
//!
//! the analog front-end lives outside this crate. whatever samples voltage and
//! current plugs in through `MeasurementSource`; on a development machine the
//! simulated meter stands in for it.
//!
//! ==============================================================================

use crate::domain::Measurement;
use std::time::Duration;

const SECONDS_PER_HOUR: f64 = 3_600.0;
const WATTS_PER_KILOWATT: f64 = 1_000.0;

pub trait MeasurementSource {
    /// one sample per tick; `energy_delta` covers the time since the last one
    fn next_measurement(&mut self) -> Measurement;
}

/// kWh produced by `power_w` watts held for `interval`
pub fn energy_kwh(power_w: f64, interval: Duration) -> f64 {
    power_w * interval.as_secs_f64() / SECONDS_PER_HOUR / WATTS_PER_KILOWATT
}

/// mains-like readings with a slow load swing
pub struct SimulatedMeter {
    nominal_voltage: f64,
    base_current: f64,
    interval: Duration,
    step: u64,
}

impl SimulatedMeter {
    pub fn new(interval: Duration) -> Self {
        Self {
            nominal_voltage: 230.0,
            base_current: 1.2,
            interval,
            step: 0,
        }
    }
}

impl MeasurementSource for SimulatedMeter {
    fn next_measurement(&mut self) -> Measurement {
        let phase = self.step as f64 / 60.0;
        self.step += 1;

        let voltage = self.nominal_voltage + 2.5 * phase.sin();
        let current = (self.base_current + 0.4 * (phase * 0.5).cos()).max(0.0);
        let power = voltage * current;
        Measurement {
            voltage,
            current,
            power,
            energy_delta: energy_kwh(power, self.interval),
        }
    }
}
