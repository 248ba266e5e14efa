//! Workload model for a medium-sized brine/water heat pump.
//!
//! Electricity drawn and heat produced are linear models in forward
//! temperature, brine temperature and compressor RPM, fitted against
//! manufacturer data for a "Thermia Mega"-class machine. The workload is a
//! gear from 1 to 10 mapped linearly onto the compressor RPM range.

use thiserror::Error;
use tracing::warn;

const ELEC_INTERCEPT_COEF: f64 = -5.195751e-01;
const ELEC_RPM_SQUARED_COEF: f64 = 1.375397e-07;
const ELEC_FORWARD_TEMP_COEF: f64 = 3.693311e-02;
const ELEC_FORWARD_TEMP_TIMES_RPM_COEF: f64 = 2.581335e-05;
const HEAT_INTERCEPT_COEF: f64 = 0.520527;
const HEAT_RPM_COEF: f64 = 0.007857;
const HEAT_FORWARD_TEMP_TIMES_RPM_COEF: f64 = -0.000017;
const HEAT_BRINE_TEMP_TIMES_RPM_COEF: f64 = 0.000188;

/// COP from the technical description, achieved at brine 0 C, forward 35 C,
/// 3600 RPM. Pumps with other rated COPs scale their heat output by the
/// ratio against this.
pub const DEFAULT_COP: f64 = 4.6;
pub const DEFAULT_BRINE_TEMP_C: f64 = 0.0;
pub const DEFAULT_FORWARD_TEMP_C: f64 = 55.0;

const RPM_MIN: f64 = 1500.0;
const RPM_MAX: f64 = 6000.0;
const MIN_WORKLOAD: u32 = 1;
const MAX_WORKLOAD: u32 = 10;

#[derive(Debug, Error)]
#[error("workload {0} outside valid range {MIN_WORKLOAD}..={MAX_WORKLOAD}")]
pub struct WorkloadOutOfRange(pub u32);

/// Converts electricity to heat for a building agent.
#[derive(Debug, Clone, Copy)]
pub struct HeatPump {
    pub coeff_of_perf: f64,
}

impl Default for HeatPump {
    fn default() -> Self {
        Self { coeff_of_perf: DEFAULT_COP }
    }
}

impl HeatPump {
    pub fn new(coeff_of_perf: f64) -> Self {
        Self { coeff_of_perf }
    }

    /// Electricity needed (kW) and heat produced (kW) at a given gear.
    /// Workload 0 means the pump is off.
    pub fn calculate_energy(
        &self,
        workload: u32,
        forward_temp_c: f64,
        brine_temp_c: f64,
    ) -> Result<(f64, f64), WorkloadOutOfRange> {
        if workload == 0 {
            return Ok((0.0, 0.0));
        }
        let rpm = map_workload_to_rpm(workload)?;
        let elec = model_elec_needed(forward_temp_c, rpm);
        let heat_normal = model_heat_output(forward_temp_c, rpm, brine_temp_c);
        let heat = heat_normal * self.coeff_of_perf / DEFAULT_COP;
        Ok((elec, heat))
    }

    /// (workload, electricity in, heat out) for the off state and every gear.
    pub fn calculate_for_all_workloads(
        &self,
        forward_temp_c: f64,
        brine_temp_c: f64,
    ) -> Vec<(u32, f64, f64)> {
        (0..=MAX_WORKLOAD)
            .map(|workload| {
                let (elec, heat) = self
                    .calculate_energy(workload, forward_temp_c, brine_temp_c)
                    .expect("workloads 0..=10 are in range");
                (workload, elec, heat)
            })
            .collect()
    }
}

pub fn model_elec_needed(forward_temp_c: f64, rpm: f64) -> f64 {
    if !(RPM_MIN..=RPM_MAX).contains(&rpm) {
        warn!(rpm, "RPM outside the range the electricity model was fitted on");
    }
    if !(35.0..=60.0).contains(&forward_temp_c) {
        warn!(forward_temp_c, "forward temperature outside fitted range");
    }
    ELEC_INTERCEPT_COEF
        + ELEC_RPM_SQUARED_COEF * rpm * rpm
        + ELEC_FORWARD_TEMP_COEF * forward_temp_c
        + ELEC_FORWARD_TEMP_TIMES_RPM_COEF * forward_temp_c * rpm
}

pub fn model_heat_output(forward_temp_c: f64, rpm: f64, brine_temp_c: f64) -> f64 {
    if !(RPM_MIN..=RPM_MAX).contains(&rpm) {
        warn!(rpm, "RPM outside the range the heat model was fitted on");
    }
    if !(-5.0..=5.0).contains(&brine_temp_c) {
        warn!(brine_temp_c, "brine temperature outside fitted range");
    }
    HEAT_INTERCEPT_COEF
        + HEAT_RPM_COEF * rpm
        + HEAT_FORWARD_TEMP_TIMES_RPM_COEF * forward_temp_c * rpm
        + HEAT_BRINE_TEMP_TIMES_RPM_COEF * brine_temp_c * rpm
}

/// Linear mapping of the gear setting onto the compressor RPM range.
pub fn map_workload_to_rpm(workload: u32) -> Result<f64, WorkloadOutOfRange> {
    if !(MIN_WORKLOAD..=MAX_WORKLOAD).contains(&workload) {
        return Err(WorkloadOutOfRange(workload));
    }
    let normalized = (workload - MIN_WORKLOAD) as f64 / (MAX_WORKLOAD - MIN_WORKLOAD) as f64;
    Ok(RPM_MIN + normalized * (RPM_MAX - RPM_MIN))
}
