//! Heat pump water heaters: a heat pump coupled to a tank, controlled on part load ratio.
//!
//! The heat pump has its own setpoint and deadband, sensed in the tank. While heating, the part
//! load ratio is found such that the sensed temperature at the end of the timestep sits on the
//! setpoint, solving the tank afresh for every trial ratio. Multi-speed units first pick the
//! lowest speed that can reach the setpoint and then solve for the ratio between that speed and
//! the one below it.

use crate::compare_floats::{max_of_2, min_of_2};
use crate::core::curves::{modifier, Curve};
use crate::core::environment::ZoneIndex;
use crate::core::schedule::ScheduleHandle;
use crate::core::solvers::{
    find_root_in_bracket, solve_part_load_ratio, PartLoadSolution, PART_LOAD_MAX_ITERATIONS,
    PART_LOAD_TOLERANCE,
};
use crate::core::water_heaters::tank::{
    AuxiliaryHeat, HeatDelivery, TankConditions, TankStepResult, WaterHeater,
};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
pub enum SourceMode {
    #[default]
    Floating,
    Heating,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CondenserLocation {
    /// Condenser wrapped around the tank, output shared over layers by fraction
    Wrapped { fractions: Vec<f64> },
    /// Water pumped through the condenser and returned at the source inlet
    Pumped,
}

impl CondenserLocation {
    pub(crate) fn delivery(&self) -> HeatDelivery {
        match self {
            CondenserLocation::Wrapped { fractions } => HeatDelivery::Distributed(fractions.clone()),
            CondenserLocation::Pumped => HeatDelivery::SourceInlet,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AirSource {
    Zone(ZoneIndex),
    OutdoorAir,
    Schedule(ScheduleHandle),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum BackupElementPolicy {
    Simultaneous,
    /// The heat pump stays off for any timestep in which the tank's element fires
    #[default]
    ElementLocksOutHeatPump,
}

/// Rated performance at one compressor speed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SpeedLevel {
    /// W
    #[validate(exclusive_minimum = 0.)]
    pub capacity: f64,
    #[validate(exclusive_minimum = 0.)]
    pub cop: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SourceDiagnostic {
    NotConverged { part_load_ratio: f64, residual: f64 },
    SpeedRatioNotFound { speed: usize },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct HeatPumpState {
    pub mode: SourceMode,
    pub saved_mode: SourceMode,
    pub part_load_ratio: f64,
    pub speed: usize,
    pub speed_ratio: f64,
}

/// Rates in W.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeatPumpReport {
    pub timestep: f64,
    pub heating_rate: f64,
    pub compressor_power: f64,
    pub fan_power: f64,
    pub on_cycle_parasitic_power: f64,
    pub off_cycle_parasitic_power: f64,
    pub evaporator_heat_rate: f64,
    pub part_load_ratio: f64,
    pub runtime_fraction: f64,
    pub cop: f64,
    /// One-based speed in use, 0 when off
    pub speed: usize,
    pub speed_ratio: f64,
}

impl HeatPumpReport {
    pub fn electric_power(&self) -> f64 {
        self.compressor_power
            + self.fan_power
            + self.on_cycle_parasitic_power
            + self.off_cycle_parasitic_power
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeatPumpWaterHeater {
    pub name: String,
    /// Arena index of the tank heated
    pub tank: usize,
    pub speeds: Vec<SpeedLevel>,
    /// Capacity modifier f(air temperature, water temperature)
    pub capacity_curve: Option<Curve>,
    /// COP modifier f(air temperature, water temperature)
    pub cop_curve: Option<Curve>,
    pub part_load_curve: Option<Curve>,
    pub setpoint: ScheduleHandle,
    pub deadband: f64,
    pub min_air_temperature: f64,
    pub max_air_temperature: f64,
    pub air_source: AirSource,
    pub condenser: CondenserLocation,
    pub backup_policy: BackupElementPolicy,
    /// W
    pub fan_power: f64,
    pub on_cycle_parasitic_power: f64,
    pub off_cycle_parasitic_power: f64,
    /// Sensing layers and weights; empty to sense as the tank's own control does
    pub sensors: Vec<(usize, f64)>,
    pub state: HeatPumpState,
    pub report: HeatPumpReport,
}

/// Outcome of coupling a source to its tank for one timestep.
#[derive(Clone, Debug, PartialEq)]
pub struct CoupledSolution {
    pub tank_result: TankStepResult,
    pub mode: SourceMode,
    pub part_load_ratio: f64,
    /// Zero-based speed index and the ratio towards it from the speed below
    pub speed: Option<(usize, f64)>,
    pub solution: Option<PartLoadSolution>,
    pub diagnostics: Vec<SourceDiagnostic>,
}

/// Solve a tank coupled to a single-capacity source for the part load ratio that puts the sensed
/// temperature on `setpoint`.
pub(crate) fn solve_coupled_part_load(
    tank: &WaterHeater,
    conditions: &TankConditions,
    delivery: &HeatDelivery,
    capacity: f64,
    setpoint: f64,
    sensed: impl Fn(&[f64]) -> f64,
) -> (PartLoadSolution, TankStepResult) {
    let trial = |plr: f64| {
        tank.simulate(
            conditions,
            &AuxiliaryHeat {
                rate: capacity * plr,
                delivery: delivery.clone(),
            },
        )
    };
    let solution = solve_part_load_ratio(
        |plr| sensed(&trial(plr).final_temperatures) - setpoint,
        PART_LOAD_TOLERANCE,
        PART_LOAD_MAX_ITERATIONS,
    );
    (solution, trial(solution.part_load_ratio()))
}

/// Whether a source floating at the start of the timestep should heat: the tank left to itself
/// would fall to the cut-in temperature.
pub(crate) fn decide_mode(
    saved_mode: SourceMode,
    saved_sensed: f64,
    setpoint: f64,
    cut_in: f64,
    idle_final_sensed: impl FnOnce() -> f64,
) -> SourceMode {
    match saved_mode {
        SourceMode::Heating if saved_sensed < setpoint => SourceMode::Heating,
        _ if saved_sensed <= cut_in => SourceMode::Heating,
        _ if idle_final_sensed() <= cut_in => SourceMode::Heating,
        _ => SourceMode::Floating,
    }
}

impl HeatPumpWaterHeater {
    pub fn sensed_temperature(&self, tank: &WaterHeater, temperatures: &[f64]) -> f64 {
        let total_weight: f64 = self.sensors.iter().map(|(_, weight)| weight).sum();
        if self.sensors.is_empty() || total_weight <= 0. {
            return tank.control_temperature(temperatures);
        }
        self.sensors
            .iter()
            .map(|&(layer, weight)| weight * temperatures[layer.min(temperatures.len() - 1)])
            .sum::<f64>()
            / total_weight
    }

    fn capacity_at(&self, speed: usize, air: f64, water: f64) -> f64 {
        self.speeds[speed].capacity * modifier(self.capacity_curve.as_ref(), air, water)
    }

    fn cop_at(&self, speed: usize, air: f64, water: f64) -> f64 {
        self.speeds[speed].cop * modifier(self.cop_curve.as_ref(), air, water)
    }

    /// Solve the heat pump and its tank together for the timestep without changing either.
    pub fn simulate(
        &self,
        tank: &WaterHeater,
        conditions: &TankConditions,
        setpoint: f64,
        air_temperature: f64,
    ) -> CoupledSolution {
        let idle = || tank.simulate(conditions, &AuxiliaryHeat::none());
        let off = |tank_result: TankStepResult, diagnostics| CoupledSolution {
            tank_result,
            mode: SourceMode::Floating,
            part_load_ratio: 0.,
            speed: None,
            solution: None,
            diagnostics,
        };

        let available = !self.speeds.is_empty()
            && air_temperature >= self.min_air_temperature
            && air_temperature <= self.max_air_temperature;
        if !available {
            return off(idle(), vec![]);
        }

        let saved = tank.saved_temperatures();
        let saved_sensed = self.sensed_temperature(tank, &saved);
        let cut_in = setpoint - self.deadband;
        let mut idle_result = None;
        let mode = decide_mode(self.state.saved_mode, saved_sensed, setpoint, cut_in, || {
            let result = idle();
            let sensed = self.sensed_temperature(tank, &result.final_temperatures);
            idle_result = Some(result);
            sensed
        });
        if mode == SourceMode::Floating {
            return off(idle_result.unwrap_or_else(idle), vec![]);
        }

        let delivery = self.condenser.delivery();
        let sensed = |temperatures: &[f64]| self.sensed_temperature(tank, temperatures);
        let mut diagnostics = vec![];
        let solved = if self.speeds.len() == 1 {
            let capacity = self.capacity_at(0, air_temperature, saved_sensed);
            let (solution, tank_result) =
                solve_coupled_part_load(tank, conditions, &delivery, capacity, setpoint, sensed);
            if let PartLoadSolution::NotConverged {
                plr: part_load_ratio,
                residual,
            } = solution
            {
                diagnostics.push(SourceDiagnostic::NotConverged {
                    part_load_ratio,
                    residual,
                });
            }
            CoupledSolution {
                tank_result,
                mode,
                part_load_ratio: solution.part_load_ratio(),
                speed: Some((0, 1.)),
                solution: Some(solution),
                diagnostics,
            }
        } else {
            self.solve_multi_speed(tank, conditions, &delivery, setpoint, air_temperature, saved_sensed, mode)
        };

        if self.backup_policy == BackupElementPolicy::ElementLocksOutHeatPump
            && solved.part_load_ratio > 0.
            && solved.tank_result.report.heater_rate > 0.
        {
            debug!("{}: tank element fired, heat pump locked out", self.name);
            return off(idle(), solved.diagnostics);
        }
        solved
    }

    #[allow(clippy::too_many_arguments)]
    fn solve_multi_speed(
        &self,
        tank: &WaterHeater,
        conditions: &TankConditions,
        delivery: &HeatDelivery,
        setpoint: f64,
        air: f64,
        water: f64,
        mode: SourceMode,
    ) -> CoupledSolution {
        let sensed = |temperatures: &[f64]| self.sensed_temperature(tank, temperatures);
        let run_at = |rate: f64| {
            tank.simulate(
                conditions,
                &AuxiliaryHeat {
                    rate,
                    delivery: delivery.clone(),
                },
            )
        };
        let mut diagnostics = vec![];

        // cycle the lowest speed on and off when it is enough on its own
        let lowest = self.capacity_at(0, air, water);
        let lowest_full = run_at(lowest);
        if sensed(&lowest_full.final_temperatures) >= setpoint {
            let (solution, tank_result) =
                solve_coupled_part_load(tank, conditions, delivery, lowest, setpoint, sensed);
            if let PartLoadSolution::NotConverged {
                plr: part_load_ratio,
                residual,
            } = solution
            {
                diagnostics.push(SourceDiagnostic::NotConverged {
                    part_load_ratio,
                    residual,
                });
            }
            return CoupledSolution {
                tank_result,
                mode,
                part_load_ratio: solution.part_load_ratio(),
                speed: Some((0, 1.)),
                solution: Some(solution),
                diagnostics,
            };
        }

        let top = self.speeds.len() - 1;
        let reaching = (1..=top).find(|&speed| {
            sensed(&run_at(self.capacity_at(speed, air, water)).final_temperatures) >= setpoint
        });
        let Some(speed) = reaching else {
            return CoupledSolution {
                tank_result: run_at(self.capacity_at(top, air, water)),
                mode,
                part_load_ratio: 1.,
                speed: Some((top, 1.)),
                solution: Some(PartLoadSolution::ClampedToFull),
                diagnostics,
            };
        };

        let lower = self.capacity_at(speed - 1, air, water);
        let upper = self.capacity_at(speed, air, water);
        let interpolated = |ratio: f64| (1. - ratio) * lower + ratio * upper;
        let ratio = match find_root_in_bracket(
            |ratio| sensed(&run_at(interpolated(ratio)).final_temperatures) - setpoint,
            0.,
            1.,
            PART_LOAD_TOLERANCE,
            PART_LOAD_MAX_ITERATIONS,
        ) {
            Ok(ratio) => ratio.clamp(0., 1.),
            Err(_) => {
                diagnostics.push(SourceDiagnostic::SpeedRatioNotFound { speed: speed + 1 });
                1.
            }
        };

        CoupledSolution {
            tank_result: run_at(interpolated(ratio)),
            mode,
            part_load_ratio: 1.,
            speed: Some((speed, ratio)),
            solution: None,
            diagnostics,
        }
    }

    /// Accept a solution: record the heat pump's own state and report.
    pub fn apply(&mut self, solution: &CoupledSolution, timestep: f64, air_temperature: f64, water_temperature: f64) {
        self.state.mode = solution.mode;
        self.state.part_load_ratio = solution.part_load_ratio;
        self.report = match solution.speed {
            Some((speed, ratio)) if solution.part_load_ratio > 0. => {
                let (capacity, cop) = if speed == 0 || ratio >= 1. {
                    (
                        self.capacity_at(speed, air_temperature, water_temperature),
                        self.cop_at(speed, air_temperature, water_temperature),
                    )
                } else {
                    let blend = |low: f64, high: f64| (1. - ratio) * low + ratio * high;
                    (
                        blend(
                            self.capacity_at(speed - 1, air_temperature, water_temperature),
                            self.capacity_at(speed, air_temperature, water_temperature),
                        ),
                        blend(
                            self.cop_at(speed - 1, air_temperature, water_temperature),
                            self.cop_at(speed, air_temperature, water_temperature),
                        ),
                    )
                };
                let part_load_ratio = solution.part_load_ratio;
                let part_load_fraction = max_of_2(
                    modifier(self.part_load_curve.as_ref(), part_load_ratio, 0.),
                    0.1,
                );
                let runtime_fraction = min_of_2(part_load_ratio / part_load_fraction, 1.);
                let heating_rate = capacity * part_load_ratio;
                let compressor_power = if cop > 0. {
                    capacity / cop * runtime_fraction
                } else {
                    0.
                };
                self.state.speed = speed + 1;
                self.state.speed_ratio = ratio;
                HeatPumpReport {
                    timestep,
                    heating_rate,
                    compressor_power,
                    fan_power: self.fan_power * runtime_fraction,
                    on_cycle_parasitic_power: self.on_cycle_parasitic_power * runtime_fraction,
                    off_cycle_parasitic_power: self.off_cycle_parasitic_power
                        * (1. - runtime_fraction),
                    evaporator_heat_rate: max_of_2(heating_rate - compressor_power, 0.),
                    part_load_ratio,
                    runtime_fraction,
                    cop,
                    speed: speed + 1,
                    speed_ratio: ratio,
                }
            }
            _ => {
                self.state.speed = 0;
                self.state.speed_ratio = 0.;
                HeatPumpReport {
                    timestep,
                    off_cycle_parasitic_power: self.off_cycle_parasitic_power,
                    ..Default::default()
                }
            }
        };
    }

    pub fn commit_timestep(&mut self) {
        self.state.saved_mode = self.state.mode;
    }
}
