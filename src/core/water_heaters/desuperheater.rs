//! Desuperheaters: heat reclaimed from a refrigeration or air-conditioning condenser and
//! delivered to a tank, controlled on part load ratio like a heat pump water heater.

use crate::compare_floats::max_of_2;
use crate::core::curves::{modifier, Curve};
use crate::core::schedule::ScheduleHandle;
use crate::core::solvers::PartLoadSolution;
use crate::core::water_heaters::heat_pump::{
    decide_mode, solve_coupled_part_load, CoupledSolution, SourceDiagnostic, SourceMode,
};
use crate::core::water_heaters::tank::{
    AuxiliaryHeat, HeatDelivery, TankConditions, WaterHeater,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Highest reclaim efficiency for most sources.
pub const MAX_RECLAIM_EFFICIENCY: f64 = 0.3;
/// Highest reclaim efficiency for refrigeration compressor racks and condensers.
pub const MAX_REFRIGERATION_RECLAIM_EFFICIENCY: f64 = 0.9;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ReclaimSourceKind {
    CompressorRack,
    DxCooling,
    DxMultiSpeed,
    DxMultiMode,
    DxVariableSpeed,
    RefrigerationCondenser,
    WaterToAirHeatPump,
}

impl ReclaimSourceKind {
    pub fn max_efficiency(&self) -> f64 {
        match self {
            ReclaimSourceKind::CompressorRack | ReclaimSourceKind::RefrigerationCondenser => {
                MAX_REFRIGERATION_RECLAIM_EFFICIENCY
            }
            _ => MAX_RECLAIM_EFFICIENCY,
        }
    }
}

/// A source of reject heat that several reclaim coils may draw on.
pub trait HeatReclaim {
    /// Reject heat available this timestep before any reclaim, W
    fn available_heat(&self) -> f64;
    /// Heat already taken this timestep by coils other than `coil`, W
    fn used_by_others(&self, coil: &str) -> f64;
    fn record_use(&mut self, coil: &str, heat: f64);
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeatReclaimSource {
    pub name: String,
    pub kind: ReclaimSourceKind,
    /// W of reject heat, per timestep
    pub reject_heat: ScheduleHandle,
    pub current_reject_heat: f64,
    used: IndexMap<String, f64>,
}

impl HeatReclaimSource {
    pub fn new(name: &str, kind: ReclaimSourceKind, reject_heat: ScheduleHandle) -> Self {
        Self {
            name: name.to_string(),
            kind,
            reject_heat,
            current_reject_heat: 0.,
            used: Default::default(),
        }
    }

    pub fn begin_timestep(&mut self, reject_heat: f64) {
        self.current_reject_heat = max_of_2(reject_heat, 0.);
        self.used.clear();
    }
}

impl HeatReclaim for HeatReclaimSource {
    fn available_heat(&self) -> f64 {
        self.current_reject_heat
    }

    fn used_by_others(&self, coil: &str) -> f64 {
        self.used
            .iter()
            .filter(|(name, _)| name.as_str() != coil)
            .map(|(_, heat)| heat)
            .sum()
    }

    fn record_use(&mut self, coil: &str, heat: f64) {
        self.used.insert(coil.to_string(), heat);
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DesuperheaterState {
    pub mode: SourceMode,
    pub saved_mode: SourceMode,
    pub part_load_ratio: f64,
}

/// Rates in W.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesuperheaterReport {
    pub timestep: f64,
    pub heating_rate: f64,
    pub reclaimed_heat_rate: f64,
    pub pump_power: f64,
    pub on_cycle_parasitic_power: f64,
    pub off_cycle_parasitic_power: f64,
    pub part_load_ratio: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Desuperheater {
    pub name: String,
    pub tank: usize,
    pub source: usize,
    pub availability: Option<ScheduleHandle>,
    pub setpoint: ScheduleHandle,
    pub deadband: f64,
    /// Fraction of reject heat recovered at rated conditions
    pub efficiency: f64,
    /// Efficiency modifier f(inlet water temperature, outdoor air temperature)
    pub efficiency_curve: Option<Curve>,
    /// Above this tank temperature no heat is reclaimed
    pub max_inlet_water_temperature: f64,
    /// W
    pub pump_power: f64,
    pub pump_fraction_to_water: f64,
    pub on_cycle_parasitic_power: f64,
    pub off_cycle_parasitic_power: f64,
    pub state: DesuperheaterState,
    pub report: DesuperheaterReport,
}

impl Desuperheater {
    /// Heat the desuperheater can deliver at full load, W
    pub fn capacity(
        &self,
        source: &impl HeatReclaim,
        water_temperature: f64,
        outdoor_temperature: f64,
    ) -> f64 {
        let reclaimable = max_of_2(source.available_heat() - source.used_by_others(&self.name), 0.);
        let efficiency = self.efficiency
            * modifier(self.efficiency_curve.as_ref(), water_temperature, outdoor_temperature);
        reclaimable * max_of_2(efficiency, 0.) + self.pump_power * self.pump_fraction_to_water
    }

    /// Solve the desuperheater and its tank together without changing either.
    pub fn simulate(
        &self,
        tank: &WaterHeater,
        conditions: &TankConditions,
        source: &impl HeatReclaim,
        setpoint: f64,
        available: bool,
        outdoor_temperature: f64,
    ) -> CoupledSolution {
        let idle = || tank.simulate(conditions, &AuxiliaryHeat::none());
        let off = |tank_result| CoupledSolution {
            tank_result,
            mode: SourceMode::Floating,
            part_load_ratio: 0.,
            speed: None,
            solution: None,
            diagnostics: vec![],
        };

        let saved = tank.saved_temperatures();
        let saved_sensed = tank.control_temperature(&saved);
        let capacity = self.capacity(source, saved_sensed, outdoor_temperature);
        if !available
            || saved_sensed > self.max_inlet_water_temperature
            || source.available_heat() <= 0.
            || capacity <= 0.
        {
            return off(idle());
        }

        let cut_in = setpoint - self.deadband;
        let mut idle_result = None;
        let mode = decide_mode(self.state.saved_mode, saved_sensed, setpoint, cut_in, || {
            let result = idle();
            let sensed = tank.control_temperature(&result.final_temperatures);
            idle_result = Some(result);
            sensed
        });
        if mode == SourceMode::Floating {
            return off(idle_result.unwrap_or_else(idle));
        }

        let (solution, tank_result) = solve_coupled_part_load(
            tank,
            conditions,
            &HeatDelivery::SourceInlet,
            capacity,
            setpoint,
            |temperatures| tank.control_temperature(temperatures),
        );
        let diagnostics = match solution {
            PartLoadSolution::NotConverged {
                plr: part_load_ratio,
                residual,
            } => vec![SourceDiagnostic::NotConverged {
                part_load_ratio,
                residual,
            }],
            _ => vec![],
        };
        CoupledSolution {
            tank_result,
            mode,
            part_load_ratio: solution.part_load_ratio(),
            speed: None,
            solution: Some(solution),
            diagnostics,
        }
    }

    /// Accept a solution, recording the heat taken from the source.
    pub fn apply(
        &mut self,
        solution: &CoupledSolution,
        source: &mut impl HeatReclaim,
        timestep: f64,
        capacity: f64,
    ) {
        let part_load_ratio = solution.part_load_ratio;
        let pump_power = self.pump_power * part_load_ratio;
        let heating_rate = capacity * part_load_ratio;
        let reclaimed_heat_rate = max_of_2(heating_rate - pump_power * self.pump_fraction_to_water, 0.);
        source.record_use(&self.name, reclaimed_heat_rate);

        self.state.mode = solution.mode;
        self.state.part_load_ratio = part_load_ratio;
        self.report = DesuperheaterReport {
            timestep,
            heating_rate,
            reclaimed_heat_rate,
            pump_power,
            on_cycle_parasitic_power: self.on_cycle_parasitic_power * part_load_ratio,
            off_cycle_parasitic_power: self.off_cycle_parasitic_power * (1. - part_load_ratio),
            part_load_ratio,
        };
    }

    pub fn commit_timestep(&mut self) {
        self.state.saved_mode = self.state.mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::ScheduleSet;
    use crate::core::water_heaters::tank::tests::{mixed_tank, still_conditions};
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn schedules() -> ScheduleSet {
        let mut schedules = ScheduleSet::new();
        schedules.add_constant("reject", 10_000.);
        schedules.add_constant("setpoint", 55.);
        schedules
    }

    #[fixture]
    fn source(schedules: ScheduleSet) -> HeatReclaimSource {
        let mut source = HeatReclaimSource::new(
            "Condenser",
            ReclaimSourceKind::DxCooling,
            schedules.handle("reject").unwrap(),
        );
        source.begin_timestep(10_000.);
        source
    }

    #[fixture]
    fn desuperheater(schedules: ScheduleSet) -> Desuperheater {
        Desuperheater {
            name: "Desuperheater".into(),
            tank: 0,
            source: 0,
            availability: None,
            setpoint: schedules.handle("setpoint").unwrap(),
            deadband: 5.,
            efficiency: 0.25,
            efficiency_curve: None,
            max_inlet_water_temperature: 50.,
            pump_power: 100.,
            pump_fraction_to_water: 0.2,
            on_cycle_parasitic_power: 0.,
            off_cycle_parasitic_power: 0.,
            state: Default::default(),
            report: Default::default(),
        }
    }

    #[rstest]
    fn capacity_is_reclaimed_heat_plus_pump_heat(
        desuperheater: Desuperheater,
        source: HeatReclaimSource,
    ) {
        assert_relative_eq!(desuperheater.capacity(&source, 40., 20.), 2500. + 20.);
    }

    #[rstest]
    fn heat_used_by_other_coils_is_not_available(
        desuperheater: Desuperheater,
        mut source: HeatReclaimSource,
    ) {
        source.record_use("Other coil", 6000.);
        source.record_use("Desuperheater", 1000.);

        assert_relative_eq!(source.used_by_others("Desuperheater"), 6000.);
        assert_relative_eq!(desuperheater.capacity(&source, 40., 20.), 1000. + 20.);
    }

    #[rstest]
    fn should_heat_tank_towards_setpoint(desuperheater: Desuperheater, source: HeatReclaimSource) {
        let tank = mixed_tank(0.3, 5., 0., 5., 45.);
        let solution = desuperheater.simulate(&tank, &still_conditions(3600., 60.), &source, 55., true, 20.);

        // 2.5 kW for an hour cannot lift 300 kg by 10 K
        assert_eq!(solution.solution, Some(PartLoadSolution::ClampedToFull));
        assert!(solution.tank_result.final_temperatures[0] > 45.);
        assert_relative_eq!(solution.tank_result.report.auxiliary_heat_rate, 2520.);
    }

    #[rstest]
    fn should_stop_above_max_inlet_temperature(
        desuperheater: Desuperheater,
        source: HeatReclaimSource,
    ) {
        let tank = mixed_tank(0.3, 5., 0., 5., 50.5);
        let solution = desuperheater.simulate(&tank, &still_conditions(3600., 60.), &source, 55., true, 20.);

        assert_eq!(solution.part_load_ratio, 0.);
        assert_eq!(solution.tank_result.report.auxiliary_heat_rate, 0.);
    }

    #[rstest]
    fn unavailable_desuperheater_stays_off(desuperheater: Desuperheater, source: HeatReclaimSource) {
        let tank = mixed_tank(0.3, 5., 0., 5., 40.);
        let solution = desuperheater.simulate(&tank, &still_conditions(3600., 60.), &source, 55., false, 20.);
        assert_eq!(solution.mode, SourceMode::Floating);
    }

    #[rstest]
    fn apply_records_heat_taken_from_source(
        mut desuperheater: Desuperheater,
        mut source: HeatReclaimSource,
    ) {
        let tank = mixed_tank(0.3, 5., 0., 5., 45.);
        let capacity = desuperheater.capacity(&source, 45., 20.);
        let solution = desuperheater.simulate(&tank, &still_conditions(3600., 60.), &source, 55., true, 20.);
        desuperheater.apply(&solution, &mut source, 3600., capacity);

        assert_relative_eq!(desuperheater.report.heating_rate, 2520.);
        assert_relative_eq!(desuperheater.report.reclaimed_heat_rate, 2500.);
        assert_relative_eq!(source.used_by_others("Another coil"), 2500.);
        assert_eq!(desuperheater.state.mode, SourceMode::Heating);
    }

    #[rstest]
    #[case(ReclaimSourceKind::RefrigerationCondenser, 0.9)]
    #[case(ReclaimSourceKind::CompressorRack, 0.9)]
    #[case(ReclaimSourceKind::DxCooling, 0.3)]
    #[case(ReclaimSourceKind::WaterToAirHeatPump, 0.3)]
    fn efficiency_limit_depends_on_source(#[case] kind: ReclaimSourceKind, #[case] limit: f64) {
        assert_eq!(kind.max_efficiency(), limit);
    }
}
