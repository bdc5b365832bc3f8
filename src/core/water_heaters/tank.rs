//! Water heater tanks: configuration, control state and the mixed-tank state machine.
//!
//! A tank is advanced from the state saved at the end of the previous timestep, so it can be
//! solved any number of times within a timestep (trial solutions by a coupled heat pump, repeated
//! plant passes) and only [`WaterHeater::commit_timestep`] moves it forward in time.

use crate::compare_floats::{max_of_2, min_of_2};
use crate::core::curves::{modifier, Curve};
use crate::core::environment::{Environment, ZoneIndex};
use crate::core::plant::{PlantNetwork, PortId};
use crate::core::schedule::{ScheduleHandle, ScheduleValues};
use crate::core::water_heaters::node::{Inflow, NodeBalance, SegmentEnergy, ThermalNode};
use crate::core::water_heaters::stratified::StratifiedTank;
use crate::simulation_time::SimulationTimeIteration;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Temperature tolerance used when comparing against control thresholds, in K
pub(crate) const TEMPERATURE_EPSILON: f64 = 1e-6;
/// Intervals shorter than this are treated as having no duration, in s
pub(crate) const TIME_EPSILON: f64 = 1e-9;
/// Mode switches allowed within one timestep before the remainder is solved in the current mode
pub(crate) const MAX_MODE_SWITCHES: usize = 50;
/// Part load fractions below this are treated as this value
const MIN_PART_LOAD_FRACTION: f64 = 0.1;
pub(crate) const MAX_ELEMENTS: usize = 2;

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq, Serialize)]
pub enum TankMode {
    #[default]
    Float,
    Heat,
    Vent,
    Cool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum TankService {
    #[default]
    HotWater,
    ChilledWater,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ControlType {
    #[default]
    Cycle,
    Modulate,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ElementPriority {
    /// Element 1 has priority; element 2 may only fire while element 1 is off.
    #[default]
    MasterSlave,
    Simultaneous,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
#[strum(ascii_case_insensitive)]
pub enum FuelType {
    #[strum(serialize = "Electricity", serialize = "Electric")]
    Electricity,
    #[strum(serialize = "NaturalGas", serialize = "Gas")]
    NaturalGas,
    #[strum(serialize = "Propane", serialize = "LPG", serialize = "PropaneGas")]
    Propane,
    FuelOilNo1,
    FuelOilNo2,
    Diesel,
    Gasoline,
    Coal,
    Steam,
    DistrictHeating,
    OtherFuel1,
    OtherFuel2,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AmbientSource {
    Schedule(ScheduleHandle),
    Zone(ZoneIndex),
    OutdoorAir,
}

/// Heat source coupled to a tank through part load control, by arena index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachedHeatSource {
    HeatPump(usize),
    Desuperheater(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeaterElement {
    /// W; for chilled-water tanks this is the cooling capacity
    pub capacity: f64,
    pub setpoint: ScheduleHandle,
    pub deadband: f64,
    /// Layer heated and sensed by the element (0 for mixed tanks)
    pub layer: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeaterSpec {
    pub control: ControlType,
    pub elements: Vec<HeaterElement>,
    pub priority: ElementPriority,
    /// W, for modulating control
    pub min_capacity: f64,
    pub fuel: FuelType,
    pub efficiency: f64,
    pub part_load_curve: Option<Curve>,
    /// kg/s of use-side flow below which the heater cannot fire
    pub ignition_minimum_flow: f64,
    /// s
    pub ignition_delay: f64,
}

impl HeaterSpec {
    pub(crate) fn can_fire(&self, use_mass_flow: f64) -> bool {
        self.elements.iter().any(|element| element.capacity > 0.)
            && use_mass_flow >= self.ignition_minimum_flow
    }

    fn part_load_fraction(&self, part_load_ratio: f64) -> f64 {
        max_of_2(
            modifier(self.part_load_curve.as_ref(), part_load_ratio, 0.),
            MIN_PART_LOAD_FRACTION,
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParasiticLoad {
    /// W of fuel
    pub fuel_rate: f64,
    pub fuel: Option<FuelType>,
    pub fraction_to_tank: f64,
    pub layer: usize,
}

impl ParasiticLoad {
    pub(crate) fn heat_to_tank(&self) -> f64 {
        self.fuel_rate * self.fraction_to_tank
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LossSpec {
    pub ambient: AmbientSource,
    pub off_cycle_fraction_to_zone: f64,
    pub on_cycle_fraction_to_zone: f64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum InletMode {
    #[default]
    Fixed,
    /// Inflow enters the layer whose temperature is closest to its own.
    Seeking,
}

/// One side (use or source) of a tank.
#[derive(Clone, Debug, PartialEq)]
pub struct TankSide {
    pub inlet_port: Option<PortId>,
    pub outlet_port: Option<PortId>,
    pub effectiveness: f64,
    /// kg/s requested from the plant when the flow is not locked
    pub design_flow: f64,
    /// m3/s, for stand-alone operation
    pub peak_volume_flow: f64,
    pub flow_schedule: Option<ScheduleHandle>,
    pub inlet_temperature_schedule: Option<ScheduleHandle>,
    pub inlet_layer: usize,
    pub outlet_layer: usize,
    pub inlet_mode: InletMode,
}

impl TankSide {
    pub fn unconnected() -> Self {
        Self {
            inlet_port: None,
            outlet_port: None,
            effectiveness: 1.,
            design_flow: 0.,
            peak_volume_flow: 0.,
            flow_schedule: None,
            inlet_temperature_schedule: None,
            inlet_layer: 0,
            outlet_layer: 0,
            inlet_mode: InletMode::Fixed,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TankGeometry {
    Mixed(ThermalNode),
    Stratified(StratifiedTank),
}

impl TankGeometry {
    pub fn nodes(&self) -> &[ThermalNode] {
        match self {
            TankGeometry::Mixed(node) => std::slice::from_ref(node),
            TankGeometry::Stratified(tank) => &tank.layers,
        }
    }

    fn nodes_mut(&mut self) -> &mut [ThermalNode] {
        match self {
            TankGeometry::Mixed(node) => std::slice::from_mut(node),
            TankGeometry::Stratified(tank) => &mut tank.layers,
        }
    }
}

/// Boundary conditions of a tank for one solve.
#[derive(Clone, Debug, PartialEq)]
pub struct TankConditions {
    /// s
    pub timestep: f64,
    pub ambient_temperature: f64,
    pub use_inflow: Inflow,
    pub source_inflow: Inflow,
    /// One per heater element
    pub setpoints: Vec<f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum HeatDelivery {
    /// Into the whole of a mixed tank, or the source-inlet layer of a stratified tank
    #[default]
    SourceInlet,
    /// Split over layers by fraction
    Distributed(Vec<f64>),
}

/// Heat from a coupled heat pump or desuperheater, constant over the timestep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuxiliaryHeat {
    /// W
    pub rate: f64,
    pub delivery: HeatDelivery,
}

impl AuxiliaryHeat {
    pub fn none() -> Self {
        Default::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TankDiagnostic {
    ExcessiveCycling { switches: usize },
    MixingNotConverged { passes: usize },
    Freezing { temperature: f64 },
    SetpointAboveMaximum { setpoint: f64 },
}

/// Control flags carried between timesteps.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TankControlState {
    pub mode: TankMode,
    pub saved_mode: TankMode,
    pub elements_on: [bool; MAX_ELEMENTS],
    pub saved_elements_on: [bool; MAX_ELEMENTS],
    pub ignition_remaining: f64,
    pub saved_ignition_remaining: f64,
}

/// Totals accumulated over the run.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CumulativeCounters {
    pub cycle_on_count: [u64; MAX_ELEMENTS],
    pub heater_energy: f64,
    pub fuel_energy: f64,
    pub vent_energy: f64,
    pub timesteps: u64,
}

/// Reportable results of the last solve. Rates in W, temperatures in deg C.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WaterHeaterReport {
    pub timestep: f64,
    pub loss_rate: f64,
    pub use_rate: f64,
    pub source_rate: f64,
    pub heater_rate: f64,
    pub heater_rates: [f64; MAX_ELEMENTS],
    pub fuel_rate: f64,
    pub fuel_rates: [f64; MAX_ELEMENTS],
    pub vent_rate: f64,
    pub off_cycle_parasitic_fuel_rate: f64,
    pub off_cycle_parasitic_heat_rate: f64,
    pub on_cycle_parasitic_fuel_rate: f64,
    pub on_cycle_parasitic_heat_rate: f64,
    pub unmet_rate: f64,
    pub net_heat_transfer_rate: f64,
    pub auxiliary_heat_rate: f64,
    pub zone_heat_gain_rate: f64,
    pub average_temperature: f64,
    pub final_temperature: f64,
    pub use_outlet_temperature: f64,
    pub source_outlet_temperature: f64,
    pub use_mass_flow: f64,
    pub source_mass_flow: f64,
    pub cycle_on_count: [u32; MAX_ELEMENTS],
    pub runtime_fractions: [f64; MAX_ELEMENTS],
    pub part_load_ratio: f64,
}

/// Everything a solve produces, applied to the tank only when accepted.
#[derive(Clone, Debug, PartialEq)]
pub struct TankStepResult {
    pub final_temperatures: Vec<f64>,
    pub average_temperatures: Vec<f64>,
    pub mode: TankMode,
    pub elements_on: [bool; MAX_ELEMENTS],
    pub ignition_remaining: f64,
    pub report: WaterHeaterReport,
    pub diagnostics: Vec<TankDiagnostic>,
}

/// Energy totals over a timestep, in J, gathered by either tank solver.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct StepTotals {
    pub(crate) energy: SegmentEnergy,
    pub(crate) heater_energy: [f64; MAX_ELEMENTS],
    pub(crate) on_time: [f64; MAX_ELEMENTS],
    pub(crate) cycles: [u32; MAX_ELEMENTS],
    pub(crate) vent_energy: f64,
    pub(crate) unmet_energy: f64,
    pub(crate) on_cycle_time: f64,
    pub(crate) zone_loss_energy: f64,
    pub(crate) auxiliary_energy: f64,
    pub(crate) stored_energy_change: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WaterHeater {
    pub name: String,
    pub service: TankService,
    pub geometry: TankGeometry,
    /// m3
    pub volume: f64,
    pub max_temperature: f64,
    pub heater: HeaterSpec,
    pub on_cycle_parasitic: ParasiticLoad,
    pub off_cycle_parasitic: ParasiticLoad,
    pub losses: LossSpec,
    pub use_side: TankSide,
    pub source_side: TankSide,
    pub heat_source: Option<AttachedHeatSource>,
    pub specific_heat: f64,
    pub state: TankControlState,
    pub report: WaterHeaterReport,
    pub cumulative: CumulativeCounters,
}

impl WaterHeater {
    pub fn is_chilled(&self) -> bool {
        self.service == TankService::ChilledWater
    }

    pub fn nodes(&self) -> &[ThermalNode] {
        self.geometry.nodes()
    }

    /// Volume-weighted tank temperature at the end of the last solve.
    pub fn temperature(&self) -> f64 {
        volume_weighted(self.nodes(), |node| node.temperature)
    }

    pub fn saved_temperature(&self) -> f64 {
        volume_weighted(self.nodes(), |node| node.saved_temperature)
    }

    /// Read the boundary conditions for this solve from the collaborators.
    pub fn resolve_conditions(
        &self,
        schedules: &impl ScheduleValues,
        environment: &impl Environment,
        plant: &mut impl PlantNetwork,
        simtime: &SimulationTimeIteration,
        density: f64,
    ) -> TankConditions {
        let ambient_temperature = match self.losses.ambient {
            AmbientSource::Schedule(handle) => schedules.value(handle, simtime),
            AmbientSource::Zone(zone) => environment.zone_air_temperature(zone),
            AmbientSource::OutdoorAir => environment.outdoor_dry_bulb(),
        };
        let use_inflow = Self::side_inflow(
            &self.use_side,
            schedules,
            plant,
            simtime,
            density,
            Some(environment.mains_water_temperature()),
        );
        let source_inflow =
            Self::side_inflow(&self.source_side, schedules, plant, simtime, density, None);
        let setpoints = self
            .heater
            .elements
            .iter()
            .map(|element| schedules.value(element.setpoint, simtime))
            .collect();

        TankConditions {
            timestep: simtime.timestep_seconds(),
            ambient_temperature,
            use_inflow,
            source_inflow,
            setpoints,
        }
    }

    fn side_inflow(
        side: &TankSide,
        schedules: &impl ScheduleValues,
        plant: &mut impl PlantNetwork,
        simtime: &SimulationTimeIteration,
        density: f64,
        default_inlet_temperature: Option<f64>,
    ) -> Inflow {
        let fraction = side
            .flow_schedule
            .map_or(1., |handle| schedules.value(handle, simtime));
        match side.inlet_port {
            Some(port) => {
                let mass_flow = match plant.locked_flow(port) {
                    Some(flow) => flow,
                    None => plant.request_flow(port, side.design_flow * fraction),
                };
                Inflow::new(mass_flow, plant.boundary_temperature(port))
            }
            None => {
                let temperature = side
                    .inlet_temperature_schedule
                    .map(|handle| schedules.value(handle, simtime))
                    .or(default_inlet_temperature)
                    .unwrap_or_default();
                Inflow::new(
                    max_of_2(side.peak_volume_flow * fraction * density, 0.),
                    temperature,
                )
            }
        }
    }

    /// Solve the timestep without changing the tank.
    pub fn simulate(
        &self,
        conditions: &TankConditions,
        auxiliary: &AuxiliaryHeat,
    ) -> TankStepResult {
        match &self.geometry {
            TankGeometry::Mixed(node) => self.simulate_mixed(node, conditions, auxiliary),
            TankGeometry::Stratified(tank) => tank.simulate(self, conditions, auxiliary),
        }
    }

    pub fn apply(&mut self, result: TankStepResult) {
        for ((node, final_temperature), average_temperature) in self
            .geometry
            .nodes_mut()
            .iter_mut()
            .zip(&result.final_temperatures)
            .zip(&result.average_temperatures)
        {
            node.temperature = *final_temperature;
            node.average_temperature = *average_temperature;
        }
        self.state.mode = result.mode;
        self.state.elements_on = result.elements_on;
        self.state.ignition_remaining = result.ignition_remaining;
        self.report = result.report;
    }

    /// Make the last accepted solve the starting point of the next timestep.
    pub fn commit_timestep(&mut self) {
        for node in self.geometry.nodes_mut() {
            node.saved_temperature = node.temperature;
        }
        self.state.saved_mode = self.state.mode;
        self.state.saved_elements_on = self.state.elements_on;
        self.state.saved_ignition_remaining = self.state.ignition_remaining;

        let report = &self.report;
        for (count, cycles) in self
            .cumulative
            .cycle_on_count
            .iter_mut()
            .zip(report.cycle_on_count)
        {
            *count += cycles as u64;
        }
        self.cumulative.heater_energy += report.heater_rate * report.timestep;
        self.cumulative.fuel_energy += report.fuel_rate * report.timestep;
        self.cumulative.vent_energy += report.vent_rate * report.timestep;
        self.cumulative.timesteps += 1;
    }

    /// Temperature the tank's own control sees, given node temperatures.
    pub fn control_temperature(&self, temperatures: &[f64]) -> f64 {
        match &self.geometry {
            TankGeometry::Mixed(_) => temperatures[0],
            TankGeometry::Stratified(_) => match self.heater.elements.first() {
                Some(element) => temperatures[element.layer.min(temperatures.len() - 1)],
                None => volume_weighted_values(self.nodes(), temperatures),
            },
        }
    }

    pub fn saved_temperatures(&self) -> Vec<f64> {
        self.nodes().iter().map(|node| node.saved_temperature).collect()
    }

    /// Overwrite node temperatures from a persisted state. Returns false, changing nothing,
    /// when the number of values does not match the number of nodes.
    pub(crate) fn restore_temperatures(&mut self, temperatures: &[f64], saved: &[f64]) -> bool {
        let nodes = self.geometry.nodes_mut();
        if temperatures.len() != nodes.len() || saved.len() != nodes.len() {
            return false;
        }
        for ((node, &temperature), &saved_temperature) in
            nodes.iter_mut().zip(temperatures).zip(saved)
        {
            node.temperature = temperature;
            node.average_temperature = temperature;
            node.saved_temperature = saved_temperature;
        }
        true
    }

    fn thresholds(&self, setpoint: f64, deadband: f64) -> (f64, f64) {
        if self.is_chilled() {
            (setpoint, setpoint + deadband)
        } else {
            (setpoint, setpoint - deadband)
        }
    }

    /// The mode to start a timestep in, decided once from the saved temperature.
    fn initial_mode(&self, temperature: f64, setpoint: f64, cut_in: f64, can_fire: bool) -> TankMode {
        let saved = self.state.saved_mode;
        if self.is_chilled() {
            return match saved {
                TankMode::Cool if can_fire && temperature > setpoint + TEMPERATURE_EPSILON => {
                    TankMode::Cool
                }
                _ if can_fire && temperature >= cut_in - TEMPERATURE_EPSILON => TankMode::Cool,
                _ => TankMode::Float,
            };
        }
        if temperature >= self.max_temperature - TEMPERATURE_EPSILON {
            return TankMode::Vent;
        }
        match saved {
            TankMode::Heat if can_fire && temperature < setpoint - TEMPERATURE_EPSILON => {
                TankMode::Heat
            }
            TankMode::Heat if can_fire && self.heater.control == ControlType::Modulate => {
                TankMode::Heat
            }
            _ if can_fire && temperature <= cut_in + TEMPERATURE_EPSILON => TankMode::Heat,
            _ => TankMode::Float,
        }
    }

    fn simulate_mixed(
        &self,
        node: &ThermalNode,
        conditions: &TankConditions,
        auxiliary: &AuxiliaryHeat,
    ) -> TankStepResult {
        let cp = self.specific_heat;
        let capacitance = node.mass * cp;
        let (capacity, deadband) = self
            .heater
            .elements
            .first()
            .map_or((0., 0.), |element| (element.capacity, element.deadband));
        let mut diagnostics = vec![];
        let mut setpoint = conditions.setpoints.first().copied().unwrap_or(0.);
        if !self.is_chilled() && setpoint > self.max_temperature {
            diagnostics.push(TankDiagnostic::SetpointAboveMaximum { setpoint });
            setpoint = self.max_temperature;
        }
        let (setpoint, cut_in) = self.thresholds(setpoint, deadband);
        let can_fire = self.heater.can_fire(conditions.use_inflow.mass_flow);
        let max_temperature = self.max_temperature;

        let balance = |loss_coefficient: f64, heat: f64| NodeBalance {
            capacitance,
            specific_heat: cp,
            loss_coefficient,
            ambient_temperature: conditions.ambient_temperature,
            use_inflow: Inflow::new(
                conditions.use_inflow.mass_flow * self.use_side.effectiveness,
                conditions.use_inflow.temperature,
            ),
            source_inflow: Inflow::new(
                conditions.source_inflow.mass_flow * self.source_side.effectiveness,
                conditions.source_inflow.temperature,
            ),
            neighbours: Default::default(),
            heat,
        };
        let on_heat = self.on_cycle_parasitic.heat_to_tank() + auxiliary.rate;
        let off_heat = self.off_cycle_parasitic.heat_to_tank() + auxiliary.rate;

        let initial_temperature = node.saved_temperature;
        let mut temperature = initial_temperature;
        let mut mode = self.initial_mode(temperature, setpoint, cut_in, can_fire);
        let mut totals = StepTotals::default();
        let mut ignition_remaining = self.state.saved_ignition_remaining;
        if matches!(mode, TankMode::Heat | TankMode::Cool)
            && !matches!(self.state.saved_mode, TankMode::Heat | TankMode::Cool)
        {
            totals.cycles[0] += 1;
            ignition_remaining = self.heater.ignition_delay;
        }

        let mut integral = 0.;
        let mut remaining = conditions.timestep;
        let mut switches = 0;
        // mode left by a switch that took no time, which may not be re-entered at the same instant
        let mut left_at_same_instant: Option<TankMode> = None;
        let mut cycling_reported = false;

        while remaining > TIME_EPSILON {
            let forced = switches >= MAX_MODE_SWITCHES;
            if forced && !cycling_reported {
                diagnostics.push(TankDiagnostic::ExcessiveCycling { switches });
                cycling_reported = true;
            }
            let plan = match mode {
                TankMode::Heat => {
                    let on = balance(node.on_cycle_loss_coefficient, on_heat);
                    if !can_fire {
                        SegmentPlan::switch(TankMode::Float)
                    } else if ignition_remaining > TIME_EPSILON {
                        // output is withheld, but parasitic and auxiliary heat still act
                        let equation = on.equation();
                        SegmentPlan::until_first_crossing(
                            &[(max_temperature, TankMode::Vent)],
                            |target| equation.time_to_reach(temperature, target),
                            min_of_2(remaining, ignition_remaining),
                            0.,
                            forced,
                            None,
                        )
                    } else if temperature >= setpoint - TEMPERATURE_EPSILON {
                        match self.heater.control {
                            ControlType::Cycle => SegmentPlan::switch(TankMode::Float),
                            ControlType::Modulate => {
                                let needed = on.heat_to_hold(setpoint) - on_heat;
                                if needed <= 0. || needed < self.heater.min_capacity {
                                    SegmentPlan::switch(TankMode::Float)
                                } else if needed <= capacity {
                                    SegmentPlan {
                                        end_temperature: Some(setpoint),
                                        ..SegmentPlan::run(remaining, needed)
                                    }
                                } else {
                                    SegmentPlan {
                                        unmet: needed - capacity,
                                        ..SegmentPlan::run(remaining, capacity)
                                    }
                                }
                            }
                        }
                    } else {
                        let equation = balance(on.loss_coefficient, on_heat + capacity).equation();
                        let next = match self.heater.control {
                            ControlType::Cycle => TankMode::Float,
                            ControlType::Modulate => TankMode::Heat,
                        };
                        let crossings = [
                            (setpoint, next),
                            (max_temperature, TankMode::Vent),
                        ];
                        SegmentPlan::until_first_crossing(
                            &crossings,
                            |target| equation.time_to_reach(temperature, target),
                            remaining,
                            capacity,
                            forced,
                            None,
                        )
                    }
                }
                TankMode::Cool => {
                    if !can_fire || temperature <= setpoint + TEMPERATURE_EPSILON {
                        SegmentPlan::switch(TankMode::Float)
                    } else {
                        let equation =
                            balance(node.on_cycle_loss_coefficient, on_heat - capacity).equation();
                        SegmentPlan::until_first_crossing(
                            &[(setpoint, TankMode::Float)],
                            |target| equation.time_to_reach(temperature, target),
                            remaining,
                            capacity,
                            forced,
                            None,
                        )
                    }
                }
                TankMode::Float => {
                    let equation = balance(node.off_cycle_loss_coefficient, off_heat).equation();
                    let mut crossings = vec![];
                    if self.is_chilled() {
                        if can_fire {
                            crossings.push((cut_in, TankMode::Cool));
                        }
                    } else {
                        if can_fire {
                            crossings.push((cut_in, TankMode::Heat));
                        }
                        crossings.push((max_temperature, TankMode::Vent));
                    }
                    SegmentPlan::until_first_crossing(
                        &crossings,
                        |target| equation.time_to_reach(temperature, target),
                        remaining,
                        0.,
                        forced,
                        left_at_same_instant,
                    )
                }
                TankMode::Vent => {
                    let off = balance(node.off_cycle_loss_coefficient, off_heat);
                    let surplus = off_heat - off.heat_to_hold(max_temperature);
                    if surplus > 0. && !self.is_chilled() {
                        SegmentPlan {
                            end_temperature: Some(max_temperature),
                            vent: surplus,
                            ..SegmentPlan::run(remaining, 0.)
                        }
                    } else {
                        SegmentPlan::switch(TankMode::Float)
                    }
                }
            };

            if plan.duration <= TIME_EPSILON {
                let left = mode;
                if let Some(next) = plan.next_mode {
                    if next != mode {
                        left_at_same_instant = Some(mode);
                        if matches!(next, TankMode::Heat | TankMode::Cool) {
                            totals.cycles[0] += 1;
                            ignition_remaining = self.heater.ignition_delay;
                        }
                        mode = next;
                    }
                }
                switches += 1;
                if forced {
                    // only the maximum temperature limit still acts; float out the timestep
                    if mode != TankMode::Vent {
                        mode = TankMode::Float;
                    }
                    left_at_same_instant = Some(left);
                }
                continue;
            }

            let firing = matches!(mode, TankMode::Heat | TankMode::Cool);
            let (loss_coefficient, base_heat) = if firing {
                (node.on_cycle_loss_coefficient, on_heat)
            } else {
                (node.off_cycle_loss_coefficient, off_heat)
            };
            let signed_heater = if mode == TankMode::Cool {
                -plan.heater
            } else {
                plan.heater
            };
            let segment = balance(loss_coefficient, base_heat + signed_heater - plan.vent)
                .advance(temperature, plan.duration);

            integral += segment.temperature_integral;
            totals.energy.accumulate(&segment.energy);
            totals.heater_energy[0] += plan.heater * plan.duration;
            if plan.heater > 0. {
                totals.on_time[0] += plan.duration;
            }
            if firing {
                totals.on_cycle_time += plan.duration;
            }
            totals.vent_energy += plan.vent * plan.duration;
            totals.unmet_energy += plan.unmet * plan.duration;
            totals.auxiliary_energy += auxiliary.rate * plan.duration;
            let fraction_to_zone = if firing {
                self.losses.on_cycle_fraction_to_zone
            } else {
                self.losses.off_cycle_fraction_to_zone
            };
            totals.zone_loss_energy += -segment.energy.ambient * fraction_to_zone;
            if mode == TankMode::Heat && ignition_remaining > TIME_EPSILON {
                ignition_remaining = max_of_2(ignition_remaining - plan.duration, 0.);
            }

            temperature = plan.end_temperature.unwrap_or(segment.final_temperature);
            remaining -= plan.duration;
            left_at_same_instant = None;
            if let Some(next) = plan.next_mode {
                if next != mode {
                    if matches!(next, TankMode::Heat | TankMode::Cool) {
                        totals.cycles[0] += 1;
                        ignition_remaining = self.heater.ignition_delay;
                    }
                    mode = next;
                    switches += 1;
                }
            }
        }

        if self.is_chilled() && temperature < 0. {
            diagnostics.push(TankDiagnostic::Freezing { temperature });
        }
        totals.stored_energy_change = capacitance * (temperature - initial_temperature);
        let average_temperature = if conditions.timestep > 0. {
            integral / conditions.timestep
        } else {
            temperature
        };
        let report = self.build_report(
            conditions,
            &totals,
            average_temperature,
            temperature,
            average_temperature,
            average_temperature,
        );

        TankStepResult {
            final_temperatures: vec![temperature],
            average_temperatures: vec![average_temperature],
            mode,
            elements_on: [matches!(mode, TankMode::Heat | TankMode::Cool), false],
            ignition_remaining,
            report,
            diagnostics,
        }
    }

    /// Turn energy totals over a timestep into reportable rates.
    pub(crate) fn build_report(
        &self,
        conditions: &TankConditions,
        totals: &StepTotals,
        average_temperature: f64,
        final_temperature: f64,
        use_outlet_temperature: f64,
        source_outlet_temperature: f64,
    ) -> WaterHeaterReport {
        let timestep = conditions.timestep;
        let rate = |energy: f64| if timestep > 0. { energy / timestep } else { 0. };
        let efficiency = max_of_2(self.heater.efficiency, f64::EPSILON);

        let mut heater_rates = [0.; MAX_ELEMENTS];
        let mut fuel_rates = [0.; MAX_ELEMENTS];
        let mut runtime_fractions = [0.; MAX_ELEMENTS];
        for (i, element) in self.heater.elements.iter().enumerate().take(MAX_ELEMENTS) {
            heater_rates[i] = rate(totals.heater_energy[i]);
            runtime_fractions[i] = min_of_2(rate(totals.on_time[i]), 1.);
            let part_load_ratio = if element.capacity > 0. {
                heater_rates[i] / element.capacity
            } else {
                0.
            };
            fuel_rates[i] =
                heater_rates[i] / (efficiency * self.heater.part_load_fraction(part_load_ratio));
        }
        let heater_rate: f64 = heater_rates.iter().sum();
        let total_capacity: f64 = self
            .heater
            .elements
            .iter()
            .map(|element| element.capacity)
            .sum();
        let on_fraction = min_of_2(rate(totals.on_cycle_time), 1.);
        let off_fraction = 1. - on_fraction;

        WaterHeaterReport {
            timestep,
            loss_rate: -rate(totals.energy.ambient),
            use_rate: -rate(totals.energy.use_side),
            source_rate: rate(totals.energy.source_side),
            heater_rate,
            heater_rates,
            fuel_rate: fuel_rates.iter().sum(),
            fuel_rates,
            vent_rate: rate(totals.vent_energy),
            off_cycle_parasitic_fuel_rate: self.off_cycle_parasitic.fuel_rate * off_fraction,
            off_cycle_parasitic_heat_rate: self.off_cycle_parasitic.heat_to_tank() * off_fraction,
            on_cycle_parasitic_fuel_rate: self.on_cycle_parasitic.fuel_rate * on_fraction,
            on_cycle_parasitic_heat_rate: self.on_cycle_parasitic.heat_to_tank() * on_fraction,
            unmet_rate: rate(totals.unmet_energy),
            net_heat_transfer_rate: rate(totals.stored_energy_change),
            auxiliary_heat_rate: rate(totals.auxiliary_energy),
            zone_heat_gain_rate: rate(totals.zone_loss_energy),
            average_temperature,
            final_temperature,
            use_outlet_temperature,
            source_outlet_temperature,
            use_mass_flow: conditions.use_inflow.mass_flow,
            source_mass_flow: conditions.source_inflow.mass_flow,
            cycle_on_count: totals.cycles,
            runtime_fractions,
            part_load_ratio: if total_capacity > 0. {
                min_of_2(heater_rate / total_capacity, 1.)
            } else {
                0.
            },
        }
    }

    /// Publish the outlet states of both sides to the plant.
    pub fn update_plant(&self, plant: &mut impl PlantNetwork) {
        if let Some(port) = self.use_side.outlet_port {
            plant.set_outlet_state(
                port,
                self.report.use_mass_flow,
                self.report.use_outlet_temperature,
            );
        }
        if let Some(port) = self.source_side.outlet_port {
            plant.set_outlet_state(
                port,
                self.report.source_mass_flow,
                self.report.source_outlet_temperature,
            );
        }
    }
}

/// How the mixed tank spends the next stretch of the timestep.
#[derive(Clone, Copy, Debug, PartialEq)]
struct SegmentPlan {
    duration: f64,
    /// Heater output magnitude, W
    heater: f64,
    /// Heat vented, W
    vent: f64,
    /// Load the heater could not meet, W
    unmet: f64,
    /// Exact temperature at the end, when the segment ends on a threshold
    end_temperature: Option<f64>,
    next_mode: Option<TankMode>,
}

impl SegmentPlan {
    fn run(duration: f64, heater: f64) -> Self {
        Self {
            duration,
            heater,
            vent: 0.,
            unmet: 0.,
            end_temperature: None,
            next_mode: None,
        }
    }

    fn switch(next: TankMode) -> Self {
        Self {
            next_mode: Some(next),
            ..Self::run(0., 0.)
        }
    }

    /// Run until the earliest threshold crossing, or to the end of the timestep.
    ///
    /// Crossings into `excluded` at zero time are ignored. When `forced`, only the crossing into
    /// `Vent` at the maximum temperature is kept.
    fn until_first_crossing(
        crossings: &[(f64, TankMode)],
        time_to_reach: impl Fn(f64) -> Option<f64>,
        remaining: f64,
        heater: f64,
        forced: bool,
        excluded: Option<TankMode>,
    ) -> Self {
        let first = crossings
            .iter()
            .filter(|&&(_, next)| !forced || next == TankMode::Vent)
            .filter_map(|&(target, next)| {
                time_to_reach(target)
                    .filter(|&time| !(time <= TIME_EPSILON && excluded == Some(next)))
                    .map(|time| (time, target, next))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));

        match first {
            Some((time, target, next)) if time <= remaining => Self {
                end_temperature: Some(target),
                next_mode: Some(next),
                ..Self::run(time, heater)
            },
            _ => Self::run(remaining, heater),
        }
    }
}

pub(crate) fn volume_weighted(nodes: &[ThermalNode], value: impl Fn(&ThermalNode) -> f64) -> f64 {
    let volume: f64 = nodes.iter().map(|node| node.volume).sum();
    if volume <= 0. {
        return nodes.first().map_or(0., value);
    }
    nodes.iter().map(|node| node.volume * value(node)).sum::<f64>() / volume
}

pub(crate) fn volume_weighted_values(nodes: &[ThermalNode], values: &[f64]) -> f64 {
    let volume: f64 = nodes.iter().map(|node| node.volume).sum();
    if volume <= 0. {
        return values.first().copied().unwrap_or_default();
    }
    nodes
        .iter()
        .zip(values)
        .map(|(node, value)| node.volume * value)
        .sum::<f64>()
        / volume
}
