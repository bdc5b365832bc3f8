use crate::core::environment::{Environment, ScheduledEnvironment, ScheduledZone, ZoneIndex};
use crate::core::material_properties::{FluidProperties, Water};
use crate::core::plant::{FixedBoundaryPlant, PortId};
use crate::core::recurring_warnings::RecurringWarnings;
use crate::core::schedule::{ScheduleSet, ScheduleValues};
use crate::core::water_heaters::desuperheater::{Desuperheater, HeatReclaimSource};
use crate::core::water_heaters::heat_pump::{
    AirSource, CondenserLocation, HeatPumpWaterHeater, SourceDiagnostic,
};
use crate::core::water_heaters::node::ThermalNode;
use crate::core::water_heaters::stratified::{
    StratifiedLayout, StratifiedTank, DEFAULT_INVERSION_MIXING_PASSES,
};
use crate::core::water_heaters::tank::{
    AmbientSource, AttachedHeatSource, AuxiliaryHeat, FuelType, HeaterElement, HeaterSpec,
    LossSpec, ParasiticLoad, TankDiagnostic, TankGeometry, TankService, TankSide, WaterHeater,
};
use crate::core::water_use::connections::{ConnectionsOutcome, WaterUseConnections};
use crate::core::water_use::equipment::WaterUseEquipment;
use crate::core::water_use::heat_recovery::DrainHeatRecovery;
use crate::core::water_use::water_storage::WaterStorage;
use crate::errors::{ComponentKind, ConfigurationError, CoreError, DhwError, InputError};
use crate::input::{
    AirSourceInput, AmbientInput, CondenserInput, DesuperheaterInput, HeatPumpWaterHeaterInput,
    Input, ParasiticInput, PlantPortInput, TankGeometryInput, TankSideInput,
    WaterHeaterInput, WaterUseConnectionsInput, WaterUseEquipmentInput,
};
use crate::reporting::{Reporter, RunResults};
use crate::simulation_time::{SimulationTime, SimulationTimeIteration};
use indexmap::IndexMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Number of times the draw circuits and tanks are solved in each timestep. The second pass sees
/// the plant temperatures and flows left by the first.
pub(crate) const PLANT_PASSES: usize = 2;

/// Starting temperature for a tank with no initial temperature and no element setpoint
const FALLBACK_INITIAL_TEMPERATURE: f64 = 20.;

/// Relative tolerance on the sum of stratified layer volumes
const LAYER_VOLUME_TOLERANCE: f64 = 1e-6;

const CONDENSER_FRACTION_TOLERANCE: f64 = 1e-6;

/// Diagnostics from the latest solve of a tank, held until the timestep is accepted.
#[derive(Clone, Debug, Default, PartialEq)]
struct PendingDiagnostics {
    tank: Vec<TankDiagnostic>,
    source: Vec<SourceDiagnostic>,
}

pub struct Corpus {
    pub simulation_time: SimulationTime,
    pub schedules: ScheduleSet,
    pub environment: ScheduledEnvironment,
    pub plant: FixedBoundaryPlant,
    pub water_heaters: Vec<WaterHeater>,
    pub heat_pumps: Vec<HeatPumpWaterHeater>,
    pub desuperheaters: Vec<Desuperheater>,
    pub reclaim_sources: Vec<HeatReclaimSource>,
    pub storages: Vec<WaterStorage>,
    pub equipment: Vec<WaterUseEquipment>,
    pub connections: Vec<WaterUseConnections>,
    pub warnings: RecurringWarnings,
    pub(crate) setup_complete: bool,
    pending: Vec<PendingDiagnostics>,
}

impl Corpus {
    /// Build every component from the input, resolving names to arena indices.
    ///
    /// Problems are collected rather than returned on first sight, so a single run reports every
    /// configuration error in the input.
    pub fn from_inputs(input: &Input) -> Result<Self, DhwError> {
        let mut errors = input.check_bounds();

        let schedules = match ScheduleSet::from_inputs(&input.schedules) {
            Ok(schedules) => schedules,
            Err(mut schedule_errors) => {
                errors.append(&mut schedule_errors);
                ScheduleSet::new()
            }
        };
        let start = input.simulation_time.iter().current_iteration();

        let zone_index = |name: &str| input.environment.zones.get_index_of(name).map(ZoneIndex);
        let environment = environment_from_input(input, &schedules, &mut errors);
        let plant = plant_from_input(&input.plant, &mut errors);

        let storages = input
            .water_storage
            .iter()
            .map(|(name, storage)| {
                WaterStorage::new(
                    name,
                    storage.capacity,
                    storage.initial_volume,
                    schedules.resolve_optional(
                        storage.temperature_schedule.as_deref(),
                        name,
                        &mut errors,
                    ),
                    storage.initial_temperature,
                )
            })
            .collect::<Vec<_>>();

        let reclaim_sources = input
            .heat_reclaim_sources
            .iter()
            .filter_map(|(name, source)| {
                let reject_heat = schedules.resolve(&source.reject_heat, name, &mut errors)?;
                Some(HeatReclaimSource::new(name, source.kind, reject_heat))
            })
            .collect::<Vec<_>>();

        let mut water_heaters = input
            .water_heaters
            .iter()
            .filter_map(|(name, tank)| {
                water_heater_from_input(
                    name,
                    tank,
                    &schedules,
                    &plant,
                    zone_index,
                    &start,
                    &mut errors,
                )
            })
            .collect::<Vec<_>>();

        // owner of each attached tank, by tank index, for duplicate reporting
        let mut attached: IndexMap<usize, String> = Default::default();

        let mut heat_pumps = vec![];
        for (name, heat_pump) in &input.heat_pump_water_heaters {
            let Some(tank) =
                find_index(&input.water_heaters, ComponentKind::WaterHeater, &heat_pump.tank, name, &mut errors)
            else {
                continue;
            };
            let Some(heat_pump) = heat_pump_from_input(
                name,
                heat_pump,
                tank,
                water_heaters.get(tank),
                &schedules,
                zone_index,
                &mut errors,
            ) else {
                continue;
            };
            if attach(
                &mut water_heaters,
                &mut attached,
                tank,
                name,
                AttachedHeatSource::HeatPump(heat_pumps.len()),
                &mut errors,
            ) {
                heat_pumps.push(heat_pump);
            }
        }

        let mut desuperheaters = vec![];
        for (name, desuperheater) in &input.desuperheaters {
            let tank = find_index(
                &input.water_heaters,
                ComponentKind::WaterHeater,
                &desuperheater.tank,
                name,
                &mut errors,
            );
            let source = find_index(
                &input.heat_reclaim_sources,
                ComponentKind::HeatReclaimSource,
                &desuperheater.source,
                name,
                &mut errors,
            );
            let (Some(tank), Some(source)) = (tank, source) else {
                continue;
            };
            let Some(desuperheater) =
                desuperheater_from_input(name, desuperheater, tank, source, input, &schedules, &mut errors)
            else {
                continue;
            };
            if attach(
                &mut water_heaters,
                &mut attached,
                tank,
                name,
                AttachedHeatSource::Desuperheater(desuperheaters.len()),
                &mut errors,
            ) {
                desuperheaters.push(desuperheater);
            }
        }

        let mut equipment = input
            .water_use_equipment
            .iter()
            .map(|(name, fixture)| {
                equipment_from_input(name, fixture, &schedules, zone_index, &mut errors)
            })
            .collect::<Vec<_>>();

        let connections = input
            .water_use_connections
            .iter()
            .enumerate()
            .map(|(index, (name, connections))| {
                connections_from_input(
                    index,
                    name,
                    connections,
                    input,
                    &mut equipment,
                    &schedules,
                    &plant,
                    &mut errors,
                )
            })
            .collect::<Vec<_>>();

        if !errors.is_empty() {
            return Err(InputError(errors).into());
        }

        let pending = vec![Default::default(); water_heaters.len()];
        Ok(Self {
            simulation_time: input.simulation_time,
            schedules,
            environment,
            plant,
            water_heaters,
            heat_pumps,
            desuperheaters,
            reclaim_sources,
            storages,
            equipment,
            connections,
            warnings: RecurringWarnings::new(),
            setup_complete: false,
            pending,
        })
    }

    /// Look up a tank by its cached index, checking the cached index still names it.
    pub fn tank_index(&self, name: &str, cached: usize) -> Result<usize, CoreError> {
        check_cached_index(
            ComponentKind::WaterHeater,
            &self.water_heaters,
            |tank| &tank.name,
            name,
            cached,
        )
    }

    pub fn connections_index(&self, name: &str, cached: usize) -> Result<usize, CoreError> {
        check_cached_index(
            ComponentKind::WaterUseConnections,
            &self.connections,
            |connections| &connections.name,
            name,
            cached,
        )
    }

    /// One-time checks that need schedule values, made on the first timestep.
    fn setup(&mut self, simtime: &SimulationTimeIteration) {
        for heat_pump in &self.heat_pumps {
            let Some(tank) = self.water_heaters.get(heat_pump.tank) else {
                continue;
            };
            let setpoint = self.schedules.value(heat_pump.setpoint, simtime);
            if setpoint > tank.max_temperature {
                warn!(
                    "Heat pump water heater '{}' setpoint {setpoint} C is above the maximum temperature of '{}' ({} C)",
                    heat_pump.name, tank.name, tank.max_temperature
                );
            }
        }
        info!(
            "Simulating {} water heater(s), {} heat pump(s), {} desuperheater(s) and {} draw circuit(s)",
            self.water_heaters.len(),
            self.heat_pumps.len(),
            self.desuperheaters.len(),
            self.connections.len()
        );
        self.setup_complete = true;
    }

    pub fn begin_timestep(&mut self, simtime: &SimulationTimeIteration) {
        if !self.setup_complete {
            self.setup(simtime);
        }
        self.environment.update(&self.schedules, simtime);
        for storage in &mut self.storages {
            storage.begin_timestep(&self.schedules, simtime);
        }
        for source in &mut self.reclaim_sources {
            source.begin_timestep(self.schedules.value(source.reject_heat, simtime));
        }
    }

    fn air_temperature(&self, source: AirSource, simtime: &SimulationTimeIteration) -> f64 {
        match source {
            AirSource::Zone(zone) => self.environment.zone_air_temperature(zone),
            AirSource::OutdoorAir => self.environment.outdoor_dry_bulb(),
            AirSource::Schedule(handle) => self.schedules.value(handle, simtime),
        }
    }

    /// Solve one tank, together with any heat pump or desuperheater attached to it, and publish
    /// its outlets to the plant.
    pub fn advance_tank(
        &mut self,
        index: usize,
        first_pass: bool,
        simtime: &SimulationTimeIteration,
    ) -> Result<(), CoreError> {
        let len = self.water_heaters.len();
        let tank = self.water_heaters.get(index).ok_or(CoreError::InvalidIndex {
            kind: ComponentKind::WaterHeater,
            index,
            len,
        })?;
        let density = Water.density(tank.saved_temperature());
        let conditions =
            tank.resolve_conditions(&self.schedules, &self.environment, &mut self.plant, simtime, density);
        let timestep = conditions.timestep;

        let (result, source_diagnostics) = match tank.heat_source {
            None => (tank.simulate(&conditions, &AuxiliaryHeat::none()), vec![]),
            Some(AttachedHeatSource::HeatPump(heat_pump_index)) => {
                let heat_pump =
                    self.heat_pumps
                        .get(heat_pump_index)
                        .ok_or(CoreError::InvalidIndex {
                            kind: ComponentKind::HeatPumpWaterHeater,
                            index: heat_pump_index,
                            len: self.heat_pumps.len(),
                        })?;
                let setpoint = self.schedules.value(heat_pump.setpoint, simtime);
                let air_temperature = self.air_temperature(heat_pump.air_source, simtime);
                if first_pass {
                    if let Some(&element_setpoint) = conditions.setpoints.first() {
                        if setpoint < element_setpoint {
                            self.warnings.record(
                                &format!("{}: setpoint below element", heat_pump.name),
                                "Heat pump water heater setpoint is below the tank element setpoint, so the element will do the heating",
                                setpoint,
                                || {
                                    format!(
                                        "'{}' setpoint {setpoint} C, element setpoint {element_setpoint} C in '{}'",
                                        heat_pump.name, tank.name
                                    )
                                },
                            );
                        }
                    }
                }
                let solution = heat_pump.simulate(tank, &conditions, setpoint, air_temperature);
                let water_temperature =
                    heat_pump.sensed_temperature(tank, &tank.saved_temperatures());
                self.heat_pumps[heat_pump_index].apply(
                    &solution,
                    timestep,
                    air_temperature,
                    water_temperature,
                );
                (solution.tank_result, solution.diagnostics)
            }
            Some(AttachedHeatSource::Desuperheater(desuperheater_index)) => {
                let desuperheater = self.desuperheaters.get(desuperheater_index).ok_or(
                    CoreError::InvalidIndex {
                        kind: ComponentKind::Desuperheater,
                        index: desuperheater_index,
                        len: self.desuperheaters.len(),
                    },
                )?;
                let source_index = desuperheater.source;
                let source =
                    self.reclaim_sources
                        .get(source_index)
                        .ok_or(CoreError::InvalidIndex {
                            kind: ComponentKind::HeatReclaimSource,
                            index: source_index,
                            len: self.reclaim_sources.len(),
                        })?;
                let setpoint = self.schedules.value(desuperheater.setpoint, simtime);
                let available = desuperheater
                    .availability
                    .map_or(true, |handle| self.schedules.value(handle, simtime) > 0.);
                let outdoor_temperature = self.environment.outdoor_dry_bulb();

                let solution = desuperheater.simulate(
                    tank,
                    &conditions,
                    source,
                    setpoint,
                    available,
                    outdoor_temperature,
                );
                let capacity = desuperheater.capacity(
                    source,
                    tank.control_temperature(&tank.saved_temperatures()),
                    outdoor_temperature,
                );
                self.desuperheaters[desuperheater_index].apply(
                    &solution,
                    &mut self.reclaim_sources[source_index],
                    timestep,
                    capacity,
                );
                (solution.tank_result, solution.diagnostics)
            }
        };

        self.pending[index] = PendingDiagnostics {
            tank: result.diagnostics.clone(),
            source: source_diagnostics,
        };
        let tank = &mut self.water_heaters[index];
        tank.apply(result);
        tank.update_plant(&mut self.plant);
        Ok(())
    }

    /// Solve one draw circuit and publish its return flow to the plant.
    pub fn advance_connections(
        &mut self,
        index: usize,
        first_pass: bool,
        simtime: &SimulationTimeIteration,
    ) -> Result<ConnectionsOutcome, CoreError> {
        let len = self.connections.len();
        let connections = self
            .connections
            .get_mut(index)
            .ok_or(CoreError::InvalidIndex {
                kind: ComponentKind::WaterUseConnections,
                index,
                len,
            })?;
        let outcome = connections.simulate(
            &mut self.equipment,
            &mut self.storages,
            &mut self.plant,
            &self.schedules,
            &self.environment,
            simtime,
            first_pass,
        )?;
        if !outcome.converged {
            let name = &connections.name;
            self.warnings.record(
                &format!("{name}: heat recovery"),
                "Drain water heat recovery temperature did not converge",
                outcome.temperature_error,
                || {
                    format!(
                        "'{name}' still changing by {} C after {} iterations",
                        outcome.temperature_error, outcome.iterations
                    )
                },
            );
        }
        Ok(outcome)
    }

    /// Fixtures on no draw circuit take their supply temperatures from schedules or mains.
    fn simulate_stand_alone_fixtures(&mut self, simtime: &SimulationTimeIteration) {
        let mains = self.environment.mains_water_temperature();
        for fixture in self.equipment.iter_mut().filter(|fixture| fixture.is_stand_alone()) {
            let supply = fixture.stand_alone_supply(&self.schedules, simtime, mains);
            fixture.calculate_mix(supply, &self.schedules, simtime);
            fixture.calculate_drain(&self.environment, &self.schedules, simtime);
            fixture.update_power(supply.cold_temperature);
        }
    }

    fn record_pending_diagnostics(&mut self, simtime: &SimulationTimeIteration) {
        for (tank, pending) in self.water_heaters.iter().zip(&self.pending) {
            let name = tank.name.as_str();
            for diagnostic in &pending.tank {
                match *diagnostic {
                    TankDiagnostic::ExcessiveCycling { switches } => self.warnings.record(
                        &format!("{name}: excessive cycling"),
                        "Water heater switched mode too often within a timestep; the rest of the timestep was solved floating",
                        switches as f64,
                        || format!("'{name}' made {switches} switches in timestep {}", simtime.index),
                    ),
                    TankDiagnostic::MixingNotConverged { passes } => self.warnings.record(
                        &format!("{name}: inversion mixing"),
                        "Stratified tank still had a temperature inversion after the mixing passes",
                        passes as f64,
                        || format!("'{name}' after {passes} passes in timestep {}", simtime.index),
                    ),
                    TankDiagnostic::Freezing { temperature } => self.warnings.record(
                        &format!("{name}: freezing"),
                        "Water heater temperature fell below freezing",
                        temperature,
                        || format!("'{name}' reached {temperature} C in timestep {}", simtime.index),
                    ),
                    TankDiagnostic::SetpointAboveMaximum { setpoint } => self.warnings.record(
                        &format!("{name}: setpoint above maximum"),
                        "Water heater setpoint is above its maximum temperature and was limited",
                        setpoint,
                        || {
                            format!(
                                "'{name}' setpoint {setpoint} C limited to {} C",
                                tank.max_temperature
                            )
                        },
                    ),
                }
            }

            let source_name = match tank.heat_source {
                Some(AttachedHeatSource::HeatPump(index)) => {
                    self.heat_pumps.get(index).map(|heat_pump| heat_pump.name.as_str())
                }
                Some(AttachedHeatSource::Desuperheater(index)) => self
                    .desuperheaters
                    .get(index)
                    .map(|desuperheater| desuperheater.name.as_str()),
                None => None,
            }
            .unwrap_or(name);
            for diagnostic in &pending.source {
                match *diagnostic {
                    SourceDiagnostic::NotConverged {
                        part_load_ratio,
                        residual,
                    } => self.warnings.record(
                        &format!("{source_name}: part load ratio"),
                        "Part load ratio did not converge; the last iterate was used",
                        residual,
                        || {
                            format!(
                                "'{source_name}' part load ratio {part_load_ratio} with residual {residual} C in timestep {}",
                                simtime.index
                            )
                        },
                    ),
                    SourceDiagnostic::SpeedRatioNotFound { speed } => self.warnings.record(
                        &format!("{source_name}: speed ratio"),
                        "Speed ratio could not be bracketed; full speed was used",
                        speed as f64,
                        || format!("'{source_name}' at speed {speed} in timestep {}", simtime.index),
                    ),
                }
            }
        }
    }

    /// Accept the last solve of every component as the start of the next timestep.
    pub fn end_timestep(&mut self, simtime: &SimulationTimeIteration) {
        self.record_pending_diagnostics(simtime);
        for pending in &mut self.pending {
            *pending = Default::default();
        }
        for tank in &mut self.water_heaters {
            tank.commit_timestep();
        }
        for heat_pump in &mut self.heat_pumps {
            heat_pump.commit_timestep();
        }
        for desuperheater in &mut self.desuperheaters {
            desuperheater.commit_timestep();
        }
        for storage in &mut self.storages {
            storage.end_timestep(simtime.timestep_seconds());
        }
    }

    pub fn run_timestep(&mut self, simtime: &SimulationTimeIteration) -> Result<(), CoreError> {
        self.begin_timestep(simtime);
        for pass in 0..PLANT_PASSES {
            let first_pass = pass == 0;
            for index in 0..self.connections.len() {
                if !self.connections[index].is_stand_alone() || first_pass {
                    self.advance_connections(index, first_pass, simtime)?;
                }
            }
            for index in 0..self.water_heaters.len() {
                self.advance_tank(index, first_pass, simtime)?;
            }
        }
        self.simulate_stand_alone_fixtures(simtime);
        self.end_timestep(simtime);
        Ok(())
    }

    pub fn run(&mut self) -> Result<RunResults, CoreError> {
        let mut reporter = Reporter::for_corpus(self);
        for simtime in self.simulation_time.iter() {
            debug!("Timestep {} at hour {}", simtime.index, simtime.time);
            self.run_timestep(&simtime)?;
            reporter.sample(self, &simtime);
        }
        self.warnings.summarise();
        Ok(reporter.finish())
    }
}

fn check_cached_index<T>(
    kind: ComponentKind,
    items: &[T],
    name_of: impl Fn(&T) -> &str,
    expected: &str,
    cached: usize,
) -> Result<usize, CoreError> {
    let item = items.get(cached).ok_or(CoreError::InvalidIndex {
        kind,
        index: cached,
        len: items.len(),
    })?;
    let found = name_of(item);
    if found != expected {
        return Err(CoreError::NameMismatch {
            kind,
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(cached)
}

fn find_index<T>(
    records: &IndexMap<String, T>,
    kind: ComponentKind,
    name: &str,
    referenced_by: &str,
    errors: &mut Vec<ConfigurationError>,
) -> Option<usize> {
    let index = records.get_index_of(name);
    if index.is_none() {
        errors.push(ConfigurationError::UnknownReference {
            kind,
            name: name.to_string(),
            referenced_by: referenced_by.to_string(),
        });
    }
    index
}

fn parse_fuel(
    value: &str,
    referenced_by: &str,
    errors: &mut Vec<ConfigurationError>,
) -> Option<FuelType> {
    match FuelType::from_str(value) {
        Ok(fuel) => Some(fuel),
        Err(_) => {
            errors.push(ConfigurationError::UnrecognisedFuelType {
                value: value.to_string(),
                referenced_by: referenced_by.to_string(),
            });
            None
        }
    }
}

fn resolve_zone(
    zone_index: impl Fn(&str) -> Option<ZoneIndex>,
    name: &str,
    referenced_by: &str,
    errors: &mut Vec<ConfigurationError>,
) -> Option<ZoneIndex> {
    let zone = zone_index(name);
    if zone.is_none() {
        errors.push(ConfigurationError::UnknownReference {
            kind: ComponentKind::Zone,
            name: name.to_string(),
            referenced_by: referenced_by.to_string(),
        });
    }
    zone
}

fn resolve_port(
    plant: &FixedBoundaryPlant,
    name: Option<&str>,
    referenced_by: &str,
    errors: &mut Vec<ConfigurationError>,
) -> Option<PortId> {
    let name = name?;
    let port = plant.port(name);
    if port.is_none() {
        errors.push(ConfigurationError::UnknownReference {
            kind: ComponentKind::PlantPort,
            name: name.to_string(),
            referenced_by: referenced_by.to_string(),
        });
    }
    port
}

fn environment_from_input(
    input: &Input,
    schedules: &ScheduleSet,
    errors: &mut Vec<ConfigurationError>,
) -> ScheduledEnvironment {
    let environment = &input.environment;
    let zones = environment
        .zones
        .iter()
        .filter_map(|(name, zone)| {
            let air_temperature = schedules.resolve(&zone.air_temperature, name, errors);
            let humidity_ratio =
                schedules.resolve_optional(zone.humidity_ratio.as_deref(), name, errors);
            Some(ScheduledZone {
                name: name.clone(),
                air_temperature: air_temperature?,
                humidity_ratio,
                volume: zone.volume,
            })
        })
        .collect();
    let outdoor_dry_bulb = schedules.resolve(&environment.outdoor_dry_bulb, "environment", errors);
    let mains =
        schedules.resolve(&environment.mains_water_temperature, "environment", errors);

    // placeholders stand in for unresolved schedules; the errors stop the build before any use
    let mut fallback = ScheduleSet::new();
    let placeholder = fallback.add_constant("", 0.);
    ScheduledEnvironment::new(
        zones,
        outdoor_dry_bulb.unwrap_or(placeholder),
        mains.unwrap_or(placeholder),
        environment.outdoor_pressure,
    )
}

fn plant_from_input(
    ports: &IndexMap<String, PlantPortInput>,
    errors: &mut Vec<ConfigurationError>,
) -> FixedBoundaryPlant {
    let mut plant = FixedBoundaryPlant::new();
    for (name, port) in ports {
        plant.add_port(name, port.supply_temperature, port.max_flow);
    }
    for (name, port) in ports {
        let Some(link) = port.link.as_deref() else {
            continue;
        };
        if let (Some(from), Some(to)) = (plant.port(name), resolve_port(&plant, Some(link), name, errors)) {
            plant.link(from, to, port.follows_link_flow);
        }
    }
    plant
}

/// Layer holding a component at `height`, or `default` when no height is given. Mixed tanks have
/// a single node.
fn layer_for(geometry: &TankGeometry, height: Option<f64>, default: usize) -> usize {
    match (geometry, height) {
        (TankGeometry::Stratified(tank), Some(height)) => tank.layer_at_height(height),
        (TankGeometry::Stratified(_), None) => default,
        (TankGeometry::Mixed(_), _) => 0,
    }
}

fn geometry_from_input(
    name: &str,
    input: &WaterHeaterInput,
    density: f64,
    initial_temperature: f64,
    errors: &mut Vec<ConfigurationError>,
) -> TankGeometry {
    match &input.geometry {
        TankGeometryInput::Mixed(mixed) => {
            let mut node = ThermalNode::new(0, input.volume, density, initial_temperature);
            node.off_cycle_loss_coefficient = mixed.off_cycle_loss_coefficient;
            node.on_cycle_loss_coefficient = mixed.on_cycle_loss_coefficient;
            TankGeometry::Mixed(node)
        }
        TankGeometryInput::Stratified(stratified) => {
            if input.service == TankService::ChilledWater {
                errors.push(ConfigurationError::InvalidValue {
                    field: "geometry".into(),
                    referenced_by: name.to_string(),
                    reason: "chilled water tanks must be mixed".into(),
                });
            }
            if stratified.additional_loss_coefficients.len() > stratified.layer_count {
                errors.push(ConfigurationError::InvalidValue {
                    field: "additional_loss_coefficients".into(),
                    referenced_by: name.to_string(),
                    reason: format!(
                        "{} values given for {} layers",
                        stratified.additional_loss_coefficients.len(),
                        stratified.layer_count
                    ),
                });
            }
            let layout = StratifiedLayout {
                volume: input.volume,
                height: stratified.height,
                shape: stratified.shape,
                layer_count: stratified.layer_count,
                skin_loss_coefficient: stratified.skin_loss_coefficient,
                additional_conductivity: stratified.additional_conductivity,
                additional_loss_coefficients: stratified.additional_loss_coefficients.clone(),
                off_cycle_flue_loss_coefficient: stratified.off_cycle_flue_loss_coefficient,
                inversion_mixing_passes: stratified
                    .inversion_mixing_passes
                    .unwrap_or(DEFAULT_INVERSION_MIXING_PASSES),
            };
            let tank = StratifiedTank::new(&layout, density, initial_temperature);
            let sum: f64 = tank.layers.iter().map(|layer| layer.volume).sum();
            if (sum - input.volume).abs() > LAYER_VOLUME_TOLERANCE * input.volume {
                errors.push(ConfigurationError::LayerVolumesMismatch {
                    tank: name.to_string(),
                    sum,
                    volume: input.volume,
                });
            }
            TankGeometry::Stratified(tank)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn tank_side_from_input(
    side: &TankSideInput,
    geometry: &TankGeometry,
    default_inlet_layer: usize,
    default_outlet_layer: usize,
    name: &str,
    schedules: &ScheduleSet,
    plant: &FixedBoundaryPlant,
    errors: &mut Vec<ConfigurationError>,
) -> TankSide {
    TankSide {
        inlet_port: resolve_port(plant, side.inlet_port.as_deref(), name, errors),
        outlet_port: resolve_port(plant, side.outlet_port.as_deref(), name, errors),
        effectiveness: side.effectiveness,
        design_flow: side.design_flow,
        peak_volume_flow: side.peak_volume_flow,
        flow_schedule: schedules.resolve_optional(side.flow_schedule.as_deref(), name, errors),
        inlet_temperature_schedule: schedules.resolve_optional(
            side.inlet_temperature_schedule.as_deref(),
            name,
            errors,
        ),
        inlet_layer: layer_for(geometry, side.inlet_height, default_inlet_layer),
        outlet_layer: layer_for(geometry, side.outlet_height, default_outlet_layer),
        inlet_mode: side.inlet_mode,
    }
}

fn parasitic_from_input(
    parasitic: &ParasiticInput,
    geometry: &TankGeometry,
    default_fuel: Option<FuelType>,
    name: &str,
    errors: &mut Vec<ConfigurationError>,
) -> ParasiticLoad {
    let bottom = geometry.nodes().len().saturating_sub(1);
    ParasiticLoad {
        fuel_rate: parasitic.fuel_rate,
        fuel: match parasitic.fuel.as_deref() {
            Some(fuel) => parse_fuel(fuel, name, errors),
            None => default_fuel,
        },
        fraction_to_tank: parasitic.fraction_to_tank,
        layer: layer_for(geometry, parasitic.height, bottom),
    }
}

fn water_heater_from_input(
    name: &str,
    input: &WaterHeaterInput,
    schedules: &ScheduleSet,
    plant: &FixedBoundaryPlant,
    zone_index: impl Fn(&str) -> Option<ZoneIndex>,
    start: &SimulationTimeIteration,
    errors: &mut Vec<ConfigurationError>,
) -> Option<WaterHeater> {
    let error_count = errors.len();
    let fuel = parse_fuel(&input.heater.fuel, name, errors);
    let setpoints = input
        .heater
        .elements
        .iter()
        .map(|element| schedules.resolve(&element.setpoint, name, errors))
        .collect::<Vec<_>>();

    let initial_temperature = input
        .initial_temperature
        .or_else(|| {
            setpoints
                .first()
                .copied()
                .flatten()
                .map(|handle| schedules.value(handle, start))
        })
        .unwrap_or(FALLBACK_INITIAL_TEMPERATURE);
    let density = Water.density(initial_temperature);
    let geometry = geometry_from_input(name, input, density, initial_temperature, errors);

    let layer_count = geometry.nodes().len();
    let bottom = layer_count.saturating_sub(1);
    let element_count = input.heater.elements.len();
    let elements = input
        .heater
        .elements
        .iter()
        .zip(&setpoints)
        .enumerate()
        .filter_map(|(i, (element, setpoint))| {
            // unplaced elements are spread evenly down the tank, first element highest
            let default_layer = ((i + 1) * layer_count / (element_count + 1)).min(bottom);
            Some(HeaterElement {
                capacity: element.capacity,
                setpoint: (*setpoint)?,
                deadband: element.deadband,
                layer: layer_for(&geometry, element.height, default_layer),
            })
        })
        .collect::<Vec<_>>();

    let ambient = match &input.ambient {
        AmbientInput::Schedule { schedule } => {
            schedules.resolve(schedule, name, errors).map(AmbientSource::Schedule)
        }
        AmbientInput::Zone { zone } => {
            resolve_zone(&zone_index, zone, name, errors).map(AmbientSource::Zone)
        }
        AmbientInput::OutdoorAir => Some(AmbientSource::OutdoorAir),
    };

    let on_cycle_parasitic =
        parasitic_from_input(&input.on_cycle_parasitic, &geometry, fuel, name, errors);
    let off_cycle_parasitic =
        parasitic_from_input(&input.off_cycle_parasitic, &geometry, fuel, name, errors);
    let use_side =
        tank_side_from_input(&input.use_side, &geometry, bottom, 0, name, schedules, plant, errors);
    let source_side = tank_side_from_input(
        &input.source_side,
        &geometry,
        0,
        bottom,
        name,
        schedules,
        plant,
        errors,
    );

    if errors.len() > error_count {
        return None;
    }
    let (Some(fuel), Some(ambient)) = (fuel, ambient) else {
        return None;
    };

    Some(WaterHeater {
        name: name.to_string(),
        service: input.service,
        geometry,
        volume: input.volume,
        max_temperature: input.max_temperature,
        heater: HeaterSpec {
            control: input.heater.control,
            elements,
            priority: input.heater.priority,
            min_capacity: input.heater.min_capacity,
            fuel,
            efficiency: input.heater.efficiency,
            part_load_curve: input.heater.part_load_curve.clone(),
            ignition_minimum_flow: input.heater.ignition_minimum_flow,
            ignition_delay: input.heater.ignition_delay,
        },
        on_cycle_parasitic,
        off_cycle_parasitic,
        losses: LossSpec {
            ambient,
            off_cycle_fraction_to_zone: input.off_cycle_fraction_to_zone,
            on_cycle_fraction_to_zone: input.on_cycle_fraction_to_zone,
        },
        use_side,
        source_side,
        heat_source: None,
        specific_heat: Water.specific_heat(initial_temperature),
        state: Default::default(),
        report: Default::default(),
        cumulative: Default::default(),
    })
}

/// Record `source` as the only heat source of the tank at `tank`. Returns false when the tank
/// already has one.
fn attach(
    water_heaters: &mut [WaterHeater],
    attached: &mut IndexMap<usize, String>,
    tank: usize,
    name: &str,
    source: AttachedHeatSource,
    errors: &mut Vec<ConfigurationError>,
) -> bool {
    if let Some(first) = attached.get(&tank) {
        let tank_name = water_heaters
            .get(tank)
            .map_or_else(String::new, |tank| tank.name.clone());
        errors.push(ConfigurationError::DuplicateHeatSource {
            tank: tank_name,
            first: first.clone(),
            second: name.to_string(),
        });
        return false;
    }
    attached.insert(tank, name.to_string());
    if let Some(tank) = water_heaters.get_mut(tank) {
        tank.heat_source = Some(source);
    }
    true
}

fn heat_pump_from_input(
    name: &str,
    input: &HeatPumpWaterHeaterInput,
    tank_index: usize,
    tank: Option<&WaterHeater>,
    schedules: &ScheduleSet,
    zone_index: impl Fn(&str) -> Option<ZoneIndex>,
    errors: &mut Vec<ConfigurationError>,
) -> Option<HeatPumpWaterHeater> {
    let error_count = errors.len();
    let setpoint = schedules.resolve(&input.setpoint, name, errors);
    let air_source = match &input.air_source {
        AirSourceInput::Zone { zone } => {
            resolve_zone(&zone_index, zone, name, errors).map(AirSource::Zone)
        }
        AirSourceInput::OutdoorAir => Some(AirSource::OutdoorAir),
        AirSourceInput::Schedule { schedule } => {
            schedules.resolve(schedule, name, errors).map(AirSource::Schedule)
        }
    };

    let condenser = match &input.condenser {
        CondenserInput::Wrapped { fractions } => {
            let sum: f64 = fractions.iter().sum();
            if (sum - 1.).abs() > CONDENSER_FRACTION_TOLERANCE {
                errors.push(ConfigurationError::CondenserFractionsMismatch {
                    heat_pump: name.to_string(),
                    sum,
                });
            }
            if let Some(TankGeometry::Stratified(stratified)) = tank.map(|tank| &tank.geometry) {
                if fractions.len() != stratified.layers.len() {
                    errors.push(ConfigurationError::InvalidValue {
                        field: "condenser fractions".into(),
                        referenced_by: name.to_string(),
                        reason: format!(
                            "{} fractions given for {} layers",
                            fractions.len(),
                            stratified.layers.len()
                        ),
                    });
                }
            }
            CondenserLocation::Wrapped {
                fractions: fractions.clone(),
            }
        }
        CondenserInput::Pumped => CondenserLocation::Pumped,
    };

    if input.min_air_temperature >= input.max_air_temperature {
        errors.push(ConfigurationError::InvalidValue {
            field: "air temperature limits".into(),
            referenced_by: name.to_string(),
            reason: format!(
                "minimum {} C is not below maximum {} C",
                input.min_air_temperature, input.max_air_temperature
            ),
        });
    }

    let sensors = match tank {
        Some(tank) => input
            .sensors
            .iter()
            .map(|sensor| (layer_for(&tank.geometry, Some(sensor.height), 0), sensor.weight))
            .collect(),
        None => vec![],
    };

    if errors.len() > error_count {
        return None;
    }
    let (Some(setpoint), Some(air_source)) = (setpoint, air_source) else {
        return None;
    };

    Some(HeatPumpWaterHeater {
        name: name.to_string(),
        tank: tank_index,
        speeds: input.speeds.clone(),
        capacity_curve: input.capacity_curve.clone(),
        cop_curve: input.cop_curve.clone(),
        part_load_curve: input.part_load_curve.clone(),
        setpoint,
        deadband: input.deadband,
        min_air_temperature: input.min_air_temperature,
        max_air_temperature: input.max_air_temperature,
        air_source,
        condenser,
        backup_policy: input.backup_policy,
        fan_power: input.fan_power,
        on_cycle_parasitic_power: input.on_cycle_parasitic_power,
        off_cycle_parasitic_power: input.off_cycle_parasitic_power,
        sensors,
        state: Default::default(),
        report: Default::default(),
    })
}

fn desuperheater_from_input(
    name: &str,
    desuperheater: &DesuperheaterInput,
    tank: usize,
    source: usize,
    input: &Input,
    schedules: &ScheduleSet,
    errors: &mut Vec<ConfigurationError>,
) -> Option<Desuperheater> {
    let error_count = errors.len();
    let setpoint = schedules.resolve(&desuperheater.setpoint, name, errors);
    let availability =
        schedules.resolve_optional(desuperheater.availability.as_deref(), name, errors);
    if let Some((_, source)) = input.heat_reclaim_sources.get_index(source) {
        let limit = source.kind.max_efficiency();
        if desuperheater.efficiency > limit {
            errors.push(ConfigurationError::InvalidValue {
                field: "efficiency".into(),
                referenced_by: name.to_string(),
                reason: format!(
                    "{} is above the limit of {limit} for a {:?} source",
                    desuperheater.efficiency, source.kind
                ),
            });
        }
    }

    if errors.len() > error_count {
        return None;
    }

    Some(Desuperheater {
        name: name.to_string(),
        tank,
        source,
        availability,
        setpoint: setpoint?,
        deadband: desuperheater.deadband,
        efficiency: desuperheater.efficiency,
        efficiency_curve: desuperheater.efficiency_curve.clone(),
        max_inlet_water_temperature: desuperheater.max_inlet_water_temperature,
        pump_power: desuperheater.pump_power,
        pump_fraction_to_water: desuperheater.pump_fraction_to_water,
        on_cycle_parasitic_power: desuperheater.on_cycle_parasitic_power,
        off_cycle_parasitic_power: desuperheater.off_cycle_parasitic_power,
        state: Default::default(),
        report: Default::default(),
    })
}

fn equipment_from_input(
    name: &str,
    input: &WaterUseEquipmentInput,
    schedules: &ScheduleSet,
    zone_index: impl Fn(&str) -> Option<ZoneIndex>,
    errors: &mut Vec<ConfigurationError>,
) -> WaterUseEquipment {
    let mut optional = |schedule: &Option<String>| {
        schedules.resolve_optional(schedule.as_deref(), name, errors)
    };
    let flow_schedule = optional(&input.flow_schedule);
    let target_temperature = optional(&input.target_temperature);
    let hot_temperature = optional(&input.hot_temperature);
    let cold_temperature = optional(&input.cold_temperature);
    let sensible_fraction = optional(&input.sensible_fraction);
    let latent_fraction = optional(&input.latent_fraction);

    WaterUseEquipment {
        name: name.to_string(),
        peak_flow: input.peak_flow,
        flow_schedule,
        target_temperature,
        hot_temperature,
        cold_temperature,
        zone: input
            .zone
            .as_deref()
            .and_then(|zone| resolve_zone(&zone_index, zone, name, errors)),
        sensible_fraction,
        latent_fraction,
        connections: None,
        state: Default::default(),
    }
}

#[allow(clippy::too_many_arguments)]
fn connections_from_input(
    index: usize,
    name: &str,
    connections: &WaterUseConnectionsInput,
    input: &Input,
    equipment: &mut [WaterUseEquipment],
    schedules: &ScheduleSet,
    plant: &FixedBoundaryPlant,
    errors: &mut Vec<ConfigurationError>,
) -> WaterUseConnections {
    let mut fixtures = vec![];
    for fixture_name in &connections.equipment {
        let Some(fixture_index) = find_index(
            &input.water_use_equipment,
            ComponentKind::WaterUseEquipment,
            fixture_name,
            name,
            errors,
        ) else {
            continue;
        };
        let Some(fixture) = equipment.get_mut(fixture_index) else {
            continue;
        };
        match fixture.connections {
            Some(first) => errors.push(ConfigurationError::DuplicateFixtureAssignment {
                fixture: fixture_name.clone(),
                first: input
                    .water_use_connections
                    .get_index(first)
                    .map_or_else(String::new, |(first, _)| first.clone()),
                second: name.to_string(),
            }),
            None => {
                fixture.connections = Some(index);
                fixtures.push(fixture_index);
            }
        }
    }

    let storage = |storage: &Option<String>, errors: &mut Vec<ConfigurationError>| {
        storage.as_deref().and_then(|storage| {
            find_index(&input.water_storage, ComponentKind::WaterStorage, storage, name, errors)
        })
    };
    let supply_storage = storage(&connections.supply_storage, errors);
    let recovery_storage = storage(&connections.recovery_storage, errors);

    WaterUseConnections {
        name: name.to_string(),
        inlet_port: resolve_port(plant, connections.inlet_port.as_deref(), name, errors),
        outlet_port: resolve_port(plant, connections.outlet_port.as_deref(), name, errors),
        equipment: fixtures,
        hot_temperature_schedule: schedules.resolve_optional(
            connections.hot_temperature_schedule.as_deref(),
            name,
            errors,
        ),
        cold_temperature_schedule: schedules.resolve_optional(
            connections.cold_temperature_schedule.as_deref(),
            name,
            errors,
        ),
        supply_storage,
        recovery_storage,
        heat_recovery: connections
            .heat_recovery
            .as_ref()
            .map(|recovery| DrainHeatRecovery {
                heat_exchanger: recovery.heat_exchanger,
                ua: recovery.ua,
                configuration: recovery.configuration,
            }),
        state: Default::default(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::water_heaters::heat_pump::SourceMode;
    use crate::input::read_input;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use serde_json::json;

    /// A mixed electric tank feeding a shower and a basin through one draw circuit.
    pub(crate) fn draw_circuit_input() -> serde_json::Value {
        json!({
            "simulation_time": {"start": 0., "end": 24., "step": 0.25},
            "schedules": {
                "Outdoor": 5.,
                "Mains": 10.,
                "Setpoint": 60.,
                "Room": 20.,
                "Shower flow": {"main": [{"value": 0., "repeat": 28}, {"value": 1., "repeat": 2}, {"value": 0., "repeat": 66}]},
                "Basin flow": 0.1,
                "Target": 40.
            },
            "environment": {
                "outdoor_dry_bulb": "Outdoor",
                "mains_water_temperature": "Mains",
                "zones": {"Bathroom": {"air_temperature": "Room", "volume": 20.}}
            },
            "plant": {
                "Draw": {"supply_temperature": 60., "link": "Tank use"},
                "Tank use": {"supply_temperature": 10., "link": "Draw", "follows_link_flow": true}
            },
            "water_heaters": {
                "Cylinder": {
                    "volume": 0.2,
                    "heater": {
                        "elements": [{"capacity": 3000., "setpoint": "Setpoint", "deadband": 5.}],
                        "fuel": "Electricity"
                    },
                    "ambient": {"type": "Zone", "zone": "Bathroom"},
                    "geometry": {
                        "type": "Mixed",
                        "off_cycle_loss_coefficient": 1.5,
                        "on_cycle_loss_coefficient": 1.5
                    },
                    "use_side": {"inlet_port": "Tank use", "outlet_port": "Tank use"}
                }
            },
            "water_use_equipment": {
                "Shower": {
                    "peak_flow": 0.0002,
                    "flow_schedule": "Shower flow",
                    "target_temperature": "Target",
                    "zone": "Bathroom"
                },
                "Basin": {"peak_flow": 0.0001, "flow_schedule": "Basin flow", "target_temperature": "Target"}
            },
            "water_use_connections": {
                "Bathroom circuit": {
                    "inlet_port": "Draw",
                    "outlet_port": "Draw",
                    "equipment": ["Shower", "Basin"]
                }
            }
        })
    }

    pub(crate) fn corpus_from(value: serde_json::Value) -> Result<Corpus, DhwError> {
        let input = read_input(value.to_string().as_bytes())?;
        Corpus::from_inputs(&input)
    }

    fn configuration_errors(value: serde_json::Value) -> Vec<ConfigurationError> {
        match corpus_from(value) {
            Err(DhwError::InvalidInput(InputError(errors))) => errors,
            Err(other) => panic!("expected configuration errors, got {other}"),
            Ok(_) => panic!("expected configuration errors"),
        }
    }

    #[fixture]
    fn corpus() -> Corpus {
        corpus_from(draw_circuit_input()).unwrap()
    }

    #[rstest]
    fn should_build_arenas_in_input_order(corpus: Corpus) {
        assert_eq!(corpus.water_heaters.len(), 1);
        assert_eq!(corpus.connections[0].equipment, vec![0, 1]);
        assert_eq!(corpus.equipment[0].connections, Some(0));
        assert_eq!(corpus.equipment[0].zone, Some(ZoneIndex(0)));
        assert_eq!(corpus.water_heaters[0].nodes()[0].temperature, 60.);
    }

    #[rstest]
    fn should_deliver_the_drawn_hot_water_through_the_tank(mut corpus: Corpus) {
        let simtime = corpus.simulation_time.iter().current_iteration();
        corpus.run_timestep(&simtime).unwrap();

        let tank = &corpus.water_heaters[0];
        let circuit = &corpus.connections[0];
        assert!(circuit.state.hot_mass_flow > 0.);
        assert_relative_eq!(
            tank.report.use_mass_flow,
            circuit.state.hot_mass_flow,
            max_relative = 1e-9
        );
        // the second pass sees the cooled tank rather than the port default
        assert!(circuit.state.hot_temperature < 60.);
        assert!(tank.temperature() < 60.);
    }

    #[rstest]
    fn should_run_a_day_and_keep_the_tank_within_limits(mut corpus: Corpus) {
        let results = corpus.run().unwrap();

        assert_eq!(results.timesteps.len(), 96);
        let tank = &corpus.water_heaters[0];
        assert!(tank.temperature() > 10. && tank.temperature() <= 60. + 1e-6);
        assert!(tank.cumulative.heater_energy > 0.);
        assert_eq!(tank.cumulative.timesteps, 96);
        assert!(corpus.warnings.is_empty());
    }

    #[rstest]
    fn should_collect_every_configuration_error() {
        let mut value = draw_circuit_input();
        value["water_heaters"]["Cylinder"]["heater"]["fuel"] = json!("Whale oil");
        value["water_heaters"]["Cylinder"]["heater"]["elements"][0]["setpoint"] = json!("Missing");
        value["water_use_equipment"]["Shower"]["zone"] = json!("Attic");
        value["water_use_connections"]["Second circuit"] = json!({"equipment": ["Basin"]});

        let errors = configuration_errors(value);

        assert_eq!(
            errors,
            vec![
                ConfigurationError::UnrecognisedFuelType {
                    value: "Whale oil".into(),
                    referenced_by: "Cylinder".into()
                },
                ConfigurationError::UnknownSchedule {
                    name: "Missing".into(),
                    referenced_by: "Cylinder".into()
                },
                ConfigurationError::UnknownReference {
                    kind: ComponentKind::Zone,
                    name: "Attic".into(),
                    referenced_by: "Shower".into()
                },
                ConfigurationError::DuplicateFixtureAssignment {
                    fixture: "Basin".into(),
                    first: "Bathroom circuit".into(),
                    second: "Second circuit".into()
                },
            ]
        );
    }

    fn heat_pump_input() -> serde_json::Value {
        json!({
            "tank": "Cylinder",
            "speeds": [{"capacity": 2000., "cop": 3.}],
            "setpoint": "Setpoint",
            "deadband": 5.,
            "air_source": {"type": "OutdoorAir"},
            "condenser": {"type": "Pumped"}
        })
    }

    #[rstest]
    fn should_reject_a_second_heat_source_on_one_tank() {
        let mut value = draw_circuit_input();
        value["heat_pump_water_heaters"] =
            json!({"Heat pump A": heat_pump_input(), "Heat pump B": heat_pump_input()});

        assert_eq!(
            configuration_errors(value),
            vec![ConfigurationError::DuplicateHeatSource {
                tank: "Cylinder".into(),
                first: "Heat pump A".into(),
                second: "Heat pump B".into()
            }]
        );
    }

    #[rstest]
    fn should_reject_wrapped_fractions_not_summing_to_one() {
        let mut value = draw_circuit_input();
        let mut heat_pump = heat_pump_input();
        heat_pump["condenser"] = json!({"type": "Wrapped", "fractions": [0.5, 0.4]});
        value["heat_pump_water_heaters"] = json!({"Heat pump": heat_pump});

        let errors = configuration_errors(value);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            ConfigurationError::CondenserFractionsMismatch { ref heat_pump, sum }
                if heat_pump == "Heat pump" && (sum - 0.9).abs() < 1e-12
        ));
    }

    #[rstest]
    #[case("CompressorRack", 0.8, true)]
    #[case("DxCooling", 0.8, false)]
    #[case("DxCooling", 0.25, true)]
    fn should_limit_desuperheater_efficiency_by_source(
        #[case] kind: &str,
        #[case] efficiency: f64,
        #[case] valid: bool,
    ) {
        let mut value = draw_circuit_input();
        value["schedules"]["Reject"] = json!(5000.);
        value["heat_reclaim_sources"] = json!({"Condenser": {"kind": kind, "reject_heat": "Reject"}});
        value["desuperheaters"] = json!({
            "Desuperheater": {
                "tank": "Cylinder",
                "source": "Condenser",
                "setpoint": "Setpoint",
                "efficiency": efficiency
            }
        });

        assert_eq!(corpus_from(value).is_ok(), valid);
    }

    #[rstest]
    fn should_reject_stratified_chilled_water_tank() {
        let mut value = draw_circuit_input();
        value["water_heaters"]["Cylinder"]["service"] = json!("ChilledWater");
        value["water_heaters"]["Cylinder"]["geometry"] =
            json!({"type": "Stratified", "height": 1.4, "layer_count": 6});

        let errors = configuration_errors(value);
        assert_eq!(
            errors,
            vec![ConfigurationError::InvalidValue {
                field: "geometry".into(),
                referenced_by: "Cylinder".into(),
                reason: "chilled water tanks must be mixed".into()
            }]
        );
    }

    #[rstest]
    fn should_place_unpositioned_elements_down_a_stratified_tank() {
        let mut value = draw_circuit_input();
        value["water_heaters"]["Cylinder"]["geometry"] =
            json!({"type": "Stratified", "height": 1.4, "layer_count": 6});
        value["water_heaters"]["Cylinder"]["heater"]["elements"] = json!([
            {"capacity": 3000., "setpoint": "Setpoint", "deadband": 5.},
            {"capacity": 3000., "setpoint": "Setpoint", "deadband": 5., "height": 0.1}
        ]);

        let corpus = corpus_from(value).unwrap();
        let tank = &corpus.water_heaters[0];
        assert_eq!(tank.heater.elements[0].layer, 2);
        assert_eq!(tank.heater.elements[1].layer, 5);
        assert_eq!(tank.use_side.inlet_layer, 5);
        assert_eq!(tank.use_side.outlet_layer, 0);
    }

    #[rstest]
    fn should_heat_with_the_heat_pump_instead_of_the_element() {
        let mut value = draw_circuit_input();
        value["schedules"]["Backup"] = json!(40.);
        value["water_heaters"]["Cylinder"]["heater"]["elements"][0]["setpoint"] = json!("Backup");
        value["water_heaters"]["Cylinder"]["initial_temperature"] = json!(45.);
        value["heat_pump_water_heaters"] = json!({"Heat pump": heat_pump_input()});
        let mut corpus = corpus_from(value).unwrap();

        let simtime = corpus.simulation_time.iter().current_iteration();
        corpus.run_timestep(&simtime).unwrap();

        let heat_pump = &corpus.heat_pumps[0];
        assert_eq!(heat_pump.state.mode, SourceMode::Heating);
        assert!(heat_pump.report.heating_rate > 0.);
        assert_eq!(corpus.water_heaters[0].report.heater_rate, 0.);
    }

    #[rstest]
    fn should_check_cached_indices_by_name(corpus: Corpus) {
        assert_eq!(corpus.tank_index("Cylinder", 0), Ok(0));
        assert_eq!(
            corpus.tank_index("Other", 0),
            Err(CoreError::NameMismatch {
                kind: ComponentKind::WaterHeater,
                expected: "Other".into(),
                found: "Cylinder".into()
            })
        );
        assert_eq!(
            corpus.connections_index("Bathroom circuit", 3),
            Err(CoreError::InvalidIndex {
                kind: ComponentKind::WaterUseConnections,
                index: 3,
                len: 1
            })
        );
    }

    #[rstest]
    fn should_fail_on_out_of_range_tank(mut corpus: Corpus) {
        let simtime = corpus.simulation_time.iter().current_iteration();
        assert_eq!(
            corpus.advance_tank(2, true, &simtime),
            Err(CoreError::InvalidIndex {
                kind: ComponentKind::WaterHeater,
                index: 2,
                len: 1
            })
        );
    }

    #[rstest]
    fn should_simulate_stand_alone_fixtures_from_mains() {
        let mut value = draw_circuit_input();
        value["water_use_connections"] = json!({});
        value["water_use_equipment"]["Basin"]["hot_temperature"] = json!("Setpoint");
        let mut corpus = corpus_from(value).unwrap();

        let simtime = corpus.simulation_time.iter().current_iteration();
        corpus.run_timestep(&simtime).unwrap();

        let basin = &corpus.equipment[1];
        assert!(basin.is_stand_alone());
        assert_relative_eq!(basin.state.cold_temperature, 10.);
        assert_relative_eq!(basin.state.mixed_temperature, 40., max_relative = 1e-9);
        assert_relative_eq!(basin.state.hot_mass_flow / basin.state.total_mass_flow, 0.6, max_relative = 1e-9);
    }
}
