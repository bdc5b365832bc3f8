//! A draw circuit: the fixtures served by one hot water supply, their combined drain and the
//! optional drain water heat recovery that preheats the cold water.
//!
//! With heat recovery feeding the fixtures' cold supply the fixture mix depends on the recovered
//! temperature, which in turn depends on the mix, so the flows, drain and recovery are iterated
//! until the cold supply temperature settles.

use crate::core::environment::Environment;
use crate::core::material_properties::{FluidProperties, Water};
use crate::core::plant::{PlantNetwork, PortId};
use crate::core::schedule::{ScheduleHandle, ScheduleValues};
use crate::core::solvers::iterate_until;
use crate::core::units::WATER_USE_INIT_TEMPERATURE;
use crate::core::water_use::equipment::{Supply, WaterUseEquipment};
use crate::core::water_use::heat_recovery::{
    DrainHeatRecovery, HeatRecoveryConfiguration, RecoveryFlows,
};
use crate::core::water_use::water_storage::WaterStorage;
use crate::errors::{ComponentKind, CoreError};
use crate::simulation_time::SimulationTimeIteration;

/// Change in the recovered cold water temperature, in deg C, below which the iteration stops
pub const RECOVERY_TOLERANCE: f64 = 0.1;
pub const RECOVERY_MAX_ITERATIONS: usize = 100;

/// Flows in kg/s (volume in m3/s), rates in W.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionsState {
    pub cold_supply_temperature: f64,
    pub cold_temperature: f64,
    pub hot_temperature: f64,
    pub drain_temperature: f64,
    pub recovery_temperature: f64,
    pub waste_temperature: f64,
    pub return_temperature: f64,
    pub hot_mass_flow: f64,
    pub cold_mass_flow: f64,
    pub total_mass_flow: f64,
    pub drain_mass_flow: f64,
    pub recovery_mass_flow: f64,
    pub hot_volume_flow: f64,
    pub cold_volume_flow: f64,
    pub total_volume_flow: f64,
    pub drain_volume_flow: f64,
    /// Cold water drawn from the supply storage
    pub tank_volume_flow: f64,
    pub tank_mass_flow: f64,
    /// Peak flow of every fixture together, offered to the plant as the design flow
    pub design_mass_flow: f64,
    pub effectiveness: f64,
    pub recovery_rate: f64,
    pub temperature_error: f64,
    pub power: f64,
    pub timestep: f64,
}

/// How the recovery iteration ended.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConnectionsOutcome {
    pub iterations: usize,
    pub converged: bool,
    pub temperature_error: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WaterUseConnections {
    pub name: String,
    pub inlet_port: Option<PortId>,
    pub outlet_port: Option<PortId>,
    /// Arena indices of the fixtures on this circuit
    pub equipment: Vec<usize>,
    pub hot_temperature_schedule: Option<ScheduleHandle>,
    pub cold_temperature_schedule: Option<ScheduleHandle>,
    pub supply_storage: Option<usize>,
    pub recovery_storage: Option<usize>,
    pub heat_recovery: Option<DrainHeatRecovery>,
    pub state: ConnectionsState,
}

impl WaterUseConnections {
    pub fn is_stand_alone(&self) -> bool {
        self.inlet_port.is_none()
    }

    fn check_indices(
        &self,
        equipment_count: usize,
        storage_count: usize,
    ) -> Result<(), CoreError> {
        if let Some(&index) = self.equipment.iter().find(|&&index| index >= equipment_count) {
            return Err(CoreError::InvalidIndex {
                kind: ComponentKind::WaterUseEquipment,
                index,
                len: equipment_count,
            });
        }
        for index in [self.supply_storage, self.recovery_storage]
            .into_iter()
            .flatten()
        {
            if index >= storage_count {
                return Err(CoreError::InvalidIndex {
                    kind: ComponentKind::WaterStorage,
                    index,
                    len: storage_count,
                });
            }
        }
        Ok(())
    }

    /// Simulate the circuit for one pass of the timestep and report the outlet to the plant.
    ///
    /// On passes after the first, a hot flow the plant could not fully deliver is shared out
    /// by scaling every fixture's hot flow by the same ratio.
    #[allow(clippy::too_many_arguments)]
    pub fn simulate(
        &mut self,
        fixtures: &mut [WaterUseEquipment],
        storages: &mut [WaterStorage],
        plant: &mut impl PlantNetwork,
        schedules: &impl ScheduleValues,
        environment: &impl Environment,
        simtime: &SimulationTimeIteration,
        first_pass: bool,
    ) -> Result<ConnectionsOutcome, CoreError> {
        self.check_indices(fixtures.len(), storages.len())?;
        self.initialise(storages, plant, schedules, environment, simtime);
        self.state.design_mass_flow = self.design_mass_flow(fixtures);

        let result = iterate_until(RECOVERY_MAX_ITERATIONS, RECOVERY_TOLERANCE, |_| {
            self.calculate_flows(fixtures, storages, plant, schedules, simtime, first_pass);
            self.calculate_drain(fixtures, environment, schedules, simtime);
            self.calculate_recovery(storages);
            ((), self.state.temperature_error)
        });
        let outcome = match result {
            Ok(converged) => ConnectionsOutcome {
                iterations: converged.iterations,
                converged: true,
                temperature_error: self.state.temperature_error,
            },
            Err(last) => ConnectionsOutcome {
                iterations: last.iterations,
                converged: false,
                temperature_error: last.error,
            },
        };

        if let Some(port) = self.outlet_port {
            plant.set_outlet_state(port, self.state.hot_mass_flow, self.state.return_temperature);
        }
        self.update_power(fixtures);

        Ok(outcome)
    }

    pub fn design_mass_flow(&self, fixtures: &[WaterUseEquipment]) -> f64 {
        self.sum(fixtures, |fixture| fixture.peak_flow) * Water.density(WATER_USE_INIT_TEMPERATURE)
    }

    fn initialise(
        &mut self,
        storages: &[WaterStorage],
        plant: &impl PlantNetwork,
        schedules: &impl ScheduleValues,
        environment: &impl Environment,
        simtime: &SimulationTimeIteration,
    ) {
        let cold_supply = match (self.supply_storage, self.cold_temperature_schedule) {
            (Some(storage), _) => storages[storage].temperature,
            (None, Some(handle)) => schedules.value(handle, simtime),
            (None, None) => environment.mains_water_temperature(),
        };
        let hot_temperature = match self.inlet_port {
            Some(port) => plant.boundary_temperature(port),
            None => self
                .hot_temperature_schedule
                .map_or(cold_supply, |handle| schedules.value(handle, simtime)),
        };

        self.state = ConnectionsState {
            cold_supply_temperature: cold_supply,
            cold_temperature: cold_supply,
            hot_temperature,
            recovery_temperature: cold_supply,
            return_temperature: cold_supply,
            timestep: simtime.timestep_seconds(),
            ..Default::default()
        };
    }

    fn calculate_flows(
        &mut self,
        fixtures: &mut [WaterUseEquipment],
        storages: &mut [WaterStorage],
        plant: &mut impl PlantNetwork,
        schedules: &impl ScheduleValues,
        simtime: &SimulationTimeIteration,
        first_pass: bool,
    ) {
        let supply = Supply {
            cold_temperature: self.state.cold_temperature,
            hot_temperature: self.state.hot_temperature,
        };
        for &index in &self.equipment {
            fixtures[index].calculate_mix(supply, schedules, simtime);
        }
        let desired_hot = self.sum(fixtures, |fixture| fixture.state.hot_mass_flow);
        let total = self.sum(fixtures, |fixture| fixture.state.total_mass_flow);

        let hot = match self.inlet_port {
            Some(port) => {
                let granted = plant.request_flow(port, desired_hot);
                if !first_pass && granted != desired_hot && desired_hot > 0. {
                    let ratio = granted / desired_hot;
                    for &index in &self.equipment {
                        fixtures[index].scale_hot_flow(ratio);
                    }
                }
                granted
            }
            None => desired_hot,
        };

        let density = Water.density(WATER_USE_INIT_TEMPERATURE);
        let state = &mut self.state;
        state.hot_mass_flow = hot;
        state.total_mass_flow = total;
        state.cold_mass_flow = total - hot;
        state.hot_volume_flow = hot / density;
        state.cold_volume_flow = state.cold_mass_flow / density;
        state.total_volume_flow = total / density;

        if let Some(storage) = self.supply_storage {
            let storage = &mut storages[storage];
            storage.request(&self.name, state.cold_volume_flow);
            state.tank_volume_flow = storage.available(&self.name);
            state.tank_mass_flow = state.tank_volume_flow * density;
        }
    }

    fn calculate_drain(
        &mut self,
        fixtures: &mut [WaterUseEquipment],
        environment: &impl Environment,
        schedules: &impl ScheduleValues,
        simtime: &SimulationTimeIteration,
    ) {
        let mut drain_mass_flow = 0.;
        let mut weighted_temperature = 0.;
        for &index in &self.equipment {
            let fixture = &mut fixtures[index];
            fixture.calculate_drain(environment, schedules, simtime);
            drain_mass_flow += fixture.state.drain_mass_flow;
            weighted_temperature += fixture.state.drain_mass_flow * fixture.state.drain_temperature;
        }

        self.state.drain_mass_flow = drain_mass_flow;
        self.state.drain_volume_flow = drain_mass_flow / Water.density(WATER_USE_INIT_TEMPERATURE);
        self.state.drain_temperature = if drain_mass_flow > 0. {
            weighted_temperature / drain_mass_flow
        } else {
            self.state.hot_temperature
        };
    }

    fn calculate_recovery(&mut self, storages: &mut [WaterStorage]) {
        let state = &mut self.state;
        match &self.heat_recovery {
            None => {
                state.recovery_temperature = state.cold_supply_temperature;
                state.return_temperature = state.cold_supply_temperature;
                state.waste_temperature = state.drain_temperature;
                state.effectiveness = 0.;
                state.recovery_rate = 0.;
                state.recovery_mass_flow = 0.;
                state.temperature_error = 0.;
            }
            Some(recovery) => {
                let flows = RecoveryFlows {
                    hot: state.hot_mass_flow,
                    cold: state.cold_mass_flow,
                    total: state.total_mass_flow,
                    drain: state.drain_mass_flow,
                };
                let outcome = recovery.recover(
                    &flows,
                    state.drain_temperature,
                    state.cold_supply_temperature,
                    Water.specific_heat(WATER_USE_INIT_TEMPERATURE),
                );
                state.recovery_mass_flow = recovery.recovery_mass_flow(&flows);
                state.effectiveness = outcome.effectiveness;
                state.recovery_rate = outcome.rate;
                state.recovery_temperature = outcome.recovery_temperature;
                state.waste_temperature = outcome.waste_temperature;

                match recovery.configuration {
                    HeatRecoveryConfiguration::Plant => {
                        state.temperature_error = 0.;
                        state.return_temperature = state.recovery_temperature;
                    }
                    HeatRecoveryConfiguration::Equipment => {
                        state.temperature_error =
                            (state.cold_temperature - state.recovery_temperature).abs();
                        state.cold_temperature = state.recovery_temperature;
                        state.return_temperature = state.cold_supply_temperature;
                    }
                    HeatRecoveryConfiguration::PlantAndEquipment => {
                        state.temperature_error =
                            (state.cold_temperature - state.recovery_temperature).abs();
                        state.cold_temperature = state.recovery_temperature;
                        state.return_temperature = state.recovery_temperature;
                    }
                }
            }
        }

        if let Some(storage) = self.recovery_storage {
            storages[storage].supply(&self.name, state.drain_volume_flow, state.waste_temperature);
        }
    }

    fn update_power(&mut self, fixtures: &mut [WaterUseEquipment]) {
        let cp = Water.specific_heat(WATER_USE_INIT_TEMPERATURE);
        for &index in &self.equipment {
            fixtures[index].update_power(self.state.return_temperature);
        }
        self.state.power = self.state.hot_mass_flow
            * cp
            * (self.state.hot_temperature - self.state.return_temperature);
    }

    fn sum(&self, fixtures: &[WaterUseEquipment], value: impl Fn(&WaterUseEquipment) -> f64) -> f64 {
        self.equipment
            .iter()
            .map(|&index| value(&fixtures[index]))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plant::FixedBoundaryPlant;
    use crate::core::schedule::ScheduleSet;
    use crate::core::water_use::equipment::tests::{environment, shower, FixedEnvironment};
    use crate::core::water_use::heat_recovery::HeatExchangerType;
    use crate::simulation_time::SimulationTime;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn simtime() -> SimulationTimeIteration {
        SimulationTime::new(0., 1., 1.).iter().current_iteration()
    }

    fn density() -> f64 {
        Water.density(WATER_USE_INIT_TEMPERATURE)
    }

    struct Circuit {
        schedules: ScheduleSet,
        fixtures: Vec<WaterUseEquipment>,
        storages: Vec<WaterStorage>,
        plant: FixedBoundaryPlant,
        connections: WaterUseConnections,
    }

    impl Circuit {
        fn new(hot_supply: f64, max_hot_flow: Option<f64>) -> Self {
            let mut schedules = ScheduleSet::new();
            let mut fixture = shower(&mut schedules);
            fixture.connections = Some(0);
            let mut plant = FixedBoundaryPlant::new();
            let inlet = plant.add_port("Hot in", hot_supply, max_hot_flow);
            let outlet = plant.add_port("Return", hot_supply, None);
            Self {
                schedules,
                fixtures: vec![fixture],
                storages: vec![],
                plant,
                connections: WaterUseConnections {
                    name: "Bathroom".into(),
                    inlet_port: Some(inlet),
                    outlet_port: Some(outlet),
                    equipment: vec![0],
                    hot_temperature_schedule: None,
                    cold_temperature_schedule: None,
                    supply_storage: None,
                    recovery_storage: None,
                    heat_recovery: None,
                    state: Default::default(),
                },
            }
        }

        fn run(
            &mut self,
            environment: &FixedEnvironment,
            first_pass: bool,
        ) -> Result<ConnectionsOutcome, CoreError> {
            self.connections.simulate(
                &mut self.fixtures,
                &mut self.storages,
                &mut self.plant,
                &self.schedules,
                environment,
                &simtime(),
                first_pass,
            )
        }
    }

    #[rstest]
    fn should_draw_hot_fraction_from_plant(environment: FixedEnvironment) {
        let mut circuit = Circuit::new(60., None);

        let outcome = circuit.run(&environment, true).unwrap();

        let total = 1e-4 * density();
        let state = &circuit.connections.state;
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.converged);
        assert_relative_eq!(state.hot_mass_flow, 0.6 * total, max_relative = 1e-12);
        assert_relative_eq!(state.cold_mass_flow, 0.4 * total, max_relative = 1e-12);
        assert_eq!(state.cold_temperature, 10.);
        assert_eq!(state.return_temperature, 10.);
        assert_relative_eq!(state.drain_temperature, 40., max_relative = 1e-12);

        let cp = Water.specific_heat(WATER_USE_INIT_TEMPERATURE);
        assert_relative_eq!(state.power, 0.6 * total * cp * 50., max_relative = 1e-12);
        assert_relative_eq!(circuit.fixtures[0].state.power, state.power, max_relative = 1e-12);

        let outlet = circuit.plant.port("Return").unwrap();
        assert_eq!(
            circuit.plant.outlet_state(outlet),
            (state.hot_mass_flow, Some(10.))
        );
    }

    #[rstest]
    fn should_only_scale_fixtures_after_first_pass(environment: FixedEnvironment) {
        let total = 1e-4 * density();
        let mut circuit = Circuit::new(60., Some(0.3 * total));

        circuit.run(&environment, true).unwrap();
        assert_relative_eq!(circuit.connections.state.hot_mass_flow, 0.3 * total);
        assert_relative_eq!(
            circuit.fixtures[0].state.hot_mass_flow,
            0.6 * total,
            max_relative = 1e-12
        );
        assert_relative_eq!(circuit.fixtures[0].state.mixed_temperature, 40., max_relative = 1e-12);

        circuit.run(&environment, false).unwrap();
        let fixture = &circuit.fixtures[0].state;
        assert_relative_eq!(fixture.hot_mass_flow, 0.3 * total, max_relative = 1e-12);
        assert_relative_eq!(fixture.cold_mass_flow, 0.7 * total, max_relative = 1e-12);
        assert_relative_eq!(fixture.mixed_temperature, 25., max_relative = 1e-12);
        assert_relative_eq!(circuit.connections.state.drain_temperature, 25., max_relative = 1e-12);
    }

    #[rstest]
    fn should_average_drain_by_mass(environment: FixedEnvironment) {
        let mut circuit = Circuit::new(60., None);
        let mut basin = shower(&mut circuit.schedules);
        basin.name = "Basin".into();
        basin.peak_flow = 3e-4;
        basin.target_temperature = Some(circuit.schedules.add_constant("basin target", 20.));
        basin.connections = Some(0);
        circuit.fixtures.push(basin);
        circuit.connections.equipment.push(1);

        circuit.run(&environment, true).unwrap();

        assert_relative_eq!(
            circuit.connections.state.drain_temperature,
            (40. + 3. * 20.) / 4.,
            max_relative = 1e-12
        );
    }

    #[rstest]
    fn drain_with_no_flow_takes_hot_temperature(environment: FixedEnvironment) {
        let mut circuit = Circuit::new(60., None);
        circuit.fixtures[0].peak_flow = 0.;

        circuit.run(&environment, true).unwrap();

        assert_eq!(circuit.connections.state.drain_temperature, 60.);
        assert_eq!(circuit.connections.state.power, 0.);
    }

    #[rstest]
    fn plant_recovery_raises_return_temperature(environment: FixedEnvironment) {
        let mut circuit = Circuit::new(60., None);
        circuit.connections.heat_recovery = Some(DrainHeatRecovery {
            heat_exchanger: HeatExchangerType::Ideal,
            ua: 0.,
            configuration: HeatRecoveryConfiguration::Plant,
        });

        let outcome = circuit.run(&environment, true).unwrap();

        let state = &circuit.connections.state;
        // Hot side is the smaller capacity rate: 0.6 of the drain flow recovers 0.6 of 30 K
        assert_eq!(outcome.iterations, 1);
        assert_relative_eq!(state.return_temperature, 10. + 0.6 * 30., max_relative = 1e-12);
        assert_eq!(state.cold_temperature, 10.);
        assert_relative_eq!(state.waste_temperature, 40. - 0.6 * 30., max_relative = 1e-12);
    }

    #[rstest]
    fn zero_ua_counterflow_recovers_nothing(environment: FixedEnvironment) {
        let mut circuit = Circuit::new(60., None);
        circuit.connections.heat_recovery = Some(DrainHeatRecovery {
            heat_exchanger: HeatExchangerType::CounterFlow,
            ua: 0.,
            configuration: HeatRecoveryConfiguration::PlantAndEquipment,
        });

        circuit.run(&environment, true).unwrap();

        let state = &circuit.connections.state;
        assert_eq!(state.effectiveness, 0.);
        assert_eq!(state.recovery_rate, 0.);
        assert_eq!(state.return_temperature, 10.);
    }

    #[rstest]
    fn equipment_recovery_converges(
        environment: FixedEnvironment,
        #[values(10., 100., 1_000., 10_000.)] ua: f64,
        #[values(0.01, 0.1, 1.)] total_mass_flow: f64,
        #[values(HeatExchangerType::CounterFlow, HeatExchangerType::CrossFlow)]
        heat_exchanger: HeatExchangerType,
    ) {
        let mut circuit = Circuit::new(60., None);
        circuit.fixtures[0].peak_flow = total_mass_flow / density();
        circuit.connections.heat_recovery = Some(DrainHeatRecovery {
            heat_exchanger,
            ua,
            configuration: HeatRecoveryConfiguration::Equipment,
        });

        let outcome = circuit.run(&environment, true).unwrap();

        let state = &circuit.connections.state;
        assert!(outcome.converged, "UA {ua}, {total_mass_flow} kg/s");
        assert!(outcome.iterations <= RECOVERY_MAX_ITERATIONS);
        assert!(outcome.temperature_error < RECOVERY_TOLERANCE);
        assert!(state.cold_temperature > 10. && state.cold_temperature < 40.);
        assert_eq!(state.return_temperature, 10.);
        assert!(state.hot_mass_flow < 0.6 * total_mass_flow);
    }

    #[rstest]
    fn should_use_storage_for_cold_supply_and_recovered_drain(environment: FixedEnvironment) {
        let mut circuit = Circuit::new(60., None);
        circuit.storages = vec![
            WaterStorage::new("Cistern", 1., 0.5, None, 15.),
            WaterStorage::new("Greywater", 1., 0., None, 20.),
        ];
        circuit.connections.supply_storage = Some(0);
        circuit.connections.recovery_storage = Some(1);

        circuit.run(&environment, true).unwrap();
        let state = circuit.connections.state.clone();
        assert_eq!(state.cold_supply_temperature, 15.);
        assert_relative_eq!(state.hot_mass_flow, 1e-4 * density() * 25. / 45., max_relative = 1e-12);

        circuit.storages[0].end_timestep(3600.);
        circuit.storages[1].end_timestep(3600.);
        assert_relative_eq!(
            circuit.storages[0].report.demand_volume_flow,
            state.cold_volume_flow,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            circuit.storages[1].report.inflow_volume_flow,
            state.drain_volume_flow,
            max_relative = 1e-12
        );

        circuit.run(&environment, true).unwrap();
        assert_relative_eq!(
            circuit.connections.state.tank_volume_flow,
            state.cold_volume_flow,
            max_relative = 1e-12
        );
    }

    #[rstest]
    fn stand_alone_circuit_uses_hot_schedule(environment: FixedEnvironment) {
        let mut circuit = Circuit::new(60., None);
        circuit.connections.inlet_port = None;
        circuit.connections.outlet_port = None;
        circuit.connections.hot_temperature_schedule =
            Some(circuit.schedules.add_constant("hot", 50.));

        circuit.run(&environment, false).unwrap();

        assert_eq!(circuit.connections.state.hot_temperature, 50.);
        assert_relative_eq!(
            circuit.connections.state.hot_mass_flow,
            1e-4 * density() * 0.75,
            max_relative = 1e-12
        );
    }

    #[rstest]
    fn should_reject_fixture_index_out_of_range(environment: FixedEnvironment) {
        let mut circuit = Circuit::new(60., None);
        circuit.connections.equipment.push(3);

        assert_eq!(
            circuit.run(&environment, true),
            Err(CoreError::InvalidIndex {
                kind: ComponentKind::WaterUseEquipment,
                index: 3,
                len: 1
            })
        );
    }
}
