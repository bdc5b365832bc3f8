//! Water-use fixtures: mixing of hot and cold supply to a target temperature, and the drain
//! water's sensible and latent exchange with the zone it discharges in.

use crate::compare_floats::{max_of_2, min_of_2};
use crate::core::environment::{Environment, ZoneIndex};
use crate::core::material_properties::{FluidProperties, Water};
use crate::core::psychrometrics::{
    dry_air_density, humidity_ratio_at_saturation, latent_heat_of_vaporisation,
};
use crate::core::schedule::{ScheduleHandle, ScheduleValues};
use crate::core::units::WATER_USE_INIT_TEMPERATURE;
use crate::simulation_time::SimulationTimeIteration;

/// Calculate the fraction of hot water required when mixing hot and cold
/// water to achieve a target temperature
pub fn frac_hot_water(temp_target: f64, temp_hot: f64, temp_cold: f64) -> f64 {
    (temp_target - temp_cold) / (temp_hot - temp_cold)
}

/// Result of mixing a total flow to a target temperature.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Mix {
    /// kg/s
    pub hot_mass_flow: f64,
    /// kg/s
    pub cold_mass_flow: f64,
    pub mixed_temperature: f64,
}

/// Split `total_mass_flow` between hot and cold supply to reach `target`.
///
/// Where the hot supply is no warmer than the target all of the flow is hot; where hot and cold
/// are the same temperature all of it is cold.
pub fn mix_to_target(total_mass_flow: f64, target: f64, hot: f64, cold: f64) -> Mix {
    if total_mass_flow <= 0. {
        return Mix {
            mixed_temperature: target,
            ..Default::default()
        };
    }
    let hot_mass_flow = if hot == cold {
        0.
    } else if target > hot {
        total_mass_flow
    } else {
        total_mass_flow * frac_hot_water(target, hot, cold)
    };
    let hot_mass_flow = max_of_2(min_of_2(hot_mass_flow, total_mass_flow), 0.);
    let cold_mass_flow = max_of_2(total_mass_flow - hot_mass_flow, 0.);

    Mix {
        hot_mass_flow,
        cold_mass_flow,
        mixed_temperature: mixed_temperature(hot_mass_flow, hot, cold_mass_flow, cold, target),
    }
}

fn mixed_temperature(hot_flow: f64, hot: f64, cold_flow: f64, cold: f64, fallback: f64) -> f64 {
    let total = hot_flow + cold_flow;
    if total > 0. {
        (hot_flow * hot + cold_flow * cold) / total
    } else {
        fallback
    }
}

/// Temperatures a fixture is supplied at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Supply {
    pub cold_temperature: f64,
    pub hot_temperature: f64,
}

/// Flows in kg/s (volume in m3/s), rates in W.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EquipmentState {
    pub cold_temperature: f64,
    pub hot_temperature: f64,
    pub target_temperature: f64,
    pub mixed_temperature: f64,
    pub drain_temperature: f64,
    pub total_volume_flow: f64,
    pub total_mass_flow: f64,
    pub hot_mass_flow: f64,
    pub cold_mass_flow: f64,
    pub drain_mass_flow: f64,
    pub hot_volume_flow: f64,
    pub cold_volume_flow: f64,
    pub sensible_rate: f64,
    pub latent_rate: f64,
    /// kg/s of water evaporated to the zone
    pub moisture_rate: f64,
    pub power: f64,
    pub timestep: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WaterUseEquipment {
    pub name: String,
    /// m3/s
    pub peak_flow: f64,
    pub flow_schedule: Option<ScheduleHandle>,
    pub target_temperature: Option<ScheduleHandle>,
    pub hot_temperature: Option<ScheduleHandle>,
    pub cold_temperature: Option<ScheduleHandle>,
    pub zone: Option<ZoneIndex>,
    pub sensible_fraction: Option<ScheduleHandle>,
    pub latent_fraction: Option<ScheduleHandle>,
    /// Arena index of the connections object serving this fixture, if any
    pub connections: Option<usize>,
    pub state: EquipmentState,
}

impl WaterUseEquipment {
    pub fn is_stand_alone(&self) -> bool {
        self.connections.is_none()
    }

    /// Supply temperatures of a fixture that is not served by a connections object.
    pub fn stand_alone_supply(
        &self,
        schedules: &impl ScheduleValues,
        simtime: &SimulationTimeIteration,
        mains_temperature: f64,
    ) -> Supply {
        let cold_temperature = self
            .cold_temperature
            .map_or(mains_temperature, |handle| schedules.value(handle, simtime));
        let hot_temperature = self
            .hot_temperature
            .map_or(cold_temperature, |handle| schedules.value(handle, simtime));
        Supply {
            cold_temperature,
            hot_temperature,
        }
    }

    /// Set the demanded flow and split it between the hot and cold supply.
    pub fn calculate_mix(
        &mut self,
        supply: Supply,
        schedules: &impl ScheduleValues,
        simtime: &SimulationTimeIteration,
    ) {
        let fraction = self
            .flow_schedule
            .map_or(1., |handle| schedules.value(handle, simtime));
        let target = self
            .target_temperature
            .map_or(supply.hot_temperature, |handle| schedules.value(handle, simtime));
        let density = Water.density(WATER_USE_INIT_TEMPERATURE);

        let total_volume_flow = self.peak_flow * fraction;
        let total_mass_flow = total_volume_flow * density;
        let mix = mix_to_target(
            total_mass_flow,
            target,
            supply.hot_temperature,
            supply.cold_temperature,
        );

        self.state = EquipmentState {
            cold_temperature: supply.cold_temperature,
            hot_temperature: supply.hot_temperature,
            target_temperature: target,
            mixed_temperature: mix.mixed_temperature,
            drain_temperature: mix.mixed_temperature,
            total_volume_flow,
            total_mass_flow,
            hot_mass_flow: mix.hot_mass_flow,
            cold_mass_flow: mix.cold_mass_flow,
            drain_mass_flow: total_mass_flow,
            hot_volume_flow: mix.hot_mass_flow / density,
            cold_volume_flow: mix.cold_mass_flow / density,
            timestep: simtime.timestep_seconds(),
            ..Default::default()
        };
    }

    /// Scale the hot flow to what the supply could deliver, keeping the total flow.
    pub fn scale_hot_flow(&mut self, ratio: f64) {
        let density = Water.density(WATER_USE_INIT_TEMPERATURE);
        let state = &mut self.state;
        state.hot_mass_flow *= ratio;
        state.cold_mass_flow = max_of_2(state.total_mass_flow - state.hot_mass_flow, 0.);
        state.hot_volume_flow = state.hot_mass_flow / density;
        state.cold_volume_flow = state.cold_mass_flow / density;
        state.mixed_temperature = mixed_temperature(
            state.hot_mass_flow,
            state.hot_temperature,
            state.cold_mass_flow,
            state.cold_temperature,
            state.target_temperature,
        );
    }

    /// Drain temperature after the fixture's sensible and latent gains to its zone.
    pub fn calculate_drain(
        &mut self,
        environment: &impl Environment,
        schedules: &impl ScheduleValues,
        simtime: &SimulationTimeIteration,
    ) {
        let timestep = simtime.timestep_seconds();
        let state = &mut self.state;
        state.sensible_rate = 0.;
        state.latent_rate = 0.;
        state.moisture_rate = 0.;

        let zone = match self.zone {
            Some(zone) if state.total_mass_flow > 0. => zone,
            _ => {
                state.drain_temperature = state.mixed_temperature;
                state.drain_mass_flow = state.total_mass_flow;
                return;
            }
        };

        let cp = Water.specific_heat(WATER_USE_INIT_TEMPERATURE);
        let zone_temperature = environment.zone_air_temperature(zone);
        if let Some(handle) = self.sensible_fraction {
            state.sensible_rate = schedules.value(handle, simtime)
                * state.total_mass_flow
                * cp
                * (state.mixed_temperature - zone_temperature);
        }
        if let Some(handle) = self.latent_fraction {
            let pressure = environment.outdoor_pressure();
            let humidity_ratio = environment.zone_humidity_ratio(zone);
            let saturated = humidity_ratio_at_saturation(zone_temperature, pressure);
            let air_density = dry_air_density(pressure, zone_temperature, 0.);
            let zone_mass_max =
                (saturated - humidity_ratio) * air_density * environment.zone_volume(zone);
            let flow_mass_max = state.total_mass_flow * timestep;
            let moisture_mass =
                schedules.value(handle, simtime) * min_of_2(zone_mass_max, flow_mass_max);
            state.moisture_rate = if timestep > 0. {
                moisture_mass / timestep
            } else {
                0.
            };
            state.latent_rate =
                state.moisture_rate * latent_heat_of_vaporisation(zone_temperature);
        }

        state.drain_mass_flow = state.total_mass_flow - state.moisture_rate;
        state.drain_temperature = if state.drain_mass_flow == 0. {
            state.mixed_temperature
        } else {
            (state.total_mass_flow * cp * state.mixed_temperature
                - state.sensible_rate
                - state.latent_rate)
                / (state.drain_mass_flow * cp)
        };
    }

    /// Hot water heating power, measured against `reference` (the connection's return water or
    /// the fixture's own cold supply).
    pub fn update_power(&mut self, reference: f64) {
        let cp = Water.specific_heat(WATER_USE_INIT_TEMPERATURE);
        self.state.power =
            self.state.hot_mass_flow * cp * (self.state.hot_temperature - reference);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::schedule::ScheduleSet;
    use crate::simulation_time::SimulationTime;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;

    pub(crate) struct FixedEnvironment {
        pub(crate) zone_temperature: f64,
        pub(crate) humidity_ratio: f64,
        pub(crate) volume: f64,
        pub(crate) mains: f64,
    }

    impl Environment for FixedEnvironment {
        fn zone_air_temperature(&self, _zone: ZoneIndex) -> f64 {
            self.zone_temperature
        }

        fn zone_humidity_ratio(&self, _zone: ZoneIndex) -> f64 {
            self.humidity_ratio
        }

        fn zone_volume(&self, _zone: ZoneIndex) -> f64 {
            self.volume
        }

        fn outdoor_dry_bulb(&self) -> f64 {
            10.
        }

        fn outdoor_pressure(&self) -> f64 {
            crate::core::units::STANDARD_PRESSURE
        }

        fn mains_water_temperature(&self) -> f64 {
            self.mains
        }
    }

    #[fixture]
    pub(crate) fn environment() -> FixedEnvironment {
        FixedEnvironment {
            zone_temperature: 22.,
            humidity_ratio: 0.008,
            volume: 250.,
            mains: 10.,
        }
    }

    pub(crate) fn shower(schedules: &mut ScheduleSet) -> WaterUseEquipment {
        WaterUseEquipment {
            name: "Shower".into(),
            peak_flow: 1e-4,
            flow_schedule: Some(schedules.add_constant("shower flow", 1.)),
            target_temperature: Some(schedules.add_constant("shower target", 40.)),
            hot_temperature: None,
            cold_temperature: None,
            zone: None,
            sensible_fraction: None,
            latent_fraction: None,
            connections: None,
            state: Default::default(),
        }
    }

    #[rstest]
    fn should_mix_to_target_fraction() {
        let mix = mix_to_target(1., 40., 60., 10.);

        assert_relative_eq!(mix.hot_mass_flow, 0.6);
        assert_relative_eq!(mix.cold_mass_flow, 0.4);
        assert_relative_eq!(mix.mixed_temperature, 40.);
    }

    #[rstest]
    fn target_above_hot_supply_takes_all_hot() {
        let mix = mix_to_target(0.5, 70., 60., 10.);
        assert_eq!(mix.hot_mass_flow, 0.5);
        assert_eq!(mix.cold_mass_flow, 0.);
        assert_relative_eq!(mix.mixed_temperature, 60.);
    }

    #[rstest]
    fn equal_supply_temperatures_take_all_cold() {
        let mix = mix_to_target(0.5, 40., 15., 15.);
        assert_eq!(mix.hot_mass_flow, 0.);
        assert_eq!(mix.cold_mass_flow, 0.5);
        assert_relative_eq!(mix.mixed_temperature, 15.);
    }

    #[rstest]
    fn target_below_cold_supply_takes_all_cold() {
        let mix = mix_to_target(0.5, 5., 60., 10.);
        assert_eq!(mix.hot_mass_flow, 0.);
        assert_relative_eq!(mix.mixed_temperature, 10.);
    }

    #[rstest]
    fn zero_flow_mixes_to_target() {
        assert_eq!(
            mix_to_target(0., 40., 60., 10.),
            Mix {
                hot_mass_flow: 0.,
                cold_mass_flow: 0.,
                mixed_temperature: 40.
            }
        );
    }

    #[rstest]
    fn stand_alone_fixture_uses_mains_and_schedules(environment: FixedEnvironment) {
        let mut schedules = ScheduleSet::new();
        let mut fixture = shower(&mut schedules);
        let simtime = SimulationTime::new(0., 1., 1.).iter().current_iteration();

        let supply = fixture.stand_alone_supply(&schedules, &simtime, environment.mains);
        assert_eq!(supply.cold_temperature, 10.);
        assert_eq!(supply.hot_temperature, 10.);

        fixture.hot_temperature = Some(schedules.add_constant("hot", 60.));
        let supply = fixture.stand_alone_supply(&schedules, &simtime, environment.mains);
        fixture.calculate_mix(supply, &schedules, &simtime);
        fixture.calculate_drain(&environment, &schedules, &simtime);

        let density = Water.density(WATER_USE_INIT_TEMPERATURE);
        assert_relative_eq!(fixture.state.total_mass_flow, 1e-4 * density);
        assert_relative_eq!(fixture.state.hot_mass_flow, 0.6 * 1e-4 * density, max_relative = 1e-12);
        assert_eq!(fixture.state.drain_temperature, fixture.state.mixed_temperature);
    }

    #[rstest]
    fn drain_loses_sensible_and_latent_heat_to_zone(environment: FixedEnvironment) {
        let mut schedules = ScheduleSet::new();
        let mut fixture = shower(&mut schedules);
        fixture.hot_temperature = Some(schedules.add_constant("hot", 60.));
        fixture.zone = Some(ZoneIndex(0));
        fixture.sensible_fraction = Some(schedules.add_constant("sensible", 0.2));
        fixture.latent_fraction = Some(schedules.add_constant("latent", 0.05));
        let simtime = SimulationTime::new(0., 1., 1.).iter().current_iteration();

        let supply = fixture.stand_alone_supply(&schedules, &simtime, environment.mains);
        fixture.calculate_mix(supply, &schedules, &simtime);
        fixture.calculate_drain(&environment, &schedules, &simtime);
        let state = &fixture.state;
        let cp = 4180.;

        assert_relative_eq!(
            state.sensible_rate,
            0.2 * state.total_mass_flow * cp * (40. - 22.),
            max_relative = 1e-12
        );
        // an hour of flow is far more water than the zone air can take up
        let saturated = humidity_ratio_at_saturation(22., crate::core::units::STANDARD_PRESSURE);
        let zone_capacity = (saturated - 0.008)
            * dry_air_density(crate::core::units::STANDARD_PRESSURE, 22., 0.)
            * 250.;
        assert_relative_eq!(state.moisture_rate, 0.05 * zone_capacity / 3600., max_relative = 1e-12);
        assert!(state.latent_rate > 0.);
        assert_relative_eq!(state.drain_mass_flow, state.total_mass_flow - state.moisture_rate);
        assert_relative_eq!(
            state.drain_mass_flow * cp * state.drain_temperature,
            state.total_mass_flow * cp * 40. - state.sensible_rate - state.latent_rate,
            max_relative = 1e-12
        );
        assert!(state.drain_temperature < 40.);
    }

    #[rstest]
    fn scaling_hot_flow_cools_the_mix() {
        let mut schedules = ScheduleSet::new();
        let mut fixture = shower(&mut schedules);
        let simtime = SimulationTime::new(0., 1., 1.).iter().current_iteration();
        fixture.calculate_mix(
            Supply {
                cold_temperature: 10.,
                hot_temperature: 60.,
            },
            &schedules,
            &simtime,
        );
        let total = fixture.state.total_mass_flow;

        fixture.scale_hot_flow(0.5);

        assert_relative_eq!(fixture.state.hot_mass_flow, 0.3 * total, max_relative = 1e-12);
        assert_relative_eq!(fixture.state.cold_mass_flow, 0.7 * total, max_relative = 1e-12);
        assert_relative_eq!(fixture.state.mixed_temperature, 25., max_relative = 1e-12);
    }
}
