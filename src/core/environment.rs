use crate::core::schedule::{ScheduleHandle, ScheduleValues};
use crate::core::units::STANDARD_PRESSURE;
use crate::simulation_time::SimulationTimeIteration;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ZoneIndex(pub usize);

/// Conditions around the water system, supplied by the zone and site models.
pub trait Environment {
    fn zone_air_temperature(&self, zone: ZoneIndex) -> f64;
    fn zone_humidity_ratio(&self, zone: ZoneIndex) -> f64;
    /// Zone air volume, in m3
    fn zone_volume(&self, zone: ZoneIndex) -> f64;
    fn outdoor_dry_bulb(&self) -> f64;
    /// Outdoor barometric pressure, in Pa
    fn outdoor_pressure(&self) -> f64;
    fn mains_water_temperature(&self) -> f64;
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ScheduledZone {
    pub(crate) name: String,
    pub(crate) air_temperature: ScheduleHandle,
    pub(crate) humidity_ratio: Option<ScheduleHandle>,
    pub(crate) volume: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct ZoneState {
    air_temperature: f64,
    humidity_ratio: f64,
}

/// An [`Environment`] whose conditions are read from schedules once per timestep.
#[derive(Clone, Debug)]
pub struct ScheduledEnvironment {
    zones: Vec<ScheduledZone>,
    outdoor_dry_bulb: ScheduleHandle,
    mains_water_temperature: ScheduleHandle,
    outdoor_pressure: f64,
    zone_states: Vec<ZoneState>,
    current_outdoor_dry_bulb: f64,
    current_mains_temperature: f64,
}

/// Humidity ratio assumed for zones without a humidity schedule
const DEFAULT_ZONE_HUMIDITY_RATIO: f64 = 0.008;

impl ScheduledEnvironment {
    pub(crate) fn new(
        zones: Vec<ScheduledZone>,
        outdoor_dry_bulb: ScheduleHandle,
        mains_water_temperature: ScheduleHandle,
        outdoor_pressure: Option<f64>,
    ) -> Self {
        let zone_states = vec![Default::default(); zones.len()];
        Self {
            zones,
            outdoor_dry_bulb,
            mains_water_temperature,
            outdoor_pressure: outdoor_pressure.unwrap_or(STANDARD_PRESSURE),
            zone_states,
            current_outdoor_dry_bulb: 0.,
            current_mains_temperature: 0.,
        }
    }

    pub fn zone_index(&self, name: &str) -> Option<ZoneIndex> {
        self.zones
            .iter()
            .position(|zone| zone.name == name)
            .map(ZoneIndex)
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Refresh every value for the timestep about to be simulated.
    pub fn update(&mut self, schedules: &impl ScheduleValues, simtime: &SimulationTimeIteration) {
        self.current_outdoor_dry_bulb = schedules.value(self.outdoor_dry_bulb, simtime);
        self.current_mains_temperature = schedules.value(self.mains_water_temperature, simtime);
        for (zone, state) in self.zones.iter().zip(self.zone_states.iter_mut()) {
            state.air_temperature = schedules.value(zone.air_temperature, simtime);
            state.humidity_ratio = zone
                .humidity_ratio
                .map_or(DEFAULT_ZONE_HUMIDITY_RATIO, |handle| {
                    schedules.value(handle, simtime)
                });
        }
    }
}

impl Environment for ScheduledEnvironment {
    fn zone_air_temperature(&self, zone: ZoneIndex) -> f64 {
        self.zone_states[zone.0].air_temperature
    }

    fn zone_humidity_ratio(&self, zone: ZoneIndex) -> f64 {
        self.zone_states[zone.0].humidity_ratio
    }

    fn zone_volume(&self, zone: ZoneIndex) -> f64 {
        self.zones[zone.0].volume
    }

    fn outdoor_dry_bulb(&self) -> f64 {
        self.current_outdoor_dry_bulb
    }

    fn outdoor_pressure(&self) -> f64 {
        self.outdoor_pressure
    }

    fn mains_water_temperature(&self) -> f64 {
        self.current_mains_temperature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::ScheduleSet;
    use crate::simulation_time::SimulationTime;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    fn should_read_conditions_from_schedules() {
        let mut schedules = ScheduleSet::new();
        let zone_temp = schedules.add_per_timestep("zone", vec![20., 21.]);
        let outdoor = schedules.add_constant("outdoor", 5.);
        let mains = schedules.add_constant("mains", 10.);
        let mut environment = ScheduledEnvironment::new(
            vec![ScheduledZone {
                name: "Kitchen".into(),
                air_temperature: zone_temp,
                humidity_ratio: None,
                volume: 40.,
            }],
            outdoor,
            mains,
            None,
        );

        let kitchen = environment.zone_index("Kitchen").unwrap();
        for (simtime, expected) in SimulationTime::new(0., 2., 1.).iter().zip([20., 21.]) {
            environment.update(&schedules, &simtime);
            assert_eq!(environment.zone_air_temperature(kitchen), expected);
        }
        assert_eq!(environment.outdoor_dry_bulb(), 5.);
        assert_eq!(environment.mains_water_temperature(), 10.);
        assert_eq!(environment.zone_humidity_ratio(kitchen), DEFAULT_ZONE_HUMIDITY_RATIO);
        assert_eq!(environment.outdoor_pressure(), STANDARD_PRESSURE);
        assert_eq!(environment.zone_index("Loft"), None);
    }
}
