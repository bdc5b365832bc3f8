//! Non-potable water storage: a volume balance that can supply cold water to connections and
//! receive their recovered drain water.

use crate::compare_floats::{max_of_2, min_of_2};
use crate::core::schedule::{ScheduleHandle, ScheduleValues};
use crate::simulation_time::SimulationTimeIteration;
use indexmap::IndexMap;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Inflow {
    /// m3/s
    volume_flow: f64,
    temperature: f64,
}

/// Volumes in m3, flows in m3/s.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WaterStorageReport {
    pub volume: f64,
    pub demand_volume_flow: f64,
    pub supplied_volume_flow: f64,
    pub inflow_volume_flow: f64,
    pub overflow_volume_flow: f64,
    pub shortfall_volume_flow: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WaterStorage {
    pub name: String,
    /// m3
    pub capacity: f64,
    pub volume: f64,
    pub temperature_schedule: Option<ScheduleHandle>,
    pub temperature: f64,
    requests: IndexMap<String, f64>,
    available: IndexMap<String, f64>,
    inflows: IndexMap<String, Inflow>,
    pub report: WaterStorageReport,
}

impl WaterStorage {
    pub fn new(
        name: &str,
        capacity: f64,
        initial_volume: f64,
        temperature_schedule: Option<ScheduleHandle>,
        initial_temperature: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            volume: min_of_2(initial_volume, capacity),
            temperature_schedule,
            temperature: initial_temperature,
            requests: Default::default(),
            available: Default::default(),
            inflows: Default::default(),
            report: Default::default(),
        }
    }

    pub fn begin_timestep(
        &mut self,
        schedules: &impl ScheduleValues,
        simtime: &SimulationTimeIteration,
    ) {
        if let Some(handle) = self.temperature_schedule {
            self.temperature = schedules.value(handle, simtime);
        }
    }

    /// Ask for a volume flow for this timestep; replaces any earlier request from `consumer`.
    pub fn request(&mut self, consumer: &str, volume_flow: f64) {
        self.requests
            .insert(consumer.to_string(), max_of_2(volume_flow, 0.));
    }

    /// Flow granted to `consumer` when the storage was last balanced.
    pub fn available(&self, consumer: &str) -> f64 {
        self.available.get(consumer).copied().unwrap_or_default()
    }

    pub fn supply(&mut self, supplier: &str, volume_flow: f64, temperature: f64) {
        self.inflows.insert(
            supplier.to_string(),
            Inflow {
                volume_flow: max_of_2(volume_flow, 0.),
                temperature,
            },
        );
    }

    /// Balance the volume over the timestep, sharing any shortfall between consumers in
    /// proportion to their requests.
    pub fn end_timestep(&mut self, timestep: f64) {
        let demand: f64 = self.requests.values().sum();
        let inflow: f64 = self.inflows.values().map(|inflow| inflow.volume_flow).sum();
        let start = self.volume;

        let deliverable = if timestep > 0. {
            max_of_2(start / timestep + inflow, 0.)
        } else {
            demand
        };
        let supplied = min_of_2(demand, deliverable);
        let share = if demand > 0. { supplied / demand } else { 0. };
        self.available = self
            .requests
            .iter()
            .map(|(consumer, request)| (consumer.clone(), request * share))
            .collect();

        let unconstrained = start + (inflow - supplied) * timestep;
        let overflow = max_of_2(unconstrained - self.capacity, 0.);
        self.volume = max_of_2(min_of_2(unconstrained, self.capacity), 0.);

        let rate = |volume: f64| if timestep > 0. { volume / timestep } else { 0. };
        self.report = WaterStorageReport {
            volume: self.volume,
            demand_volume_flow: demand,
            supplied_volume_flow: supplied,
            inflow_volume_flow: inflow,
            overflow_volume_flow: rate(overflow),
            shortfall_volume_flow: demand - supplied,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn storage() -> WaterStorage {
        WaterStorage::new("Rainwater", 1., 0.5, None, 12.)
    }

    #[rstest]
    fn should_grant_requests_it_can_meet(mut storage: WaterStorage) {
        storage.request("Connections", 1e-4);
        storage.end_timestep(3600.);

        assert_eq!(storage.available("Connections"), 1e-4);
        assert_relative_eq!(storage.volume, 0.5 - 0.36);
        assert_eq!(storage.report.shortfall_volume_flow, 0.);
    }

    #[rstest]
    fn should_share_shortfall_between_consumers(mut storage: WaterStorage) {
        storage.request("a", 3e-4);
        storage.request("b", 1e-4);
        storage.end_timestep(3600.);

        let deliverable = 0.5 / 3600.;
        assert_relative_eq!(storage.available("a"), deliverable * 0.75, max_relative = 1e-12);
        assert_relative_eq!(storage.available("b"), deliverable * 0.25, max_relative = 1e-12);
        assert_eq!(storage.volume, 0.);
    }

    #[rstest]
    fn should_overflow_above_capacity(mut storage: WaterStorage) {
        storage.supply("Drain recovery", 2e-4, 25.);
        storage.end_timestep(3600.);

        assert_eq!(storage.volume, 1.);
        assert_relative_eq!(storage.report.overflow_volume_flow, (0.72 - 0.5) / 3600., max_relative = 1e-12);
        assert_eq!(storage.available("unknown"), 0.);
    }
}
