use crate::core::units::SECONDS_PER_HOUR;
use serde::{Deserialize, Serialize};

pub const HOURS_IN_DAY: u32 = 24;

/// Simulation clock. All values are in hours from the start of the year.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationTime {
    #[serde(rename = "start")]
    start_time: f64,
    #[serde(rename = "end")]
    end_time: f64,
    step: f64,
}

impl SimulationTime {
    pub fn new(start_time: f64, end_time: f64, step: f64) -> Self {
        Self {
            start_time,
            end_time,
            step,
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        if self.step <= 0. || self.end_time <= self.start_time {
            return 0;
        }
        ((self.end_time - self.start_time) / self.step).ceil() as usize
    }

    pub fn iter(&self) -> SimulationTimeIterator {
        SimulationTimeIterator {
            next_index: 0,
            simulation_time: *self,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SimulationTimeIterator {
    next_index: usize,
    simulation_time: SimulationTime,
}

impl SimulationTimeIterator {
    pub fn current_index(&self) -> usize {
        self.next_index
    }

    /// The iteration the iterator will yield next, without advancing it.
    pub fn current_iteration(&self) -> SimulationTimeIteration {
        SimulationTimeIteration {
            index: self.next_index,
            time: self.simulation_time.start_time
                + self.next_index as f64 * self.simulation_time.step,
            timestep: self.simulation_time.step,
        }
    }
}

/// One simulation timestep: its index, the time at its start (hours) and its length (hours).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulationTimeIteration {
    pub index: usize,
    pub time: f64,
    pub timestep: f64,
}

impl SimulationTimeIteration {
    pub fn current_hour(&self) -> u32 {
        self.time.floor() as u32
    }

    pub fn hour_of_day(&self) -> u32 {
        self.current_hour() % HOURS_IN_DAY
    }

    pub fn current_day(&self) -> u32 {
        self.time as u32 / HOURS_IN_DAY
    }

    pub fn timestep_seconds(&self) -> f64 {
        self.timestep * SECONDS_PER_HOUR as f64
    }
}

impl Iterator for SimulationTimeIterator {
    type Item = SimulationTimeIteration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.simulation_time.total_steps() {
            return None;
        }
        let iteration = self.current_iteration();
        self.next_index += 1;

        Some(iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn simtime() -> SimulationTime {
        SimulationTime::new(742.0, 746.0, 0.5)
    }

    #[rstest]
    fn should_have_correct_total_steps(simtime: SimulationTime) {
        assert_eq!(simtime.total_steps(), 8);
    }

    #[rstest]
    fn should_iterate_over_half_hour_steps(simtime: SimulationTime) {
        let hours_of_day: Vec<u32> = simtime.iter().map(|t| t.hour_of_day()).collect();
        assert_eq!(hours_of_day, vec![22, 22, 23, 23, 0, 0, 1, 1]);
        assert_eq!(simtime.iter().last().map(|t| t.index), Some(7));
    }

    #[rstest]
    fn should_report_timestep_in_seconds(simtime: SimulationTime) {
        assert_eq!(simtime.iter().current_iteration().timestep_seconds(), 1800.);
    }

    #[rstest]
    fn should_yield_nothing_for_empty_range() {
        assert_eq!(SimulationTime::new(5., 5., 1.).iter().count(), 0);
    }
}
