//! Persisted state, so a run can stop and later resume from the same tank states.

use crate::core::water_heaters::heat_pump::SourceMode;
use crate::core::water_heaters::tank::{
    AttachedHeatSource, CumulativeCounters, TankControlState, WaterHeater,
};
use crate::corpus::Corpus;
use crate::errors::{ComponentKind, CoreError};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TankStateRecord {
    pub name: String,
    pub index: usize,
    pub control: TankControlState,
    /// One per node; a mixed tank has one
    pub temperatures: Vec<f64>,
    pub saved_temperatures: Vec<f64>,
    pub cumulative: CumulativeCounters,
    /// Mode of the attached heat pump or desuperheater, if any
    pub source_mode: Option<SourceMode>,
    #[serde(default)]
    pub source_part_load_ratio: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StateSnapshot {
    pub setup_complete: bool,
    /// Half-open range of the tank indices held in `tanks`
    pub tank_range: (usize, usize),
    pub tanks: Vec<TankStateRecord>,
}

pub fn write_snapshot(snapshot: &StateSnapshot, writer: impl Write) -> anyhow::Result<()> {
    let mut writer = BufWriter::new(writer);
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writer.flush()?;
    Ok(())
}

pub fn read_snapshot(reader: impl Read) -> anyhow::Result<StateSnapshot> {
    Ok(serde_json::from_reader(BufReader::new(reader))?)
}

impl Corpus {
    fn source_state(&self, tank: &WaterHeater) -> (Option<SourceMode>, f64) {
        match tank.heat_source {
            Some(AttachedHeatSource::HeatPump(index)) => self
                .heat_pumps
                .get(index)
                .map_or((None, 0.), |heat_pump| {
                    (Some(heat_pump.state.mode), heat_pump.state.part_load_ratio)
                }),
            Some(AttachedHeatSource::Desuperheater(index)) => self
                .desuperheaters
                .get(index)
                .map_or((None, 0.), |desuperheater| {
                    (
                        Some(desuperheater.state.mode),
                        desuperheater.state.part_load_ratio,
                    )
                }),
            None => (None, 0.),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let tanks = self
            .water_heaters
            .iter()
            .enumerate()
            .map(|(index, tank)| {
                let (source_mode, source_part_load_ratio) = self.source_state(tank);
                TankStateRecord {
                    name: tank.name.clone(),
                    index,
                    control: tank.state.clone(),
                    temperatures: tank.nodes().iter().map(|node| node.temperature).collect(),
                    saved_temperatures: tank.saved_temperatures(),
                    cumulative: tank.cumulative.clone(),
                    source_mode,
                    source_part_load_ratio,
                }
            })
            .collect();
        StateSnapshot {
            setup_complete: self.setup_complete,
            tank_range: (0, self.water_heaters.len()),
            tanks,
        }
    }

    /// Restore tank states from a snapshot taken from a corpus built from the same input.
    ///
    /// Every record is checked before anything is changed, so a failed restore leaves the
    /// corpus as it was.
    pub fn restore(&mut self, snapshot: &StateSnapshot) -> Result<(), CoreError> {
        let len = self.water_heaters.len();
        let (start, end) = snapshot.tank_range;
        if start > end || end > len {
            return Err(CoreError::InvalidIndex {
                kind: ComponentKind::WaterHeater,
                index: end,
                len,
            });
        }
        if snapshot.tanks.len() != end - start {
            return Err(CoreError::InvalidIndex {
                kind: ComponentKind::WaterHeater,
                index: start + snapshot.tanks.len(),
                len: end,
            });
        }

        for record in &snapshot.tanks {
            let index = self.tank_index(&record.name, record.index)?;
            if index < start || index >= end {
                return Err(CoreError::InvalidIndex {
                    kind: ComponentKind::WaterHeater,
                    index,
                    len: end,
                });
            }
            let nodes = self.water_heaters[index].nodes().len();
            let found = record.temperatures.len().max(record.saved_temperatures.len());
            if record.temperatures.len() != nodes || record.saved_temperatures.len() != nodes {
                return Err(CoreError::NodeCountMismatch {
                    tank: record.name.clone(),
                    expected: nodes,
                    found,
                });
            }
        }

        for record in &snapshot.tanks {
            let tank = &mut self.water_heaters[record.index];
            tank.restore_temperatures(&record.temperatures, &record.saved_temperatures);
            tank.state = record.control.clone();
            tank.cumulative = record.cumulative.clone();

            let Some(mode) = record.source_mode else {
                continue;
            };
            match tank.heat_source {
                Some(AttachedHeatSource::HeatPump(index)) => {
                    if let Some(heat_pump) = self.heat_pumps.get_mut(index) {
                        heat_pump.state.mode = mode;
                        heat_pump.state.saved_mode = mode;
                        heat_pump.state.part_load_ratio = record.source_part_load_ratio;
                    }
                }
                Some(AttachedHeatSource::Desuperheater(index)) => {
                    if let Some(desuperheater) = self.desuperheaters.get_mut(index) {
                        desuperheater.state.mode = mode;
                        desuperheater.state.saved_mode = mode;
                        desuperheater.state.part_load_ratio = record.source_part_load_ratio;
                    }
                }
                None => {}
            }
        }
        self.setup_complete = snapshot.setup_complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::tests::{corpus_from, draw_circuit_input};
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use serde_json::json;

    /// The tank on its own, so its state is the whole state of the run.
    fn tank_only_input() -> serde_json::Value {
        let mut value = draw_circuit_input();
        value["water_use_connections"] = json!({});
        value["water_heaters"]["Cylinder"]["initial_temperature"] = json!(56.);
        value
    }

    #[rstest]
    fn should_resume_from_a_written_snapshot() {
        let mut uninterrupted = corpus_from(tank_only_input()).unwrap();
        let steps: Vec<_> = uninterrupted.simulation_time.iter().take(8).collect();
        for simtime in &steps[..6] {
            uninterrupted.run_timestep(simtime).unwrap();
        }

        let mut buffer = vec![];
        write_snapshot(&uninterrupted.snapshot(), &mut buffer).unwrap();
        let snapshot = read_snapshot(buffer.as_slice()).unwrap();

        let mut resumed = corpus_from(tank_only_input()).unwrap();
        resumed.restore(&snapshot).unwrap();
        assert!(resumed.setup_complete);
        assert_eq!(resumed.water_heaters[0].state, uninterrupted.water_heaters[0].state);

        for simtime in &steps[6..] {
            uninterrupted.run_timestep(simtime).unwrap();
            resumed.run_timestep(simtime).unwrap();
        }
        assert_relative_eq!(
            resumed.water_heaters[0].temperature(),
            uninterrupted.water_heaters[0].temperature(),
            max_relative = 1e-9
        );
        assert_eq!(
            resumed.water_heaters[0].cumulative.timesteps,
            uninterrupted.water_heaters[0].cumulative.timesteps
        );
    }

    #[rstest]
    fn should_reject_snapshot_for_a_different_tank() {
        let corpus = corpus_from(tank_only_input()).unwrap();
        let mut snapshot = corpus.snapshot();
        snapshot.tanks[0].name = "Other cylinder".into();

        let mut target = corpus_from(tank_only_input()).unwrap();
        assert_eq!(
            target.restore(&snapshot),
            Err(CoreError::NameMismatch {
                kind: ComponentKind::WaterHeater,
                expected: "Other cylinder".into(),
                found: "Cylinder".into()
            })
        );
    }

    #[rstest]
    fn should_reject_snapshot_with_wrong_range() {
        let corpus = corpus_from(tank_only_input()).unwrap();
        let mut snapshot = corpus.snapshot();
        snapshot.tank_range = (0, 2);

        let mut target = corpus_from(tank_only_input()).unwrap();
        assert_eq!(
            target.restore(&snapshot),
            Err(CoreError::InvalidIndex {
                kind: ComponentKind::WaterHeater,
                index: 2,
                len: 1
            })
        );
    }

    #[rstest]
    fn should_leave_corpus_unchanged_when_node_count_differs() {
        let corpus = corpus_from(tank_only_input()).unwrap();
        let mut snapshot = corpus.snapshot();
        snapshot.tanks[0].temperatures = vec![50., 40.];
        snapshot.tanks[0].cumulative.timesteps = 99;

        let mut target = corpus_from(tank_only_input()).unwrap();
        assert_eq!(
            target.restore(&snapshot),
            Err(CoreError::NodeCountMismatch {
                tank: "Cylinder".into(),
                expected: 1,
                found: 2
            })
        );
        assert_eq!(target.water_heaters[0].cumulative.timesteps, 0);
    }
}
