use crate::errors::ConfigurationError;
use crate::simulation_time::SimulationTimeIteration;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Index of a schedule within a [`ScheduleSet`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ScheduleHandle(usize);

/// Supplies the scalar value of a schedule at a point in simulated time.
pub trait ScheduleValues {
    fn value(&self, handle: ScheduleHandle, simtime: &SimulationTimeIteration) -> f64;
}

#[derive(Clone, Debug, PartialEq)]
enum ExpandedSchedule {
    Constant(f64),
    /// One value per simulation timestep, repeated cyclically when the run is longer.
    PerTimestep(Vec<f64>),
}

#[derive(Clone, Debug, Default)]
pub struct ScheduleSet {
    handles: IndexMap<String, ScheduleHandle>,
    schedules: Vec<ExpandedSchedule>,
}

impl ScheduleSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_inputs(
        inputs: &IndexMap<String, input::ScheduleInput>,
    ) -> Result<Self, Vec<ConfigurationError>> {
        let mut set = Self::new();
        let mut errors = vec![];
        for (name, schedule) in inputs {
            match schedule.expand() {
                Ok(expanded) => {
                    set.push(name, expanded);
                }
                Err(reason) => errors.push(ConfigurationError::InvalidSchedule {
                    name: name.clone(),
                    reason,
                }),
            }
        }
        if errors.is_empty() {
            Ok(set)
        } else {
            Err(errors)
        }
    }

    pub fn add_constant(&mut self, name: &str, value: f64) -> ScheduleHandle {
        self.push(name, ExpandedSchedule::Constant(value))
    }

    pub fn add_per_timestep(&mut self, name: &str, values: Vec<f64>) -> ScheduleHandle {
        self.push(name, ExpandedSchedule::PerTimestep(values))
    }

    fn push(&mut self, name: &str, schedule: ExpandedSchedule) -> ScheduleHandle {
        if let Some(&handle) = self.handles.get(name) {
            self.schedules[handle.0] = schedule;
            return handle;
        }
        let handle = ScheduleHandle(self.schedules.len());
        self.schedules.push(schedule);
        self.handles.insert(name.to_string(), handle);
        handle
    }

    pub fn handle(&self, name: &str) -> Option<ScheduleHandle> {
        self.handles.get(name).copied()
    }

    /// Resolve a schedule name, recording an error against `context` when it is unknown.
    pub(crate) fn resolve(
        &self,
        name: &str,
        context: &str,
        errors: &mut Vec<ConfigurationError>,
    ) -> Option<ScheduleHandle> {
        let handle = self.handle(name);
        if handle.is_none() {
            errors.push(ConfigurationError::UnknownSchedule {
                name: name.to_string(),
                referenced_by: context.to_string(),
            });
        }
        handle
    }

    pub(crate) fn resolve_optional(
        &self,
        name: Option<&str>,
        context: &str,
        errors: &mut Vec<ConfigurationError>,
    ) -> Option<ScheduleHandle> {
        name.and_then(|name| self.resolve(name, context, errors))
    }
}

impl ScheduleValues for ScheduleSet {
    fn value(&self, handle: ScheduleHandle, simtime: &SimulationTimeIteration) -> f64 {
        match &self.schedules[handle.0] {
            ExpandedSchedule::Constant(value) => *value,
            ExpandedSchedule::PerTimestep(values) if values.is_empty() => 0.,
            ExpandedSchedule::PerTimestep(values) => values[simtime.index % values.len()],
        }
    }
}

/// Data structures representing how schedules can be provided as input (in JSON).
pub mod input {
    use super::ExpandedSchedule;
    use itertools::Itertools;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[serde(untagged)]
    pub enum ScheduleInput {
        Constant(f64),
        Compact(CompactSchedule),
    }

    impl ScheduleInput {
        pub(super) fn expand(&self) -> Result<ExpandedSchedule, String> {
            match self {
                ScheduleInput::Constant(value) => Ok(ExpandedSchedule::Constant(*value)),
                ScheduleInput::Compact(schedule) => {
                    let values = schedule.expand(0)?;
                    if values.is_empty() {
                        return Err("schedule has no values".into());
                    }
                    Ok(ExpandedSchedule::PerTimestep(values))
                }
            }
        }
    }

    /// A list of values per timestep, where runs can be written as repeaters and shared runs
    /// can be written once and referenced by name.
    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    pub struct CompactSchedule {
        pub main: Vec<ScheduleEntry>,
        #[serde(flatten)]
        pub references: HashMap<String, ScheduleReferenceEntry>,
    }

    const MAX_REFERENCE_DEPTH: usize = 16;

    impl CompactSchedule {
        fn expand(&self, depth: usize) -> Result<Vec<f64>, String> {
            self.main
                .iter()
                .map(|entry| self.expand_entry(entry, depth))
                .flatten_ok()
                .collect()
        }

        fn expand_entry(&self, entry: &ScheduleEntry, depth: usize) -> Result<Vec<f64>, String> {
            match entry {
                ScheduleEntry::Value(v) => Ok(vec![*v]),
                ScheduleEntry::Repeater(repeater) => {
                    let block = match &repeater.value {
                        ScheduleRepeaterValue::Value(v) => vec![*v],
                        ScheduleRepeaterValue::Reference(reference) => {
                            self.expand_reference(reference, depth + 1)?
                        }
                    };
                    Ok(itertools::repeat_n(block, repeater.repeat)
                        .flatten()
                        .collect_vec())
                }
                ScheduleEntry::Reference(reference) => self.expand_reference(reference, depth + 1),
            }
        }

        fn expand_reference(&self, reference: &str, depth: usize) -> Result<Vec<f64>, String> {
            if depth > MAX_REFERENCE_DEPTH {
                return Err(format!("reference '{reference}' nests too deeply"));
            }
            match self.references.get(reference) {
                Some(ScheduleReferenceEntry::Single(entry)) => self.expand_entry(entry, depth),
                Some(ScheduleReferenceEntry::Multi(entries)) => entries
                    .iter()
                    .map(|entry| self.expand_entry(entry, depth))
                    .flatten_ok()
                    .collect(),
                None => Err(format!("reference '{reference}' is not defined")),
            }
        }
    }

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[serde(untagged)]
    pub enum ScheduleEntry {
        Value(f64),
        Repeater(ScheduleRepeater),
        Reference(String),
    }

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[serde(untagged)]
    pub enum ScheduleReferenceEntry {
        Multi(Vec<ScheduleEntry>),
        Single(ScheduleEntry),
    }

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    pub struct ScheduleRepeater {
        pub value: ScheduleRepeaterValue,
        pub repeat: usize,
    }

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    #[serde(untagged)]
    pub enum ScheduleRepeaterValue {
        Value(f64),
        Reference(String),
    }
}
