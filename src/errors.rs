use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhwError {
    #[error("Input was considered invalid due to error: {0}")]
    InvalidInput(#[from] InputError),
    #[error("Input could not be read: {0}")]
    UnreadableInput(#[from] serde_json::Error),
    #[error("Error identified during calculation: {0}")]
    FailureInCalculation(#[from] CoreError),
    #[error("Error during output: {0}")]
    ErrorInOutput(#[from] anyhow::Error),
}

/// Every configuration problem found while setting up a simulation, reported together.
#[derive(Debug, Error)]
#[error("{} configuration error(s) found: {}", .0.len(), .0.iter().join("; "))]
pub struct InputError(pub Vec<ConfigurationError>);

impl InputError {
    pub fn errors(&self) -> &[ConfigurationError] {
        &self.0
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("schedule '{name}' referenced by '{referenced_by}' was not found")]
    UnknownSchedule { name: String, referenced_by: String },
    #[error("schedule '{name}' is invalid: {reason}")]
    InvalidSchedule { name: String, reason: String },
    #[error("fuel type '{value}' given for '{referenced_by}' is not recognised")]
    UnrecognisedFuelType { value: String, referenced_by: String },
    #[error("water use equipment '{fixture}' is assigned to both '{first}' and '{second}'")]
    DuplicateFixtureAssignment {
        fixture: String,
        first: String,
        second: String,
    },
    #[error("{kind} '{name}' referenced by '{referenced_by}' was not found")]
    UnknownReference {
        kind: ComponentKind,
        name: String,
        referenced_by: String,
    },
    #[error("water heater '{tank}' is already served by '{first}', so '{second}' cannot also attach to it")]
    DuplicateHeatSource {
        tank: String,
        first: String,
        second: String,
    },
    #[error("'{referenced_by}' has an invalid {field}: {reason}")]
    InvalidValue {
        field: String,
        referenced_by: String,
        reason: String,
    },
    #[error("layer volumes of '{tank}' sum to {sum} m3 but the tank volume is {volume} m3")]
    LayerVolumesMismatch { tank: String, sum: f64, volume: f64 },
    #[error("wrapped condenser fractions of '{heat_pump}' sum to {sum}, not 1")]
    CondenserFractionsMismatch { heat_pump: String, sum: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ComponentKind {
    #[strum(to_string = "water heater")]
    WaterHeater,
    #[strum(to_string = "heat pump water heater")]
    HeatPumpWaterHeater,
    #[strum(to_string = "desuperheater")]
    Desuperheater,
    #[strum(to_string = "heat reclaim source")]
    HeatReclaimSource,
    #[strum(to_string = "water use connections")]
    WaterUseConnections,
    #[strum(to_string = "water use equipment")]
    WaterUseEquipment,
    #[strum(to_string = "water storage tank")]
    WaterStorage,
    #[strum(to_string = "plant port")]
    PlantPort,
    #[strum(to_string = "zone")]
    Zone,
}

/// Breaches of the calling contract. These end the simulation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("{kind} index {index} is out of range (there are {len})")]
    InvalidIndex {
        kind: ComponentKind,
        index: usize,
        len: usize,
    },
    #[error("{kind} at the cached index is named '{found}', expected '{expected}'")]
    NameMismatch {
        kind: ComponentKind,
        expected: String,
        found: String,
    },
    #[error("saved state of water heater '{tank}' has {found} node temperatures, the tank has {expected}")]
    NodeCountMismatch {
        tank: String,
        expected: usize,
        found: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    fn should_report_all_configuration_errors_together() {
        let error = InputError(vec![
            ConfigurationError::UnknownSchedule {
                name: "Setpoint".into(),
                referenced_by: "Tank 1".into(),
            },
            ConfigurationError::UnrecognisedFuelType {
                value: "Whale oil".into(),
                referenced_by: "Tank 1".into(),
            },
        ]);

        assert_eq!(
            error.to_string(),
            "2 configuration error(s) found: schedule 'Setpoint' referenced by 'Tank 1' was not found; \
             fuel type 'Whale oil' given for 'Tank 1' is not recognised"
        );
    }

    #[rstest]
    fn should_describe_invalid_index() {
        let error = CoreError::InvalidIndex {
            kind: ComponentKind::WaterHeater,
            index: 4,
            len: 2,
        };
        assert_eq!(
            error.to_string(),
            "water heater index 4 is out of range (there are 2)"
        );
    }
}
