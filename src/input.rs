use crate::core::curves::Curve;
use crate::core::schedule::input::ScheduleInput;
use crate::core::water_heaters::desuperheater::ReclaimSourceKind;
use crate::core::water_heaters::heat_pump::{BackupElementPolicy, SpeedLevel};
use crate::core::water_heaters::stratified::TankShape;
use crate::core::water_heaters::tank::{ControlType, ElementPriority, InletMode, TankService};
use crate::core::water_use::heat_recovery::{HeatExchangerType, HeatRecoveryConfiguration};
use crate::errors::{ConfigurationError, DhwError};
use crate::simulation_time::SimulationTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::io::{BufReader, Read};

pub fn read_input(json: impl Read) -> Result<Input, DhwError> {
    Ok(serde_json::from_reader(BufReader::new(json))?)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Input {
    pub simulation_time: SimulationTime,
    #[serde(default)]
    pub schedules: IndexMap<String, ScheduleInput>,
    pub environment: EnvironmentInput,
    #[serde(default)]
    pub plant: IndexMap<String, PlantPortInput>,
    #[serde(default)]
    pub water_heaters: IndexMap<String, WaterHeaterInput>,
    #[serde(default)]
    pub heat_pump_water_heaters: IndexMap<String, HeatPumpWaterHeaterInput>,
    #[serde(default)]
    pub desuperheaters: IndexMap<String, DesuperheaterInput>,
    #[serde(default)]
    pub heat_reclaim_sources: IndexMap<String, HeatReclaimSourceInput>,
    #[serde(default)]
    pub water_storage: IndexMap<String, WaterStorageInput>,
    #[serde(default)]
    pub water_use_equipment: IndexMap<String, WaterUseEquipmentInput>,
    #[serde(default)]
    pub water_use_connections: IndexMap<String, WaterUseConnectionsInput>,
}

impl Input {
    /// Check the numeric bounds of every record, returning one error per offending record.
    pub(crate) fn check_bounds(&self) -> Vec<ConfigurationError> {
        let mut errors = vec![];
        check(&self.environment, "environment", &mut errors);
        for (name, zone) in &self.environment.zones {
            check(zone, name, &mut errors);
        }
        for (name, port) in &self.plant {
            check(port, name, &mut errors);
        }
        for (name, tank) in &self.water_heaters {
            check(tank, name, &mut errors);
            match &tank.geometry {
                TankGeometryInput::Mixed(mixed) => check(mixed, name, &mut errors),
                TankGeometryInput::Stratified(stratified) => check(stratified, name, &mut errors),
            }
        }
        for (name, heat_pump) in &self.heat_pump_water_heaters {
            check(heat_pump, name, &mut errors);
        }
        for (name, desuperheater) in &self.desuperheaters {
            check(desuperheater, name, &mut errors);
        }
        for (name, storage) in &self.water_storage {
            check(storage, name, &mut errors);
        }
        for (name, fixture) in &self.water_use_equipment {
            check(fixture, name, &mut errors);
        }
        for (name, connections) in &self.water_use_connections {
            check(connections, name, &mut errors);
        }
        errors
    }
}

fn check(record: &impl Validate, name: &str, errors: &mut Vec<ConfigurationError>) {
    if let Err(validation_errors) = record.validate() {
        errors.push(ConfigurationError::InvalidValue {
            field: "numeric bounds".into(),
            referenced_by: name.to_string(),
            reason: validation_errors.to_string(),
        });
    }
}

fn default_one() -> f64 {
    1.
}

/// Collaborator conditions, all given as schedule names.
#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentInput {
    pub outdoor_dry_bulb: String,
    pub mains_water_temperature: String,
    /// Pa
    #[validate(exclusive_minimum = 0.)]
    pub outdoor_pressure: Option<f64>,
    #[serde(default)]
    pub zones: IndexMap<String, ZoneInput>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ZoneInput {
    pub air_temperature: String,
    pub humidity_ratio: Option<String>,
    /// m3
    #[validate(exclusive_minimum = 0.)]
    pub volume: f64,
}

/// A fixed-temperature boundary of the plant network.
#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PlantPortInput {
    pub supply_temperature: f64,
    /// kg/s
    #[validate(minimum = 0.)]
    pub max_flow: Option<f64>,
    /// Another port whose outlet feeds this one
    pub link: Option<String>,
    #[serde(default)]
    pub follows_link_flow: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum AmbientInput {
    Schedule { schedule: String },
    Zone { zone: String },
    OutdoorAir,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct HeaterElementInput {
    /// W
    #[validate(minimum = 0.)]
    pub capacity: f64,
    pub setpoint: String,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub deadband: f64,
    /// m from the tank bottom, stratified tanks only
    #[validate(minimum = 0.)]
    pub height: Option<f64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct HeaterInput {
    #[serde(default)]
    pub control: ControlType,
    #[validate(min_items = 1)]
    #[validate(max_items = 2)]
    #[validate]
    pub elements: Vec<HeaterElementInput>,
    #[serde(default)]
    pub priority: ElementPriority,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub min_capacity: f64,
    /// Parsed when the corpus is built, so an unknown fuel is reported with the other errors
    pub fuel: String,
    #[serde(default = "default_one")]
    #[validate(exclusive_minimum = 0.)]
    #[validate(maximum = 1.)]
    pub efficiency: f64,
    pub part_load_curve: Option<Curve>,
    /// kg/s
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub ignition_minimum_flow: f64,
    /// s
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub ignition_delay: f64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ParasiticInput {
    /// W
    #[validate(minimum = 0.)]
    pub fuel_rate: f64,
    pub fuel: Option<String>,
    #[serde(default)]
    #[validate(minimum = 0.)]
    #[validate(maximum = 1.)]
    pub fraction_to_tank: f64,
    #[validate(minimum = 0.)]
    pub height: Option<f64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum TankGeometryInput {
    Mixed(MixedGeometryInput),
    Stratified(StratifiedGeometryInput),
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct MixedGeometryInput {
    /// W/K
    #[validate(minimum = 0.)]
    pub off_cycle_loss_coefficient: f64,
    #[validate(minimum = 0.)]
    pub on_cycle_loss_coefficient: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StratifiedGeometryInput {
    /// m
    #[validate(exclusive_minimum = 0.)]
    pub height: f64,
    #[serde(default)]
    pub shape: TankShape,
    #[validate(minimum = 1)]
    pub layer_count: usize,
    /// W/(m2.K)
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub skin_loss_coefficient: f64,
    /// W/(m.K)
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub additional_conductivity: f64,
    #[serde(default)]
    pub additional_loss_coefficients: Vec<f64>,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub off_cycle_flue_loss_coefficient: f64,
    #[validate(minimum = 1)]
    pub inversion_mixing_passes: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TankSideInput {
    pub inlet_port: Option<String>,
    pub outlet_port: Option<String>,
    #[serde(default = "default_one")]
    #[validate(minimum = 0.)]
    #[validate(maximum = 1.)]
    pub effectiveness: f64,
    /// kg/s
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub design_flow: f64,
    /// m3/s
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub peak_volume_flow: f64,
    pub flow_schedule: Option<String>,
    pub inlet_temperature_schedule: Option<String>,
    #[validate(minimum = 0.)]
    pub inlet_height: Option<f64>,
    #[validate(minimum = 0.)]
    pub outlet_height: Option<f64>,
    #[serde(default)]
    pub inlet_mode: InletMode,
}

impl Default for TankSideInput {
    fn default() -> Self {
        Self {
            inlet_port: None,
            outlet_port: None,
            effectiveness: 1.,
            design_flow: 0.,
            peak_volume_flow: 0.,
            flow_schedule: None,
            inlet_temperature_schedule: None,
            inlet_height: None,
            outlet_height: None,
            inlet_mode: InletMode::Fixed,
        }
    }
}

fn default_max_temperature() -> f64 {
    100.
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WaterHeaterInput {
    #[serde(default)]
    pub service: TankService,
    /// m3
    #[validate(exclusive_minimum = 0.)]
    pub volume: f64,
    #[serde(default = "default_max_temperature")]
    pub max_temperature: f64,
    /// Defaults to the first element's setpoint at the start of the run
    pub initial_temperature: Option<f64>,
    #[validate]
    pub heater: HeaterInput,
    #[serde(default)]
    #[validate]
    pub on_cycle_parasitic: ParasiticInput,
    #[serde(default)]
    #[validate]
    pub off_cycle_parasitic: ParasiticInput,
    pub ambient: AmbientInput,
    #[serde(default = "default_one")]
    #[validate(minimum = 0.)]
    #[validate(maximum = 1.)]
    pub off_cycle_fraction_to_zone: f64,
    #[serde(default = "default_one")]
    #[validate(minimum = 0.)]
    #[validate(maximum = 1.)]
    pub on_cycle_fraction_to_zone: f64,
    pub geometry: TankGeometryInput,
    #[serde(default)]
    #[validate]
    pub use_side: TankSideInput,
    #[serde(default)]
    #[validate]
    pub source_side: TankSideInput,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum AirSourceInput {
    Zone { zone: String },
    OutdoorAir,
    Schedule { schedule: String },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum CondenserInput {
    Wrapped { fractions: Vec<f64> },
    Pumped,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SensorInput {
    /// m from the tank bottom
    #[validate(minimum = 0.)]
    pub height: f64,
    #[validate(minimum = 0.)]
    #[validate(maximum = 1.)]
    pub weight: f64,
}

fn default_min_air_temperature() -> f64 {
    10.
}

fn default_max_air_temperature() -> f64 {
    48.89
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct HeatPumpWaterHeaterInput {
    pub tank: String,
    #[validate(min_items = 1)]
    #[validate]
    pub speeds: Vec<SpeedLevel>,
    pub capacity_curve: Option<Curve>,
    pub cop_curve: Option<Curve>,
    pub part_load_curve: Option<Curve>,
    pub setpoint: String,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub deadband: f64,
    #[serde(default = "default_min_air_temperature")]
    pub min_air_temperature: f64,
    #[serde(default = "default_max_air_temperature")]
    pub max_air_temperature: f64,
    pub air_source: AirSourceInput,
    pub condenser: CondenserInput,
    #[serde(default)]
    pub backup_policy: BackupElementPolicy,
    /// W
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub fan_power: f64,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub on_cycle_parasitic_power: f64,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub off_cycle_parasitic_power: f64,
    #[serde(default)]
    #[validate(max_items = 2)]
    #[validate]
    pub sensors: Vec<SensorInput>,
}

fn default_max_inlet_water_temperature() -> f64 {
    100.
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DesuperheaterInput {
    pub tank: String,
    pub source: String,
    pub availability: Option<String>,
    pub setpoint: String,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub deadband: f64,
    /// Checked against the source's limit when the corpus is built
    #[validate(minimum = 0.)]
    pub efficiency: f64,
    pub efficiency_curve: Option<Curve>,
    #[serde(default = "default_max_inlet_water_temperature")]
    pub max_inlet_water_temperature: f64,
    /// W
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub pump_power: f64,
    #[serde(default)]
    #[validate(minimum = 0.)]
    #[validate(maximum = 1.)]
    pub pump_fraction_to_water: f64,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub on_cycle_parasitic_power: f64,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub off_cycle_parasitic_power: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeatReclaimSourceInput {
    pub kind: ReclaimSourceKind,
    /// Schedule of reject heat, W
    pub reject_heat: String,
}

fn default_storage_temperature() -> f64 {
    10.
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WaterStorageInput {
    /// m3
    #[validate(exclusive_minimum = 0.)]
    pub capacity: f64,
    #[serde(default)]
    #[validate(minimum = 0.)]
    pub initial_volume: f64,
    pub temperature_schedule: Option<String>,
    #[serde(default = "default_storage_temperature")]
    pub initial_temperature: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WaterUseEquipmentInput {
    /// m3/s
    #[validate(minimum = 0.)]
    pub peak_flow: f64,
    pub flow_schedule: Option<String>,
    pub target_temperature: Option<String>,
    pub hot_temperature: Option<String>,
    pub cold_temperature: Option<String>,
    pub zone: Option<String>,
    pub sensible_fraction: Option<String>,
    pub latent_fraction: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct HeatRecoveryInput {
    #[serde(default)]
    pub heat_exchanger: HeatExchangerType,
    /// W/K
    #[validate(minimum = 0.)]
    pub ua: f64,
    #[serde(default)]
    pub configuration: HeatRecoveryConfiguration,
}

#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WaterUseConnectionsInput {
    pub inlet_port: Option<String>,
    pub outlet_port: Option<String>,
    #[validate(min_items = 1)]
    pub equipment: Vec<String>,
    pub hot_temperature_schedule: Option<String>,
    pub cold_temperature_schedule: Option<String>,
    pub supply_storage: Option<String>,
    pub recovery_storage: Option<String>,
    #[validate]
    pub heat_recovery: Option<HeatRecoveryInput>,
}
