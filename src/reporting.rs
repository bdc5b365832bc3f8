//! Per-timestep reporting of component state.
//!
//! Every component type has an enum of the quantities it reports. Registering a component adds
//! one column per variant, and the [`Reporter`] samples every column after each timestep.

use crate::core::units::joules_to_kilowatt_hours;
use crate::core::water_heaters::desuperheater::Desuperheater;
use crate::core::water_heaters::heat_pump::{HeatPumpWaterHeater, SourceMode};
use crate::core::water_heaters::tank::WaterHeater;
use crate::core::water_use::connections::WaterUseConnections;
use crate::core::water_use::equipment::WaterUseEquipment;
use crate::core::water_use::water_storage::WaterStorage;
use crate::corpus::Corpus;
use crate::simulation_time::SimulationTimeIteration;
use strum::IntoEnumIterator;
use strum_macros::{EnumIter, IntoStaticStr};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Aggregation {
    /// Rates, temperatures and ratios: the run value is the mean over timesteps
    Average,
    /// Energies, volumes and counts: the run value is the total
    Sum,
}

/// A quantity reported for each component of one type.
pub trait Reportable: Copy + IntoEnumIterator + Into<&'static str> {
    type Component;

    fn label(self) -> &'static str {
        self.into()
    }
    fn unit(self) -> &'static str;
    fn aggregation(self) -> Aggregation {
        Aggregation::Average
    }
    fn value(self, component: &Self::Component) -> f64;
}

fn energy(rate: f64, timestep: f64) -> f64 {
    joules_to_kilowatt_hours(rate * timestep)
}

#[derive(Clone, Copy, Debug, EnumIter, Eq, IntoStaticStr, PartialEq)]
pub enum WaterHeaterVariable {
    #[strum(serialize = "tank temperature")]
    TankTemperature,
    #[strum(serialize = "final tank temperature")]
    FinalTankTemperature,
    #[strum(serialize = "use side outlet temperature")]
    UseOutletTemperature,
    #[strum(serialize = "source side outlet temperature")]
    SourceOutletTemperature,
    #[strum(serialize = "use side mass flow")]
    UseMassFlow,
    #[strum(serialize = "source side mass flow")]
    SourceMassFlow,
    #[strum(serialize = "heat loss rate")]
    LossRate,
    #[strum(serialize = "heat loss energy")]
    LossEnergy,
    #[strum(serialize = "use side heat transfer rate")]
    UseRate,
    #[strum(serialize = "use side heat transfer energy")]
    UseEnergy,
    #[strum(serialize = "source side heat transfer rate")]
    SourceRate,
    #[strum(serialize = "source side heat transfer energy")]
    SourceEnergy,
    #[strum(serialize = "heater heating rate")]
    HeaterRate,
    #[strum(serialize = "heater heating energy")]
    HeaterEnergy,
    #[strum(serialize = "heater 1 heating rate")]
    Heater1Rate,
    #[strum(serialize = "heater 2 heating rate")]
    Heater2Rate,
    #[strum(serialize = "heater fuel rate")]
    FuelRate,
    #[strum(serialize = "heater fuel energy")]
    FuelEnergy,
    #[strum(serialize = "vent rate")]
    VentRate,
    #[strum(serialize = "vent energy")]
    VentEnergy,
    #[strum(serialize = "off cycle parasitic fuel rate")]
    OffCycleParasiticFuelRate,
    #[strum(serialize = "off cycle parasitic heat to tank rate")]
    OffCycleParasiticHeatRate,
    #[strum(serialize = "on cycle parasitic fuel rate")]
    OnCycleParasiticFuelRate,
    #[strum(serialize = "on cycle parasitic heat to tank rate")]
    OnCycleParasiticHeatRate,
    #[strum(serialize = "unmet demand rate")]
    UnmetRate,
    #[strum(serialize = "unmet demand energy")]
    UnmetEnergy,
    #[strum(serialize = "net heat transfer rate")]
    NetHeatTransferRate,
    #[strum(serialize = "net heat transfer energy")]
    NetHeatTransferEnergy,
    #[strum(serialize = "zone heat gain rate")]
    ZoneHeatGainRate,
    #[strum(serialize = "heater 1 cycle on count")]
    Heater1CycleOnCount,
    #[strum(serialize = "heater 2 cycle on count")]
    Heater2CycleOnCount,
    #[strum(serialize = "heater 1 runtime fraction")]
    Heater1RuntimeFraction,
    #[strum(serialize = "heater 2 runtime fraction")]
    Heater2RuntimeFraction,
    #[strum(serialize = "heater part load ratio")]
    PartLoadRatio,
}

impl Reportable for WaterHeaterVariable {
    type Component = WaterHeater;

    fn unit(self) -> &'static str {
        use WaterHeaterVariable::*;
        match self {
            TankTemperature | FinalTankTemperature | UseOutletTemperature
            | SourceOutletTemperature => "[C]",
            UseMassFlow | SourceMassFlow => "[kg/s]",
            LossEnergy | UseEnergy | SourceEnergy | HeaterEnergy | FuelEnergy | VentEnergy
            | UnmetEnergy | NetHeatTransferEnergy => "[kWh]",
            Heater1CycleOnCount | Heater2CycleOnCount => "[count]",
            Heater1RuntimeFraction | Heater2RuntimeFraction | PartLoadRatio => "[ratio]",
            _ => "[W]",
        }
    }

    fn aggregation(self) -> Aggregation {
        match self.unit() {
            "[kWh]" | "[count]" => Aggregation::Sum,
            _ => Aggregation::Average,
        }
    }

    fn value(self, tank: &WaterHeater) -> f64 {
        use WaterHeaterVariable::*;
        let report = &tank.report;
        let timestep = report.timestep;
        match self {
            TankTemperature => report.average_temperature,
            FinalTankTemperature => report.final_temperature,
            UseOutletTemperature => report.use_outlet_temperature,
            SourceOutletTemperature => report.source_outlet_temperature,
            UseMassFlow => report.use_mass_flow,
            SourceMassFlow => report.source_mass_flow,
            LossRate => report.loss_rate,
            LossEnergy => energy(report.loss_rate, timestep),
            UseRate => report.use_rate,
            UseEnergy => energy(report.use_rate, timestep),
            SourceRate => report.source_rate,
            SourceEnergy => energy(report.source_rate, timestep),
            HeaterRate => report.heater_rate,
            HeaterEnergy => energy(report.heater_rate, timestep),
            Heater1Rate => report.heater_rates[0],
            Heater2Rate => report.heater_rates[1],
            FuelRate => report.fuel_rate,
            FuelEnergy => energy(report.fuel_rate, timestep),
            VentRate => report.vent_rate,
            VentEnergy => energy(report.vent_rate, timestep),
            OffCycleParasiticFuelRate => report.off_cycle_parasitic_fuel_rate,
            OffCycleParasiticHeatRate => report.off_cycle_parasitic_heat_rate,
            OnCycleParasiticFuelRate => report.on_cycle_parasitic_fuel_rate,
            OnCycleParasiticHeatRate => report.on_cycle_parasitic_heat_rate,
            UnmetRate => report.unmet_rate,
            UnmetEnergy => energy(report.unmet_rate, timestep),
            NetHeatTransferRate => report.net_heat_transfer_rate,
            NetHeatTransferEnergy => energy(report.net_heat_transfer_rate, timestep),
            ZoneHeatGainRate => report.zone_heat_gain_rate,
            Heater1CycleOnCount => report.cycle_on_count[0] as f64,
            Heater2CycleOnCount => report.cycle_on_count[1] as f64,
            Heater1RuntimeFraction => report.runtime_fractions[0],
            Heater2RuntimeFraction => report.runtime_fractions[1],
            PartLoadRatio => report.part_load_ratio,
        }
    }
}

#[derive(Clone, Copy, Debug, EnumIter, Eq, IntoStaticStr, PartialEq)]
pub enum HeatPumpVariable {
    #[strum(serialize = "heating rate")]
    HeatingRate,
    #[strum(serialize = "heating energy")]
    HeatingEnergy,
    #[strum(serialize = "electric power")]
    ElectricPower,
    #[strum(serialize = "electric energy")]
    ElectricEnergy,
    #[strum(serialize = "compressor power")]
    CompressorPower,
    #[strum(serialize = "fan power")]
    FanPower,
    #[strum(serialize = "evaporator heat rate")]
    EvaporatorHeatRate,
    #[strum(serialize = "part load ratio")]
    PartLoadRatio,
    #[strum(serialize = "runtime fraction")]
    RuntimeFraction,
    #[strum(serialize = "COP")]
    Cop,
    #[strum(serialize = "speed level")]
    SpeedLevel,
    #[strum(serialize = "speed ratio")]
    SpeedRatio,
    #[strum(serialize = "heating mode")]
    HeatingMode,
}

impl Reportable for HeatPumpVariable {
    type Component = HeatPumpWaterHeater;

    fn unit(self) -> &'static str {
        use HeatPumpVariable::*;
        match self {
            HeatingEnergy | ElectricEnergy => "[kWh]",
            PartLoadRatio | RuntimeFraction | Cop | SpeedRatio | HeatingMode => "[ratio]",
            SpeedLevel => "[count]",
            _ => "[W]",
        }
    }

    fn aggregation(self) -> Aggregation {
        match self {
            HeatPumpVariable::HeatingEnergy | HeatPumpVariable::ElectricEnergy => Aggregation::Sum,
            _ => Aggregation::Average,
        }
    }

    fn value(self, heat_pump: &HeatPumpWaterHeater) -> f64 {
        use HeatPumpVariable::*;
        let report = &heat_pump.report;
        match self {
            HeatingRate => report.heating_rate,
            HeatingEnergy => energy(report.heating_rate, report.timestep),
            ElectricPower => report.electric_power(),
            ElectricEnergy => energy(report.electric_power(), report.timestep),
            CompressorPower => report.compressor_power,
            FanPower => report.fan_power,
            EvaporatorHeatRate => report.evaporator_heat_rate,
            PartLoadRatio => report.part_load_ratio,
            RuntimeFraction => report.runtime_fraction,
            Cop => report.cop,
            SpeedLevel => report.speed as f64,
            SpeedRatio => report.speed_ratio,
            HeatingMode => f64::from(u8::from(heat_pump.state.mode == SourceMode::Heating)),
        }
    }
}

#[derive(Clone, Copy, Debug, EnumIter, Eq, IntoStaticStr, PartialEq)]
pub enum DesuperheaterVariable {
    #[strum(serialize = "heating rate")]
    HeatingRate,
    #[strum(serialize = "heating energy")]
    HeatingEnergy,
    #[strum(serialize = "reclaimed heat rate")]
    ReclaimedHeatRate,
    #[strum(serialize = "pump power")]
    PumpPower,
    #[strum(serialize = "pump energy")]
    PumpEnergy,
    #[strum(serialize = "on cycle parasitic power")]
    OnCycleParasiticPower,
    #[strum(serialize = "off cycle parasitic power")]
    OffCycleParasiticPower,
    #[strum(serialize = "part load ratio")]
    PartLoadRatio,
}

impl Reportable for DesuperheaterVariable {
    type Component = Desuperheater;

    fn unit(self) -> &'static str {
        use DesuperheaterVariable::*;
        match self {
            HeatingEnergy | PumpEnergy => "[kWh]",
            PartLoadRatio => "[ratio]",
            _ => "[W]",
        }
    }

    fn aggregation(self) -> Aggregation {
        match self {
            DesuperheaterVariable::HeatingEnergy | DesuperheaterVariable::PumpEnergy => {
                Aggregation::Sum
            }
            _ => Aggregation::Average,
        }
    }

    fn value(self, desuperheater: &Desuperheater) -> f64 {
        use DesuperheaterVariable::*;
        let report = &desuperheater.report;
        match self {
            HeatingRate => report.heating_rate,
            HeatingEnergy => energy(report.heating_rate, report.timestep),
            ReclaimedHeatRate => report.reclaimed_heat_rate,
            PumpPower => report.pump_power,
            PumpEnergy => energy(report.pump_power, report.timestep),
            OnCycleParasiticPower => report.on_cycle_parasitic_power,
            OffCycleParasiticPower => report.off_cycle_parasitic_power,
            PartLoadRatio => report.part_load_ratio,
        }
    }
}

#[derive(Clone, Copy, Debug, EnumIter, Eq, IntoStaticStr, PartialEq)]
pub enum EquipmentVariable {
    #[strum(serialize = "hot water volume flow")]
    HotVolumeFlow,
    #[strum(serialize = "cold water volume flow")]
    ColdVolumeFlow,
    #[strum(serialize = "total volume flow")]
    TotalVolumeFlow,
    #[strum(serialize = "hot water volume")]
    HotVolume,
    #[strum(serialize = "total volume")]
    TotalVolume,
    #[strum(serialize = "hot water temperature")]
    HotTemperature,
    #[strum(serialize = "cold water temperature")]
    ColdTemperature,
    #[strum(serialize = "target temperature")]
    TargetTemperature,
    #[strum(serialize = "mixed water temperature")]
    MixedTemperature,
    #[strum(serialize = "drain water temperature")]
    DrainTemperature,
    #[strum(serialize = "zone sensible heat gain rate")]
    SensibleRate,
    #[strum(serialize = "zone latent gain rate")]
    LatentRate,
    #[strum(serialize = "heating rate")]
    Power,
    #[strum(serialize = "heating energy")]
    Energy,
}

impl Reportable for EquipmentVariable {
    type Component = WaterUseEquipment;

    fn unit(self) -> &'static str {
        use EquipmentVariable::*;
        match self {
            HotVolumeFlow | ColdVolumeFlow | TotalVolumeFlow => "[m3/s]",
            HotVolume | TotalVolume => "[m3]",
            HotTemperature | ColdTemperature | TargetTemperature | MixedTemperature
            | DrainTemperature => "[C]",
            Energy => "[kWh]",
            _ => "[W]",
        }
    }

    fn aggregation(self) -> Aggregation {
        match self.unit() {
            "[m3]" | "[kWh]" => Aggregation::Sum,
            _ => Aggregation::Average,
        }
    }

    fn value(self, fixture: &WaterUseEquipment) -> f64 {
        use EquipmentVariable::*;
        let state = &fixture.state;
        match self {
            HotVolumeFlow => state.hot_volume_flow,
            ColdVolumeFlow => state.cold_volume_flow,
            TotalVolumeFlow => state.total_volume_flow,
            HotVolume => state.hot_volume_flow * state.timestep,
            TotalVolume => state.total_volume_flow * state.timestep,
            HotTemperature => state.hot_temperature,
            ColdTemperature => state.cold_temperature,
            TargetTemperature => state.target_temperature,
            MixedTemperature => state.mixed_temperature,
            DrainTemperature => state.drain_temperature,
            SensibleRate => state.sensible_rate,
            LatentRate => state.latent_rate,
            Power => state.power,
            Energy => energy(state.power, state.timestep),
        }
    }
}

#[derive(Clone, Copy, Debug, EnumIter, Eq, IntoStaticStr, PartialEq)]
pub enum ConnectionsVariable {
    #[strum(serialize = "hot water volume flow")]
    HotVolumeFlow,
    #[strum(serialize = "cold water volume flow")]
    ColdVolumeFlow,
    #[strum(serialize = "total volume flow")]
    TotalVolumeFlow,
    #[strum(serialize = "drain water volume flow")]
    DrainVolumeFlow,
    #[strum(serialize = "hot water volume")]
    HotVolume,
    #[strum(serialize = "plant design mass flow")]
    DesignMassFlow,
    #[strum(serialize = "hot water temperature")]
    HotTemperature,
    #[strum(serialize = "cold water temperature")]
    ColdTemperature,
    #[strum(serialize = "drain water temperature")]
    DrainTemperature,
    #[strum(serialize = "return water temperature")]
    ReturnTemperature,
    #[strum(serialize = "waste water temperature")]
    WasteTemperature,
    #[strum(serialize = "heat recovery water temperature")]
    RecoveryTemperature,
    #[strum(serialize = "heat recovery rate")]
    RecoveryRate,
    #[strum(serialize = "heat recovery energy")]
    RecoveryEnergy,
    #[strum(serialize = "heat recovery effectiveness")]
    Effectiveness,
    #[strum(serialize = "plant hot water rate")]
    Power,
    #[strum(serialize = "plant hot water energy")]
    Energy,
}

impl Reportable for ConnectionsVariable {
    type Component = WaterUseConnections;

    fn unit(self) -> &'static str {
        use ConnectionsVariable::*;
        match self {
            HotVolumeFlow | ColdVolumeFlow | TotalVolumeFlow | DrainVolumeFlow => "[m3/s]",
            HotVolume => "[m3]",
            DesignMassFlow => "[kg/s]",
            HotTemperature | ColdTemperature | DrainTemperature | ReturnTemperature
            | WasteTemperature | RecoveryTemperature => "[C]",
            RecoveryEnergy | Energy => "[kWh]",
            Effectiveness => "[ratio]",
            _ => "[W]",
        }
    }

    fn aggregation(self) -> Aggregation {
        match self.unit() {
            "[m3]" | "[kWh]" => Aggregation::Sum,
            _ => Aggregation::Average,
        }
    }

    fn value(self, connections: &WaterUseConnections) -> f64 {
        use ConnectionsVariable::*;
        let state = &connections.state;
        match self {
            HotVolumeFlow => state.hot_volume_flow,
            ColdVolumeFlow => state.cold_volume_flow,
            TotalVolumeFlow => state.total_volume_flow,
            DrainVolumeFlow => state.drain_volume_flow,
            HotVolume => state.hot_volume_flow * state.timestep,
            DesignMassFlow => state.design_mass_flow,
            HotTemperature => state.hot_temperature,
            ColdTemperature => state.cold_temperature,
            DrainTemperature => state.drain_temperature,
            ReturnTemperature => state.return_temperature,
            WasteTemperature => state.waste_temperature,
            RecoveryTemperature => state.recovery_temperature,
            RecoveryRate => state.recovery_rate,
            RecoveryEnergy => energy(state.recovery_rate, state.timestep),
            Effectiveness => state.effectiveness,
            Power => state.power,
            Energy => energy(state.power, state.timestep),
        }
    }
}

#[derive(Clone, Copy, Debug, EnumIter, Eq, IntoStaticStr, PartialEq)]
pub enum StorageVariable {
    #[strum(serialize = "volume")]
    Volume,
    #[strum(serialize = "demand volume flow")]
    DemandVolumeFlow,
    #[strum(serialize = "supplied volume flow")]
    SuppliedVolumeFlow,
    #[strum(serialize = "inflow volume flow")]
    InflowVolumeFlow,
    #[strum(serialize = "overflow volume flow")]
    OverflowVolumeFlow,
    #[strum(serialize = "shortfall volume flow")]
    ShortfallVolumeFlow,
}

impl Reportable for StorageVariable {
    type Component = WaterStorage;

    fn unit(self) -> &'static str {
        match self {
            StorageVariable::Volume => "[m3]",
            _ => "[m3/s]",
        }
    }

    fn value(self, storage: &WaterStorage) -> f64 {
        use StorageVariable::*;
        let report = &storage.report;
        match self {
            Volume => report.volume,
            DemandVolumeFlow => report.demand_volume_flow,
            SuppliedVolumeFlow => report.supplied_volume_flow,
            InflowVolumeFlow => report.inflow_volume_flow,
            OverflowVolumeFlow => report.overflow_volume_flow,
            ShortfallVolumeFlow => report.shortfall_volume_flow,
        }
    }
}

/// Where a column's value comes from: an arena index and the variable to read.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Sampler {
    WaterHeater(usize, WaterHeaterVariable),
    HeatPump(usize, HeatPumpVariable),
    Desuperheater(usize, DesuperheaterVariable),
    Equipment(usize, EquipmentVariable),
    Connections(usize, ConnectionsVariable),
    Storage(usize, StorageVariable),
}

fn read<R: Reportable>(components: &[R::Component], index: usize, variable: R) -> f64 {
    components
        .get(index)
        .map_or(0., |component| variable.value(component))
}

impl Sampler {
    fn sample(&self, corpus: &Corpus) -> f64 {
        match *self {
            Sampler::WaterHeater(index, variable) => read(&corpus.water_heaters, index, variable),
            Sampler::HeatPump(index, variable) => read(&corpus.heat_pumps, index, variable),
            Sampler::Desuperheater(index, variable) => {
                read(&corpus.desuperheaters, index, variable)
            }
            Sampler::Equipment(index, variable) => read(&corpus.equipment, index, variable),
            Sampler::Connections(index, variable) => read(&corpus.connections, index, variable),
            Sampler::Storage(index, variable) => read(&corpus.storages, index, variable),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResultColumn {
    pub heading: String,
    pub unit: &'static str,
    pub aggregation: Aggregation,
    pub values: Vec<f64>,
}

impl ResultColumn {
    /// The column's value over the whole run.
    pub fn aggregate(&self) -> f64 {
        let total: f64 = self.values.iter().sum();
        match self.aggregation {
            Aggregation::Sum => total,
            Aggregation::Average if self.values.is_empty() => 0.,
            Aggregation::Average => total / self.values.len() as f64,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunResults {
    /// Hours from the start of the year, one per timestep
    pub timesteps: Vec<f64>,
    pub columns: Vec<ResultColumn>,
}

impl RunResults {
    pub fn column(&self, heading: &str) -> Option<&ResultColumn> {
        self.columns.iter().find(|column| column.heading == heading)
    }
}

#[derive(Debug)]
pub struct Reporter {
    capacity: usize,
    samplers: Vec<Sampler>,
    results: RunResults,
}

impl Reporter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samplers: vec![],
            results: RunResults {
                timesteps: Vec::with_capacity(capacity),
                columns: vec![],
            },
        }
    }

    /// A reporter with every component of the corpus registered.
    pub fn for_corpus(corpus: &Corpus) -> Self {
        let mut reporter = Self::new(corpus.simulation_time.total_steps());
        for (index, tank) in corpus.water_heaters.iter().enumerate() {
            reporter.register_reportable(&tank.name, index, Sampler::WaterHeater);
        }
        for (index, heat_pump) in corpus.heat_pumps.iter().enumerate() {
            reporter.register_reportable(&heat_pump.name, index, Sampler::HeatPump);
        }
        for (index, desuperheater) in corpus.desuperheaters.iter().enumerate() {
            reporter.register_reportable(&desuperheater.name, index, Sampler::Desuperheater);
        }
        for (index, connections) in corpus.connections.iter().enumerate() {
            reporter.register_reportable(&connections.name, index, Sampler::Connections);
        }
        for (index, fixture) in corpus.equipment.iter().enumerate() {
            reporter.register_reportable(&fixture.name, index, Sampler::Equipment);
        }
        for (index, storage) in corpus.storages.iter().enumerate() {
            reporter.register_reportable(&storage.name, index, Sampler::Storage);
        }
        reporter
    }

    /// Add one column per variable of `R` for the component at `index`.
    fn register_reportable<R: Reportable>(
        &mut self,
        component: &str,
        index: usize,
        sampler: impl Fn(usize, R) -> Sampler,
    ) {
        for variable in R::iter() {
            self.results.columns.push(ResultColumn {
                heading: format!("{component} {}", variable.label()),
                unit: variable.unit(),
                aggregation: variable.aggregation(),
                values: Vec::with_capacity(self.capacity),
            });
            self.samplers.push(sampler(index, variable));
        }
    }

    pub fn sample(&mut self, corpus: &Corpus, simtime: &SimulationTimeIteration) {
        self.results.timesteps.push(simtime.time);
        for (sampler, column) in self.samplers.iter().zip(self.results.columns.iter_mut()) {
            column.values.push(sampler.sample(corpus));
        }
    }

    pub fn finish(self) -> RunResults {
        self.results
    }
}
