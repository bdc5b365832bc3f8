pub const WATTS_PER_KILOWATT: u32 = 1_000;
pub const LITRES_PER_CUBIC_METRE: u32 = 1_000;
pub const SECONDS_PER_MINUTE: u32 = 60;
pub const SECONDS_PER_HOUR: u32 = 3_600;
pub const JOULES_PER_KILOWATT_HOUR: u32 = 3_600_000;

pub(crate) const KELVIN_OFFSET: f64 = 273.15;

/// Standard atmospheric pressure, in Pa
pub const STANDARD_PRESSURE: f64 = 101_325.;

/// Water temperature at which fixture flow rates are converted from volume to mass, in deg C
pub const WATER_USE_INIT_TEMPERATURE: f64 = 5.05;

pub(crate) fn joules_to_kilowatt_hours(joules: f64) -> f64 {
    joules / JOULES_PER_KILOWATT_HOUR as f64
}
