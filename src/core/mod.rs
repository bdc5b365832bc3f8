pub mod curves;
pub mod environment;
pub mod material_properties;
pub mod plant;
mod psychrometrics;
pub mod recurring_warnings;
pub mod schedule;
pub(crate) mod solvers;
pub mod units;
pub mod water_heaters;
pub mod water_use;
