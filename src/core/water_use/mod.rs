pub mod connections;
pub mod equipment;
pub mod heat_recovery;
pub mod water_storage;
