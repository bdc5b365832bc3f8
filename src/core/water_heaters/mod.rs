pub mod desuperheater;
pub mod heat_pump;
pub mod node;
pub mod stratified;
pub mod tank;
