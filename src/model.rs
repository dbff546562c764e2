pub mod configuration;
pub mod container;
pub mod surface;
