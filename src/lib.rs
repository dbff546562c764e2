pub mod common;
pub mod engine;
pub mod model;
pub mod organizer;
