pub mod sync;
pub mod transition;
