//! Burn models trained by this crate

pub mod dynamics;
pub mod loss;
pub mod representation;

pub use dynamics::{DynamicsConfig, DynamicsFunction};
pub use loss::{argmax, constant_target_cross_entropy, probability_cross_entropy, squared_error};
pub use representation::{RepresentationConfig, RepresentationModel};
