pub mod action;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod model;
pub mod search;
pub mod train;

// Re-export commonly used types for convenience
pub use action::{Action, Button};
pub use config::FgzConfig;
pub use error::{FgzError, Result};
pub use search::{DynamicsEnvironment, Fmc};
pub use train::{FgzTrainer, TrainContext};
