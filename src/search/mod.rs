pub mod dynamics_env;
pub mod env;
pub mod fmc;
pub mod sampler;
pub mod tree;

pub use dynamics_env::{DynamicsEnvironment, EnvConfig};
pub use env::{StepBatch, VectorizedEnvironment};
pub use fmc::{Fmc, FmcConfig, relativize};
pub use sampler::{SampleType, TreeBatch, TreeSampler};
pub use tree::{NodeId, ROOT, SearchNode, SearchTree, TreePath};
