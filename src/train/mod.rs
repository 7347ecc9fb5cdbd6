pub mod checkpoint;
pub mod metrics;
pub mod representation;
pub mod trainer;

pub use checkpoint::{CheckpointMeta, RepresentationMeta, RunDirectory, TargetState};
pub use metrics::{CsvMetricsLogger, MetricsSink, MovingAverage, MultiSink, TracingSink, TrainReport};
pub use representation::{RepresentationTrainer, RepresentationTrainerConfig};
pub use trainer::{FgzTrainer, SubTrajectoryLoss, TrainContext, TrainerConfig, run_name};
