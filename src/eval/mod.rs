pub mod evaluator;
pub mod summary;

pub use evaluator::{EvalConfig, EvaluationReport, Evaluator, LiveEnvironment, LiveStep};
pub use summary::{EvaluationMetrics, TaskStats};
