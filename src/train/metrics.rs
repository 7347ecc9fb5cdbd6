//! Training metrics and the sinks they are reported to

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::Result;

/// Moving average over the last `window_size` values
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<f32>,
    window_size: usize,
    sum: f32,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.values.len() >= self.window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Scalars produced by one training batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub step: usize,
    pub total_loss: f32,
    pub consistency_loss: f32,
    pub classification_loss: f32,
    /// Share of classified frames whose argmax matched the target logit
    pub accuracy: f32,
    /// Share of classified frames whose argmax over task classes matched the task
    pub task_accuracy: f32,
    pub frame_count: usize,
    /// Steps on the sampled search paths, summed over the batch
    pub search_steps: usize,
    /// Mean confusion along a sampled search path, averaged over the batch's searches
    pub search_average_reward: f32,
    pub task_ids: Vec<usize>,
}

impl TrainReport {
    /// Metric names and values in the order they are logged
    pub fn scalars(&self) -> [(&'static str, f32); 8] {
        [
            ("train/total_loss", self.total_loss),
            ("train/expert_consistency_loss", self.consistency_loss),
            ("train/classification_loss", self.classification_loss),
            ("train/accuracy", self.accuracy),
            ("train/no_fmc_task_accuracy", self.task_accuracy),
            ("metrics/frame_count", self.frame_count as f32),
            ("fmc/steps_taken", self.search_steps as f32),
            ("fmc/average_reward", self.search_average_reward),
        ]
    }
}

/// Destination for per-batch training metrics
pub trait MetricsSink {
    fn record(&mut self, report: &TrainReport) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Logs smoothed metrics through `tracing` every `log_every` batches
#[derive(Debug)]
pub struct TracingSink {
    log_every: usize,
    total_loss: MovingAverage,
    consistency_loss: MovingAverage,
    accuracy: MovingAverage,
    search_reward: MovingAverage,
    frames: usize,
    start_time: Instant,
}

impl TracingSink {
    pub fn new(log_every: usize, window_size: usize) -> Self {
        Self {
            log_every: log_every.max(1),
            total_loss: MovingAverage::new(window_size),
            consistency_loss: MovingAverage::new(window_size),
            accuracy: MovingAverage::new(window_size),
            search_reward: MovingAverage::new(window_size),
            frames: 0,
            start_time: Instant::now(),
        }
    }

    pub fn frames_per_second(&self) -> f64 {
        let duration = self.start_time.elapsed().as_secs_f64();
        if duration > 0.0 {
            self.frames as f64 / duration
        } else {
            0.0
        }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(10, 100)
    }
}

impl MetricsSink for TracingSink {
    fn record(&mut self, report: &TrainReport) -> Result<()> {
        self.total_loss.push(report.total_loss);
        self.consistency_loss.push(report.consistency_loss);
        self.accuracy.push(report.accuracy);
        self.search_reward.push(report.search_average_reward);
        self.frames += report.frame_count;

        tracing::debug!(
            "Batch {} tasks {:?}: loss={:.4}, classification={:.4}, consistency={:.4}, accuracy={:.3}",
            report.step,
            report.task_ids,
            report.total_loss,
            report.classification_loss,
            report.consistency_loss,
            report.accuracy
        );

        if report.step % self.log_every == 0 {
            tracing::info!(
                "Step {} | frames {} | FPS {:.1}",
                report.step,
                self.frames,
                self.frames_per_second()
            );
            tracing::info!(
                "  Losses: total={:.4}, consistency={:.4} | accuracy={:.1}% | search reward={:.3}",
                self.total_loss.average(),
                self.consistency_loss.average(),
                self.accuracy.average() * 100.0,
                self.search_reward.average()
            );
        }
        Ok(())
    }
}

/// Appends one `step,value` CSV per metric under a log directory
#[derive(Debug, Clone)]
pub struct CsvMetricsLogger {
    log_dir: PathBuf,
}

impl CsvMetricsLogger {
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self { log_dir })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// `train/total_loss` is written to `train_total_loss.csv`
    pub fn path_for(&self, tag: &str) -> PathBuf {
        self.log_dir.join(format!("{}.csv", tag.replace('/', "_")))
    }

    pub fn log_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        let path = self.path_for(tag);
        let file_exists = path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !file_exists {
            writeln!(file, "step,value")?;
        }
        writeln!(file, "{},{}", step, value)?;
        Ok(())
    }
}

impl MetricsSink for CsvMetricsLogger {
    fn record(&mut self, report: &TrainReport) -> Result<()> {
        for (tag, value) in report.scalars() {
            self.log_scalar(tag, value, report.step)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        tracing::info!("Metrics saved to {}", self.log_dir.display());
        Ok(())
    }
}

/// Fans a report out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricsSink for MultiSink {
    fn record(&mut self, report: &TrainReport) -> Result<()> {
        for sink in &mut self.sinks {
            sink.record(report)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}
