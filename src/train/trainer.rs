//! Fractal search training loop for the dynamics function
//!
//! Each sub-trajectory window contributes two terms. The expert term unrolls
//! the dynamics function along the demonstrated actions, classifying every
//! predicted state as the demonstrated task and pulling the predicted
//! embeddings towards the expert's. The search term runs the fractal search
//! from the window's root, rewarding walkers for confusing the discriminator,
//! and trains the discriminator to label the best path as search-generated.
//! All windows of a batch accumulate into one scalar and one optimizer step.

use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::SeedableRng;
use rand::rngs::StdRng;
use time::{OffsetDateTime, format_description};

use super::metrics::TrainReport;
use crate::data::{DataHandler, Embedder, TrajectoryLoader, TrajectoryWindow};
use crate::error::{self, FgzError, tensor_to_vec};
use crate::model::{DynamicsFunction, argmax, constant_target_cross_entropy, squared_error};
use crate::search::{DynamicsEnvironment, Fmc, TreeSampler};

/// Trajectories drawn before giving up on finding one that fills a window
const MAX_TRAJECTORY_ATTEMPTS: usize = 100;

#[derive(Debug, Config)]
pub struct TrainerConfig {
    /// Simulation steps per search episode
    #[config(default = 16)]
    pub search_steps: usize,
    /// Expert steps unrolled through the dynamics function per window
    #[config(default = 4)]
    pub unroll_steps: usize,
    /// Sub-trajectories per optimizer step
    #[config(default = 8)]
    pub batch_size: usize,
    /// Weight of the consistency term; 0 disables it
    #[config(default = 1.0)]
    pub consistency_loss_coeff: f32,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// Skip the search term and the search class entirely
    #[config(default = false)]
    pub disable_search_detection: bool,
    /// Windows used from each sampled trajectory; all of them when unset
    pub max_windows_per_trajectory: Option<usize>,
    #[config(default = 0)]
    pub seed: u64,
}

impl TrainerConfig {
    /// Expert windows hold the root plus one frame per unrolled step
    pub fn frames_per_window(&self) -> usize {
        self.unroll_steps + 1
    }

    pub fn discriminator_classes(&self, num_tasks: usize) -> usize {
        if self.disable_search_detection {
            num_tasks
        } else {
            num_tasks + 1
        }
    }

    pub fn validate(&self, num_tasks: usize) -> error::Result<()> {
        if self.unroll_steps == 0 {
            return Err(FgzError::config("unroll_steps must be positive"));
        }
        if self.batch_size == 0 {
            return Err(FgzError::config("batch_size must be positive"));
        }
        if !self.disable_search_detection && self.batch_size % 2 != 0 {
            return Err(FgzError::config(format!(
                "batch_size must be even when search detection is enabled, got {}",
                self.batch_size
            )));
        }
        let min_tasks = if self.disable_search_detection { 2 } else { 1 };
        if num_tasks < min_tasks {
            return Err(FgzError::config(format!(
                "at least {min_tasks} tasks are required, got {num_tasks}"
            )));
        }
        if self.max_windows_per_trajectory == Some(0) {
            return Err(FgzError::config("max_windows_per_trajectory must be positive"));
        }
        Ok(())
    }
}

/// Timestamp run name, e.g. `2024-03-01_14-05-09`
pub fn run_name() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_description::parse("[year]-[month]-[day]_[hour]-[minute]-[second]")
        .ok()
        .and_then(|format| now.format(&format).ok())
        .unwrap_or_else(|| now.unix_timestamp().to_string())
}

/// Mutable state threaded through every training step
pub struct TrainContext<B: AutodiffBackend, O> {
    /// Owns the search environment, and through it the dynamics function
    pub fmc: Fmc<DynamicsEnvironment<B>>,
    pub optimizer: O,
    pub run_name: String,
    pub train_steps_taken: usize,
}

impl<B: AutodiffBackend, O> TrainContext<B, O> {
    pub fn new(fmc: Fmc<DynamicsEnvironment<B>>, optimizer: O, run_name: impl Into<String>) -> Self {
        Self {
            fmc,
            optimizer,
            run_name: run_name.into(),
            train_steps_taken: 0,
        }
    }

    pub fn dynamics(&self) -> &DynamicsFunction<B> {
        self.fmc.env().dynamics()
    }

    pub fn device(&self) -> B::Device {
        self.fmc.env().device().clone()
    }
}

/// Per-batch counters behind the accuracy metrics
#[derive(Debug, Default)]
struct BatchStats {
    correct_logits: usize,
    correct_tasks: usize,
    frames: usize,
    /// Summed over every search in the batch
    search_steps: usize,
    searches: usize,
    search_reward_sum: f32,
}

impl BatchStats {
    fn record(&mut self, probs: &[f32], target: usize, task_id: usize, num_tasks: Option<usize>) {
        if argmax(probs) == target {
            self.correct_logits += 1;
        }
        if let Some(num_tasks) = num_tasks {
            if argmax(&probs[..num_tasks.min(probs.len())]) == task_id {
                self.correct_tasks += 1;
            }
        }
        self.frames += 1;
    }

    fn record_search(&mut self, steps: usize, average_reward: f32) {
        self.search_steps += steps;
        self.searches += 1;
        self.search_reward_sum += average_reward;
    }

    /// Mean of the per-search average rewards
    fn search_average_reward(&self) -> f32 {
        if self.searches == 0 {
            0.0
        } else {
            self.search_reward_sum / self.searches as f32
        }
    }

    fn ratio(&self, count: usize) -> f32 {
        if self.frames == 0 {
            0.0
        } else {
            count as f32 / self.frames as f32
        }
    }
}

/// Losses of one sub-trajectory, averaged over its windows
pub struct SubTrajectoryLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub consistency: Tensor<B, 1>,
    pub classification: Tensor<B, 1>,
    pub task_id: usize,
    pub windows: usize,
}

pub struct FgzTrainer {
    config: TrainerConfig,
    num_tasks: usize,
    sampler: TreeSampler,
    rng: StdRng,
}

impl FgzTrainer {
    /// Fails on configuration errors before any training happens
    pub fn new(config: TrainerConfig, num_tasks: usize) -> error::Result<Self> {
        config.validate(num_tasks)?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            num_tasks,
            sampler: TreeSampler::best_path(),
            rng,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    /// Discriminator class the search-generated states are labelled with
    pub fn search_logit(&self) -> usize {
        self.num_tasks
    }

    fn task_classes(&self) -> Option<usize> {
        (!self.config.disable_search_detection).then_some(self.num_tasks)
    }

    /// Check that the dynamics function in `ctx` matches this trainer and data
    pub fn check_context<B: AutodiffBackend, O>(&self, ctx: &TrainContext<B, O>, embedding_size: usize) -> error::Result<()> {
        let dynamics = ctx.dynamics();
        let expected = self.config.discriminator_classes(self.num_tasks);
        if dynamics.discriminator_classes() != expected {
            return Err(FgzError::config(format!(
                "dynamics function has {} discriminator classes, expected {expected}",
                dynamics.discriminator_classes()
            )));
        }
        if dynamics.state_embedding_size() != embedding_size {
            return Err(FgzError::DimensionMismatch {
                expected: embedding_size,
                actual: dynamics.state_embedding_size(),
            });
        }
        Ok(())
    }

    fn root_embedding<B: AutodiffBackend>(window: &TrajectoryWindow, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_floats(window.root_embedding(), device)
    }

    /// Confusion loss on the best search path from the window's root.
    /// `None` when the search produced no usable steps.
    fn get_search_loss<B: AutodiffBackend, O>(
        &mut self,
        ctx: &mut TrainContext<B, O>,
        window: &TrajectoryWindow,
        stats: &mut BatchStats,
    ) -> error::Result<Option<Tensor<B, 1>>> {
        if self.config.search_steps == 0 {
            tracing::warn!("Search budget is 0 steps, skipping the confusion loss");
            return Ok(None);
        }

        let device = ctx.device();
        let env = ctx.fmc.env_mut();
        env.set_target_logit(window.task_id)?;
        env.set_all_states(Self::root_embedding::<B>(window, &device))?;
        ctx.fmc.reset()?;
        ctx.fmc.simulate(self.config.search_steps)?;

        let batch = self.sampler.get_batch(ctx.fmc.tree(), &mut self.rng)?;
        let steps = batch.steps();
        if steps == 0 {
            tracing::warn!("Search path has no steps, skipping the confusion loss");
            return Ok(None);
        }

        let probs = Tensor::stack::<2>(batch.step_infos().cloned().collect(), 0);
        let host = tensor_to_vec(probs.clone())?;
        let classes = host.len() / steps;
        for row in host.chunks(classes.max(1)) {
            stats.record(row, self.search_logit(), window.task_id, self.task_classes());
        }
        stats.record_search(steps, batch.average_confusion());

        Ok(Some(constant_target_cross_entropy(probs, self.search_logit())))
    }

    /// Classification loss along the expert unroll and the mean consistency error
    fn get_expert_loss<B: AutodiffBackend, O>(
        &self,
        ctx: &TrainContext<B, O>,
        window: &TrajectoryWindow,
        stats: &mut BatchStats,
    ) -> error::Result<(Tensor<B, 1>, Tensor<B, 1>)> {
        if window.len() < self.config.unroll_steps {
            return Err(FgzError::config(format!(
                "window of {} frames is shorter than {} unroll steps",
                window.len(),
                self.config.unroll_steps
            )));
        }

        let device = ctx.device();
        let dynamics = ctx.dynamics();
        let camera_scale = ctx.fmc.env().camera_scale();

        let mut embedding = Self::root_embedding::<B>(window, &device);
        let mut loss = Tensor::<B, 1>::zeros([1], &device);
        let mut consistency = Tensor::<B, 1>::zeros([1], &device);
        let mut compared = 0usize;

        for i in 0..self.config.unroll_steps {
            let (next, probs) = dynamics.forward_action(embedding, &window.frames[i].action, camera_scale)?;
            embedding = next;

            let host = tensor_to_vec(probs.clone())?;
            stats.record(&host, window.task_id, window.task_id, self.task_classes());
            loss = loss + constant_target_cross_entropy(probs.unsqueeze::<2>(), window.task_id);

            if let Some(expected) = window.frames.get(i + 1) {
                let expected = Tensor::<B, 1>::from_floats(expected.embedding.as_slice(), &device);
                consistency = consistency + squared_error(embedding.clone(), expected);
                compared += 1;
            }
        }

        if compared > 0 {
            consistency = consistency / compared as f32;
        }
        Ok((loss / self.config.unroll_steps as f32, consistency))
    }

    /// Losses over the windows of one freshly sampled trajectory
    fn get_loss_for_sub_trajectory<B, O, L, E>(
        &mut self,
        ctx: &mut TrainContext<B, O>,
        data: &mut DataHandler<L, E>,
        stats: &mut BatchStats,
    ) -> error::Result<SubTrajectoryLoss<B>>
    where
        B: AutodiffBackend,
        L: TrajectoryLoader,
        E: Embedder + ?Sized,
    {
        let device = ctx.device();
        for _ in 0..MAX_TRAJECTORY_ATTEMPTS {
            let windows = data.sample_single_trajectory()?;
            let trajectory = windows.trajectory().clone();
            let limit = self.config.max_windows_per_trajectory.unwrap_or(usize::MAX);

            let mut total = Tensor::<B, 1>::zeros([1], &device);
            let mut consistency_total = Tensor::<B, 1>::zeros([1], &device);
            let mut count = 0usize;

            for window in windows.take(limit) {
                let search_loss = if self.config.disable_search_detection {
                    None
                } else {
                    self.get_search_loss(ctx, &window, stats)?
                };
                let (expert_loss, consistency) = self.get_expert_loss(ctx, &window, stats)?;

                total = match search_loss {
                    Some(search_loss) => total + expert_loss + search_loss,
                    None => total + expert_loss,
                };
                consistency_total = consistency_total + consistency;
                count += 1;
            }

            if count == 0 {
                tracing::warn!(
                    "{} is shorter than {} frames, sampling another trajectory",
                    trajectory,
                    data.frames_per_window()
                );
                continue;
            }

            tracing::debug!("Trained on task {} {}[{} windows]", trajectory.task_id, trajectory, count);
            let total = total / count as f32;
            let consistency = consistency_total / count as f32;
            let classification = total.clone();
            let total = total + consistency.clone() * self.config.consistency_loss_coeff;
            return Ok(SubTrajectoryLoss {
                total,
                consistency,
                classification,
                task_id: trajectory.task_id,
                windows: count,
            });
        }
        Err(FgzError::config(format!(
            "no trajectory with at least {} frames after {MAX_TRAJECTORY_ATTEMPTS} samples",
            data.frames_per_window()
        )))
    }

    /// One optimizer step over `batch_size` sub-trajectories
    pub fn train_sub_trajectories<B, O, L, E>(
        &mut self,
        ctx: &mut TrainContext<B, O>,
        data: &mut DataHandler<L, E>,
    ) -> error::Result<TrainReport>
    where
        B: AutodiffBackend,
        O: Optimizer<DynamicsFunction<B>, B>,
        L: TrajectoryLoader,
        E: Embedder + ?Sized,
    {
        let device = ctx.device();
        let mut stats = BatchStats::default();
        let mut task_ids = Vec::new();

        let mut total = Tensor::<B, 1>::zeros([1], &device);
        let mut consistency = Tensor::<B, 1>::zeros([1], &device);
        let mut classification = Tensor::<B, 1>::zeros([1], &device);

        let num_batch_steps = if self.config.disable_search_detection {
            self.config.batch_size
        } else {
            self.config.batch_size / 2
        };

        for _ in 0..num_batch_steps {
            let loss = self.get_loss_for_sub_trajectory(ctx, data, &mut stats)?;
            task_ids.push(loss.task_id);
            total = total + loss.total;
            consistency = consistency + loss.consistency;
            classification = classification + loss.classification;
        }

        let batch_size = self.config.batch_size as f32;
        let total = total / batch_size;
        let consistency = consistency / batch_size;
        let classification = classification / batch_size;

        let report = TrainReport {
            step: ctx.train_steps_taken,
            total_loss: scalar(total.clone())?,
            consistency_loss: scalar(consistency)?,
            classification_loss: scalar(classification)?,
            accuracy: stats.ratio(stats.correct_logits),
            task_accuracy: stats.ratio(stats.correct_tasks),
            frame_count: stats.frames,
            search_steps: stats.search_steps,
            search_average_reward: stats.search_average_reward(),
            task_ids,
        };

        let dynamics = ctx.dynamics().clone();
        let grads = total.backward();
        let grads = GradientsParams::from_grads(grads, &dynamics);
        let dynamics = ctx.optimizer.step(self.config.learning_rate, dynamics, grads);
        ctx.fmc.env_mut().set_dynamics(dynamics);

        ctx.train_steps_taken += 1;
        Ok(report)
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> error::Result<f32> {
    Ok(tensor_to_vec(tensor)?.first().copied().unwrap_or(0.0))
}
