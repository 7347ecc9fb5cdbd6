//! Drive a live environment with the fractal search over a trained dynamics function

use std::sync::Arc;

use burn::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::action::{Action, Button};
use super::summary::EvaluationMetrics;
use crate::data::Embedder;
use crate::error::{FgzError, Result, tensor_to_vec};
use crate::model::RepresentationModel;
use crate::search::{DynamicsEnvironment, EnvConfig, Fmc, FmcConfig, TreeSampler};
use crate::train::RunDirectory;

/// Outcome of one live step
#[derive(Debug, Clone)]
pub struct LiveStep {
    /// Frame features of the new observation
    pub observation: Vec<f32>,
    pub reward: f32,
    pub done: bool,
}

/// The real game the trained agent is evaluated in
pub trait LiveEnvironment {
    fn reset(&mut self) -> Result<Vec<f32>>;

    fn step(&mut self, action: &Action) -> Result<LiveStep>;
}

#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Discriminator class the search rewards confusion against
    pub target_logit: usize,
    pub search_steps: usize,
    /// Stop after this many live steps even if the episode is not done
    pub max_steps: Option<usize>,
    /// Never press ESC, which would open the game menu
    pub force_no_escape: bool,
    pub seed: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            target_logit: 0,
            search_steps: 16,
            max_steps: Some(1000),
            force_no_escape: true,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationReport {
    pub actions: Vec<Action>,
    pub rewards: Vec<f32>,
    /// Average reward of the best search path at each step
    pub path_rewards: Vec<f32>,
    /// Distance from each observed embedding to the target state, when one was given
    pub target_distances: Vec<f32>,
    pub done: bool,
}

impl EvaluationReport {
    pub fn steps(&self) -> usize {
        self.rewards.len()
    }

    pub fn total_reward(&self) -> f32 {
        self.rewards.iter().sum()
    }

    pub fn final_distance(&self) -> Option<f32> {
        self.target_distances.last().copied()
    }
}

pub struct Evaluator<B: Backend, E: Embedder + ?Sized> {
    fmc: Fmc<DynamicsEnvironment<B>>,
    embedder: Arc<E>,
    config: EvalConfig,
    target_state: Option<Vec<f32>>,
    /// Projects live embeddings into the space of `target_state` when set
    representation: Option<RepresentationModel<B>>,
    sampler: TreeSampler,
    rng: StdRng,
}

impl<B: Backend, E: Embedder + ?Sized> Evaluator<B, E> {
    pub fn new(
        mut fmc: Fmc<DynamicsEnvironment<B>>,
        embedder: Arc<E>,
        config: EvalConfig,
    ) -> Result<Self> {
        if config.search_steps == 0 {
            return Err(FgzError::config("evaluation needs at least one search step"));
        }
        let expected = fmc.env().dynamics().state_embedding_size();
        if embedder.embedding_size() != expected {
            return Err(FgzError::DimensionMismatch {
                expected,
                actual: embedder.embedding_size(),
            });
        }
        fmc.env_mut().set_target_logit(config.target_logit)?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            fmc,
            embedder,
            config,
            target_state: None,
            representation: None,
            sampler: TreeSampler::best_path(),
            rng,
        })
    }

    /// Rebuild the dynamics function and target state saved by a training run.
    ///
    /// The camera scale comes from the checkpointed dynamics config. The target
    /// is the saved embedding for `config.target_logit`; a missing file or task
    /// entry leaves the evaluator without one.
    pub fn from_checkpoint(
        run: &RunDirectory,
        step: Option<usize>,
        env_config: EnvConfig,
        fmc_config: FmcConfig,
        embedder: Arc<E>,
        config: EvalConfig,
        device: B::Device,
    ) -> Result<Self> {
        let (dynamics, meta) = run.load_model::<B>(step, &device)?;
        let env = DynamicsEnvironment::new(dynamics, env_config, device);
        let evaluator = Self::new(Fmc::new(env, fmc_config), embedder, config)?;
        let task = evaluator.config.target_logit;

        match run.load_target_state(Some(meta.step)) {
            Ok(target) => match target.for_task(task) {
                Some(embedding) => {
                    let embedding = embedding.to_vec();
                    Ok(evaluator.with_target_state(embedding))
                }
                None => {
                    tracing::warn!("Target state {} has no entry for task {}", meta.step, task);
                    Ok(evaluator)
                }
            },
            Err(FgzError::NoCheckpoint(path)) => {
                tracing::warn!("No target state at {}, evaluating without one", path.display());
                Ok(evaluator)
            }
            Err(err) => Err(err),
        }
    }

    /// Target in raw embedder space
    pub fn with_target_state(mut self, target_state: Vec<f32>) -> Self {
        self.target_state = Some(target_state);
        self.representation = None;
        self
    }

    /// Target in the output space of `model`; live embeddings are projected before measuring
    pub fn with_representation(mut self, model: RepresentationModel<B>, target_state: Vec<f32>) -> Self {
        self.target_state = Some(target_state);
        self.representation = Some(model);
        self
    }

    /// Measure distances with a saved representation model and its target for `config.target_logit`
    pub fn load_representation(self, run: &RunDirectory, step: Option<usize>) -> Result<Self> {
        let (model, meta) = run.load_representation::<B>(step, self.fmc.env().device())?;
        let expected = self.embedder.embedding_size();
        if meta.config.input_size != expected {
            return Err(FgzError::DimensionMismatch {
                expected,
                actual: meta.config.input_size,
            });
        }
        let task = self.config.target_logit;
        let target = meta
            .target
            .for_task(task)
            .ok_or_else(|| FgzError::UnknownTask(task.to_string()))?
            .to_vec();
        tracing::info!("Using representation {} for task {}", meta.step, task);
        Ok(self.with_representation(model, target))
    }

    /// Best first action from the given root embedding, and the best path's average reward
    pub fn plan(&mut self, embedding: &[f32]) -> Result<(Action, f32)> {
        let device = self.fmc.env().device().clone();
        self.fmc
            .env_mut()
            .set_all_states(Tensor::<B, 1>::from_floats(embedding, &device))?;
        self.fmc.reset()?;
        self.fmc.simulate(self.config.search_steps)?;

        let batch = self.sampler.get_batch(self.fmc.tree(), &mut self.rng)?;
        let mut action = batch
            .actions
            .get(1)
            .cloned()
            .flatten()
            .ok_or(FgzError::EmptyTree)?;
        if self.config.force_no_escape {
            action.release(Button::Esc);
        }
        Ok((action, batch.average_confusion()))
    }

    fn target_distance(&self, embedding: &[f32]) -> Result<Option<f32>> {
        let Some(target) = &self.target_state else {
            return Ok(None);
        };
        let point = match &self.representation {
            Some(model) => {
                let input = Tensor::<B, 1>::from_floats(embedding, self.fmc.env().device());
                tensor_to_vec(model.forward(input.unsqueeze::<2>()))?
            }
            None => embedding.to_vec(),
        };
        if point.len() != target.len() {
            return Err(FgzError::DimensionMismatch {
                expected: point.len(),
                actual: target.len(),
            });
        }
        Ok(Some(distance(&point, target)))
    }

    pub fn run<L: LiveEnvironment>(&mut self, live: &mut L) -> Result<EvaluationReport> {
        let mut report = EvaluationReport::default();
        let mut observation = live.reset()?;
        let max_steps = self.config.max_steps.unwrap_or(usize::MAX);

        while report.steps() < max_steps {
            let embedding = self.embedder.embed(&observation)?;
            if let Some(distance) = self.target_distance(&embedding)? {
                report.target_distances.push(distance);
            }

            let (action, path_reward) = self.plan(&embedding)?;
            let step = live.step(&action)?;

            tracing::debug!(
                "Step {}: reward={:.3}, average path reward={:.3}",
                report.steps(),
                step.reward,
                path_reward
            );
            report.actions.push(action);
            report.rewards.push(step.reward);
            report.path_rewards.push(path_reward);
            observation = step.observation;

            if step.done {
                report.done = true;
                break;
            }
        }

        tracing::info!(
            "Evaluation finished after {} steps: total reward {:.2}",
            report.steps(),
            report.total_reward()
        );
        Ok(report)
    }

    /// Play `episodes` episodes and log the aggregate
    pub fn evaluate<L: LiveEnvironment>(&mut self, live: &mut L, episodes: usize) -> Result<EvaluationMetrics> {
        let mut metrics = EvaluationMetrics::new();
        for episode in 0..episodes {
            let report = self.run(live)?;
            tracing::debug!("Episode {} done={} after {} steps", episode, report.done, report.steps());
            metrics.record_episode(self.config.target_logit, &report);
        }
        metrics.print_summary();
        Ok(metrics)
    }
}

fn distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PassthroughEmbedder;
    use crate::model::{DynamicsConfig, RepresentationConfig};
    use crate::train::{CheckpointMeta, RepresentationMeta, TargetState, TrainerConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;

    type TestBackend = NdArray;

    /// Rewards every step and counts ESC presses
    struct CountingGame {
        steps: usize,
        episode_length: usize,
        escapes: usize,
    }

    impl LiveEnvironment for CountingGame {
        fn reset(&mut self) -> Result<Vec<f32>> {
            self.steps = 0;
            Ok(vec![0.5; 4])
        }

        fn step(&mut self, action: &Action) -> Result<LiveStep> {
            self.steps += 1;
            if action.button(Button::Esc) > 0.0 {
                self.escapes += 1;
            }
            Ok(LiveStep {
                observation: vec![self.steps as f32 / 10.0; 4],
                reward: 1.0,
                done: self.steps >= self.episode_length,
            })
        }
    }

    fn evaluator(config: EvalConfig) -> Result<Evaluator<TestBackend, PassthroughEmbedder>> {
        let device = Default::default();
        let dynamics = DynamicsConfig::new(4, 3).with_embedder_layers(1).init(&device);
        let env_config = EnvConfig {
            num_walkers: 4,
            action_space: crate::action::ActionSpace {
                sample_escape: true,
                ..Default::default()
            },
            ..EnvConfig::default()
        };
        let fmc = Fmc::new(DynamicsEnvironment::new(dynamics, env_config, device), FmcConfig::new());
        Evaluator::new(fmc, Arc::new(PassthroughEmbedder::new(4)), config)
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let zero_steps = EvalConfig {
            search_steps: 0,
            ..EvalConfig::default()
        };
        assert!(evaluator(zero_steps).is_err());

        let bad_logit = EvalConfig {
            target_logit: 9,
            ..EvalConfig::default()
        };
        assert!(evaluator(bad_logit).is_err());
    }

    #[test]
    fn test_run_until_done() {
        let config = EvalConfig {
            search_steps: 2,
            ..EvalConfig::default()
        };
        let mut evaluator = evaluator(config).unwrap().with_target_state(vec![0.5; 4]);
        let mut game = CountingGame {
            steps: 0,
            episode_length: 3,
            escapes: 0,
        };
        let report = evaluator.run(&mut game).unwrap();

        assert!(report.done);
        assert_eq!(report.steps(), 3);
        assert_eq!(report.total_reward(), 3.0);
        assert_eq!(report.path_rewards.len(), 3);
        assert_eq!(report.target_distances[0], 0.0);
        assert_eq!(game.escapes, 0);
    }

    #[test]
    fn test_max_steps() {
        let config = EvalConfig {
            search_steps: 1,
            max_steps: Some(2),
            ..EvalConfig::default()
        };
        let mut evaluator = evaluator(config).unwrap();
        let mut game = CountingGame {
            steps: 0,
            episode_length: 100,
            escapes: 0,
        };
        let report = evaluator.run(&mut game).unwrap();
        assert!(!report.done);
        assert_eq!(report.steps(), 2);
        assert!(report.target_distances.is_empty());
    }

    fn game(episode_length: usize) -> CountingGame {
        CountingGame {
            steps: 0,
            episode_length,
            escapes: 0,
        }
    }

    fn one_step() -> EvalConfig {
        EvalConfig {
            search_steps: 1,
            max_steps: Some(1),
            ..EvalConfig::default()
        }
    }

    fn save_checkpoint(run: &RunDirectory, camera_scale: f32) {
        let device = Default::default();
        let dynamics_config = DynamicsConfig::new(4, 3)
            .with_embedder_layers(1)
            .with_camera_scale(camera_scale);
        let model = dynamics_config.init::<Autodiff<NdArray>>(&device);
        let optimizer = AdamConfig::new().init();
        let meta = CheckpointMeta {
            step: 4,
            run_name: "run".to_string(),
            num_tasks: 2,
            dynamics: dynamics_config,
            trainer: TrainerConfig::new(),
        };
        run.save_checkpoint(&meta, &model, &optimizer).unwrap();
    }

    fn from_checkpoint(run: &RunDirectory, config: EvalConfig) -> Evaluator<TestBackend, PassthroughEmbedder> {
        Evaluator::from_checkpoint(
            run,
            None,
            EnvConfig {
                num_walkers: 3,
                ..EnvConfig::default()
            },
            FmcConfig::new(),
            Arc::new(PassthroughEmbedder::new(4)),
            config,
            Default::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDirectory::new(dir.path(), "run");
        save_checkpoint(&run, 90.0);
        let finals = vec![vec![vec![1.0; 4]], vec![vec![0.0; 4]]];
        run.save_target_state(&TargetState::from_final_embeddings(4, &finals).unwrap())
            .unwrap();

        let mut evaluator = from_checkpoint(&run, one_step());
        assert!((evaluator.fmc.env().camera_scale() - 90.0).abs() < 1e-6);
        let report = evaluator.run(&mut game(5)).unwrap();
        assert_eq!(report.target_distances, vec![1.0]);

        // the search class has no expert target
        let search_class = EvalConfig {
            target_logit: 2,
            ..one_step()
        };
        let mut evaluator = from_checkpoint(&run, search_class);
        let report = evaluator.run(&mut game(5)).unwrap();
        assert!(report.target_distances.is_empty());
    }

    #[test]
    fn test_representation_target() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDirectory::new(dir.path(), "run");
        let device = Default::default();

        let config = RepresentationConfig::new(4).with_output_size(2);
        let model = config.init::<TestBackend>(&device);
        // the game resets to [0.5; 4], so the first distance is zero
        let start = Tensor::<TestBackend, 2>::from_floats([[0.5; 4]], &device);
        let target = tensor_to_vec(model.forward(start)).unwrap();
        let meta = RepresentationMeta {
            step: 2,
            run_name: "run".to_string(),
            config,
            target: TargetState::from_final_embeddings(2, &[vec![target]]).unwrap(),
        };
        run.save_representation(&meta, &model).unwrap();

        let mut evaluator = evaluator(one_step()).unwrap().load_representation(&run, None).unwrap();
        let report = evaluator.run(&mut game(5)).unwrap();
        assert_eq!(report.target_distances.len(), 1);
        assert!(report.target_distances[0] < 1e-5);

        let other_task = EvalConfig {
            target_logit: 1,
            ..one_step()
        };
        let err = self::evaluator(other_task).unwrap().load_representation(&run, None).err().unwrap();
        assert!(matches!(err, FgzError::UnknownTask(_)));
    }

    #[test]
    fn test_representation_input_must_match_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDirectory::new(dir.path(), "run");
        let config = RepresentationConfig::new(3).with_output_size(2);
        let model = config.init::<TestBackend>(&Default::default());
        let meta = RepresentationMeta {
            step: 1,
            run_name: "run".to_string(),
            config,
            target: TargetState::from_final_embeddings(1, &[vec![vec![0.0; 2]]]).unwrap(),
        };
        run.save_representation(&meta, &model).unwrap();

        let err = evaluator(one_step()).unwrap().load_representation(&run, None).err().unwrap();
        assert!(matches!(err, FgzError::DimensionMismatch { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_target_of_wrong_size() {
        let mut evaluator = evaluator(one_step()).unwrap().with_target_state(vec![0.0; 3]);
        let err = evaluator.run(&mut game(5)).unwrap_err();
        assert!(matches!(err, FgzError::DimensionMismatch { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_evaluate_records_every_episode() {
        let config = EvalConfig {
            search_steps: 1,
            ..EvalConfig::default()
        };
        let mut evaluator = evaluator(config).unwrap().with_target_state(vec![0.5; 4]);
        let metrics = evaluator.evaluate(&mut game(2), 3).unwrap();

        assert_eq!(metrics.num_episodes, 3);
        assert!((metrics.completion_rate() - 1.0).abs() < 1e-6);
        assert!((metrics.avg_steps() - 2.0).abs() < 1e-6);
        assert!((metrics.avg_reward() - 2.0).abs() < 1e-6);
        assert_eq!(metrics.task_stats[&0].episodes, 3);
        // the last observation before the episode ends is [0.1; 4]
        let expected = (4.0f32 * 0.4 * 0.4).sqrt();
        assert!((metrics.avg_final_distance().unwrap() - expected).abs() < 1e-5);
    }
}
