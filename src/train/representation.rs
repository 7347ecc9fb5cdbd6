//! Temporal cycle consistency training of the representation model

use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::{EmbeddedTrajectory, TrajectoryPair};
use crate::error::{self, FgzError, tensor_to_vec};
use crate::model::RepresentationModel;

/// Keeps the distance gradient finite for coincident points
const DISTANCE_EPSILON: f32 = 1e-12;

#[derive(Debug, Config)]
pub struct RepresentationTrainerConfig {
    /// Frames of the first trajectory cycled per pair
    #[config(default = 20)]
    pub num_frame_samples: usize,
    #[config(default = 1e-2)]
    pub learning_rate: f64,
    #[config(default = 0)]
    pub seed: u64,
}

pub struct RepresentationTrainer<B: AutodiffBackend, O> {
    model: RepresentationModel<B>,
    optimizer: O,
    config: RepresentationTrainerConfig,
    device: B::Device,
    rng: StdRng,
    pub train_steps_taken: usize,
}

impl<B, O> RepresentationTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<RepresentationModel<B>, B>,
{
    pub fn new(
        model: RepresentationModel<B>,
        optimizer: O,
        config: RepresentationTrainerConfig,
        device: B::Device,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            model,
            optimizer,
            config,
            device,
            rng,
            train_steps_taken: 0,
        }
    }

    pub fn model(&self) -> &RepresentationModel<B> {
        &self.model
    }

    fn to_tensor(&self, trajectory: &EmbeddedTrajectory) -> error::Result<Tensor<B, 2>> {
        let frames = trajectory.len();
        let width = trajectory.embeddings.first().map(Vec::len).unwrap_or(0);
        if frames == 0 || width == 0 {
            return Err(FgzError::config(format!("{} has no embedded frames", trajectory.trajectory)));
        }
        let flat: Vec<f32> = trajectory.embeddings.iter().flatten().copied().collect();
        if flat.len() != frames * width {
            return Err(FgzError::DimensionMismatch {
                expected: frames * width,
                actual: flat.len(),
            });
        }
        Ok(Tensor::<B, 1>::from_floats(flat.as_slice(), &self.device).reshape([frames, width]))
    }

    /// Cycle-back regression loss for the given frame indices of `z0`
    pub fn cycle_loss(&self, z0: Tensor<B, 2>, z1: Tensor<B, 2>, frames: &[usize]) -> Tensor<B, 1> {
        let [n0, _] = z0.dims();
        let positions: Vec<f32> = (1..=n0).map(|k| k as f32 / n0 as f32).collect();
        let positions = Tensor::<B, 1>::from_floats(positions.as_slice(), &self.device).reshape([1, n0]);

        let mut total = Tensor::<B, 1>::zeros([1], &self.device);
        for &i in frames {
            let u = z0.clone().slice([i..i + 1]);
            let alpha = soft_assignment(u, z1.clone());
            let v = alpha.transpose().matmul(z1.clone());
            let beta = soft_assignment(v, z0.clone());
            let mu = positions.clone().matmul(beta).reshape([1]);

            let t = i as f32 / n0 as f32;
            total = total + (mu - t).powf_scalar(2.0) / n0 as f32;
        }
        total / frames.len().max(1) as f32
    }

    /// One optimizer step on a trajectory pair; returns the loss
    pub fn train_on_pair(&mut self, pair: &TrajectoryPair) -> error::Result<f32> {
        let z0 = self.model.forward(self.to_tensor(&pair.first)?);
        let z1 = self.model.forward(self.to_tensor(&pair.second)?);

        let n0 = pair.first.len();
        let frames: Vec<usize> = (0..self.config.num_frame_samples)
            .map(|_| self.rng.random_range(0..n0))
            .collect();
        let loss = self.cycle_loss(z0, z1, &frames);
        let value = tensor_to_vec(loss.clone())?.first().copied().unwrap_or(0.0);

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);
        self.train_steps_taken += 1;

        tracing::debug!(
            "TCC step {}: loss={:.6} ({} vs {} frames)",
            self.train_steps_taken,
            value,
            pair.first.len(),
            pair.second.len()
        );
        Ok(value)
    }

    /// Mean representation of the final frame of each trajectory
    pub fn target_state(&self, trajectories: &[&EmbeddedTrajectory]) -> error::Result<Vec<f32>> {
        let mut finals = Vec::with_capacity(trajectories.len());
        for trajectory in trajectories {
            let last = trajectory
                .last_embedding()
                .ok_or_else(|| FgzError::config(format!("{} has no embedded frames", trajectory.trajectory)))?;
            finals.push(Tensor::<B, 1>::from_floats(last, &self.device));
        }
        if finals.is_empty() {
            return Err(FgzError::config("target state needs at least one trajectory"));
        }
        let stacked = Tensor::stack::<2>(finals, 0);
        let represented = self.model.forward(stacked).mean_dim(0);
        tensor_to_vec(represented)
    }
}

/// Softmax over negative distances from `point` [1, d] to each row of `others` [n, d]; returns [n, 1]
fn soft_assignment<B: Backend>(point: Tensor<B, 2>, others: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = others.dims();
    let distances = (others - point.repeat_dim(0, n))
        .powf_scalar(2.0)
        .sum_dim(1)
        .add_scalar(DISTANCE_EPSILON)
        .sqrt();
    softmax(distances.neg(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TrajectoryRef;
    use crate::model::RepresentationConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;

    type TestBackend = Autodiff<NdArray>;

    fn embedded(uid: &str, frames: usize, width: usize) -> EmbeddedTrajectory {
        EmbeddedTrajectory {
            trajectory: TrajectoryRef {
                uid: uid.to_string(),
                task_id: 0,
            },
            embeddings: (0..frames)
                .map(|i| (0..width).map(|j| ((i * width + j) as f32 * 0.37).sin()).collect())
                .collect(),
            actions: Vec::new(),
            frame_indices: (0..frames).collect(),
        }
    }

    fn trainer() -> RepresentationTrainer<TestBackend, impl Optimizer<RepresentationModel<TestBackend>, TestBackend>> {
        let device = Default::default();
        let model = RepresentationConfig::new(6).with_output_size(3).init::<TestBackend>(&device);
        let optimizer = AdamConfig::new().init::<TestBackend, RepresentationModel<TestBackend>>();
        RepresentationTrainer::new(
            model,
            optimizer,
            RepresentationTrainerConfig::new().with_num_frame_samples(5),
            device,
        )
    }

    #[test]
    fn test_cycle_loss_of_separated_points() {
        let trainer = trainer();
        let device = Default::default();
        // well separated points cycle back to themselves
        let z = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [10.0, 0.0], [20.0, 0.0]], &device);
        let loss = trainer.cycle_loss(z.clone(), z, &[2]);
        let value = tensor_to_vec(loss).unwrap()[0];
        // mu = 3/3 for the last frame, t = 2/3
        let expected = (1.0f32 - 2.0 / 3.0).powi(2) / 3.0;
        assert!((value - expected).abs() < 1e-4);
    }

    #[test]
    fn test_train_on_pair() {
        let mut trainer = trainer();
        let pair = TrajectoryPair {
            first: embedded("a", 8, 6),
            second: embedded("b", 5, 6),
        };
        let loss = trainer.train_on_pair(&pair).unwrap();
        assert!(loss.is_finite() && loss >= 0.0);
        assert_eq!(trainer.train_steps_taken, 1);
    }

    #[test]
    fn test_target_state_shape() {
        let trainer = trainer();
        let a = embedded("a", 4, 6);
        let b = embedded("b", 2, 6);
        let state = trainer.target_state(&[&a, &b]).unwrap();
        assert_eq!(state.len(), 3);
        assert!(trainer.target_state(&[]).is_err());
    }

    #[test]
    fn test_empty_trajectory_is_rejected() {
        let mut trainer = trainer();
        let pair = TrajectoryPair {
            first: embedded("a", 0, 6),
            second: embedded("b", 3, 6),
        };
        assert!(trainer.train_on_pair(&pair).is_err());
    }
}
