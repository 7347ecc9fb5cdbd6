//! Search environment backed by the learned dynamics function

use burn::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::env::{StepBatch, VectorizedEnvironment};
use crate::action::{Action, ActionSpace, vectorize_actions};
use crate::error::{FgzError, Result, tensor_to_vec};
use crate::model::DynamicsFunction;

/// Environment configuration
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Number of walkers in the search population
    pub num_walkers: usize,
    /// Seed for exploratory action sampling
    pub seed: u64,
    pub action_space: ActionSpace,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            num_walkers: 16,
            seed: 0,
            action_space: ActionSpace::default(),
        }
    }
}

/// Walker population simulated by a [`DynamicsFunction`].
///
/// States stay on the backend so that, under an autodiff backend, discriminator
/// outputs recorded along a search path carry gradients back to the model.
pub struct DynamicsEnvironment<B: Backend> {
    dynamics: DynamicsFunction<B>,
    config: EnvConfig,
    target_logit: usize,
    /// [num_walkers, embedding], `None` until `set_all_states`
    states: Option<Tensor<B, 2>>,
    rng: StdRng,
    device: B::Device,
}

impl<B: Backend> DynamicsEnvironment<B> {
    pub fn new(dynamics: DynamicsFunction<B>, config: EnvConfig, device: B::Device) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            dynamics,
            config,
            target_logit: 0,
            states: None,
            rng,
            device,
        }
    }

    pub fn dynamics(&self) -> &DynamicsFunction<B> {
        &self.dynamics
    }

    /// Swap in updated parameters after an optimizer step
    pub fn set_dynamics(&mut self, dynamics: DynamicsFunction<B>) {
        self.dynamics = dynamics;
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn target_logit(&self) -> usize {
        self.target_logit
    }

    /// Set by the dynamics config so search and training vectorize the same way
    pub fn camera_scale(&self) -> f32 {
        self.dynamics.camera_scale()
    }

    /// Select the discriminator class whose probability the reward is taken against
    pub fn set_target_logit(&mut self, logit: usize) -> Result<()> {
        let classes = self.dynamics.discriminator_classes();
        if logit >= classes {
            return Err(FgzError::config(format!(
                "target logit {logit} out of range for {classes} discriminator classes"
            )));
        }
        self.target_logit = logit;
        Ok(())
    }

    /// Broadcast one root embedding to every walker slot
    pub fn set_all_states(&mut self, embedding: Tensor<B, 1>) -> Result<()> {
        let [size] = embedding.dims();
        let expected = self.dynamics.state_embedding_size();
        if size != expected {
            return Err(FgzError::DimensionMismatch {
                expected,
                actual: size,
            });
        }
        if self.config.num_walkers == 0 {
            return Err(FgzError::config("search needs at least one walker"));
        }

        self.states = Some(
            embedding
                .unsqueeze::<2>()
                .repeat_dim(0, self.config.num_walkers),
        );
        Ok(())
    }

    /// Walker states as a backend tensor
    pub fn states(&self) -> Result<Tensor<B, 2>> {
        self.states.clone().ok_or(FgzError::UninitializedState)
    }

    fn check_len(&self, actual: usize) -> Result<()> {
        if actual != self.config.num_walkers {
            return Err(FgzError::WalkerCount {
                expected: self.config.num_walkers,
                actual,
            });
        }
        Ok(())
    }

    fn host_rows(tensor: Tensor<B, 2>) -> Result<Vec<Vec<f32>>> {
        let [_, width] = tensor.dims();
        let flat = tensor_to_vec(tensor)?;
        Ok(flat.chunks(width.max(1)).map(|row| row.to_vec()).collect())
    }
}

impl<B: Backend> VectorizedEnvironment for DynamicsEnvironment<B> {
    type Action = Action;
    /// Discriminator probabilities of the walker's new state
    type Info = Tensor<B, 1>;

    fn num_walkers(&self) -> usize {
        self.config.num_walkers
    }

    fn batch_reset(&mut self) -> Result<Vec<Vec<f32>>> {
        Self::host_rows(self.states()?)
    }

    fn batch_step(
        &mut self,
        actions: &[Action],
        freeze_mask: &[bool],
    ) -> Result<StepBatch<Tensor<B, 1>>> {
        let states = self.states()?;
        self.check_len(actions.len())?;
        self.check_len(freeze_mask.len())?;

        let n = self.config.num_walkers;
        let batch = vectorize_actions(actions, self.dynamics.camera_scale())?;
        let (buttons, camera) = batch.to_tensors::<B>(&self.device);

        let (next_states, probs) = self.dynamics.forward(states.clone(), buttons, camera);

        // 1.0 keeps the old state, 0.0 takes the new one
        let frozen: Vec<f32> = freeze_mask.iter().map(|&f| if f { 1.0 } else { 0.0 }).collect();
        let frozen = Tensor::<B, 1>::from_floats(frozen.as_slice(), &self.device).reshape([n, 1]);
        let advancing = frozen.ones_like() - frozen.clone();
        let merged = states * frozen + next_states * advancing;
        self.states = Some(merged.clone());

        let classes = self.dynamics.discriminator_classes();
        let host_probs = tensor_to_vec(probs.clone())?;
        let rewards = (0..n)
            .map(|i| {
                if freeze_mask[i] {
                    0.0
                } else {
                    1.0 - host_probs[i * classes + self.target_logit]
                }
            })
            .collect();

        let infos = (0..n)
            .map(|i| probs.clone().slice([i..i + 1, 0..classes]).squeeze::<1>(0))
            .collect();

        let host_states = Self::host_rows(merged)?;
        Ok(StepBatch {
            observations: host_states.clone(),
            states: host_states,
            rewards,
            dones: vec![false; n],
            infos,
        })
    }

    fn clone_walkers(&mut self, partners: &[usize], clone_mask: &[bool]) -> Result<()> {
        let states = self.states()?;
        self.check_len(partners.len())?;
        self.check_len(clone_mask.len())?;

        let n = self.config.num_walkers;
        let mut source = Vec::with_capacity(n);
        for i in 0..n {
            if clone_mask[i] {
                if partners[i] >= n {
                    return Err(FgzError::InvalidPartner {
                        index: i,
                        partner: partners[i],
                    });
                }
                source.push(partners[i] as i64);
            } else {
                source.push(i as i64);
            }
        }

        let indices = Tensor::<B, 1, Int>::from_ints(source.as_slice(), &self.device);
        self.states = Some(states.select(0, indices));
        Ok(())
    }

    fn batched_action_space_sample(&mut self) -> Vec<Action> {
        self.config
            .action_space
            .sample_n(&mut self.rng, self.config.num_walkers)
    }
}
