//! Batched environment surface driven by the fractal search

use crate::error::Result;

/// Result of advancing every walker by one step
#[derive(Debug, Clone)]
pub struct StepBatch<I> {
    /// Walker states after the step [num_walkers][embedding]
    pub states: Vec<Vec<f32>>,
    /// What the search observes of each walker; equal to `states` for latent environments
    pub observations: Vec<Vec<f32>>,
    pub rewards: Vec<f32>,
    pub dones: Vec<bool>,
    /// Per-walker auxiliary output of the step
    pub infos: Vec<I>,
}

impl<I> StepBatch<I> {
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }
}

/// N parallel walkers stepped in place.
///
/// Walkers are identified only by index; `clone_walkers` is the resampling
/// primitive that overwrites a walker with its partner's state.
pub trait VectorizedEnvironment {
    type Action: Clone;
    type Info: Clone;

    fn num_walkers(&self) -> usize;

    /// Current walker states, failing if they were never initialized
    fn batch_reset(&mut self) -> Result<Vec<Vec<f32>>>;

    /// Advance all non-frozen walkers; frozen walkers keep their state and earn 0
    fn batch_step(
        &mut self,
        actions: &[Self::Action],
        freeze_mask: &[bool],
    ) -> Result<StepBatch<Self::Info>>;

    /// For every `i` with `clone_mask[i]`, copy walker `partners[i]` into walker `i`
    fn clone_walkers(&mut self, partners: &[usize], clone_mask: &[bool]) -> Result<()>;

    /// One independently sampled exploratory action per walker
    fn batched_action_space_sample(&mut self) -> Vec<Self::Action>;
}
