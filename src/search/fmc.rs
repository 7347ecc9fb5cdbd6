//! Fractal Monte Carlo: population-based tree search over a vectorized environment
//!
//! Each simulation step every walker proposes an action and advances. Walkers
//! then score themselves with a virtual reward that balances accumulated
//! reward against distance to a random companion, and low scorers are
//! stochastically cloned onto better partners. The visited transitions form a
//! [`SearchTree`]; cloning merges lineages by moving a walker's node pointer.

use burn::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::env::VectorizedEnvironment;
use super::tree::{NodeId, ROOT, SearchTree, TreePath};
use crate::error;

#[derive(Debug, Config)]
pub struct FmcConfig {
    /// Exponent applied to the reward term of the virtual reward
    #[config(default = 1.0)]
    pub balance: f32,
    /// Remove branches no walker occupies after each clone phase
    #[config(default = true)]
    pub prune_tree: bool,
    #[config(default = 0)]
    pub seed: u64,
}

pub struct Fmc<E: VectorizedEnvironment> {
    env: E,
    config: FmcConfig,
    tree: SearchTree<E::Action, E::Info>,
    walker_nodes: Vec<NodeId>,
    cumulative_rewards: Vec<f32>,
    frozen: Vec<bool>,
    states: Vec<Vec<f32>>,
    steps_taken: usize,
    rng: StdRng,
}

impl<E: VectorizedEnvironment> Fmc<E> {
    /// The environment's walkers must be initialized before `reset`
    pub fn new(env: E, config: FmcConfig) -> Self {
        let n = env.num_walkers();
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            env,
            config,
            tree: SearchTree::new(Vec::new()),
            walker_nodes: vec![ROOT; n],
            cumulative_rewards: vec![0.0; n],
            frozen: vec![false; n],
            states: Vec::new(),
            steps_taken: 0,
            rng,
        }
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn tree(&self) -> &SearchTree<E::Action, E::Info> {
        &self.tree
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn walker_nodes(&self) -> &[NodeId] {
        &self.walker_nodes
    }

    pub fn best_path(&self) -> Option<TreePath> {
        self.tree.best_path()
    }

    /// Discard the previous episode and root a fresh tree at the environment's current state
    pub fn reset(&mut self) -> error::Result<()> {
        let states = self.env.batch_reset()?;
        let n = self.env.num_walkers();
        let root_state = states.first().cloned().unwrap_or_default();

        self.tree = SearchTree::new(root_state);
        self.walker_nodes = vec![ROOT; n];
        self.cumulative_rewards = vec![0.0; n];
        self.frozen = vec![false; n];
        self.states = states;
        self.steps_taken = 0;
        Ok(())
    }

    pub fn simulate(&mut self, steps: usize) -> error::Result<()> {
        for _ in 0..steps {
            self.step()?;
        }
        tracing::debug!(
            steps,
            nodes = self.tree.len(),
            best_reward = self.best_path().map(|p| p.total_reward).unwrap_or(0.0),
            "Search finished"
        );
        Ok(())
    }

    pub fn step(&mut self) -> error::Result<()> {
        let actions = self.env.batched_action_space_sample();
        let batch = self.env.batch_step(&actions, &self.frozen)?;

        for (i, action) in actions.into_iter().enumerate() {
            if self.frozen[i] {
                continue;
            }
            self.cumulative_rewards[i] += batch.rewards[i];
            self.walker_nodes[i] = self.tree.add_child(
                self.walker_nodes[i],
                batch.observations[i].clone(),
                action,
                batch.rewards[i],
                batch.infos[i].clone(),
            );
        }
        for (i, done) in batch.dones.iter().enumerate() {
            self.frozen[i] |= *done;
        }
        self.states = batch.states;

        self.clone_phase()?;

        if self.config.prune_tree {
            self.tree.prune(&self.walker_nodes);
        }
        self.steps_taken += 1;
        Ok(())
    }

    fn clone_phase(&mut self) -> error::Result<()> {
        let n = self.walker_nodes.len();
        if n < 2 {
            return Ok(());
        }

        let virtual_rewards = self.virtual_rewards();
        let partners: Vec<usize> = (0..n).map(|i| self.random_partner(i, n)).collect();

        let clone_mask: Vec<bool> = (0..n)
            .map(|i| {
                if self.frozen[i] {
                    return false;
                }
                let own = virtual_rewards[i];
                let other = virtual_rewards[partners[i]];
                let probability = ((other - own) / own).clamp(0.0, 1.0);
                self.rng.random::<f32>() < probability
            })
            .collect();

        self.env.clone_walkers(&partners, &clone_mask)?;

        let nodes = self.walker_nodes.clone();
        let rewards = self.cumulative_rewards.clone();
        for i in (0..n).filter(|&i| clone_mask[i]) {
            let p = partners[i];
            self.walker_nodes[i] = nodes[p];
            self.cumulative_rewards[i] = rewards[p];
            self.states[i] = self.states[p].clone();
        }

        let cloned = clone_mask.iter().filter(|c| **c).count();
        tracing::trace!(cloned, "Clone phase");
        Ok(())
    }

    fn random_partner(&mut self, i: usize, n: usize) -> usize {
        let offset = self.rng.random_range(1..n);
        (i + offset) % n
    }

    /// Relativized reward raised to `balance`, times relativized companion distance
    fn virtual_rewards(&mut self) -> Vec<f32> {
        let n = self.states.len();
        let distances: Vec<f32> = (0..n)
            .map(|i| {
                let j = self.random_partner(i, n);
                euclidean(&self.states[i], &self.states[j])
            })
            .collect();

        let rewards = relativize(&self.cumulative_rewards);
        let distances = relativize(&distances);
        rewards
            .iter()
            .zip(distances.iter())
            .map(|(r, d)| r.powf(self.config.balance) * d)
            .collect()
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Standardize, then map to strictly positive values: `1 + ln(1 + z)` above
/// zero and `exp(z)` below, so scores stay comparable across scales.
pub fn relativize(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
    if std <= f32::EPSILON {
        return vec![1.0; values.len()];
    }
    values
        .iter()
        .map(|v| {
            let z = (v - mean) / std;
            if z > 0.0 { 1.0 + z.ln_1p() } else { z.exp() }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::error::FgzError;
    use crate::search::env::StepBatch;

    /// 1D walkers that move by their action and earn their new position
    struct LineEnv {
        states: Option<Vec<f32>>,
        n: usize,
        rng: StdRng,
    }

    impl LineEnv {
        fn new(n: usize) -> Self {
            Self {
                states: Some(vec![0.0; n]),
                n,
                rng: StdRng::seed_from_u64(5),
            }
        }
    }

    impl VectorizedEnvironment for LineEnv {
        type Action = f32;
        type Info = usize;

        fn num_walkers(&self) -> usize {
            self.n
        }

        fn batch_reset(&mut self) -> Result<Vec<Vec<f32>>> {
            let states = self.states.as_ref().ok_or(FgzError::UninitializedState)?;
            Ok(states.iter().map(|s| vec![*s]).collect())
        }

        fn batch_step(&mut self, actions: &[f32], freeze_mask: &[bool]) -> Result<StepBatch<usize>> {
            let states = self.states.as_mut().ok_or(FgzError::UninitializedState)?;
            let mut rewards = vec![0.0; self.n];
            for i in 0..self.n {
                if !freeze_mask[i] {
                    states[i] += actions[i];
                    rewards[i] = states[i];
                }
            }
            let rows: Vec<Vec<f32>> = states.iter().map(|s| vec![*s]).collect();
            Ok(StepBatch {
                states: rows.clone(),
                observations: rows,
                rewards,
                dones: vec![false; self.n],
                infos: (0..self.n).collect(),
            })
        }

        fn clone_walkers(&mut self, partners: &[usize], clone_mask: &[bool]) -> Result<()> {
            let states = self.states.as_mut().ok_or(FgzError::UninitializedState)?;
            let before = states.clone();
            for i in 0..self.n {
                if clone_mask[i] {
                    states[i] = before[partners[i]];
                }
            }
            Ok(())
        }

        fn batched_action_space_sample(&mut self) -> Vec<f32> {
            (0..self.n).map(|_| self.rng.random_range(-1.0..1.0)).collect()
        }
    }

    #[test]
    fn test_fmc_config_defaults() {
        let config = FmcConfig::new();
        assert!((config.balance - 1.0).abs() < 1e-6);
        assert!(config.prune_tree);
    }

    #[test]
    fn test_relativize() {
        assert_eq!(relativize(&[2.0, 2.0, 2.0]), vec![1.0, 1.0, 1.0]);
        let scores = relativize(&[0.0, 1.0, 5.0]);
        assert!(scores.iter().all(|s| *s > 0.0));
        assert!(scores[0] < scores[1] && scores[1] < scores[2]);
        assert!(relativize(&[]).is_empty());
    }

    #[test]
    fn test_reset_requires_initialized_env() {
        let mut env = LineEnv::new(4);
        env.states = None;
        let mut fmc = Fmc::new(env, FmcConfig::new());
        assert!(matches!(fmc.reset(), Err(FgzError::UninitializedState)));
    }

    #[test]
    fn test_zero_steps_leaves_tree_empty() {
        let mut fmc = Fmc::new(LineEnv::new(4), FmcConfig::new());
        fmc.reset().unwrap();
        fmc.simulate(0).unwrap();
        assert!(fmc.tree().is_empty());
        assert!(fmc.best_path().is_none());
    }

    #[test]
    fn test_simulation_builds_consistent_tree() {
        let mut fmc = Fmc::new(LineEnv::new(8), FmcConfig::new().with_seed(9));
        fmc.reset().unwrap();
        fmc.simulate(10).unwrap();
        assert_eq!(fmc.steps_taken(), 10);

        let path = fmc.best_path().unwrap();
        assert_eq!(path.steps(), 10);

        // walker states agree with the node each walker points at
        let states = fmc.env_mut().batch_reset().unwrap();
        for (i, &node) in fmc.walker_nodes().iter().enumerate() {
            assert_eq!(fmc.tree().get(node).unwrap().state, states[i]);
        }

        // every non-root node on the path carries its action and info
        for &id in &path.nodes[1..] {
            let node = fmc.tree().get(id).unwrap();
            assert!(node.action.is_some());
            assert!(node.info.is_some());
        }
    }

    #[test]
    fn test_pruned_tree_only_holds_walker_lineages() {
        let mut fmc = Fmc::new(LineEnv::new(6), FmcConfig::new().with_seed(1));
        fmc.reset().unwrap();
        fmc.simulate(5).unwrap();

        let occupied: Vec<NodeId> = fmc.walker_nodes().to_vec();
        for leaf in fmc.tree().leaves() {
            assert!(occupied.contains(&leaf));
        }
    }

    #[test]
    fn test_reset_discards_previous_tree() {
        let mut fmc = Fmc::new(LineEnv::new(4), FmcConfig::new());
        fmc.reset().unwrap();
        fmc.simulate(3).unwrap();
        assert!(!fmc.tree().is_empty());

        fmc.reset().unwrap();
        assert!(fmc.tree().is_empty());
        assert_eq!(fmc.steps_taken(), 0);
    }
}
