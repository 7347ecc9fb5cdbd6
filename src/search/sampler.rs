//! Extract training sequences from a finished search tree

use rand::Rng;
use rand::seq::IteratorRandom;

use super::tree::{SearchTree, TreePath};
use crate::error::{FgzError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleType {
    /// Root to the leaf with the highest cumulative reward
    #[default]
    BestPath,
    /// Root to a uniformly chosen leaf
    RandomLeaf,
}

/// Per-node sequences along one root-to-leaf path.
///
/// All vectors have the path's node count. Index 0 is the root, whose action
/// and info are `None` and whose confusion is 0.
#[derive(Debug, Clone)]
pub struct TreeBatch<A, I> {
    pub observations: Vec<Vec<f32>>,
    pub actions: Vec<Option<A>>,
    /// Cumulative reward at each node
    pub rewards: Vec<f32>,
    /// Reward earned on the transition into each node
    pub confusions: Vec<f32>,
    pub infos: Vec<Option<I>>,
}

impl<A, I> TreeBatch<A, I> {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Transitions recorded, excluding the root
    pub fn steps(&self) -> usize {
        self.len().saturating_sub(1)
    }

    /// Mean confusion over non-root nodes
    pub fn average_confusion(&self) -> f32 {
        if self.steps() == 0 {
            return 0.0;
        }
        self.confusions[1..].iter().sum::<f32>() / self.steps() as f32
    }

    /// Infos of every non-root node, in path order
    pub fn step_infos(&self) -> impl Iterator<Item = &I> {
        self.infos.iter().skip(1).flatten()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeSampler {
    pub sample_type: SampleType,
}

impl TreeSampler {
    pub fn new(sample_type: SampleType) -> Self {
        Self { sample_type }
    }

    pub fn best_path() -> Self {
        Self::new(SampleType::BestPath)
    }

    /// Fails with `EmptyTree` if no transition was ever recorded
    pub fn get_batch<A: Clone, I: Clone, R: Rng + ?Sized>(
        &self,
        tree: &SearchTree<A, I>,
        rng: &mut R,
    ) -> Result<TreeBatch<A, I>> {
        let path = self.pick_path(tree, rng).ok_or(FgzError::EmptyTree)?;
        Ok(Self::collect(tree, &path))
    }

    fn pick_path<A: Clone, I: Clone, R: Rng + ?Sized>(
        &self,
        tree: &SearchTree<A, I>,
        rng: &mut R,
    ) -> Option<TreePath> {
        if tree.is_empty() {
            return None;
        }
        match self.sample_type {
            SampleType::BestPath => tree.best_path(),
            SampleType::RandomLeaf => {
                let leaf = tree.leaves().choose(rng)?;
                tree.path_to(leaf)
            }
        }
    }

    fn collect<A: Clone, I: Clone>(tree: &SearchTree<A, I>, path: &TreePath) -> TreeBatch<A, I> {
        let len = path.nodes.len();
        let mut batch = TreeBatch {
            observations: Vec::with_capacity(len),
            actions: Vec::with_capacity(len),
            rewards: Vec::with_capacity(len),
            confusions: Vec::with_capacity(len),
            infos: Vec::with_capacity(len),
        };
        for node in path.nodes.iter().filter_map(|&id| tree.get(id)) {
            batch.observations.push(node.state.clone());
            batch.actions.push(node.action.clone());
            batch.rewards.push(node.cumulative_reward);
            batch.confusions.push(node.reward);
            batch.infos.push(node.info.clone());
        }
        batch
    }
}
