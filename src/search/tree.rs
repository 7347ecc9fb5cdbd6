//! Arena-backed search tree built incrementally by the walkers

use std::cmp::Ordering;

pub type NodeId = usize;

/// Root of every tree
pub const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
pub struct SearchNode<A, I> {
    pub parent: Option<NodeId>,
    /// Action taken from the parent; `None` only at the root
    pub action: Option<A>,
    pub state: Vec<f32>,
    /// Reward earned on the transition into this node
    pub reward: f32,
    /// Sum of rewards from the root to this node
    pub cumulative_reward: f32,
    pub depth: usize,
    pub info: Option<I>,
    children: usize,
}

impl<A, I> SearchNode<A, I> {
    pub fn is_leaf(&self) -> bool {
        self.children == 0
    }

    pub fn average_reward(&self) -> f32 {
        if self.depth == 0 {
            0.0
        } else {
            self.cumulative_reward / self.depth as f32
        }
    }
}

/// Tree of visited states.
///
/// Nodes live in a flat arena and refer to their parent by index; walkers
/// hold the index of their current node, so a clone merges lineages by
/// copying an index. Pruned slots are left empty and never reused.
#[derive(Debug, Clone)]
pub struct SearchTree<A, I> {
    nodes: Vec<Option<SearchNode<A, I>>>,
    live: usize,
}

/// Root-to-leaf node sequence
#[derive(Debug, Clone, PartialEq)]
pub struct TreePath {
    pub nodes: Vec<NodeId>,
    pub total_reward: f32,
}

impl TreePath {
    /// Number of transitions on the path
    pub fn steps(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn average_reward(&self) -> f32 {
        if self.steps() == 0 {
            0.0
        } else {
            self.total_reward / self.steps() as f32
        }
    }
}

impl<A: Clone, I: Clone> SearchTree<A, I> {
    pub fn new(root_state: Vec<f32>) -> Self {
        let root = SearchNode {
            parent: None,
            action: None,
            state: root_state,
            reward: 0.0,
            cumulative_reward: 0.0,
            depth: 0,
            info: None,
            children: 0,
        };
        Self {
            nodes: vec![Some(root)],
            live: 1,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&SearchNode<A, I>> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    pub fn root(&self) -> &SearchNode<A, I> {
        self.nodes[ROOT].as_ref().expect("root is never pruned")
    }

    /// Live node count, including the root
    pub fn len(&self) -> usize {
        self.live
    }

    /// True while no transition has been recorded
    pub fn is_empty(&self) -> bool {
        self.live <= 1
    }

    pub fn add_child(
        &mut self,
        parent: NodeId,
        state: Vec<f32>,
        action: A,
        reward: f32,
        info: I,
    ) -> NodeId {
        let parent_node = self.nodes[parent]
            .as_mut()
            .expect("walkers only point at live nodes");
        parent_node.children += 1;
        let depth = parent_node.depth + 1;
        let cumulative_reward = parent_node.cumulative_reward + reward;

        let id = self.nodes.len();
        self.nodes.push(Some(SearchNode {
            parent: Some(parent),
            action: Some(action),
            state,
            reward,
            cumulative_reward,
            depth,
            info: Some(info),
            children: 0,
        }));
        self.live += 1;
        id
    }

    /// Drop leaves that no walker occupies, walking up through ancestors
    /// left childless. Returns the number of nodes removed.
    pub fn prune(&mut self, occupied: &[NodeId]) -> usize {
        let mut held = vec![false; self.nodes.len()];
        for &id in occupied {
            if id < held.len() {
                held[id] = true;
            }
        }

        let mut removed = 0;
        for start in (1..self.nodes.len()).rev() {
            let mut current = start;
            loop {
                if current == ROOT || held[current] {
                    break;
                }
                let Some(node) = self.nodes[current].as_ref() else {
                    break;
                };
                if !node.is_leaf() {
                    break;
                }
                let parent = node.parent;
                self.nodes[current] = None;
                self.live -= 1;
                removed += 1;

                match parent {
                    Some(p) => {
                        if let Some(parent_node) = self.nodes[p].as_mut() {
                            parent_node.children -= 1;
                        }
                        current = p;
                    }
                    None => break,
                }
            }
        }
        removed
    }

    /// Node ids from the root down to `leaf`
    pub fn path_to(&self, leaf: NodeId) -> Option<TreePath> {
        let total_reward = self.get(leaf)?.cumulative_reward;
        let mut nodes = Vec::new();
        let mut current = Some(leaf);
        while let Some(id) = current {
            nodes.push(id);
            current = self.get(id)?.parent;
        }
        nodes.reverse();
        Some(TreePath {
            nodes,
            total_reward,
        })
    }

    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(id, node)| match node {
                Some(node) if id != ROOT && node.is_leaf() => Some(id),
                _ => None,
            })
    }

    /// Leaf with the highest cumulative reward; deeper wins ties
    pub fn best_leaf(&self) -> Option<NodeId> {
        let key = |id: NodeId| self.get(id).map(|node| (node.cumulative_reward, node.depth));
        self.leaves()
            .max_by(|&a, &b| key(a).partial_cmp(&key(b)).unwrap_or(Ordering::Equal))
    }

    pub fn best_path(&self) -> Option<TreePath> {
        self.best_leaf().and_then(|leaf| self.path_to(leaf))
    }
}
