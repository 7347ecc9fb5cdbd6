//! Task-balanced access to expert trajectories

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::embed::{Embedder, embed_frame};
use super::trajectory::{TrajectoryLoader, TrajectoryRef};
use super::window::SlidingWindows;
use crate::error::{FgzError, Result};

/// One loader per task; the task id is the loader's position
pub struct DataHandler<L: TrajectoryLoader, E: Embedder + ?Sized> {
    loaders: Vec<L>,
    embedder: Arc<E>,
    frames_per_window: usize,
    rng: StdRng,
}

impl<L: TrajectoryLoader, E: Embedder + ?Sized> DataHandler<L, E> {
    pub fn new(loaders: Vec<L>, embedder: Arc<E>, frames_per_window: usize, seed: u64) -> Result<Self> {
        if loaders.is_empty() {
            return Err(FgzError::config("at least one task dataset is required"));
        }
        for (task_id, loader) in loaders.iter().enumerate() {
            if loader.task_id() != task_id {
                return Err(FgzError::config(format!(
                    "loader at position {task_id} reports task id {}",
                    loader.task_id()
                )));
            }
            if loader.is_empty() {
                return Err(FgzError::config(format!("task {task_id} has no trajectories")));
            }
        }
        if frames_per_window == 0 {
            return Err(FgzError::config("frames_per_window must be positive"));
        }

        Ok(Self {
            loaders,
            embedder,
            frames_per_window,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn num_tasks(&self) -> usize {
        self.loaders.len()
    }

    pub fn frames_per_window(&self) -> usize {
        self.frames_per_window
    }

    pub fn loaders(&self) -> &[L] {
        &self.loaders
    }

    pub fn embedder(&self) -> &Arc<E> {
        &self.embedder
    }

    /// Uniform task, then uniform trajectory within it
    pub fn sample_trajectory(&mut self) -> Result<TrajectoryRef> {
        let task_id = self.rng.random_range(0..self.loaders.len());
        self.loaders[task_id]
            .sample(&mut self.rng)
            .ok_or_else(|| FgzError::UnknownTask(task_id.to_string()))
    }

    /// Sliding windows over a freshly sampled trajectory
    pub fn sample_single_trajectory(&mut self) -> Result<SlidingWindows<L::Steps, E>> {
        let trajectory = self.sample_trajectory()?;
        self.windows(trajectory)
    }

    pub fn windows(&self, trajectory: TrajectoryRef) -> Result<SlidingWindows<L::Steps, E>> {
        let loader = self
            .loaders
            .get(trajectory.task_id)
            .ok_or_else(|| FgzError::UnknownTask(trajectory.task_id.to_string()))?;
        let steps = loader.open(&trajectory.uid)?;
        Ok(SlidingWindows::new(
            trajectory,
            steps,
            Arc::clone(&self.embedder),
            self.frames_per_window,
        ))
    }

    /// `per_task` trajectories from every task, indexed by task id
    pub fn sample_trajectories_for_each_task(&mut self, per_task: usize) -> Vec<Vec<TrajectoryRef>> {
        let rng = &mut self.rng;
        self.loaders
            .iter()
            .map(|loader| (0..per_task).filter_map(|_| loader.sample(rng)).collect())
            .collect()
    }

    /// Embed every frame of a trajectory
    pub fn embed_trajectory(&self, trajectory: &TrajectoryRef) -> Result<Vec<Vec<f32>>> {
        let loader = self
            .loaders
            .get(trajectory.task_id)
            .ok_or_else(|| FgzError::UnknownTask(trajectory.task_id.to_string()))?;
        loader
            .open(&trajectory.uid)?
            .enumerate()
            .map(|(index, step)| embed_frame(&*self.embedder, &trajectory.uid, index, &step?.frame))
            .collect()
    }

    /// Embedding of the last frame only
    pub fn embed_final_frame(&self, trajectory: &TrajectoryRef) -> Result<Vec<f32>> {
        let loader = self
            .loaders
            .get(trajectory.task_id)
            .ok_or_else(|| FgzError::UnknownTask(trajectory.task_id.to_string()))?;
        let mut last = None;
        for (index, step) in loader.open(&trajectory.uid)?.enumerate() {
            last = Some((index, step?));
        }
        let (index, step) = last.ok_or_else(|| FgzError::UnknownTrajectory(trajectory.uid.clone()))?;
        embed_frame(&*self.embedder, &trajectory.uid, index, &step.frame)
    }

    /// Final-frame embeddings of `per_task` sampled trajectories, indexed by task id
    pub fn final_embeddings_for_each_task(&mut self, per_task: usize) -> Result<Vec<Vec<Vec<f32>>>> {
        self.sample_trajectories_for_each_task(per_task)
            .iter()
            .map(|refs| refs.iter().map(|r| self.embed_final_frame(r)).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::data::embed::PassthroughEmbedder;
    use crate::data::trajectory::{MemoryLoader, TrajectoryStep};

    fn trajectory(len: usize) -> Vec<TrajectoryStep> {
        (0..len)
            .map(|i| TrajectoryStep {
                frame: vec![i as f32, 0.0],
                action: Action::new(),
            })
            .collect()
    }

    fn handler() -> DataHandler<MemoryLoader, PassthroughEmbedder> {
        let loaders = vec![
            MemoryLoader::new(0).with_trajectory("a0", trajectory(5)),
            MemoryLoader::new(1)
                .with_trajectory("b0", trajectory(4))
                .with_trajectory("b1", trajectory(6)),
        ];
        DataHandler::new(loaders, Arc::new(PassthroughEmbedder::new(2)), 3, 1).unwrap()
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let embedder = Arc::new(PassthroughEmbedder::new(2));
        let empty: Vec<MemoryLoader> = Vec::new();
        assert!(DataHandler::new(empty, embedder.clone(), 3, 0).is_err());

        let misnumbered = vec![MemoryLoader::new(4).with_trajectory("x", trajectory(2))];
        assert!(DataHandler::new(misnumbered, embedder.clone(), 3, 0).is_err());

        let no_trajectories = vec![MemoryLoader::new(0)];
        assert!(DataHandler::new(no_trajectories, embedder, 3, 0).is_err());
    }

    #[test]
    fn test_sampled_windows_match_their_task() {
        let mut handler = handler();
        assert_eq!(handler.num_tasks(), 2);
        let mut seen = [false; 2];
        for _ in 0..30 {
            let windows = handler.sample_single_trajectory().unwrap();
            let task_id = windows.task_id();
            seen[task_id] = true;
            for window in windows {
                assert_eq!(window.task_id, task_id);
                assert_eq!(window.len(), 3);
            }
        }
        assert!(seen[0] && seen[1]);
    }

    #[test]
    fn test_sample_for_each_task() {
        let mut handler = handler();
        let sampled = handler.sample_trajectories_for_each_task(2);
        assert_eq!(sampled.len(), 2);
        for (task_id, refs) in sampled.iter().enumerate() {
            assert_eq!(refs.len(), 2);
            assert!(refs.iter().all(|r| r.task_id == task_id));
        }
    }

    #[test]
    fn test_embed_trajectory() {
        let handler = handler();
        let trajectory = TrajectoryRef {
            uid: "b1".to_string(),
            task_id: 1,
        };
        let embeddings = handler.embed_trajectory(&trajectory).unwrap();
        assert_eq!(embeddings.len(), 6);
        assert_eq!(embeddings[5], vec![5.0, 0.0]);
    }

    #[test]
    fn test_final_embeddings_for_each_task() {
        let mut handler = handler();
        let finals = handler.final_embeddings_for_each_task(3).unwrap();
        assert_eq!(finals.len(), 2);
        assert_eq!(finals[0], vec![vec![4.0, 0.0]; 3]);
        for last in &finals[1] {
            assert!(*last == vec![3.0, 0.0] || *last == vec![5.0, 0.0]);
        }
    }
}
