//! Pair sampling workers feeding the representation trainer

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use super::embed::{Embedder, embed_frame};
use super::trajectory::{TrajectoryLoader, TrajectoryRef, TrajectoryStep};
use crate::action::Action;
use crate::error::{FgzError, Result};

/// Embedded frames of one trajectory, possibly subsampled
#[derive(Debug, Clone)]
pub struct EmbeddedTrajectory {
    pub trajectory: TrajectoryRef,
    pub embeddings: Vec<Vec<f32>>,
    pub actions: Vec<Action>,
    /// Position of each kept frame in the source trajectory
    pub frame_indices: Vec<usize>,
}

impl EmbeddedTrajectory {
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn last_embedding(&self) -> Option<&[f32]> {
        self.embeddings.last().map(Vec::as_slice)
    }
}

/// Two embedded trajectories with distinct uids
#[derive(Debug, Clone)]
pub struct TrajectoryPair {
    pub first: EmbeddedTrajectory,
    pub second: EmbeddedTrajectory,
}

/// A unit of work the prefetcher can run on a blocking thread
pub trait PairSampler: Send + 'static {
    fn sample_pair(&mut self) -> Result<TrajectoryPair>;
}

#[derive(Debug, Clone)]
pub struct PairWorkerConfig {
    /// Read at most this many frames of each trajectory
    pub max_frames: Option<usize>,
    /// Evenly subsample to this many frames, always keeping the last one
    pub frames_per_trajectory: Option<usize>,
    /// Attempts before the worker gives up on a pair
    pub max_attempts: usize,
    pub seed: u64,
}

impl Default for PairWorkerConfig {
    fn default() -> Self {
        Self {
            max_frames: None,
            frames_per_trajectory: Some(100),
            max_attempts: 1000,
            seed: 0,
        }
    }
}

pub struct PairWorker<L, E: ?Sized> {
    id: usize,
    loader: Arc<L>,
    embedder: Arc<E>,
    config: PairWorkerConfig,
    rng: StdRng,
}

impl<L: TrajectoryLoader, E: Embedder + ?Sized> PairWorker<L, E> {
    /// The loader must hold at least two trajectories
    pub fn new(id: usize, loader: Arc<L>, embedder: Arc<E>, config: PairWorkerConfig) -> Result<Self> {
        if loader.len() < 2 {
            return Err(FgzError::config(format!(
                "pair sampling needs at least two trajectories, task {} has {}",
                loader.task_id(),
                loader.len()
            )));
        }
        if config.frames_per_trajectory == Some(0) {
            return Err(FgzError::config("frames_per_trajectory must be positive"));
        }
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(id as u64));
        Ok(Self {
            id,
            loader,
            embedder,
            config,
            rng,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn sample_distinct(&mut self) -> Result<(TrajectoryRef, TrajectoryRef)> {
        let task_id = self.loader.task_id();
        let empty = || FgzError::UnknownTask(task_id.to_string());
        loop {
            let first = self.loader.sample(&mut self.rng).ok_or_else(empty)?;
            let second = self.loader.sample(&mut self.rng).ok_or_else(empty)?;
            if first.uid != second.uid {
                return Ok((first, second));
            }
        }
    }

    pub fn embed_trajectory(&self, trajectory: &TrajectoryRef) -> Result<EmbeddedTrajectory> {
        let limit = self.config.max_frames.unwrap_or(usize::MAX);
        let steps: Vec<TrajectoryStep> = self
            .loader
            .open(&trajectory.uid)?
            .take(limit)
            .collect::<Result<_>>()?;

        let frame_indices = match self.config.frames_per_trajectory {
            Some(count) => even_indices(steps.len(), count),
            None => (0..steps.len()).collect(),
        };

        let mut embeddings = Vec::with_capacity(frame_indices.len());
        let mut actions = Vec::with_capacity(frame_indices.len());
        for &index in &frame_indices {
            let step = &steps[index];
            embeddings.push(embed_frame(&*self.embedder, &trajectory.uid, index, &step.frame)?);
            actions.push(step.action.clone());
        }

        Ok(EmbeddedTrajectory {
            trajectory: trajectory.clone(),
            embeddings,
            actions,
            frame_indices,
        })
    }
}

impl<L: TrajectoryLoader, E: Embedder + ?Sized> PairSampler for PairWorker<L, E> {
    fn sample_pair(&mut self) -> Result<TrajectoryPair> {
        for attempt in 1..=self.config.max_attempts {
            let (t0, t1) = self.sample_distinct()?;
            let embedded = self
                .embed_trajectory(&t0)
                .and_then(|first| Ok((first, self.embed_trajectory(&t1)?)));
            match embedded {
                Ok((first, second)) if !first.is_empty() && !second.is_empty() => {
                    return Ok(TrajectoryPair { first, second });
                }
                Ok(_) => {
                    tracing::warn!("Worker {}: sampled an empty trajectory, resampling", self.id);
                }
                Err(err) if err.is_recoverable_data_error() => {
                    tracing::warn!(
                        "Worker {}: failed to embed trajectories ({}), resampling (attempt {})",
                        self.id,
                        err,
                        attempt
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(FgzError::WorkerFailed(self.id))
    }
}

/// `count` indices spread evenly over `0..len`, ending at `len - 1`
pub fn even_indices(len: usize, count: usize) -> Vec<usize> {
    if len == 0 || count == 0 {
        return Vec::new();
    }
    if count >= len {
        return (0..len).collect();
    }
    if count == 1 {
        return vec![len - 1];
    }
    let span = (len - 1) as f64;
    let mut indices: Vec<usize> = (0..count)
        .map(|i| (i as f64 * span / (count - 1) as f64).round() as usize)
        .collect();
    indices.dedup();
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::embed::PassthroughEmbedder;
    use crate::data::trajectory::MemoryLoader;

    fn trajectory(len: usize, corrupt_at: Option<usize>) -> Vec<TrajectoryStep> {
        (0..len)
            .map(|i| TrajectoryStep {
                frame: if corrupt_at == Some(i) {
                    vec![f32::NAN]
                } else {
                    vec![i as f32]
                },
                action: Action::new(),
            })
            .collect()
    }

    fn worker(loader: MemoryLoader, config: PairWorkerConfig) -> Result<PairWorker<MemoryLoader, PassthroughEmbedder>> {
        PairWorker::new(0, Arc::new(loader), Arc::new(PassthroughEmbedder::new(1)), config)
    }

    #[test]
    fn test_even_indices_keep_last_frame() {
        assert_eq!(even_indices(10, 4), vec![0, 3, 6, 9]);
        assert_eq!(even_indices(3, 5), vec![0, 1, 2]);
        assert_eq!(even_indices(7, 1), vec![6]);
        assert!(even_indices(0, 3).is_empty());
    }

    #[test]
    fn test_single_trajectory_loader_is_rejected() {
        let loader = MemoryLoader::new(0).with_trajectory("only", trajectory(3, None));
        let err = worker(loader, PairWorkerConfig::default()).err().unwrap();
        assert!(matches!(err, FgzError::Config(_)));
    }

    #[test]
    fn test_two_trajectory_loader_terminates_with_distinct_pair() {
        let loader = MemoryLoader::new(0)
            .with_trajectory("a", trajectory(5, None))
            .with_trajectory("b", trajectory(8, None));
        let mut worker = worker(loader, PairWorkerConfig::default()).unwrap();
        for _ in 0..20 {
            let pair = worker.sample_pair().unwrap();
            assert_ne!(pair.first.trajectory.uid, pair.second.trajectory.uid);
        }
    }

    #[test]
    fn test_subsampling_and_frame_limit() {
        let loader = MemoryLoader::new(0)
            .with_trajectory("a", trajectory(20, None))
            .with_trajectory("b", trajectory(20, None));
        let config = PairWorkerConfig {
            max_frames: Some(10),
            frames_per_trajectory: Some(4),
            ..PairWorkerConfig::default()
        };
        let mut worker = worker(loader, config).unwrap();
        let pair = worker.sample_pair().unwrap();
        assert_eq!(pair.first.frame_indices, vec![0, 3, 6, 9]);
        assert_eq!(pair.first.last_embedding(), Some(&[9.0][..]));
        assert_eq!(pair.second.len(), 4);
    }

    #[test]
    fn test_corrupt_trajectory_is_resampled() {
        let loader = MemoryLoader::new(0)
            .with_trajectory("good0", trajectory(4, None))
            .with_trajectory("good1", trajectory(4, None))
            .with_trajectory("bad", trajectory(4, Some(2)));
        let config = PairWorkerConfig {
            frames_per_trajectory: None,
            ..PairWorkerConfig::default()
        };
        let mut worker = worker(loader, config).unwrap();
        for _ in 0..10 {
            let pair = worker.sample_pair().unwrap();
            assert_ne!(pair.first.trajectory.uid, "bad");
            assert_ne!(pair.second.trajectory.uid, "bad");
        }
    }

    #[test]
    fn test_worker_gives_up_after_max_attempts() {
        let loader = MemoryLoader::new(0)
            .with_trajectory("bad0", trajectory(3, Some(0)))
            .with_trajectory("bad1", trajectory(3, Some(1)));
        let config = PairWorkerConfig {
            max_attempts: 5,
            ..PairWorkerConfig::default()
        };
        let mut worker = worker(loader, config).unwrap();
        assert!(matches!(worker.sample_pair(), Err(FgzError::WorkerFailed(0))));
    }
}
