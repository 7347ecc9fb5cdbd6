//! Run configuration read from `FGZ_*` environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::action::{ActionSpace, DEFAULT_CAMERA_SCALE};
use crate::data::PairWorkerConfig;
use crate::error::{FgzError, Result};
use crate::search::{EnvConfig, FmcConfig};
use crate::train::{RepresentationTrainerConfig, TrainerConfig};

#[derive(Debug, Clone)]
pub struct FgzConfig {
    /// One directory of `*.jsonl` trajectories per task, in task id order
    pub dataset_dirs: Vec<PathBuf>,
    pub out_dir: PathBuf,
    /// Defaults to a timestamp
    pub run_name: Option<String>,
    pub train_steps: usize,
    pub checkpoint_every: usize,
    pub log_every: usize,
    pub embedding_size: usize,
    pub num_workers: usize,
    /// Divisor for camera deltas, stored with the dynamics config
    pub camera_scale: f32,
    pub trainer: TrainerConfig,
    pub fmc: FmcConfig,
    pub env: EnvConfig,
    pub representation: RepresentationTrainerConfig,
    pub pair_worker: PairWorkerConfig,
}

impl Default for FgzConfig {
    fn default() -> Self {
        Self {
            dataset_dirs: Vec::new(),
            out_dir: PathBuf::from("train"),
            run_name: None,
            train_steps: 1000,
            checkpoint_every: 100,
            log_every: 10,
            embedding_size: 64,
            num_workers: 4,
            camera_scale: DEFAULT_CAMERA_SCALE,
            trainer: TrainerConfig::new(),
            fmc: FmcConfig::new(),
            env: EnvConfig::default(),
            representation: RepresentationTrainerConfig::new(),
            pair_worker: PairWorkerConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FgzError::config(format!("{key}: cannot parse {value:?}"))),
    }
}

impl FgzConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Unset keys keep their defaults; malformed values are errors
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dirs) = lookup("FGZ_DATASET_DIRS") {
            config.dataset_dirs = dirs
                .split(',')
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(dir) = lookup("FGZ_OUT_DIR") {
            config.out_dir = PathBuf::from(dir);
        }
        config.run_name = lookup("FGZ_RUN_NAME");

        macro_rules! set {
            ($field:expr, $key:literal) => {
                if let Some(value) = parse_var(&lookup, $key)? {
                    $field = value;
                }
            };
        }

        set!(config.train_steps, "FGZ_TRAIN_STEPS");
        set!(config.checkpoint_every, "FGZ_CHECKPOINT_EVERY");
        set!(config.log_every, "FGZ_LOG_EVERY");
        set!(config.embedding_size, "FGZ_EMBEDDING_SIZE");
        set!(config.num_workers, "FGZ_WORKERS");

        set!(config.trainer.search_steps, "FGZ_SEARCH_STEPS");
        set!(config.trainer.unroll_steps, "FGZ_UNROLL_STEPS");
        set!(config.trainer.batch_size, "FGZ_BATCH_SIZE");
        set!(config.trainer.consistency_loss_coeff, "FGZ_CONSISTENCY_LOSS_COEFF");
        set!(config.trainer.learning_rate, "FGZ_LEARNING_RATE");
        set!(config.trainer.disable_search_detection, "FGZ_DISABLE_SEARCH_DETECTION");
        if let Some(max) = parse_var(&lookup, "FGZ_MAX_WINDOWS_PER_TRAJECTORY")? {
            config.trainer.max_windows_per_trajectory = Some(max);
        }

        set!(config.fmc.balance, "FGZ_BALANCE");
        set!(config.fmc.prune_tree, "FGZ_PRUNE_TREE");

        set!(config.env.num_walkers, "FGZ_NUM_WALKERS");
        set!(config.camera_scale, "FGZ_CAMERA_SCALE");
        set!(config.env.action_space.sample_escape, "FGZ_SAMPLE_ESCAPE");

        set!(config.representation.num_frame_samples, "FGZ_FRAME_SAMPLES");
        set!(config.representation.learning_rate, "FGZ_REPRESENTATION_LEARNING_RATE");
        if let Some(frames) = parse_var(&lookup, "FGZ_FRAMES_PER_TRAJECTORY")? {
            config.pair_worker.frames_per_trajectory = Some(frames);
        }
        if let Some(frames) = parse_var(&lookup, "FGZ_MAX_FRAMES")? {
            config.pair_worker.max_frames = Some(frames);
        }

        if let Some(seed) = parse_var::<u64>(&lookup, "FGZ_SEED")? {
            config.set_seed(seed);
        }
        Ok(config)
    }

    /// Seeds every component, offset so their streams differ
    pub fn set_seed(&mut self, seed: u64) {
        self.trainer.seed = seed;
        self.fmc.seed = seed.wrapping_add(1);
        self.env.seed = seed.wrapping_add(2);
        self.representation.seed = seed.wrapping_add(3);
        self.pair_worker.seed = seed.wrapping_add(4);
    }

    pub fn num_tasks(&self) -> usize {
        self.dataset_dirs.len()
    }

    pub fn action_space(&self) -> &ActionSpace {
        &self.env.action_space
    }

    pub fn validate(&self) -> Result<()> {
        if self.dataset_dirs.is_empty() {
            return Err(FgzError::config("FGZ_DATASET_DIRS names no dataset"));
        }
        self.trainer.validate(self.num_tasks())?;
        if self.checkpoint_every == 0 || self.log_every == 0 {
            return Err(FgzError::config("checkpoint and log intervals must be positive"));
        }
        if self.camera_scale <= 0.0 {
            return Err(FgzError::config("camera_scale must be positive"));
        }
        if self.embedding_size == 0 {
            return Err(FgzError::config("embedding_size must be positive"));
        }
        if self.env.num_walkers < 2 {
            return Err(FgzError::config("the search needs at least two walkers"));
        }
        if self.num_workers == 0 {
            return Err(FgzError::config("at least one pair worker is required"));
        }
        if self.representation.num_frame_samples == 0 {
            return Err(FgzError::config("num_frame_samples must be positive"));
        }
        Ok(())
    }

    pub fn log_summary(&self) {
        tracing::info!("Datasets: {:?}", self.dataset_dirs);
        tracing::info!("Output: {}", self.out_dir.display());
        tracing::info!(
            "Training {} steps: batch={}, unroll={}, search_steps={}, walkers={}",
            self.train_steps,
            self.trainer.batch_size,
            self.trainer.unroll_steps,
            self.trainer.search_steps,
            self.env.num_walkers
        );
        if self.trainer.disable_search_detection {
            tracing::info!("Search detection disabled");
        }
    }
}
