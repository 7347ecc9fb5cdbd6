//! Checkpoint and target-state files for a training run
//!
//! Layout under `{out}/{run}`:
//! - `checkpoints/{step}.mpk` dynamics weights
//! - `checkpoints/{step}_optim.mpk` optimizer state
//! - `checkpoints/{step}.json` configuration, step and run name
//! - `target_states/{step}.json` per-task target embeddings for evaluation
//! - `representations/{step}.mpk` representation weights
//! - `representations/{step}.json` representation config and its per-task targets

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use super::trainer::TrainerConfig;
use crate::error::{FgzError, Result};
use crate::model::{DynamicsConfig, DynamicsFunction, RepresentationConfig, RepresentationModel};

type FileRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub run_name: String,
    pub num_tasks: usize,
    pub dynamics: DynamicsConfig,
    pub trainer: TrainerConfig,
}

/// Mean final-frame embedding of each task's expert trajectories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub step: usize,
    pub tasks: BTreeMap<usize, Vec<f32>>,
}

impl TargetState {
    /// `finals[task]` holds final-frame embeddings; tasks without any are left out
    pub fn from_final_embeddings(step: usize, finals: &[Vec<Vec<f32>>]) -> Result<Self> {
        let mut tasks = BTreeMap::new();
        for (task, embeddings) in finals.iter().enumerate() {
            let Some(first) = embeddings.first() else {
                continue;
            };
            let mut mean = vec![0.0; first.len()];
            for embedding in embeddings {
                if embedding.len() != mean.len() {
                    return Err(FgzError::DimensionMismatch {
                        expected: mean.len(),
                        actual: embedding.len(),
                    });
                }
                for (m, v) in mean.iter_mut().zip(embedding) {
                    *m += v;
                }
            }
            mean.iter_mut().for_each(|m| *m /= embeddings.len() as f32);
            tasks.insert(task, mean);
        }
        Ok(Self { step, tasks })
    }

    pub fn for_task(&self, task: usize) -> Option<&[f32]> {
        self.tasks.get(&task).map(Vec::as_slice)
    }
}

/// A representation model's config plus targets expressed in its output space
#[derive(Debug, Serialize, Deserialize)]
pub struct RepresentationMeta {
    pub step: usize,
    pub run_name: String,
    pub config: RepresentationConfig,
    pub target: TargetState,
}

#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    pub fn new(out_dir: impl AsRef<Path>, run_name: &str) -> Self {
        Self {
            root: out_dir.as_ref().join(run_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn target_states_dir(&self) -> PathBuf {
        self.root.join("target_states")
    }

    pub fn representations_dir(&self) -> PathBuf {
        self.root.join("representations")
    }

    /// The recorder appends `.mpk` itself
    fn model_path(&self, step: usize) -> PathBuf {
        self.checkpoints_dir().join(step.to_string())
    }

    /// A dotted name would lose its suffix to the recorder's `set_extension`
    fn optimizer_path(&self, step: usize) -> PathBuf {
        self.checkpoints_dir().join(format!("{step}_optim"))
    }

    fn meta_path(&self, step: usize) -> PathBuf {
        self.checkpoints_dir().join(format!("{step}.json"))
    }

    fn target_state_path(&self, step: usize) -> PathBuf {
        self.target_states_dir().join(format!("{step}.json"))
    }

    fn representation_path(&self, step: usize) -> PathBuf {
        self.representations_dir().join(step.to_string())
    }

    fn representation_meta_path(&self, step: usize) -> PathBuf {
        self.representations_dir().join(format!("{step}.json"))
    }

    pub fn save_checkpoint<B, O>(
        &self,
        meta: &CheckpointMeta,
        model: &DynamicsFunction<B>,
        optimizer: &O,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<DynamicsFunction<B>, B>,
    {
        fs::create_dir_all(self.checkpoints_dir())?;
        let recorder = FileRecorder::new();

        model
            .clone()
            .save_file(self.model_path(meta.step), &recorder)
            .map_err(|err| FgzError::Recorder(format!("{err:?}")))?;
        Recorder::<B>::record(&recorder, optimizer.to_record(), self.optimizer_path(meta.step))
            .map_err(|err| FgzError::Recorder(format!("{err:?}")))?;
        fs::write(self.meta_path(meta.step), serde_json::to_string_pretty(meta)?)?;

        tracing::info!("Saved checkpoint {} to {}", meta.step, self.checkpoints_dir().display());
        Ok(())
    }

    /// Largest step with a saved checkpoint
    pub fn latest_step(&self) -> Result<usize> {
        largest_numeric_stem(&self.checkpoints_dir(), "json")
            .ok_or_else(|| FgzError::NoCheckpoint(self.checkpoints_dir()))
    }

    pub fn load_meta(&self, step: Option<usize>) -> Result<CheckpointMeta> {
        let step = match step {
            Some(step) => step,
            None => self.latest_step()?,
        };
        let path = self.meta_path(step);
        if !path.exists() {
            return Err(FgzError::NoCheckpoint(path));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Rebuild the dynamics function from its saved config and weights
    pub fn load_model<B: Backend>(
        &self,
        step: Option<usize>,
        device: &B::Device,
    ) -> Result<(DynamicsFunction<B>, CheckpointMeta)> {
        let meta = self.load_meta(step)?;
        let model = meta
            .dynamics
            .init::<B>(device)
            .load_file(self.model_path(meta.step), &FileRecorder::new(), device)
            .map_err(|err| FgzError::Recorder(format!("{err:?}")))?;
        tracing::info!("Loaded checkpoint {} from {}", meta.step, self.checkpoints_dir().display());
        Ok((model, meta))
    }

    pub fn load_optimizer<B, O>(&self, step: usize, optimizer: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        O: Optimizer<DynamicsFunction<B>, B>,
    {
        let record = Recorder::<B>::load(&FileRecorder::new(), self.optimizer_path(step), device)
            .map_err(|err| FgzError::Recorder(format!("{err:?}")))?;
        Ok(optimizer.load_record(record))
    }

    pub fn save_target_state(&self, state: &TargetState) -> Result<()> {
        fs::create_dir_all(self.target_states_dir())?;
        fs::write(self.target_state_path(state.step), serde_json::to_string(state)?)?;
        tracing::info!("Saved target state {} for {} tasks", state.step, state.tasks.len());
        Ok(())
    }

    /// Target state for `step`, or the latest one
    pub fn load_target_state(&self, step: Option<usize>) -> Result<TargetState> {
        let step = match step {
            Some(step) => step,
            None => largest_numeric_stem(&self.target_states_dir(), "json")
                .ok_or_else(|| FgzError::NoCheckpoint(self.target_states_dir()))?,
        };
        let path = self.target_state_path(step);
        if !path.exists() {
            return Err(FgzError::NoCheckpoint(path));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save_representation<B: Backend>(
        &self,
        meta: &RepresentationMeta,
        model: &RepresentationModel<B>,
    ) -> Result<()> {
        fs::create_dir_all(self.representations_dir())?;
        model
            .clone()
            .save_file(self.representation_path(meta.step), &FileRecorder::new())
            .map_err(|err| FgzError::Recorder(format!("{err:?}")))?;
        fs::write(
            self.representation_meta_path(meta.step),
            serde_json::to_string_pretty(meta)?,
        )?;
        tracing::info!(
            "Saved representation {} to {}",
            meta.step,
            self.representations_dir().display()
        );
        Ok(())
    }

    /// Representation model for `step`, or the latest one, with its targets
    pub fn load_representation<B: Backend>(
        &self,
        step: Option<usize>,
        device: &B::Device,
    ) -> Result<(RepresentationModel<B>, RepresentationMeta)> {
        let step = match step {
            Some(step) => step,
            None => largest_numeric_stem(&self.representations_dir(), "json")
                .ok_or_else(|| FgzError::NoCheckpoint(self.representations_dir()))?,
        };
        let path = self.representation_meta_path(step);
        if !path.exists() {
            return Err(FgzError::NoCheckpoint(path));
        }
        let meta: RepresentationMeta = serde_json::from_str(&fs::read_to_string(path)?)?;
        let model = meta
            .config
            .init::<B>(device)
            .load_file(self.representation_path(step), &FileRecorder::new(), device)
            .map_err(|err| FgzError::Recorder(format!("{err:?}")))?;
        Ok((model, meta))
    }
}

fn largest_numeric_stem(dir: &Path, extension: &str) -> Option<usize> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .filter_map(|path| path.file_stem()?.to_str()?.parse::<usize>().ok())
        .max()
}
