//! Expert trajectories and the loaders that enumerate them

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::{FgzError, Result};

/// Identifies one recorded demonstration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrajectoryRef {
    pub uid: String,
    pub task_id: usize,
}

impl std::fmt::Display for TrajectoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T({})", self.uid)
    }
}

/// One frame of a demonstration and the action taken from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    /// Pre-extracted frame features
    pub frame: Vec<f32>,
    pub action: Action,
}

/// Source of trajectories for a single task.
///
/// Steps are produced lazily; a loader never holds a whole trajectory in
/// memory unless it was constructed from one.
pub trait TrajectoryLoader: Send + Sync + 'static {
    type Steps: Iterator<Item = Result<TrajectoryStep>> + Send + 'static;

    fn task_id(&self) -> usize;

    fn uids(&self) -> &[String];

    fn open(&self, uid: &str) -> Result<Self::Steps>;

    fn len(&self) -> usize {
        self.uids().len()
    }

    fn is_empty(&self) -> bool {
        self.uids().is_empty()
    }

    fn trajectories(&self) -> Vec<TrajectoryRef> {
        self.uids()
            .iter()
            .map(|uid| TrajectoryRef {
                uid: uid.clone(),
                task_id: self.task_id(),
            })
            .collect()
    }

    /// Uniformly chosen trajectory, `None` if the loader is empty
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<TrajectoryRef> {
        self.uids().choose(rng).map(|uid| TrajectoryRef {
            uid: uid.clone(),
            task_id: self.task_id(),
        })
    }
}

/// Task directory holding one `<uid>.jsonl` file per trajectory
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    root: PathBuf,
    task_id: usize,
    uids: Vec<String>,
}

impl DirectoryLoader {
    pub fn new(root: impl AsRef<Path>, task_id: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut uids = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    uids.push(stem.to_string());
                }
            }
        }
        uids.sort();

        tracing::info!(
            "Loaded task {} from {}: {} trajectories",
            task_id,
            root.display(),
            uids.len()
        );
        Ok(Self {
            root,
            task_id,
            uids,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TrajectoryLoader for DirectoryLoader {
    type Steps = JsonlSteps;

    fn task_id(&self) -> usize {
        self.task_id
    }

    fn uids(&self) -> &[String] {
        &self.uids
    }

    fn open(&self, uid: &str) -> Result<JsonlSteps> {
        if !self.uids.iter().any(|known| known == uid) {
            return Err(FgzError::UnknownTrajectory(uid.to_string()));
        }
        let file = File::open(self.root.join(format!("{uid}.jsonl")))?;
        Ok(JsonlSteps {
            lines: BufReader::new(file).lines(),
        })
    }
}

/// Line-by-line reader of a `.jsonl` trajectory; blank lines are skipped
pub struct JsonlSteps {
    lines: Lines<BufReader<File>>,
}

impl Iterator for JsonlSteps {
    type Item = Result<TrajectoryStep>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(FgzError::from));
        }
    }
}

/// In-memory trajectories, for synthetic data and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    task_id: usize,
    uids: Vec<String>,
    trajectories: HashMap<String, Arc<Vec<TrajectoryStep>>>,
}

impl MemoryLoader {
    pub fn new(task_id: usize) -> Self {
        Self {
            task_id,
            ..Self::default()
        }
    }

    pub fn with_trajectory(mut self, uid: impl Into<String>, steps: Vec<TrajectoryStep>) -> Self {
        self.insert(uid, steps);
        self
    }

    pub fn insert(&mut self, uid: impl Into<String>, steps: Vec<TrajectoryStep>) {
        let uid = uid.into();
        if !self.trajectories.contains_key(&uid) {
            self.uids.push(uid.clone());
        }
        self.trajectories.insert(uid, Arc::new(steps));
    }
}

impl TrajectoryLoader for MemoryLoader {
    type Steps = MemorySteps;

    fn task_id(&self) -> usize {
        self.task_id
    }

    fn uids(&self) -> &[String] {
        &self.uids
    }

    fn open(&self, uid: &str) -> Result<MemorySteps> {
        let steps = self
            .trajectories
            .get(uid)
            .cloned()
            .ok_or_else(|| FgzError::UnknownTrajectory(uid.to_string()))?;
        Ok(MemorySteps { steps, position: 0 })
    }
}

pub struct MemorySteps {
    steps: Arc<Vec<TrajectoryStep>>,
    position: usize,
}

impl Iterator for MemorySteps {
    type Item = Result<TrajectoryStep>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = self.steps.get(self.position)?.clone();
        self.position += 1;
        Some(Ok(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;

    fn step(value: f32) -> TrajectoryStep {
        TrajectoryStep {
            frame: vec![value; 2],
            action: Action::new().with_button("forward", 1.0),
        }
    }

    #[test]
    fn test_directory_loader_reads_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("abc.jsonl")).unwrap();
        writeln!(file, r#"{{"frame":[0.5,0.25],"action":{{"camera":[1.0,2.0],"jump":1}}}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"frame":[1.0,0.0],"action":{{"forward":1}}}}"#).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        let loader = DirectoryLoader::new(dir.path(), 3).unwrap();
        assert_eq!(loader.uids(), &["abc".to_string()]);
        assert_eq!(loader.task_id(), 3);

        let steps: Vec<TrajectoryStep> = loader
            .open("abc")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].frame, vec![0.5, 0.25]);
        assert_eq!(steps[0].action.camera, [1.0, 2.0]);
        assert_eq!(steps[1].action.button(crate::action::Button::Forward), 1.0);
    }

    #[test]
    fn test_directory_loader_reports_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.jsonl"), "not json\n").unwrap();

        let loader = DirectoryLoader::new(dir.path(), 0).unwrap();
        let first = loader.open("bad").unwrap().next().unwrap();
        assert!(matches!(first, Err(FgzError::Json(_))));
        assert!(matches!(loader.open("missing"), Err(FgzError::UnknownTrajectory(_))));
    }

    #[test]
    fn test_memory_loader_sampling() {
        let loader = MemoryLoader::new(1)
            .with_trajectory("a", vec![step(0.0)])
            .with_trajectory("b", vec![step(1.0), step(2.0)]);
        assert_eq!(loader.len(), 2);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let sampled = loader.sample(&mut rng).unwrap();
            assert_eq!(sampled.task_id, 1);
            assert!(sampled.uid == "a" || sampled.uid == "b");
        }

        assert_eq!(loader.open("b").unwrap().count(), 2);
        assert!(MemoryLoader::new(0).sample(&mut rng).is_none());
    }
}
