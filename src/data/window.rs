//! Fixed-capacity sliding windows over one expert trajectory

use std::collections::VecDeque;
use std::sync::Arc;

use super::embed::{Embedder, embed_frame};
use super::trajectory::{TrajectoryRef, TrajectoryStep};
use crate::action::Action;
use crate::error::Result;

/// An embedded frame and the expert action taken from it
#[derive(Debug, Clone, PartialEq)]
pub struct WindowFrame {
    pub embedding: Vec<f32>,
    pub action: Action,
}

/// K consecutive frames of one trajectory
#[derive(Debug, Clone)]
pub struct TrajectoryWindow {
    pub uid: String,
    pub task_id: usize,
    /// Index of `frames[0]` within the trajectory
    pub start: usize,
    pub frames: Vec<WindowFrame>,
}

impl TrajectoryWindow {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Index one past the last frame
    pub fn end(&self) -> usize {
        self.start + self.frames.len()
    }

    pub fn root_embedding(&self) -> &[f32] {
        &self.frames[0].embedding
    }
}

/// Lazily embeds a trajectory and yields every full window of `capacity` frames.
///
/// The first window appears once `capacity` frames were read; each further
/// frame drops the oldest. A trajectory shorter than the capacity yields
/// nothing. A frame that fails to load or embed ends the trajectory early.
pub struct SlidingWindows<S, E: ?Sized> {
    trajectory: TrajectoryRef,
    steps: S,
    embedder: Arc<E>,
    capacity: usize,
    window: VecDeque<WindowFrame>,
    next_index: usize,
    finished: bool,
}

impl<S, E> SlidingWindows<S, E>
where
    S: Iterator<Item = Result<TrajectoryStep>>,
    E: Embedder + ?Sized,
{
    pub fn new(trajectory: TrajectoryRef, steps: S, embedder: Arc<E>, capacity: usize) -> Self {
        Self {
            trajectory,
            steps,
            embedder,
            capacity,
            window: VecDeque::with_capacity(capacity),
            next_index: 0,
            finished: capacity == 0,
        }
    }

    pub fn trajectory(&self) -> &TrajectoryRef {
        &self.trajectory
    }

    pub fn task_id(&self) -> usize {
        self.trajectory.task_id
    }

    fn push_next(&mut self) -> Option<()> {
        let index = self.next_index;
        let step = match self.steps.next()? {
            Ok(step) => step,
            Err(err) => {
                tracing::warn!(
                    "Failed to read frame {} of {}, ending trajectory: {}",
                    index,
                    self.trajectory,
                    err
                );
                return None;
            }
        };
        let embedding = match embed_frame(&*self.embedder, &self.trajectory.uid, index, &step.frame) {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::warn!("{}, ending trajectory early", err);
                return None;
            }
        };

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(WindowFrame {
            embedding,
            action: step.action,
        });
        self.next_index += 1;
        Some(())
    }
}

impl<S, E> Iterator for SlidingWindows<S, E>
where
    S: Iterator<Item = Result<TrajectoryStep>>,
    E: Embedder + ?Sized,
{
    type Item = TrajectoryWindow;

    fn next(&mut self) -> Option<TrajectoryWindow> {
        if self.finished {
            return None;
        }

        loop {
            if self.push_next().is_none() {
                self.finished = true;
                return None;
            }
            if self.window.len() == self.capacity {
                break;
            }
        }

        Some(TrajectoryWindow {
            uid: self.trajectory.uid.clone(),
            task_id: self.trajectory.task_id,
            start: self.next_index - self.capacity,
            frames: self.window.iter().cloned().collect(),
        })
    }
}
