//! Bounded pool of pair samplers running ahead of the trainer
//!
//! Every worker always has exactly one task in flight on the blocking pool of
//! a private tokio runtime. A worker's sampler moves into its task and comes
//! back with the result, so nothing is shared between the trainer thread and
//! the workers. Polling is a zero-timeout `is_finished` check.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use super::worker::{PairSampler, TrajectoryPair};
use crate::error::{FgzError, Result};

/// A pair plus the worker that produced it and that worker's task sequence number
#[derive(Debug, Clone)]
pub struct Prefetched {
    pub worker: usize,
    pub sequence: u64,
    pub pair: TrajectoryPair,
}

type TaskOutput<S> = (S, Result<TrajectoryPair>);

struct InFlight<S> {
    sequence: u64,
    handle: JoinHandle<TaskOutput<S>>,
}

pub struct Prefetcher<S: PairSampler> {
    runtime: Option<Runtime>,
    tasks: Vec<Option<InFlight<S>>>,
    issued: Vec<u64>,
    buffer: VecDeque<Prefetched>,
    capacity: usize,
    poll_interval: Duration,
}

impl<S: PairSampler> Prefetcher<S> {
    /// Start one task per sampler; the ready buffer holds at most `samplers.len()` pairs
    pub fn new(samplers: Vec<S>) -> Result<Self> {
        if samplers.is_empty() {
            return Err(FgzError::config("prefetcher needs at least one worker"));
        }
        let capacity = samplers.len();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(capacity)
            .thread_name("fgz-prefetch")
            .build()?;

        let mut prefetcher = Self {
            runtime: Some(runtime),
            tasks: (0..capacity).map(|_| None).collect(),
            issued: vec![0; capacity],
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            poll_interval: Duration::from_millis(1),
        };
        for (worker, sampler) in samplers.into_iter().enumerate() {
            prefetcher.issue(worker, sampler);
        }
        tracing::info!("Started prefetcher with {} workers", capacity);
        Ok(prefetcher)
    }

    pub fn num_workers(&self) -> usize {
        self.capacity
    }

    /// Results waiting to be consumed; never more than the worker count
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn issue(&mut self, worker: usize, mut sampler: S) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        let sequence = self.issued[worker];
        self.issued[worker] += 1;
        let handle = runtime.spawn_blocking(move || {
            let result = sampler.sample_pair();
            (sampler, result)
        });
        self.tasks[worker] = Some(InFlight { sequence, handle });
    }

    /// Move finished results into the buffer while it has room, re-issuing
    /// each freed worker immediately
    fn harvest(&mut self) -> Result<()> {
        for worker in 0..self.capacity {
            if self.buffer.len() >= self.capacity {
                break;
            }
            let finished = self.tasks[worker]
                .as_ref()
                .is_some_and(|task| task.handle.is_finished());
            if !finished {
                continue;
            }
            let Some(task) = self.tasks[worker].take() else {
                continue;
            };
            let Some(runtime) = self.runtime.as_ref() else {
                return Err(FgzError::WorkerFailed(worker));
            };

            let (sampler, result) = runtime.block_on(task.handle).map_err(|err| {
                tracing::error!("Prefetch worker {} panicked: {}", worker, err);
                FgzError::WorkerFailed(worker)
            })?;
            self.issue(worker, sampler);

            self.buffer.push_back(Prefetched {
                worker,
                sequence: task.sequence,
                pair: result?,
            });
        }
        Ok(())
    }

    /// Oldest ready pair, polling until one is available
    pub fn sample_train_pair(&mut self) -> Result<Prefetched> {
        loop {
            self.harvest()?;
            if let Some(ready) = self.buffer.pop_front() {
                tracing::debug!("Data buffer length: {}", self.buffer.len());
                return Ok(ready);
            }
            if self.tasks.iter().all(Option::is_none) {
                return Err(FgzError::WorkerFailed(0));
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl<S: PairSampler> Drop for Prefetcher<S> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
