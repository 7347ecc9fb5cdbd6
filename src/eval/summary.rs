use std::collections::BTreeMap;

use super::evaluator::EvaluationReport;

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub episodes: usize,
    pub completions: usize,
    pub total_reward: f32,
    pub total_steps: usize,
}

/// Aggregate over evaluation episodes, keyed by the targeted discriminator logit
#[derive(Debug, Clone, Default)]
pub struct EvaluationMetrics {
    pub num_episodes: usize,
    pub total_reward: f32,
    pub num_completions: usize,
    pub total_steps: usize,
    pub total_path_reward: f32,
    /// Summed over the episodes that measured a target distance
    pub total_final_distance: f32,
    pub distance_episodes: usize,
    pub task_stats: BTreeMap<usize, TaskStats>,
}

impl EvaluationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_episode(&mut self, target_logit: usize, report: &EvaluationReport) {
        let reward = report.total_reward();
        let steps = report.steps();

        self.num_episodes += 1;
        self.total_reward += reward;
        self.total_steps += steps;
        if report.done {
            self.num_completions += 1;
        }
        if steps > 0 {
            self.total_path_reward += report.path_rewards.iter().sum::<f32>() / steps as f32;
        }
        if let Some(distance) = report.final_distance() {
            self.total_final_distance += distance;
            self.distance_episodes += 1;
        }

        let stats = self.task_stats.entry(target_logit).or_default();
        stats.episodes += 1;
        stats.total_reward += reward;
        stats.total_steps += steps;
        if report.done {
            stats.completions += 1;
        }
    }

    fn per_episode(&self, total: f32) -> f32 {
        if self.num_episodes > 0 {
            total / self.num_episodes as f32
        } else {
            0.0
        }
    }

    pub fn avg_reward(&self) -> f32 {
        self.per_episode(self.total_reward)
    }

    pub fn avg_steps(&self) -> f32 {
        self.per_episode(self.total_steps as f32)
    }

    pub fn completion_rate(&self) -> f32 {
        self.per_episode(self.num_completions as f32)
    }

    /// Mean over episodes of the per-step average best-path reward
    pub fn avg_path_reward(&self) -> f32 {
        self.per_episode(self.total_path_reward)
    }

    /// Mean distance to the target at the last observed step
    pub fn avg_final_distance(&self) -> Option<f32> {
        (self.distance_episodes > 0).then(|| self.total_final_distance / self.distance_episodes as f32)
    }

    pub fn print_summary(&self) {
        tracing::info!("=== Evaluation Summary ===");
        tracing::info!("Episodes: {}", self.num_episodes);
        tracing::info!("Avg Reward: {:.2}", self.avg_reward());
        tracing::info!("Completion Rate: {:.1}%", self.completion_rate() * 100.0);
        tracing::info!("Avg Steps: {:.1}", self.avg_steps());
        tracing::info!("Avg Path Reward: {:.3}", self.avg_path_reward());
        if let Some(distance) = self.avg_final_distance() {
            tracing::info!("Avg Final Distance: {:.3}", distance);
        }

        for (task, stats) in &self.task_stats {
            let avg_reward = if stats.episodes > 0 {
                stats.total_reward / stats.episodes as f32
            } else {
                0.0
            };
            tracing::info!(
                "  Task {}: {} episodes, {} completed, avg_reward={:.2}",
                task,
                stats.episodes,
                stats.completions,
                avg_reward
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(rewards: Vec<f32>, done: bool) -> EvaluationReport {
        EvaluationReport {
            path_rewards: vec![0.5; rewards.len()],
            rewards,
            done,
            ..EvaluationReport::default()
        }
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = EvaluationMetrics::new();
        assert_eq!(metrics.avg_reward(), 0.0);
        assert_eq!(metrics.completion_rate(), 0.0);
        assert!(metrics.avg_final_distance().is_none());
    }

    #[test]
    fn test_record_episodes() {
        let mut metrics = EvaluationMetrics::new();
        metrics.record_episode(0, &report(vec![1.0, 2.0], true));
        metrics.record_episode(1, &report(vec![1.0; 4], false));
        metrics.record_episode(1, &report(Vec::new(), false));
        metrics.record_episode(
            0,
            &EvaluationReport {
                target_distances: vec![3.0, 1.0],
                ..report(vec![0.0; 2], false)
            },
        );

        assert_eq!(metrics.num_episodes, 4);
        assert!((metrics.avg_reward() - 7.0 / 4.0).abs() < 1e-6);
        assert!((metrics.avg_steps() - 2.0).abs() < 1e-6);
        assert!((metrics.completion_rate() - 1.0 / 4.0).abs() < 1e-6);
        assert!((metrics.avg_path_reward() - 0.375).abs() < 1e-6);
        assert_eq!(metrics.avg_final_distance(), Some(1.0));
        assert_eq!(metrics.task_stats[&1].episodes, 2);
        assert_eq!(metrics.task_stats[&0].episodes, 2);
        assert_eq!(metrics.task_stats[&0].completions, 1);
    }
}
