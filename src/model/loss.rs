//! Losses over discriminator probabilities

use burn::prelude::*;

/// Floor applied before taking the log of a probability
const PROB_EPSILON: f32 = 1e-7;

/// Cross-entropy between softmax-normalized discriminator outputs and class targets.
/// probs: [n, classes], targets: [n]
pub fn probability_cross_entropy<B: Backend>(
    probs: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [n] = targets.dims();
    let picked = probs.gather(1, targets.reshape([n, 1]));
    -picked.clamp_min(PROB_EPSILON).log().mean()
}

/// Cross-entropy against the same class for every row
pub fn constant_target_cross_entropy<B: Backend>(probs: Tensor<B, 2>, class: usize) -> Tensor<B, 1> {
    let [n, _] = probs.dims();
    let targets = Tensor::<B, 1, Int>::full([n], class as i64, &probs.device());
    probability_cross_entropy(probs, targets)
}

/// Mean squared error between two embeddings
pub fn squared_error<B: Backend>(predicted: Tensor<B, 1>, expected: Tensor<B, 1>) -> Tensor<B, 1> {
    (predicted - expected).powf_scalar(2.0).mean()
}

/// Index of the largest entry in a host-side probability row
pub fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, &v)| {
            if v > best_value { (i, v) } else { (best, best_value) }
        })
        .0
}
