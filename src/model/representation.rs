//! Representation head trained with temporal cycle consistency

use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;

#[derive(Debug, Config)]
pub struct RepresentationConfig {
    /// Size of the backbone embedding fed in
    pub input_size: usize,
    /// Size of the learned representation
    #[config(default = 32)]
    pub output_size: usize,
    #[config(default = 64)]
    pub hidden_size: usize,
    #[config(default = 2)]
    pub num_layers: usize,
}

impl RepresentationConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RepresentationModel<B> {
        RepresentationModel::new(device, self)
    }
}

#[derive(Module, Debug)]
pub struct RepresentationModel<B: Backend> {
    input: Linear<B>,
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> RepresentationModel<B> {
    pub fn new(device: &B::Device, config: &RepresentationConfig) -> Self {
        let input = LinearConfig::new(config.input_size, config.hidden_size).init(device);

        let mut hidden = Vec::new();
        for _ in 0..config.num_layers.saturating_sub(1) {
            hidden.push(LinearConfig::new(config.hidden_size, config.hidden_size).init(device));
        }

        let output = LinearConfig::new(config.hidden_size, config.output_size).init(device);

        Self {
            input,
            hidden,
            output,
            activation: Relu::new(),
        }
    }

    /// embeddings: [frames, input_size] -> [frames, output_size]
    pub fn forward(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = self.activation.forward(self.input.forward(embeddings));

        for layer in &self.hidden {
            x = self.activation.forward(layer.forward(x));
        }

        self.output.forward(x)
    }

    pub fn output_size(&self) -> usize {
        self.output.weight.val().dims()[1]
    }
}
