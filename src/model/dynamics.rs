//! Dynamics function: (state embedding, action) -> (next embedding, discriminator probabilities)

use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};

use crate::action::{Action, NUM_BUTTONS, vectorize_action};
use crate::error::{self, FgzError};

/// Configuration for the dynamics function
#[derive(Debug, Config)]
pub struct DynamicsConfig {
    /// Size of the state embedding flowing through the search
    pub state_embedding_size: usize,
    /// Number of discriminator classes (tasks, plus one search class when enabled)
    pub discriminator_classes: usize,
    /// Width of the button encoder
    #[config(default = 16)]
    pub button_features: usize,
    /// Width of the camera encoder
    #[config(default = 16)]
    pub camera_features: usize,
    /// Hidden layers after the input projection
    #[config(default = 4)]
    pub embedder_layers: usize,
    /// Divisor applied to camera deltas during vectorization
    #[config(default = 180.0)]
    pub camera_scale: f32,
}

impl DynamicsConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DynamicsFunction<B> {
        DynamicsFunction::new(device, self)
    }
}

/// Learned simulator and discriminator in one module.
///
/// The next embedding is sigmoid-bounded and the discriminator output is a
/// softmax distribution, so the search reward cannot be inflated by growing
/// magnitudes.
#[derive(Module, Debug)]
pub struct DynamicsFunction<B: Backend> {
    button_embedder: Linear<B>,
    camera_embedder: Linear<B>,
    /// Projects [state | buttons | camera] back to the embedding size
    input: Linear<B>,
    hidden: Vec<Linear<B>>,
    discriminator_head: Linear<B>,
    activation: Relu,
    /// Divisor for camera deltas, taken from the config rather than the record
    camera_scale: f32,
}

impl<B: Backend> DynamicsFunction<B> {
    pub fn new(device: &B::Device, config: &DynamicsConfig) -> Self {
        let size = config.state_embedding_size;

        let button_embedder = LinearConfig::new(NUM_BUTTONS, config.button_features).init(device);
        let camera_embedder = LinearConfig::new(2, config.camera_features).init(device);

        let input = LinearConfig::new(
            size + config.button_features + config.camera_features,
            size,
        )
        .init(device);

        let hidden = (0..config.embedder_layers)
            .map(|_| LinearConfig::new(size, size).init(device))
            .collect();

        let discriminator_head =
            LinearConfig::new(size, config.discriminator_classes).init(device);

        Self {
            button_embedder,
            camera_embedder,
            input,
            hidden,
            discriminator_head,
            activation: Relu::new(),
            camera_scale: config.camera_scale,
        }
    }

    pub fn state_embedding_size(&self) -> usize {
        self.discriminator_head.weight.val().dims()[0]
    }

    pub fn discriminator_classes(&self) -> usize {
        self.discriminator_head.weight.val().dims()[1]
    }

    pub fn camera_scale(&self) -> f32 {
        self.camera_scale
    }

    /// Batched step along the walker axis.
    /// state: [n, embedding], buttons: [n, NUM_BUTTONS], camera: [n, 2]
    pub fn forward(
        &self,
        state: Tensor<B, 2>,
        buttons: Tensor<B, 2>,
        camera: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let button_embedding = self.activation.forward(self.button_embedder.forward(buttons));
        let camera_embedding = self.activation.forward(self.camera_embedder.forward(camera));

        let concat = Tensor::cat(vec![state, button_embedding, camera_embedding], 1);
        let mut x = self.input.forward(concat);
        for layer in &self.hidden {
            x = layer.forward(self.activation.forward(x));
        }
        let next_state = sigmoid(x);

        let discriminator = softmax(self.discriminator_head.forward(next_state.clone()), 1);

        (next_state, discriminator)
    }

    /// Single-action step without the batch dimension
    pub fn forward_action(
        &self,
        state: Tensor<B, 1>,
        action: &Action,
        camera_scale: f32,
    ) -> error::Result<(Tensor<B, 1>, Tensor<B, 1>)> {
        let [size] = state.dims();
        if size != self.state_embedding_size() {
            return Err(FgzError::DimensionMismatch {
                expected: self.state_embedding_size(),
                actual: size,
            });
        }

        let device = state.device();
        let (buttons, camera) = vectorize_action(action, camera_scale)?;
        let buttons = Tensor::<B, 1>::from_floats(buttons.as_slice(), &device).unsqueeze::<2>();
        let camera = Tensor::<B, 1>::from_floats(camera.as_slice(), &device).unsqueeze::<2>();

        let (next_state, discriminator) = self.forward(state.unsqueeze::<2>(), buttons, camera);
        Ok((next_state.squeeze::<1>(0), discriminator.squeeze::<1>(0)))
    }

    /// [`Self::forward_action`] with the configured camera scale
    pub fn step(&self, state: Tensor<B, 1>, action: &Action) -> error::Result<(Tensor<B, 1>, Tensor<B, 1>)> {
        self.forward_action(state, action, self.camera_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::tensor_to_vec;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn model(size: usize, classes: usize) -> DynamicsFunction<TestBackend> {
        DynamicsConfig::new(size, classes)
            .with_embedder_layers(2)
            .init(&Default::default())
    }

    #[test]
    fn test_dynamics_config_defaults() {
        let config = DynamicsConfig::new(32, 3);
        assert_eq!(config.button_features, 16);
        assert_eq!(config.camera_features, 16);
        assert_eq!(config.embedder_layers, 4);
        assert!((config.camera_scale - 180.0).abs() < 1e-6);
    }

    #[test]
    fn test_forward_shapes_and_bounds() {
        let device = Default::default();
        let dynamics = model(8, 3);
        assert_eq!(dynamics.state_embedding_size(), 8);
        assert_eq!(dynamics.discriminator_classes(), 3);

        let state = Tensor::<TestBackend, 2>::random(
            [5, 8],
            burn::tensor::Distribution::Uniform(-50.0, 50.0),
            &device,
        );
        let buttons = Tensor::<TestBackend, 2>::ones([5, NUM_BUTTONS], &device);
        let camera = Tensor::<TestBackend, 2>::full([5, 2], 3.0, &device);

        let (next, probs) = dynamics.forward(state, buttons, camera);
        assert_eq!(next.dims(), [5, 8]);
        assert_eq!(probs.dims(), [5, 3]);

        let next = tensor_to_vec(next).unwrap();
        assert!(next.iter().all(|v| (0.0..=1.0).contains(v)));

        let probs = tensor_to_vec(probs).unwrap();
        for row in probs.chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_action_drops_batch_dim() {
        let device = Default::default();
        let dynamics = model(6, 2);
        let state = Tensor::<TestBackend, 1>::zeros([6], &device);
        let action = Action::new().with_button("forward", 1.0).with_camera(180.0, -90.0);

        let (next, probs) = dynamics.step(state, &action).unwrap();
        assert_eq!(next.dims(), [6]);
        assert_eq!(probs.dims(), [2]);
    }

    #[test]
    fn test_forward_action_rejects_wrong_size() {
        let device = Default::default();
        let dynamics = model(6, 2);
        let state = Tensor::<TestBackend, 1>::zeros([4], &device);
        let err = dynamics.step(state, &Action::new()).unwrap_err();
        assert!(matches!(err, FgzError::DimensionMismatch { expected: 6, actual: 4 }));
    }

    #[test]
    fn test_step_uses_configured_camera_scale() {
        let device = Default::default();
        let dynamics = DynamicsConfig::new(6, 2)
            .with_embedder_layers(1)
            .with_camera_scale(90.0)
            .init::<TestBackend>(&device);
        assert!((dynamics.camera_scale() - 90.0).abs() < 1e-6);

        let state = Tensor::<TestBackend, 1>::full([6], 0.5, &device);
        let action = Action::new().with_camera(45.0, -30.0);
        let (stepped, _) = dynamics.step(state.clone(), &action).unwrap();
        let (at_90, _) = dynamics.forward_action(state.clone(), &action, 90.0).unwrap();
        let (at_180, _) = dynamics.forward_action(state, &action, 180.0).unwrap();

        let stepped = tensor_to_vec(stepped).unwrap();
        assert_eq!(stepped, tensor_to_vec(at_90).unwrap());
        assert_ne!(stepped, tensor_to_vec(at_180).unwrap());
    }
}
