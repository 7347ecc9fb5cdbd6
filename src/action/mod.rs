//! Structured game actions and their numeric encoding
//!
//! An [`Action`] is a set of named button activations plus a 2D camera delta,
//! as logged alongside expert trajectories. [`vectorize_action`] turns it into
//! the fixed-size vectors consumed by the dynamics model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod button;
pub mod space;
pub mod vectorize;

pub use button::{Button, NUM_BUTTONS};
pub use space::ActionSpace;
pub use vectorize::{
    ActionBatch, DEFAULT_CAMERA_SCALE, vectorize_action, vectorize_actions, vectorize_buttons,
    vectorize_camera,
};

/// Button activations keyed by button name, plus camera delta in degrees
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub camera: [f32; 2],
    #[serde(flatten)]
    pub buttons: BTreeMap<String, f32>,
}

impl Action {
    /// The no-op action
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_button(mut self, name: impl Into<String>, value: f32) -> Self {
        self.buttons.insert(name.into(), value);
        self
    }

    pub fn with_camera(mut self, pitch: f32, yaw: f32) -> Self {
        self.camera = [pitch, yaw];
        self
    }

    /// Activation of a button, zero if absent
    pub fn button(&self, button: Button) -> f32 {
        self.buttons
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(button.name()))
            .map(|(_, value)| *value)
            .unwrap_or(0.0)
    }

    /// Release a button, whatever casing it was recorded under
    pub fn release(&mut self, button: Button) {
        self.buttons
            .retain(|name, _| !name.eq_ignore_ascii_case(button.name()));
        self.buttons.insert(button.name().to_string(), 0.0);
    }
}
