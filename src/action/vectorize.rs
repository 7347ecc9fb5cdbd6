//! Deterministic encoding of structured actions into numeric vectors

use burn::prelude::*;

use super::button::{Button, NUM_BUTTONS};
use super::Action;
use crate::error::{FgzError, Result};

/// Divisor applied to raw camera deltas
pub const DEFAULT_CAMERA_SCALE: f32 = 180.0;

/// Vectorize the button activations of an action.
///
/// Softmax is taken only over buttons with a nonzero raw activation, so
/// simultaneously pressed buttons share probability mass and untouched
/// buttons stay exactly zero. Names match case-insensitively, so a
/// button given under two spellings is an error.
pub fn vectorize_buttons(action: &Action) -> Result<[f32; NUM_BUTTONS]> {
    let mut raw = [0.0f32; NUM_BUTTONS];
    let mut seen = [false; NUM_BUTTONS];
    for (name, &value) in &action.buttons {
        let button: Button = name.parse()?;
        if std::mem::replace(&mut seen[button.index()], true) {
            return Err(FgzError::DuplicateButton(name.clone()));
        }
        raw[button.index()] = value;
    }

    let max = raw
        .iter()
        .filter(|v| **v != 0.0)
        .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    if max == f32::NEG_INFINITY {
        return Ok(raw);
    }

    let mut out = [0.0f32; NUM_BUTTONS];
    let mut total = 0.0f32;
    for (slot, &v) in out.iter_mut().zip(raw.iter()) {
        if v != 0.0 {
            *slot = (v - max).exp();
            total += *slot;
        }
    }
    for slot in out.iter_mut() {
        *slot /= total;
    }
    Ok(out)
}

pub fn vectorize_camera(action: &Action, camera_scale: f32) -> [f32; 2] {
    [action.camera[0] / camera_scale, action.camera[1] / camera_scale]
}

pub fn vectorize_action(action: &Action, camera_scale: f32) -> Result<([f32; NUM_BUTTONS], [f32; 2])> {
    Ok((vectorize_buttons(action)?, vectorize_camera(action, camera_scale)))
}

/// Row-major stack of vectorized actions, ready to become `[n, _]` tensors
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBatch {
    pub buttons: Vec<f32>,
    pub camera: Vec<f32>,
    pub len: usize,
}

impl ActionBatch {
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let buttons = Tensor::<B, 1>::from_floats(self.buttons.as_slice(), device)
            .reshape([self.len, NUM_BUTTONS]);
        let camera =
            Tensor::<B, 1>::from_floats(self.camera.as_slice(), device).reshape([self.len, 2]);
        (buttons, camera)
    }
}

/// Vectorize a list of actions, preserving order
pub fn vectorize_actions(actions: &[Action], camera_scale: f32) -> Result<ActionBatch> {
    let mut buttons = Vec::with_capacity(actions.len() * NUM_BUTTONS);
    let mut camera = Vec::with_capacity(actions.len() * 2);
    for action in actions {
        let (b, c) = vectorize_action(action, camera_scale)?;
        buttons.extend_from_slice(&b);
        camera.extend_from_slice(&c);
    }
    Ok(ActionBatch {
        buttons,
        camera,
        len: actions.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectorization_is_deterministic() {
        let action = Action::new()
            .with_button("forward", 1.0)
            .with_button("jump", 1.0)
            .with_camera(12.5, -3.0);
        let a = vectorize_action(&action, DEFAULT_CAMERA_SCALE).unwrap();
        let b = vectorize_action(&action, DEFAULT_CAMERA_SCALE).unwrap();
        assert_eq!(a.0.map(f32::to_bits), b.0.map(f32::to_bits));
        assert_eq!(a.1.map(f32::to_bits), b.1.map(f32::to_bits));
    }

    #[test]
    fn test_softmax_over_active_buttons_only() {
        let action = Action::new()
            .with_button("FORWARD", 1.0)
            .with_button("JUMP", 1.0)
            .with_button("attack", 0.0);
        let buttons = vectorize_buttons(&action).unwrap();

        let forward = buttons[Button::Forward.index()];
        let jump = buttons[Button::Jump.index()];
        assert!((forward + jump - 1.0).abs() < 1e-6);
        assert!((forward - 0.5).abs() < 1e-6);

        for button in Button::ALL {
            if button != Button::Forward && button != Button::Jump {
                assert_eq!(buttons[button.index()], 0.0);
            }
        }
    }

    #[test]
    fn test_single_button_gets_full_mass() {
        let buttons = vectorize_buttons(&Action::new().with_button("attack", 1.0)).unwrap();
        assert_eq!(buttons[Button::Attack.index()], 1.0);
        assert_eq!(buttons.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn test_noop_is_all_zero() {
        let buttons = vectorize_buttons(&Action::new()).unwrap();
        assert!(buttons.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_camera_scaling() {
        let action = Action::new().with_camera(180.0, -90.0);
        assert_eq!(vectorize_camera(&action, 180.0), [1.0, -0.5]);

        // no clipping
        let action = Action::new().with_camera(360.0, 0.0);
        assert_eq!(vectorize_camera(&action, 180.0), [2.0, 0.0]);
    }

    #[test]
    fn test_unknown_button_fails() {
        let action = Action::new().with_button("jetpack", 1.0);
        let err = vectorize_buttons(&action).unwrap_err();
        assert!(matches!(err, FgzError::UnknownButton(_)));
    }

    #[test]
    fn test_button_given_twice_fails() {
        let action = Action::new()
            .with_button("forward", 0.0)
            .with_button("FORWARD", 1.0);
        let err = vectorize_buttons(&action).unwrap_err();
        assert!(matches!(err, FgzError::DuplicateButton(_)));

        let batch = vectorize_actions(&[Action::new(), action], DEFAULT_CAMERA_SCALE);
        assert!(matches!(batch, Err(FgzError::DuplicateButton(_))));
    }

    #[test]
    fn test_batch_preserves_order() {
        let actions = vec![
            Action::new().with_button("back", 1.0).with_camera(90.0, 0.0),
            Action::new().with_button("use", 1.0).with_camera(0.0, 45.0),
        ];
        let batch = vectorize_actions(&actions, DEFAULT_CAMERA_SCALE).unwrap();
        assert_eq!(batch.len, 2);
        assert_eq!(batch.buttons[Button::Back.index()], 1.0);
        assert_eq!(batch.buttons[NUM_BUTTONS + Button::Use.index()], 1.0);
        assert_eq!(batch.camera, vec![0.5, 0.0, 0.0, 0.25]);
    }
}
