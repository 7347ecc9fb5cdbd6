//! Uniform sampling over the MineRL-shaped action space

use rand::Rng;

use super::{Action, Button};

#[derive(Debug, Clone)]
pub struct ActionSpace {
    /// Camera deltas are drawn from `[-camera_limit, camera_limit]`
    pub camera_limit: f32,
    /// Whether ESC may be pressed by sampled actions
    pub sample_escape: bool,
}

impl Default for ActionSpace {
    fn default() -> Self {
        Self {
            camera_limit: 180.0,
            sample_escape: false,
        }
    }
}

impl ActionSpace {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        let mut action = Action::new();
        for button in Button::ALL {
            let pressed = if button == Button::Esc && !self.sample_escape {
                false
            } else {
                rng.random_bool(0.5)
            };
            action
                .buttons
                .insert(button.name().to_string(), if pressed { 1.0 } else { 0.0 });
        }
        action.camera = [
            rng.random_range(-self.camera_limit..=self.camera_limit),
            rng.random_range(-self.camera_limit..=self.camera_limit),
        ];
        action
    }

    pub fn sample_n<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<Action> {
        (0..n).map(|_| self.sample(rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::vectorize_buttons;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_samples_are_valid_actions() {
        let space = ActionSpace::default();
        let mut rng = StdRng::seed_from_u64(7);
        for action in space.sample_n(&mut rng, 64) {
            assert!(vectorize_buttons(&action).is_ok());
            assert_eq!(action.button(Button::Esc), 0.0);
            assert!(action.camera.iter().all(|c| c.abs() <= 180.0));
        }
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let space = ActionSpace::default();
        let a = space.sample_n(&mut StdRng::seed_from_u64(3), 8);
        let b = space.sample_n(&mut StdRng::seed_from_u64(3), 8);
        assert_eq!(a, b);
    }
}
