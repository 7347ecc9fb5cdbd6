//! Known buttons of the MineRL action space, in canonical vector order

use std::fmt;
use std::str::FromStr;

use crate::error::FgzError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Button {
    Attack,
    Back,
    Forward,
    Jump,
    Left,
    Right,
    Sneak,
    Sprint,
    Use,
    Drop,
    Inventory,
    Hotbar1,
    Hotbar2,
    Hotbar3,
    Hotbar4,
    Hotbar5,
    Hotbar6,
    Hotbar7,
    Hotbar8,
    Hotbar9,
    Esc,
}

/// Number of entries in a button vector
pub const NUM_BUTTONS: usize = Button::ALL.len();

impl Button {
    /// Canonical order used by the button vector
    pub const ALL: [Button; 21] = [
        Button::Attack,
        Button::Back,
        Button::Forward,
        Button::Jump,
        Button::Left,
        Button::Right,
        Button::Sneak,
        Button::Sprint,
        Button::Use,
        Button::Drop,
        Button::Inventory,
        Button::Hotbar1,
        Button::Hotbar2,
        Button::Hotbar3,
        Button::Hotbar4,
        Button::Hotbar5,
        Button::Hotbar6,
        Button::Hotbar7,
        Button::Hotbar8,
        Button::Hotbar9,
        Button::Esc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Button::Attack => "attack",
            Button::Back => "back",
            Button::Forward => "forward",
            Button::Jump => "jump",
            Button::Left => "left",
            Button::Right => "right",
            Button::Sneak => "sneak",
            Button::Sprint => "sprint",
            Button::Use => "use",
            Button::Drop => "drop",
            Button::Inventory => "inventory",
            Button::Hotbar1 => "hotbar.1",
            Button::Hotbar2 => "hotbar.2",
            Button::Hotbar3 => "hotbar.3",
            Button::Hotbar4 => "hotbar.4",
            Button::Hotbar5 => "hotbar.5",
            Button::Hotbar6 => "hotbar.6",
            Button::Hotbar7 => "hotbar.7",
            Button::Hotbar8 => "hotbar.8",
            Button::Hotbar9 => "hotbar.9",
            Button::Esc => "ESC",
        }
    }

    /// Position of this button in the button vector
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Button {
    type Err = FgzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Button::ALL
            .iter()
            .find(|button| button.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| FgzError::UnknownButton(s.to_string()))
    }
}
