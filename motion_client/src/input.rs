//! Input handling.
//!
//! Windowing and raw key events live outside the core. The embedding
//! application hands over the currently held keys as an [`InputState`] and
//! the [`InputSequencer`] turns them into sequenced `InputCommand`s.

use motion_shared::{
    math::{Quat, Vec3},
    protocol::{timestamp_ms, Actions, InputCommand},
};

/// Keys held at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub jump: bool,
    pub fire: bool,
    pub sprint: bool,
}

impl InputState {
    /// True while any movement key or jump is held.
    pub fn is_active(self) -> bool {
        self.forward || self.back || self.left || self.right || self.jump
    }

    /// Movement intent: unit-length horizontal direction (forward is -z)
    /// and `y = 1` while jumping.
    pub fn movement(self) -> Vec3 {
        let mut v = Vec3::ZERO;
        if self.forward {
            v.z -= 1.0;
        }
        if self.back {
            v.z += 1.0;
        }
        if self.left {
            v.x -= 1.0;
        }
        if self.right {
            v.x += 1.0;
        }

        let len = v.horizontal_len();
        if len > 0.0 {
            v.x /= len;
            v.z /= len;
        }
        if self.jump {
            v.y = 1.0;
        }
        v
    }

    pub fn actions(self) -> Actions {
        let mut actions = Actions::empty();
        actions.set(Actions::FIRE, self.fire);
        actions.set(Actions::SPRINT, self.sprint);
        actions
    }
}

/// Issues input commands with per-connection sequence numbers starting at 1.
#[derive(Debug)]
pub struct InputSequencer {
    next: u32,
}

impl Default for InputSequencer {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl InputSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, state: InputState, rotation: Quat) -> InputCommand {
        let sequence_number = self.next;
        self.next = self.next.wrapping_add(1);
        InputCommand {
            movement: state.movement(),
            rotation,
            actions: state.actions(),
            timestamp: timestamp_ms(),
            sequence_number,
        }
    }

    /// Sequence number of the most recent command, 0 before the first.
    pub fn last_issued(&self) -> u32 {
        self.next.wrapping_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagonal_movement_is_normalized() {
        let state = InputState {
            forward: true,
            right: true,
            ..Default::default()
        };
        let m = state.movement();
        assert!((m.horizontal_len() - 1.0).abs() < 1e-6);
        assert!(m.x > 0.0 && m.z < 0.0);
        assert_eq!(m.y, 0.0);
    }

    #[test]
    fn opposite_keys_cancel() {
        let state = InputState {
            forward: true,
            back: true,
            ..Default::default()
        };
        assert_eq!(state.movement(), Vec3::ZERO);
        assert!(state.is_active());
    }

    #[test]
    fn jump_sets_vertical_intent() {
        let state = InputState {
            jump: true,
            ..Default::default()
        };
        assert_eq!(state.movement(), Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn fire_alone_is_not_movement() {
        let state = InputState {
            fire: true,
            ..Default::default()
        };
        assert!(!state.is_active());
        assert!(state.actions().contains(Actions::FIRE));
    }

    #[test]
    fn sequence_numbers_start_at_one() {
        let mut seq = InputSequencer::new();
        assert_eq!(seq.last_issued(), 0);
        let a = seq.sample(InputState::default(), Quat::IDENTITY);
        let b = seq.sample(InputState::default(), Quat::IDENTITY);
        assert_eq!(a.sequence_number, 1);
        assert_eq!(b.sequence_number, 2);
        assert_eq!(seq.last_issued(), 2);
    }
}
