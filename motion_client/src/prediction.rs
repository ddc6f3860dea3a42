//! Client-side prediction and reconciliation.
//!
//! The local body is simulated with the same movement model the server
//! runs. Every sent input is kept in a bounded history keyed by its frame
//! id (the input's sequence number). When a snapshot arrives that is newer
//! than the last one processed, the local body is compared against the
//! server's state for the local player:
//! - within [`CORRECTION_THRESHOLD`] nothing changes
//! - beyond it position and velocity move [`CORRECTION_FACTOR`] of the way
//!   to the server values and rotation is taken as-is
//!
//! Either way the history is pruned to inputs newer than the snapshot.

use std::collections::VecDeque;

use motion_shared::{
    physics::{BodyHandle, PhysicsWorld},
    protocol::{InputCommand, PlayerState},
};
use tracing::debug;

pub const MAX_HISTORY: usize = 120;
pub const CORRECTION_THRESHOLD: f32 = 0.1;
pub const CORRECTION_FACTOR: f32 = 0.1;

/// A sent input and the frame id it is tracked under.
#[derive(Debug, Clone, PartialEq)]
pub struct InputHistoryEntry {
    pub input: InputCommand,
    pub frame_id: u64,
}

/// Unacknowledged inputs, oldest first.
#[derive(Debug, Default)]
pub struct InputHistory {
    entries: VecDeque<InputHistoryEntry>,
}

impl InputHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, input: InputCommand) {
        let frame_id = u64::from(input.sequence_number);
        self.entries.push_back(InputHistoryEntry { input, frame_id });
        while self.entries.len() > MAX_HISTORY {
            self.entries.pop_front();
        }
    }

    /// Drops every entry with `frame_id <= acked`.
    pub fn prune_through(&mut self, acked: u64) {
        self.entries.retain(|e| e.frame_id > acked);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputHistoryEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// The snapshot was not newer than the last one processed.
    Stale,
    WithinTolerance { error: f32 },
    Blended { error: f32 },
}

#[derive(Debug, Default)]
pub struct Reconciler {
    last_frame: Option<u64>,
    history: InputHistory,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, input: InputCommand) {
        self.history.push(input);
    }

    pub fn history(&self) -> &InputHistory {
        &self.history
    }

    pub fn last_processed_frame(&self) -> Option<u64> {
        self.last_frame
    }

    pub fn reset(&mut self) {
        self.last_frame = None;
        self.history.clear();
    }

    /// Corrects `body` toward `server`, the authoritative state of the
    /// local player at `frame_id`.
    pub fn reconcile(
        &mut self,
        frame_id: u64,
        physics: &mut PhysicsWorld,
        body: BodyHandle,
        server: &PlayerState,
    ) -> Correction {
        if self.last_frame.is_some_and(|last| frame_id <= last) {
            return Correction::Stale;
        }
        self.last_frame = Some(frame_id);

        let correction = match physics.read_state(body) {
            Some(mut local) => {
                let target = server.transform.position;
                let error = local.position.distance(target);
                if error > CORRECTION_THRESHOLD {
                    local.position = local.position + (target - local.position) * CORRECTION_FACTOR;
                    local.velocity =
                        local.velocity + (server.velocity - local.velocity) * CORRECTION_FACTOR;
                    local.rotation = server.transform.rotation.normalize();
                    physics.write_state(body, local);
                    debug!(frame_id, error, "Reconciled local player");
                    Correction::Blended { error }
                } else {
                    Correction::WithinTolerance { error }
                }
            }
            None => Correction::WithinTolerance { error: 0.0 },
        };

        self.history.prune_through(frame_id);
        correction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use motion_shared::{
        math::{Quat, Transform, Vec3},
        protocol::PlayerId,
    };

    fn input(seq: u32) -> InputCommand {
        InputCommand {
            sequence_number: seq,
            ..Default::default()
        }
    }

    fn server_state(position: Vec3, velocity: Vec3, rotation: Quat) -> PlayerState {
        PlayerState {
            id: PlayerId::from("me"),
            name: "me".into(),
            transform: Transform::new(position, rotation),
            velocity,
            input: InputCommand::default(),
        }
    }

    #[test]
    fn history_is_bounded_oldest_first() {
        let mut history = InputHistory::new();
        for seq in 1..=130 {
            history.push(input(seq));
        }
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.iter().next().unwrap().frame_id, 11);
    }

    #[test]
    fn small_error_is_a_no_op() {
        let mut physics = PhysicsWorld::default();
        let body = physics.create_body(Vec3::new(0.0, 2.0, 0.0));
        let before = physics.read_state(body).unwrap();

        let mut rec = Reconciler::new();
        let server = server_state(Vec3::new(0.05, 2.0, 0.0), Vec3::new(3.0, 0.0, 0.0), Quat::from_yaw(1.0));
        let out = rec.reconcile(1, &mut physics, body, &server);

        assert!(matches!(out, Correction::WithinTolerance { .. }));
        assert_eq!(physics.read_state(body).unwrap(), before);
    }

    #[test]
    fn large_error_blends_and_shrinks() {
        let mut physics = PhysicsWorld::default();
        let body = physics.create_body(Vec3::new(0.0, 2.0, 0.0));
        let mut rec = Reconciler::new();
        let target = Vec3::new(5.0, 2.0, 0.0);
        let rotation = Quat::from_yaw(0.7);
        let server = server_state(target, Vec3::new(1.0, 0.0, 0.0), rotation);

        let mut last_error = f32::MAX;
        for frame in 1..=5 {
            match rec.reconcile(frame, &mut physics, body, &server) {
                Correction::Blended { error } => {
                    assert!(error < last_error);
                    last_error = error;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let state = physics.read_state(body).unwrap();
        assert!((state.position.x - 5.0 * (1.0 - 0.9f32.powi(5))).abs() < 1e-4);
        assert!(state.rotation.dot(rotation) > 0.99999);
        assert!(state.velocity.x > 0.0);
    }

    #[test]
    fn stale_frames_are_ignored() {
        let mut physics = PhysicsWorld::default();
        let body = physics.create_body(Vec3::ZERO);
        let mut rec = Reconciler::new();
        let server = server_state(Vec3::new(9.0, 0.0, 0.0), Vec3::ZERO, Quat::IDENTITY);

        assert!(matches!(rec.reconcile(7, &mut physics, body, &server), Correction::Blended { .. }));
        assert_eq!(rec.reconcile(7, &mut physics, body, &server), Correction::Stale);
        assert_eq!(rec.reconcile(3, &mut physics, body, &server), Correction::Stale);
        assert_eq!(rec.last_processed_frame(), Some(7));
    }

    #[test]
    fn ack_prunes_inputs_through_its_frame() {
        let mut physics = PhysicsWorld::default();
        let body = physics.create_body(Vec3::ZERO);
        let mut rec = Reconciler::new();
        for seq in 1..=50 {
            rec.record(input(seq));
        }
        let server = server_state(Vec3::ZERO, Vec3::ZERO, Quat::IDENTITY);
        rec.reconcile(42, &mut physics, body, &server);

        let left: Vec<u64> = rec.history().iter().map(|e| e.frame_id).collect();
        assert_eq!(left, (43..=50).collect::<Vec<u64>>());
    }
}
