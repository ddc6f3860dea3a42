//! Interpolation.
//!
//! The server sends discrete snapshots at tick boundaries. The client
//! renders at its own rate and eases every non-local entity toward the
//! most recent snapshot. A new snapshot replaces the target outright; the
//! displayed transform keeps moving from wherever it currently is.

use motion_shared::math::{Quat, Transform, Vec3};

/// Fraction of the remaining distance covered per 60 Hz frame.
pub const INTERP_RATE: f32 = 0.1;
/// Below this distance the position snaps onto the target.
pub const SNAP_DISTANCE: f32 = 0.01;

/// Blend factor for a frame of `dt` seconds. A non-finite `dt` does not
/// move anything.
pub fn blend_factor(dt: f32) -> f32 {
    if !dt.is_finite() {
        return 0.0;
    }
    (INTERP_RATE * dt * 60.0).clamp(0.0, 1.0)
}

/// Where a remote entity is heading.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolationTarget {
    pub position: Vec3,
    pub rotation: Quat,
    /// Accumulated blend in `[0, 1]`.
    pub progress: f32,
    pub time_since_update: f32,
}

impl InterpolationTarget {
    pub fn new(target: &Transform) -> Self {
        Self {
            position: target.position,
            rotation: target.rotation.normalize(),
            progress: 0.0,
            time_since_update: 0.0,
        }
    }

    pub fn retarget(&mut self, target: &Transform) {
        *self = Self::new(target);
    }

    /// Moves `current` one frame toward the target.
    pub fn advance(&mut self, current: &mut Transform, dt: f32) {
        self.time_since_update += dt.max(0.0);
        let t = blend_factor(dt);

        if current.position.distance(self.position) > SNAP_DISTANCE {
            current.position = current.position.lerp(self.position, t);
        } else {
            current.position = self.position;
        }
        current.rotation = current.rotation.nlerp(self.rotation, t);
        self.progress = (self.progress + t).min(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 60.0;

    #[test]
    fn distance_shrinks_then_snaps() {
        let mut current = Transform::from_position(Vec3::ZERO);
        let mut target = InterpolationTarget::new(&Transform::from_position(Vec3::new(1.0, 0.0, 0.0)));

        let mut last = f32::MAX;
        let mut frames = 0;
        while current.position != target.position {
            let d = current.position.distance(target.position);
            assert!(d < last);
            last = d;
            target.advance(&mut current, DT);
            frames += 1;
            assert!(frames < 200, "never converged");
        }
        // Converges geometrically at 10% per frame until the snap.
        assert!(frames > 30);
        assert_eq!(target.progress, 1.0);
    }

    #[test]
    fn large_dt_jumps_straight_to_target() {
        let mut current = Transform::from_position(Vec3::ZERO);
        let mut target = InterpolationTarget::new(&Transform::from_position(Vec3::new(0.0, 0.0, 4.0)));
        target.advance(&mut current, 1.0);
        assert_eq!(current.position, Vec3::new(0.0, 0.0, 4.0));
        assert_eq!(target.progress, 1.0);
    }

    #[test]
    fn rotation_stays_unit_length() {
        let mut current = Transform::default();
        let goal = Transform::new(Vec3::ZERO, Quat::from_yaw(3.0));
        let mut target = InterpolationTarget::new(&goal);
        for _ in 0..120 {
            target.advance(&mut current, DT);
            assert!((current.rotation.len() - 1.0).abs() < 1e-5);
        }
        assert!(current.rotation.dot(goal.rotation).abs() > 0.999);
    }

    #[test]
    fn non_finite_dt_leaves_transform_untouched() {
        assert_eq!(blend_factor(f32::NAN), 0.0);
        assert_eq!(blend_factor(f32::INFINITY), 0.0);

        let start = Transform::new(Vec3::new(1.0, 2.0, 3.0), Quat::from_yaw(0.5));
        let mut current = start;
        let mut target = InterpolationTarget::new(&Transform::new(
            Vec3::new(-4.0, 2.0, 0.0),
            Quat::from_yaw(2.0),
        ));
        target.advance(&mut current, f32::NAN);
        assert_eq!(current.position, start.position);
        assert!(current.rotation.dot(start.rotation) > 0.99999);
        assert_eq!(target.progress, 0.0);
        assert!(target.time_since_update.is_finite());
    }

    #[test]
    fn retarget_resets_progress() {
        let mut current = Transform::default();
        let mut target = InterpolationTarget::new(&Transform::from_position(Vec3::new(1.0, 0.0, 0.0)));
        target.advance(&mut current, DT);
        target.advance(&mut current, DT);
        assert!(target.progress > 0.0);
        assert!(target.time_since_update > 0.0);

        target.retarget(&Transform::from_position(Vec3::new(-1.0, 0.0, 0.0)));
        assert_eq!(target.progress, 0.0);
        assert_eq!(target.time_since_update, 0.0);
        assert_eq!(target.position, Vec3::new(-1.0, 0.0, 0.0));
    }
}
