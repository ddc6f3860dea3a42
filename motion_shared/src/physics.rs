//! Character physics.
//!
//! A small rigid-body stepper specialised for floating capsule characters.
//! Server and client run this exact module so that predicted and
//! authoritative trajectories follow the same movement model:
//!
//! - Horizontal velocity accelerates toward `intent.xz * move_speed`.
//! - A hover controller keeps the capsule floating above the ground.
//! - Jumps fire when the body is close enough to its hover height.
//! - The solver integrates at a fixed timestep with bounded sub-steps.
//!
//! Bodies live in an arena owned by [`PhysicsWorld`]; callers only ever hold
//! a [`BodyHandle`].

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::math::{Quat, Vec3};

/// Movement and solver parameters.
#[derive(Debug, Clone, Copy)]
pub struct PhysicsConfig {
    pub gravity: Vec3,
    /// Solver timestep in seconds.
    pub fixed_dt: f32,
    /// Maximum solver steps per `step_fixed` call.
    pub max_sub_steps: u32,
    pub capsule_radius: f32,
    /// Capsule height excluding the caps.
    pub capsule_height: f32,
    /// Top surface of the ground plane.
    pub ground_top: f32,
    /// Per-second velocity damping applied by the solver.
    pub linear_damping: f32,
    pub hover_height: f32,
    /// Hover force engages while `ground_distance` is below this.
    pub hover_band: f32,
    pub hover_strength: f32,
    /// Lower edge of the settle band, relative to hover height.
    pub settle_floor: f32,
    pub settle_damping: f32,
    pub horizontal_damping: f32,
    pub move_speed: f32,
    pub acceleration: f32,
    pub jump_speed: f32,
    /// Jumps are allowed while `ground_distance` is below this.
    pub jump_gate: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.82, 0.0),
            fixed_dt: 1.0 / 60.0,
            max_sub_steps: 3,
            capsule_radius: 0.4,
            capsule_height: 1.8,
            ground_top: 0.1,
            linear_damping: 0.1,
            hover_height: 1.5,
            hover_band: 0.5,
            hover_strength: 50.0,
            settle_floor: -0.1,
            settle_damping: 0.9,
            horizontal_damping: 0.9,
            move_speed: 10.0,
            acceleration: 50.0,
            jump_speed: 12.0,
            jump_gate: 0.3,
        }
    }
}

impl PhysicsConfig {
    /// Distance from the capsule center to its lowest point.
    pub fn capsule_half_extent(&self) -> f32 {
        self.capsule_height * 0.5 + self.capsule_radius
    }
}

/// Opaque handle to a body owned by a [`PhysicsWorld`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle(u32);

/// Readable/writable kinematic state of a body.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BodyState {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
}

/// Physics world holding capsule character bodies.
#[derive(Debug)]
pub struct PhysicsWorld {
    cfg: PhysicsConfig,
    bodies: HashMap<BodyHandle, BodyState>,
    next_handle: u32,
    accumulator: f32,
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new(PhysicsConfig::default())
    }
}

impl PhysicsWorld {
    pub fn new(cfg: PhysicsConfig) -> Self {
        Self {
            cfg,
            bodies: HashMap::new(),
            next_handle: 1,
            accumulator: 0.0,
        }
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.cfg
    }

    /// Creates an upright capsule body at rest at `spawn`.
    pub fn create_body(&mut self, spawn: Vec3) -> BodyHandle {
        let handle = BodyHandle(self.next_handle);
        self.next_handle += 1;
        self.bodies.insert(
            handle,
            BodyState {
                position: spawn,
                rotation: Quat::IDENTITY,
                velocity: Vec3::ZERO,
            },
        );
        handle
    }

    /// Removes a body. Returns false if the handle was unknown.
    pub fn remove_body(&mut self, handle: BodyHandle) -> bool {
        self.bodies.remove(&handle).is_some()
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn contains(&self, handle: BodyHandle) -> bool {
        self.bodies.contains_key(&handle)
    }

    pub fn read_state(&self, handle: BodyHandle) -> Option<BodyState> {
        self.bodies.get(&handle).copied()
    }

    /// Overwrites a body's state. Used for teleports and reconciliation.
    pub fn write_state(&mut self, handle: BodyHandle, state: BodyState) -> bool {
        match self.bodies.get_mut(&handle) {
            Some(body) => {
                *body = state;
                true
            }
            None => false,
        }
    }

    /// Height of the body above its hover height.
    pub fn ground_distance(&self, handle: BodyHandle) -> Option<f32> {
        self.bodies
            .get(&handle)
            .map(|b| b.position.y - self.cfg.hover_height)
    }

    /// Drives the body toward the requested movement intent.
    ///
    /// Horizontal components are clamped to `[-1, 1]`; a positive vertical
    /// component requests a jump. Returns true if a jump fired.
    pub fn apply_movement_intent(&mut self, handle: BodyHandle, intent: Vec3) -> bool {
        let cfg = self.cfg;
        let Some(body) = self.bodies.get_mut(&handle) else {
            return false;
        };
        let intent = sanitize_intent(intent);

        let target_x = intent.x * cfg.move_speed;
        let target_z = intent.z * cfg.move_speed;
        body.velocity.x += (target_x - body.velocity.x) * cfg.acceleration * cfg.fixed_dt;
        body.velocity.z += (target_z - body.velocity.z) * cfg.acceleration * cfg.fixed_dt;

        let ground_distance = body.position.y - cfg.hover_height;
        if intent.y > 0.0 && ground_distance < cfg.jump_gate {
            body.velocity.y = cfg.jump_speed;
            return true;
        }
        false
    }

    /// Advances the world by `real_dt` seconds of wall-clock time.
    ///
    /// Hover and damping run once per call for every body, then the solver
    /// takes up to `max_sub_steps` fixed steps. Returns the number of solver
    /// steps taken.
    pub fn step_fixed(&mut self, real_dt: f32) -> u32 {
        let cfg = self.cfg;
        for body in self.bodies.values_mut() {
            apply_hover_and_damping(&cfg, body);
        }

        if real_dt.is_finite() && real_dt > 0.0 {
            self.accumulator += real_dt;
        }

        let mut steps = 0;
        while self.accumulator >= cfg.fixed_dt && steps < cfg.max_sub_steps {
            for body in self.bodies.values_mut() {
                integrate(&cfg, body, cfg.fixed_dt);
            }
            self.accumulator -= cfg.fixed_dt;
            steps += 1;
        }
        // Time beyond the sub-step budget is dropped.
        if steps == cfg.max_sub_steps && self.accumulator >= cfg.fixed_dt {
            tracing::debug!(dropped_s = self.accumulator, "Physics fell behind");
            self.accumulator = 0.0;
        }
        steps
    }
}

/// Random spawn point above the ground near the origin.
pub fn random_spawn() -> Vec3 {
    let mut rng = rand::thread_rng();
    Vec3::new(rng.gen_range(-5.0..5.0), 2.5, rng.gen_range(-5.0..5.0))
}

fn sanitize_intent(intent: Vec3) -> Vec3 {
    let clean = |v: f32| if v.is_finite() { v } else { 0.0 };
    Vec3::new(
        clean(intent.x).clamp(-1.0, 1.0),
        clean(intent.y),
        clean(intent.z).clamp(-1.0, 1.0),
    )
}

fn apply_hover_and_damping(cfg: &PhysicsConfig, body: &mut BodyState) {
    let ground_distance = body.position.y - cfg.hover_height;

    if ground_distance < cfg.hover_band {
        let force = (cfg.hover_band - ground_distance) * cfg.hover_strength;
        body.velocity.y += force * cfg.fixed_dt;
    }

    if ground_distance >= cfg.settle_floor && ground_distance <= cfg.hover_band {
        body.velocity.y *= cfg.settle_damping;
    }

    body.velocity.x *= cfg.horizontal_damping;
    body.velocity.z *= cfg.horizontal_damping;
}

fn integrate(cfg: &PhysicsConfig, body: &mut BodyState, dt: f32) {
    body.velocity += cfg.gravity * dt;
    body.velocity = body.velocity * (1.0 - cfg.linear_damping).powf(dt);
    body.position += body.velocity * dt;

    // Ground contact. Rotation is locked, so only the vertical axis resolves.
    let rest_y = cfg.ground_top + cfg.capsule_half_extent();
    if body.position.y < rest_y {
        body.position.y = rest_y;
        if body.velocity.y < 0.0 {
            body.velocity.y = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 60.0;

    fn world_with_body(y: f32) -> (PhysicsWorld, BodyHandle) {
        let mut world = PhysicsWorld::default();
        let h = world.create_body(Vec3::new(0.0, y, 0.0));
        (world, h)
    }

    #[test]
    fn create_and_remove_body() {
        let mut world = PhysicsWorld::default();
        let a = world.create_body(Vec3::new(1.0, 2.0, 3.0));
        let b = world.create_body(Vec3::ZERO);
        assert_ne!(a, b);
        assert_eq!(world.body_count(), 2);
        assert_eq!(world.read_state(a).unwrap().position, Vec3::new(1.0, 2.0, 3.0));

        assert_eq!(world.ground_distance(a), Some(0.5));

        assert!(world.remove_body(a));
        assert!(!world.remove_body(a));
        assert!(world.read_state(a).is_none());
        assert!(world.ground_distance(a).is_none());
        assert_eq!(world.body_count(), 1);
    }

    #[test]
    fn horizontal_intent_accelerates_instead_of_snapping() {
        let (mut world, h) = world_with_body(5.0);
        world.apply_movement_intent(h, Vec3::new(1.0, 0.0, 0.0));
        let v = world.read_state(h).unwrap().velocity;
        let expected = 10.0 * 50.0 * DT;
        assert!((v.x - expected).abs() < 1e-4);
        assert!(v.x < 10.0);
        assert_eq!(v.z, 0.0);
    }

    #[test]
    fn intent_is_clamped() {
        let (mut world, h) = world_with_body(5.0);
        world.apply_movement_intent(h, Vec3::new(5.0, 0.0, f32::NAN));
        let v = world.read_state(h).unwrap().velocity;
        assert!((v.x - 10.0 * 50.0 * DT).abs() < 1e-4);
        assert_eq!(v.z, 0.0);
    }

    #[test]
    fn jump_fires_only_near_hover_height() {
        let (mut world, h) = world_with_body(1.5);
        assert!(world.apply_movement_intent(h, Vec3::new(0.0, 1.0, 0.0)));
        assert_eq!(world.read_state(h).unwrap().velocity.y, 12.0);

        let (mut world, h) = world_with_body(3.0);
        assert!(!world.apply_movement_intent(h, Vec3::new(0.0, 1.0, 0.0)));
        assert_eq!(world.read_state(h).unwrap().velocity.y, 0.0);
    }

    #[test]
    fn hover_pushes_up_when_low() {
        let (mut world, h) = world_with_body(1.45);
        world.step_fixed(0.0);
        // No solver step, only hover: (0.5 + 0.05) * 50 * dt, then settle damping.
        let vy = world.read_state(h).unwrap().velocity.y;
        let expected = 0.55 * 50.0 * DT * 0.9;
        assert!((vy - expected).abs() < 1e-5);
    }

    #[test]
    fn horizontal_velocity_decays_without_input() {
        let (mut world, h) = world_with_body(5.0);
        let mut state = world.read_state(h).unwrap();
        state.velocity.x = 10.0;
        world.write_state(h, state);

        let mut last = 10.0;
        for _ in 0..30 {
            world.step_fixed(DT);
            let vx = world.read_state(h).unwrap().velocity.x;
            assert!(vx < last);
            last = vx;
        }
        assert!(last < 0.5);
    }

    #[test]
    fn body_settles_near_hover_height() {
        let (mut world, h) = world_with_body(2.5);
        for _ in 0..600 {
            world.step_fixed(DT);
        }
        let s = world.read_state(h).unwrap();
        let above = world.ground_distance(h).unwrap();
        assert!(above > -0.1 && above < 0.8, "ground distance = {above}");
        assert!(s.velocity.y.abs() < 0.5, "vy = {}", s.velocity.y);
    }

    #[test]
    fn step_caps_sub_steps() {
        let mut world = PhysicsWorld::default();
        assert_eq!(world.step_fixed(1.0), 3);
        assert_eq!(world.step_fixed(DT), 1);
        assert_eq!(world.step_fixed(0.005), 0);
        assert_eq!(world.step_fixed(0.012), 1);
    }

    #[test]
    fn ground_is_solid() {
        let (mut world, h) = world_with_body(1.4);
        let mut state = world.read_state(h).unwrap();
        state.velocity.y = -50.0;
        world.write_state(h, state);
        world.step_fixed(DT);
        let s = world.read_state(h).unwrap();
        assert!(s.position.y >= 1.4 - 1e-5);
    }

    #[test]
    fn random_spawn_in_range() {
        for _ in 0..32 {
            let p = random_spawn();
            assert!((-5.0..5.0).contains(&p.x));
            assert!((-5.0..5.0).contains(&p.z));
            assert_eq!(p.y, 2.5);
        }
    }
}
