//! Pointer motion to splat requests.
//!
//! Pointer events may be delivered on a different thread than the one
//! stepping the solver, so pending requests live behind a mutex and are
//! drained in arrival order at the start of every step.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::grid::SurfaceSize;

/// Pixel delta to velocity impulse gain.
pub const IMPULSE_GAIN: f32 = 5.0;
/// Single-pole low-pass factor applied per sample.
pub const ACTIVITY_SMOOTHING: f32 = 0.15;
/// Pointer speed (px/s) at which the activity target saturates.
pub const FULL_ACTIVITY_SPEED: f32 = 1500.0;
const MIN_ELAPSED_MS: f32 = 1.0;
const MIN_DYE_INTENSITY: f32 = 1.0;
const MAX_DYE_INTENSITY: f32 = 6.0;

/// One pointer movement in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerMotion {
    /// Pointer position after the move, y pointing down.
    pub position: [f32; 2],
    pub delta: [f32; 2],
    pub elapsed_ms: f32,
}

impl PointerMotion {
    /// Speed in pixels per second.
    pub fn speed(&self) -> f32 {
        let elapsed_ms = if self.elapsed_ms > 0.0 {
            self.elapsed_ms
        } else {
            MIN_ELAPSED_MS
        };
        self.delta[0].hypot(self.delta[1]) / (elapsed_ms / 1000.0)
    }

    pub fn is_stationary(&self) -> bool {
        self.delta[0] == 0.0 && self.delta[1] == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatRequest {
    /// Normalized grid coordinates, y up.
    pub position: [f32; 2],
    pub impulse: [f32; 2],
}

impl SplatRequest {
    pub fn from_motion(motion: &PointerMotion, surface: SurfaceSize) -> Self {
        let x = motion.position[0] / surface.width as f32;
        let y = 1.0 - motion.position[1] / surface.height as f32;
        Self {
            position: [x.clamp(0.0, 1.0), y.clamp(0.0, 1.0)],
            impulse: [motion.delta[0] * IMPULSE_GAIN, -motion.delta[1] * IMPULSE_GAIN],
        }
    }

    pub fn velocity_payload(&self) -> [f32; 4] {
        [self.impulse[0], self.impulse[1], 0.0, 0.0]
    }

    /// Dye payload, scaled by the smoothed activity at apply time.
    pub fn dye_payload(&self, activity: f32) -> [f32; 4] {
        let magnitude = self.impulse[0].hypot(self.impulse[1]);
        let intensity = magnitude.clamp(MIN_DYE_INTENSITY, MAX_DYE_INTENSITY) * activity;
        [intensity; 4]
    }
}

/// Clamped linear ramp from pointer speed to activity.
pub fn activity_target(speed: f32) -> f32 {
    if !speed.is_finite() {
        return if speed > 0.0 { 1.0 } else { 0.0 };
    }
    (speed / FULL_ACTIVITY_SPEED).clamp(0.0, 1.0)
}

fn smooth_activity(current: f32, target: f32) -> f32 {
    (current + (target - current) * ACTIVITY_SMOOTHING).clamp(0.0, 1.0)
}

#[derive(Debug, Default)]
struct InjectorState {
    pending: VecDeque<SplatRequest>,
    activity: f32,
    samples_since_drain: usize,
}

/// Requests drained for one frame plus the activity they are applied with.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedSplats {
    pub requests: Vec<SplatRequest>,
    pub activity: f32,
}

/// Shared pending-splat queue. Clones refer to the same queue.
#[derive(Debug, Clone, Default)]
pub struct SplatQueue {
    inner: Arc<Mutex<InjectorState>>,
}

impl SplatQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InjectorState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Updates the activity filter and queues a splat for a moving pointer.
    /// Returns the queued request, if any.
    pub fn enqueue(&self, motion: PointerMotion, surface: SurfaceSize) -> Option<SplatRequest> {
        let mut state = self.lock();
        state.activity = smooth_activity(state.activity, activity_target(motion.speed()));
        state.samples_since_drain += 1;

        if motion.is_stationary() {
            return None;
        }
        let request = SplatRequest::from_motion(&motion, surface);
        state.pending.push_back(request);
        Some(request)
    }

    /// Queues a request directly, bypassing the activity filter.
    pub fn push(&self, request: SplatRequest) {
        self.lock().pending.push_back(request);
    }

    pub fn activity(&self) -> f32 {
        self.lock().activity
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Takes every pending request in arrival order. A frame without any
    /// pointer sample counts as one idle sample for the activity filter.
    pub fn drain(&self) -> DrainedSplats {
        let mut state = self.lock();
        if state.samples_since_drain == 0 {
            state.activity = smooth_activity(state.activity, 0.0);
        }
        state.samples_since_drain = 0;
        DrainedSplats {
            requests: state.pending.drain(..).collect(),
            activity: state.activity,
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.activity = 0.0;
        state.samples_since_drain = 0;
    }
}

/// Turns absolute pointer samples into motion samples.
#[derive(Debug, Default, Clone)]
pub struct PointerTracker {
    last: Option<([f32; 2], f64)>,
}

impl PointerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first sample only primes the tracker.
    pub fn sample(&mut self, client_x: f32, client_y: f32, timestamp_ms: f64) -> Option<PointerMotion> {
        let position = [client_x, client_y];
        let previous = self.last.replace((position, timestamp_ms));
        let (last_position, last_time) = previous?;
        Some(PointerMotion {
            position,
            delta: [client_x - last_position[0], client_y - last_position[1]],
            elapsed_ms: (timestamp_ms - last_time) as f32,
        })
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
