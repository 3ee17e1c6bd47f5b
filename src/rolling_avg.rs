use crate::circular_queue::CircularQueue;
use nalgebra as na;

/// Rolling mean over the last `window` instantaneous velocities of a target.
#[derive(Debug, Clone)]
pub struct RollingAvg {
    history: CircularQueue<na::Vector2<f32>>,
}

impl RollingAvg {
    pub fn new(window: usize) -> Self {
        Self {
            history: CircularQueue::with_capacity(window),
        }
    }

    /// Records `vel` and returns the mean of the window including it.
    pub fn push(&mut self, vel: na::Vector2<f32>) -> na::Vector2<f32> {
        self.history.push(vel);

        self.mean().unwrap_or(vel)
    }

    pub fn mean(&self) -> Option<na::Vector2<f32>> {
        if self.history.is_empty() {
            return None;
        }

        let sum = self
            .history
            .iter()
            .fold(na::Vector2::zeros(), |acc: na::Vector2<f32>, v| acc + v);

        Some(sum / self.history.len() as f32)
    }
}
