use nalgebra as na;
use num_traits::{Float, FloatConst};

pub fn gauss<F: Float>(x: F, c: F) -> F {
    let two = F::one() + F::one();

    (-((x * x) / (two * c * c))).exp()
}

/// Wraps an angle into `(-pi, pi]`.
pub fn ang_norm_pi_sig<F: Float + FloatConst>(angle: F) -> F {
    let two_pi = F::PI() + F::PI();
    let mut a = angle % two_pi;

    if a > F::PI() {
        a = a - two_pi;
    } else if a <= -F::PI() {
        a = a + two_pi;
    }

    a
}

#[inline]
pub fn estimated_position(
    from: na::Point2<f32>,
    velocity: na::Vector2<f32>,
    dt: f32,
) -> na::Point2<f32> {
    from + velocity * dt
}

#[inline]
pub fn is_target_near(a: na::Point2<f32>, b: na::Point2<f32>, threshold: f32) -> bool {
    na::distance(&a, &b) < threshold
}

#[inline]
pub fn clamp_velocity(v: na::Vector2<f32>, limit: f32) -> na::Vector2<f32> {
    na::Vector2::new(v.x.clamp(-limit, limit), v.y.clamp(-limit, limit))
}

#[inline]
pub fn within_velocity(v: &na::Vector2<f32>, limit: f32) -> bool {
    v.x.abs() <= limit && v.y.abs() <= limit
}

/// Coarse heading of a velocity or displacement, one of eight compass
/// sectors or `Still` when both components vanish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Still,
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    pub fn of(v: &na::Vector2<f32>) -> Self {
        let sx = signum(v.x);
        let sy = signum(v.y);

        match (sx, sy) {
            (0, 0) => Direction::Still,
            (0, 1) => Direction::North,
            (1, 1) => Direction::NorthEast,
            (1, 0) => Direction::East,
            (1, -1) => Direction::SouthEast,
            (0, -1) => Direction::South,
            (-1, -1) => Direction::SouthWest,
            (-1, 0) => Direction::West,
            _ => Direction::NorthWest,
        }
    }
}

#[inline]
fn signum(x: f32) -> i8 {
    if x.abs() < f32::EPSILON {
        0
    } else if x > 0.0 {
        1
    } else {
        -1
    }
}

#[inline]
pub fn round_n(x: f32, n: i32) -> f32 {
    let p = 10f32.powi(n);

    (x * p).round() / p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angle_normalization_wraps_into_half_open_range() {
        let pi = std::f32::consts::PI;

        assert!((ang_norm_pi_sig(3.5 * pi) + pi / 2.0).abs() < 1e-5);
        assert!((ang_norm_pi_sig(-pi / 2.0) + pi / 2.0).abs() < 1e-6);
        assert!((ang_norm_pi_sig(2.5 * pi) - pi / 2.0).abs() < 1e-5);
    }

    #[test]
    fn gauss_peaks_at_zero() {
        assert!((gauss(0.0f32, 1.0) - 1.0).abs() < f32::EPSILON);
        assert!(gauss(3.0f32, 1.0) < 0.02);
    }

    #[test]
    fn direction_sectors() {
        assert_eq!(Direction::of(&na::Vector2::new(0.0, 0.0)), Direction::Still);
        assert_eq!(Direction::of(&na::Vector2::new(1.0, -1.0)), Direction::SouthEast);
        assert_eq!(Direction::of(&na::Vector2::new(-0.3, 0.0)), Direction::West);
    }
}
