use crate::math;
use nalgebra as na;
use rand::Rng;
use rand_distr::StandardNormal;
use serde_derive::{Deserialize, Serialize};

/// 2D pose: position plus heading in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

impl Pose {
    #[inline]
    pub fn new(x: f32, y: f32, theta: f32) -> Self {
        Self { x, y, theta }
    }

    #[inline]
    pub fn from_point(p: na::Point2<f32>) -> Self {
        Self::new(p.x, p.y, 0.0)
    }

    #[inline]
    pub fn point(&self) -> na::Point2<f32> {
        na::Point2::new(self.x, self.y)
    }

    /// Distance of the position from the origin.
    #[inline]
    pub fn norm(&self) -> f32 {
        self.point().coords.norm()
    }

    /// Converts a point expressed in this pose's frame into the global frame.
    pub fn relative_to_global(&self, p: na::Point2<f32>) -> na::Point2<f32> {
        let rot = na::Rotation2::new(self.theta);

        self.point() + rot * p.coords
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseParticle {
    pub pose: Pose,
    pub weight: f32,
}

impl PoseParticle {
    #[inline]
    pub fn new(pose: Pose, weight: f32) -> Self {
        Self { pose, weight }
    }

    #[inline]
    pub fn point(&self) -> na::Point2<f32> {
        self.pose.point()
    }
}

impl Default for PoseParticle {
    fn default() -> Self {
        Self::new(Pose::default(), 0.0)
    }
}

/// A group of particles believed to represent one target, with its centroid.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub particles: Vec<PoseParticle>,
    pub centroid: Pose,
}

impl Cluster {
    pub fn new(particles: Vec<PoseParticle>) -> Self {
        let centroid = centroid(&particles);

        Self {
            particles,
            centroid,
        }
    }
}

#[inline]
pub fn gaussian<R: Rng + ?Sized>(rng: &mut R, sigma: f32) -> f32 {
    let n: f32 = rng.sample(StandardNormal);

    n * sigma
}

/// Perturbs `pose` with zero-mean gaussian noise, `sr` on the position and
/// `st` on the heading.
pub fn jitter<R: Rng + ?Sized>(pose: Pose, sr: f32, st: f32, rng: &mut R) -> Pose {
    Pose::new(
        pose.x + gaussian(rng, sr),
        pose.y + gaussian(rng, sr),
        math::ang_norm_pi_sig(pose.theta + gaussian(rng, st)),
    )
}

/// `n` unit-weight particles drawn around `center` with per-axis `sigma`.
pub fn sample_around<R: Rng + ?Sized>(
    center: na::Point2<f32>,
    sigma: na::Vector2<f32>,
    n: usize,
    rng: &mut R,
) -> Vec<PoseParticle> {
    (0..n)
        .map(|_| {
            let pose = Pose::new(
                center.x + gaussian(rng, sigma.x.abs()),
                center.y + gaussian(rng, sigma.y.abs()),
                0.0,
            );

            PoseParticle::new(pose, 1.0)
        })
        .collect()
}

/// Weighted mean position and circular mean heading.
pub fn centroid(particles: &[PoseParticle]) -> Pose {
    if particles.is_empty() {
        return Pose::default();
    }

    let total: f32 = particles.iter().map(|p| p.weight.max(0.0)).sum();
    let uniform = total <= f32::EPSILON;

    let (mut x, mut y, mut c, mut s) = (0.0, 0.0, 0.0, 0.0);

    for p in particles {
        let w = if uniform { 1.0 } else { p.weight.max(0.0) };

        x += p.pose.x * w;
        y += p.pose.y * w;
        c += p.pose.theta.cos();
        s += p.pose.theta.sin();
    }

    let norm = if uniform {
        particles.len() as f32
    } else {
        total
    };

    Pose::new(x / norm, y / norm, s.atan2(c))
}

/// Per-axis standard deviation of `particles` around `center`.
pub fn sigma(particles: &[PoseParticle], center: &Pose) -> na::Vector2<f32> {
    if particles.is_empty() {
        return na::Vector2::zeros();
    }

    let n = particles.len() as f32;
    let (sx, sy) = particles.iter().fold((0.0, 0.0), |(sx, sy), p| {
        let dx = p.pose.x - center.x;
        let dy = p.pose.y - center.y;

        (sx + dx * dx, sy + dy * dy)
    });

    na::Vector2::new((sx / n).sqrt(), (sy / n).sqrt())
}

/// Systematic resampling: returns the indexes of the particles to keep, one
/// per slot, proportionally to their weight.
pub fn resample_indexes<R: Rng + ?Sized>(particles: &[PoseParticle], rng: &mut R) -> Vec<usize> {
    let n = particles.len();

    if n == 0 {
        return Vec::new();
    }

    let total: f32 = particles.iter().map(|p| p.weight).sum();

    if total <= 0.0 {
        return (0..n).collect();
    }

    let step = total / n as f32;
    let mut u = rng.gen::<f32>() * step;
    let mut cumsum = particles[0].weight;
    let mut i = 0;
    let mut indexes = Vec::with_capacity(n);

    for _ in 0..n {
        while u > cumsum && i + 1 < n {
            i += 1;
            cumsum += particles[i].weight;
        }

        indexes.push(i);
        u += step;
    }

    indexes
}

pub fn repeat_indexes(particles: &[PoseParticle], indexes: &[usize]) -> Vec<PoseParticle> {
    indexes.iter().map(|&i| particles[i]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn particle(x: f32, y: f32, w: f32) -> PoseParticle {
        PoseParticle::new(Pose::new(x, y, 0.0), w)
    }

    #[test]
    fn centroid_is_weighted() {
        let ps = [particle(0.0, 0.0, 1.0), particle(4.0, 0.0, 3.0)];
        let c = centroid(&ps);

        assert!((c.x - 3.0).abs() < 1e-6);
        assert!(c.y.abs() < 1e-6);
    }

    #[test]
    fn centroid_heading_wraps() {
        let pi = std::f32::consts::PI;
        let ps = [
            PoseParticle::new(Pose::new(0.0, 0.0, pi - 0.1), 1.0),
            PoseParticle::new(Pose::new(0.0, 0.0, -pi + 0.1), 1.0),
        ];

        assert!((centroid(&ps).theta.abs() - pi).abs() < 1e-4);
    }

    #[test]
    fn resampling_prefers_heavy_particles() {
        let mut rng = StdRng::seed_from_u64(7);
        let ps = [
            particle(0.0, 0.0, 0.0),
            particle(1.0, 0.0, 1.0),
            particle(2.0, 0.0, 0.0),
        ];
        let idx = resample_indexes(&ps, &mut rng);

        assert_eq!(idx, vec![1, 1, 1]);
        assert_eq!(repeat_indexes(&ps, &idx).len(), 3);
    }

    #[test]
    fn relative_points_are_rotated_then_translated() {
        let pose = Pose::new(1.0, 2.0, std::f32::consts::FRAC_PI_2);
        let p = pose.relative_to_global(na::Point2::new(1.0, 0.0));

        assert!((p.x - 1.0).abs() < 1e-5);
        assert!((p.y - 3.0).abs() < 1e-5);
    }
}
