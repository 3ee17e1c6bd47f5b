use crate::bbox::{BBox, Ltrb};
use crate::circular_queue::CircularQueue;
use crate::config::WorldBounds;
use crate::particle::Pose;

use nalgebra as na;
use ndarray::{Array2, Axis};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HISTOGRAM_BINS: usize = 256;
pub const HISTOGRAM_CHANNELS: usize = 3;

/// Two appearance models closer than this are the same target.
pub const BHATTACHARYYA_THRESHOLD: f32 = 0.35;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PolarPoint {
    pub rho: f32,
    pub theta: f32,
}

impl PolarPoint {
    #[inline]
    pub fn new(theta: f32, rho: f32) -> Self {
        Self { rho, theta }
    }

    #[inline]
    pub fn from_cartesian(p: na::Point2<f32>) -> Self {
        Self::new(p.y.atan2(p.x), p.coords.norm())
    }

    #[inline]
    pub fn cartesian(&self) -> na::Point2<f32> {
        na::Point2::new(self.rho * self.theta.cos(), self.rho * self.theta.sin())
    }
}

/// Three normalized color histograms, one row per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histograms(Array2<f32>);

impl Default for Histograms {
    fn default() -> Self {
        Self(Array2::zeros((HISTOGRAM_CHANNELS, HISTOGRAM_BINS)))
    }
}

impl Histograms {
    /// Normalizes raw per-bin pixel counts by the number of counted pixels.
    /// An empty region yields `None`.
    pub fn from_counts(counts: &Array2<f32>, counter: f32) -> Option<Self> {
        if counter <= 0.0 || counts.dim() != (HISTOGRAM_CHANNELS, HISTOGRAM_BINS) {
            return None;
        }

        Some(Self(counts / counter))
    }

    #[inline]
    pub fn channel(&self, i: usize) -> ndarray::ArrayView1<'_, f32> {
        self.0.index_axis(Axis(0), i)
    }

    /// Weighted Bhattacharyya distance; the first channel weighs the most.
    pub fn bhattacharyya(&self, other: &Histograms) -> f32 {
        let mut distance = 0.0;

        for i in 0..HISTOGRAM_CHANNELS {
            let coefficient: f32 = self
                .channel(i)
                .iter()
                .zip(other.channel(i).iter())
                .map(|(a, b)| (a * b).sqrt())
                .sum();

            let weight = (3.0 - i as f32) / 6.0;

            distance += weight * (1.0 - coefficient).max(0.0).sqrt();
        }

        distance
    }

    pub fn similarity(&self, other: &Histograms) -> (bool, f32) {
        let distance = self.bhattacharyya(other);

        (distance < BHATTACHARYYA_THRESHOLD, distance)
    }
}

/// Appearance and motion model of an observation or estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    /// Top-left and bottom-right corners, relative to the barycenter.
    pub bounding_box: BBox<Ltrb>,
    pub width: f32,
    pub height: f32,
    pub barycenter: f32,
    pub histograms: Histograms,
    pub velocity: na::Vector2<f32>,
    pub averaged_velocity: na::Vector2<f32>,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            bounding_box: BBox::default(),
            width: 0.0,
            height: 0.0,
            barycenter: -1.0,
            histograms: Histograms::default(),
            velocity: na::Vector2::zeros(),
            averaged_velocity: na::Vector2::zeros(),
        }
    }
}

impl Model {
    /// `3:1` blend of the geometry with a new observation; histograms are
    /// taken from the new observation as they are. Velocities start at zero
    /// and are left to the caller.
    pub fn blend(&self, next: &Model) -> Model {
        Model {
            bounding_box: self.bounding_box.blend(&next.bounding_box),
            width: (self.width * 3.0 + next.width) / 4.0,
            height: (self.height * 3.0 + next.height) / 4.0,
            barycenter: next.barycenter,
            histograms: next.histograms.clone(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub observation: PolarPoint,
    pub head: na::Point2<f32>,
    pub sigma: na::Vector2<f32>,
    pub model: Model,
}

impl Default for Observation {
    fn default() -> Self {
        Self {
            observation: PolarPoint::default(),
            head: na::Point2::origin(),
            sigma: na::Vector2::zeros(),
            model: Model::default(),
        }
    }
}

impl Observation {
    pub fn at(p: na::Point2<f32>) -> Self {
        Self {
            observation: PolarPoint::from_cartesian(p),
            head: p,
            ..Default::default()
        }
    }

    /// Builds an observation from an extracted foreground region. Regions
    /// with a zero barycenter or no counted pixels are dropped.
    pub fn from_region(
        position: na::Point2<f32>,
        head: na::Point2<f32>,
        bounding_box: BBox<Ltrb>,
        barycenter: f32,
        counts: &Array2<f32>,
        counter: f32,
    ) -> Option<Self> {
        if barycenter == 0.0 {
            return None;
        }

        let histograms = Histograms::from_counts(counts, counter)?;
        let ltwh = bounding_box.as_ltwh();

        Some(Self {
            observation: PolarPoint::from_cartesian(position),
            head,
            sigma: na::Vector2::zeros(),
            model: Model {
                width: ltwh.width().abs(),
                height: ltwh.height().abs(),
                bounding_box,
                barycenter,
                histograms,
                ..Default::default()
            },
        })
    }

    #[inline]
    pub fn cartesian(&self) -> na::Point2<f32> {
        self.observation.cartesian()
    }

    #[inline]
    pub fn set_cartesian(&mut self, p: na::Point2<f32>) {
        self.observation = PolarPoint::from_cartesian(p);
    }
}

/// A persistent estimate: the observation it is built from and its sigma.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimation {
    pub observation: Observation,
    pub sigma: na::Vector2<f32>,
}

impl Default for Estimation {
    fn default() -> Self {
        Self::new(Observation::default())
    }
}

impl Estimation {
    pub fn new(observation: Observation) -> Self {
        let sigma = observation.sigma;

        Self { observation, sigma }
    }

    #[inline]
    pub fn cartesian(&self) -> na::Point2<f32> {
        self.observation.cartesian()
    }
}

/// Estimations keyed by identity.
pub type Estimations = BTreeMap<u32, Estimation>;

/// Orders observations for association: larger boxes first, then the closest.
pub fn compare_observations(a: &Observation, b: &Observation) -> std::cmp::Ordering {
    b.model
        .area()
        .total_cmp(&a.model.area())
        .then_with(|| a.observation.rho.total_cmp(&b.observation.rho))
}

/// What one sensor of the agent perceived during a frame.
#[derive(Debug, Clone, Default)]
pub struct ObjectSensorReading {
    observations: Vec<Observation>,
    agent_pose: Pose,
    sensor: String,
}

impl ObjectSensorReading {
    pub fn new<S: Into<String>>(sensor: S) -> Self {
        Self {
            sensor: sensor.into(),
            ..Default::default()
        }
    }

    pub fn with_observations<S: Into<String>>(sensor: S, observations: Vec<Observation>) -> Self {
        Self {
            observations,
            sensor: sensor.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    #[inline]
    pub fn observations_mut(&mut self) -> &mut Vec<Observation> {
        &mut self.observations
    }

    /// Refills the reading with the `fresh` newest perceptions of `history`,
    /// skipping points outside `world` and moving the others from the agent
    /// frame into the global one.
    pub fn set_observations_from_history(
        &mut self,
        history: &CircularQueue<Observation>,
        fresh: usize,
        world: &WorldBounds,
    ) {
        self.observations.clear();

        for target in history.latest(fresh) {
            let p = target.cartesian();

            if !world.contains(&p) {
                continue;
            }

            let mut target = target.clone();
            target.set_cartesian(self.agent_pose.relative_to_global(p));

            self.observations.push(target);
        }
    }

    pub fn set_agent_pose(&mut self, pose: Pose) {
        self.agent_pose = pose;
    }

    #[inline]
    pub fn sensor(&self) -> &str {
        &self.sensor
    }
}

/// The identified targets one agent shares with the others.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReading {
    pub address: String,
    pub port: u16,
    pub agent_pose: Pose,
    pub estimations: Estimations,
    /// Milliseconds, at the sender.
    pub timestamp: u64,
}

/// One box of the offline observation file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    pub h: f32,
    pub w: f32,
    pub xc: f32,
    pub yc: f32,
    pub hxc: f32,
    pub hyc: f32,
    pub b: f32,
}

impl From<&BoxRecord> for Observation {
    fn from(r: &BoxRecord) -> Self {
        Observation {
            observation: PolarPoint::from_cartesian(na::Point2::new(r.xc, r.yc)),
            head: na::Point2::new(r.hxc, r.hyc),
            sigma: na::Vector2::zeros(),
            model: Model {
                width: r.w,
                height: r.h,
                barycenter: r.b,
                ..Default::default()
            },
        }
    }
}
