#![allow(dead_code)]

use nalgebra as na;
use ptrack::filter::FILTER_NAME;
use ptrack::observation::Histograms;
use ptrack::{Config, ObjectParticleFilter, ObjectSensorReading, Observation, Pose, Tracking};

pub const CONFIG: &str = r#"{
    "parameters": {
        "particles": 200,
        "sr0": 0.05,
        "st0": 0.1,
        "bestParticles": 50,
        "averagedVelocityWindow": 5,
        "closenessThreshold": 0.5,
        "opticalTracker": false,
        "timeToWaitBeforeDeleting": 2000,
        "timeToWaitBeforePromoting": 300,
        "velocityStabilizationFactor": 1.0,
        "seed": 7
    },
    "sensorModel": { "type": "BasicSensorModel", "modelLinearVelocity": 1.5 },
    "location": { "worldXMin": 0, "worldXMax": 20, "worldYMin": 0, "worldYMax": 20 },
    "clustering": { "algorithm": "KClusterizer" }
}"#;

pub const DELETE_AFTER: u64 = 2000;
pub const PROMOTE_AFTER: u64 = 300;

pub fn config() -> Config {
    Config::from_json(CONFIG).unwrap()
}

pub fn filter() -> ObjectParticleFilter {
    ObjectParticleFilter::new(&config()).unwrap()
}

pub fn observation(x: f32, y: f32) -> Observation {
    let mut obs = Observation::at(na::Point2::new(x, y));
    obs.sigma = na::Vector2::new(0.1, 0.1);
    obs
}

/// Histograms with all the mass of every channel in `bin`.
pub fn histograms(bin: usize) -> Histograms {
    let mut counts = ndarray::Array2::zeros((3, 256));

    for c in 0..3 {
        counts[[c, bin]] = 10.0;
    }

    Histograms::from_counts(&counts, 10.0).unwrap()
}

/// One predict + observe cycle of a static agent from `t0` to `t1`.
pub fn step(f: &mut ObjectParticleFilter, t0: u64, t1: u64, observations: Vec<Observation>) {
    let origin = Pose::default();
    let mut reading = ObjectSensorReading::with_observations(FILTER_NAME, observations);

    f.predict(&origin, &origin, t0, t1);
    f.observe(&mut reading);
}

pub fn near(p: na::Point2<f32>, x: f32, y: f32, tolerance: f32) -> bool {
    na::distance(&p, &na::Point2::new(x, y)) < tolerance
}
