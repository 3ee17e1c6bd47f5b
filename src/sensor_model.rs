use crate::config::{SensorModelConfig, WorldBounds};
use crate::error::Error;
use crate::math;
use crate::observation::ObjectSensorReading;
use crate::particle::PoseParticle;

use std::fmt;

/// Weight given to particles nothing explains.
pub const MIN_WEIGHT: f32 = 1e-9;

pub trait SensorModel: fmt::Debug + Send {
    /// Multiplies every particle weight by its likelihood given `reading`.
    fn likelihood(&self, reading: &ObjectSensorReading, particles: &mut [PoseParticle]);
}

/// Builds the sensor model named in the configuration.
pub fn from_config(cfg: &SensorModelConfig, world: WorldBounds) -> Result<Box<dyn SensorModel>, Error> {
    match cfg.kind.as_str() {
        "BasicSensorModel" => Ok(Box::new(BasicSensorModel::new(cfg.sigma, world))),
        other => Err(Error::UnknownSensorModel(other.to_string())),
    }
}

/// Gaussian likelihood of the distance to the closest-fitting observation.
#[derive(Debug, Clone)]
pub struct BasicSensorModel {
    sigma: f32,
    world: WorldBounds,
}

impl BasicSensorModel {
    pub fn new(sigma: f32, world: WorldBounds) -> Self {
        Self { sigma, world }
    }
}

impl SensorModel for BasicSensorModel {
    fn likelihood(&self, reading: &ObjectSensorReading, particles: &mut [PoseParticle]) {
        let observations = reading.observations();

        for p in particles.iter_mut() {
            let point = p.point();

            if !self.world.contains(&point) {
                p.weight = MIN_WEIGHT;
                continue;
            }

            let mut best = 0.0f32;

            for obs in observations {
                let o = obs.cartesian();
                let sx = if obs.sigma.x > 0.0 { obs.sigma.x } else { self.sigma };
                let sy = if obs.sigma.y > 0.0 { obs.sigma.y } else { self.sigma };

                let l = math::gauss(point.x - o.x, sx) * math::gauss(point.y - o.y, sy);

                best = best.max(l);
            }

            p.weight = (p.weight * best).max(MIN_WEIGHT);
        }
    }
}
