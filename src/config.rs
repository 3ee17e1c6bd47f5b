use crate::error::Error;
use nalgebra as na;
use serde_derive::Deserialize;
use std::path::Path;

/// Bounds larger than this are treated as unbounded when spreading the
/// initial particle population.
const MAX_UNIFORM_EXTENT: f32 = 1000.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub parameters: Parameters,
    pub sensor_model: SensorModelConfig,
    pub location: Location,
    pub clustering: Clustering,
    #[serde(default)]
    pub agent: Option<AgentConfig>,
    #[serde(default)]
    pub viewer: Option<Endpoint>,
    #[serde(default)]
    pub ros_bridge: Option<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    pub particles: usize,
    pub sr0: f32,
    pub st0: f32,
    pub best_particles: usize,
    pub averaged_velocity_window: usize,
    pub closeness_threshold: f32,
    pub optical_tracker: bool,
    /// Milliseconds.
    pub time_to_wait_before_deleting: u64,
    /// Milliseconds.
    pub time_to_wait_before_promoting: u64,
    pub velocity_stabilization_factor: f32,
    #[serde(default)]
    pub max_time_to_wait: u64,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorModelConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub model_linear_velocity: f32,
    #[serde(default = "default_sensor_sigma")]
    pub sigma: f32,
}

fn default_sensor_sigma() -> f32 {
    0.2
}

/// A world limit, either a number or one of the strings `"inf"` / `"-inf"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Value(f32),
    Label(String),
}

impl Bound {
    fn resolve(&self, key: &str) -> Result<f32, Error> {
        match self {
            Bound::Value(v) => Ok(*v),
            Bound::Label(s) => match s.trim() {
                "inf" => Ok(f32::MAX),
                "-inf" => Ok(-f32::MAX),
                other => other.parse().map_err(|_| {
                    Error::ConfigParseError(serde::de::Error::custom(format!(
                        "invalid value '{}' for location/{}",
                        other, key
                    )))
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub world_x_min: Bound,
    pub world_x_max: Bound,
    pub world_y_min: Bound,
    pub world_y_max: Bound,
}

impl Location {
    pub fn bounds(&self) -> Result<WorldBounds, Error> {
        Ok(WorldBounds {
            x_min: self.world_x_min.resolve("worldXMin")?,
            x_max: self.world_x_max.resolve("worldXMax")?,
            y_min: self.world_y_min.resolve("worldYMin")?,
            y_max: self.world_y_max.resolve("worldYMax")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBounds {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

impl WorldBounds {
    pub fn new(x_min: f32, x_max: f32, y_min: f32, y_max: f32) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    /// Inclusive on every side.
    #[inline]
    pub fn contains(&self, p: &na::Point2<f32>) -> bool {
        p.x >= self.x_min && p.x <= self.x_max && p.y >= self.y_min && p.y <= self.y_max
    }

    /// The box with unbounded sides cut down to a finite extent.
    pub fn finite(&self) -> WorldBounds {
        WorldBounds {
            x_min: self.x_min.max(-MAX_UNIFORM_EXTENT),
            x_max: self.x_max.min(MAX_UNIFORM_EXTENT),
            y_min: self.y_min.max(-MAX_UNIFORM_EXTENT),
            y_max: self.y_max.min(MAX_UNIFORM_EXTENT),
        }
    }

    #[inline]
    pub fn size(&self) -> (f32, f32) {
        (self.x_max - self.x_min, self.y_max - self.y_min)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clustering {
    pub algorithm: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_id: i32,
    pub agents: Vec<AgentEndpoint>,
    /// Hz.
    pub message_frequency: f32,
    #[serde(default = "default_fusion_interval")]
    pub fusion_interval: usize,
    #[serde(default = "default_max_queued_readings")]
    pub max_queued_readings: usize,
}

fn default_fusion_interval() -> usize {
    1
}

fn default_max_queued_readings() -> usize {
    64
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEndpoint {
    pub id: i32,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigReadError {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        let cfg: Config = serde_json::from_str(text)?;

        // surfaces malformed bounds at startup
        cfg.location.bounds()?;

        let mlv = cfg.sensor_model.model_linear_velocity;
        if mlv.is_nan() || mlv < 0.0 {
            return Err(Error::InvalidParameter {
                key: "modelLinearVelocity",
                reason: format!("must be a non-negative speed, got {}", mlv),
            });
        }

        Ok(cfg)
    }

    pub fn world(&self) -> Result<WorldBounds, Error> {
        self.location.bounds()
    }
}
