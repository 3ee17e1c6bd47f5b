pub mod bbox;
pub mod clusterizer;
pub mod config;
pub mod error;
pub mod filter;
pub mod math;
pub mod multi_agent;
pub mod observation;
pub mod packet;
pub mod particle;
pub mod processor;
pub mod rolling_avg;
pub mod sensor_model;
pub mod tracker;

mod circular_queue;

pub use circular_queue::CircularQueue;
pub use config::Config;
pub use filter::ObjectParticleFilter;
pub use multi_agent::ObjectParticleFilterMultiAgent;
pub use observation::{AgentReading, Estimation, Estimations, ObjectSensorReading, Observation};
pub use particle::{Pose, PoseParticle};
pub use processor::Processor;
pub use tracker::PTracker;

/// A filter driven one frame at a time: propagate, then correct.
pub trait Tracking {
    /// Name of the sensor whose readings this filter consumes.
    fn sensor(&self) -> &str;

    /// Propagates the state from `t0` to `t1` (ms) while the agent moved
    /// from `old_pose` to `new_pose`.
    fn predict(&mut self, new_pose: &Pose, old_pose: &Pose, t0: u64, t1: u64);

    /// Corrects the state with `reading`. Observations that were neither
    /// associated nor promoted are removed from it.
    fn observe(&mut self, reading: &mut ObjectSensorReading);
}
