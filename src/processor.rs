use crate::observation::ObjectSensorReading;
use crate::particle::Pose;
use crate::Tracking;

/// Position change of the agent that forces an update.
const POSITION_THRESHOLD: f32 = 0.03;

/// Heading change of the agent, in degrees, that forces an update.
const HEADING_THRESHOLD_DEG: f32 = 5.0;

/// Decides when a filter runs: on the first frame, after `max_time_to_wait`
/// ms, or when the agent moved noticeably.
#[derive(Debug)]
pub struct Processor<T: Tracking> {
    filter: T,
    max_time_to_wait: u64,
    last_pose: Pose,
    last_update: Option<u64>,
}

impl<T: Tracking> Processor<T> {
    pub fn new(filter: T, max_time_to_wait: u64) -> Self {
        Self {
            filter,
            max_time_to_wait,
            last_pose: Pose::default(),
            last_update: None,
        }
    }

    #[inline]
    pub fn filter(&self) -> &T {
        &self.filter
    }

    fn update_needed(&self, pose: &Pose, now: u64) -> bool {
        let last = match self.last_update {
            Some(last) => last,
            None => return true,
        };

        let dtheta = (pose.theta - self.last_pose.theta).abs().to_degrees();

        now.saturating_sub(last) > self.max_time_to_wait
            || (pose.norm() - self.last_pose.norm()).abs() > POSITION_THRESHOLD
            || dtheta > HEADING_THRESHOLD_DEG
    }

    /// Runs predict and observe when due; returns whether it did. Only
    /// readings of the filter's sensor are observed.
    pub fn process_reading(
        &mut self,
        pose: &Pose,
        t0: u64,
        now: u64,
        readings: &mut [ObjectSensorReading],
    ) -> bool {
        if !self.update_needed(pose, now) {
            tracing::trace!(now, "skipping filter update");
            return false;
        }

        self.filter.predict(pose, &self.last_pose, t0, now);

        for reading in readings.iter_mut() {
            if reading.sensor() == self.filter.sensor() {
                self.filter.observe(reading);
            }
        }

        self.last_pose = *pose;
        self.last_update = Some(now);

        true
    }
}
