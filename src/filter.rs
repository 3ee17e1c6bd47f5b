use crate::bbox::{BBox, Ltwh};
use crate::clusterizer::{ClusteringAlgorithm, Clusterizer};
use crate::config::{Config, WorldBounds};
use crate::error::Error;
use crate::math::{self, Direction};
use crate::observation::{
    compare_observations, Estimation, Estimations, Model, ObjectSensorReading, Observation,
    PolarPoint,
};
use crate::particle::{self, Cluster, Pose, PoseParticle};
use crate::rolling_avg::RollingAvg;
use crate::sensor_model::{self, SensorModel};
use crate::Tracking;

use nalgebra as na;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f32::consts::{FRAC_PI_2, PI};

pub const FILTER_NAME: &str = "ObjectParticleFilter";

/// Without a successful association for this long (ms) the filter starts over.
const REINITIALIZATION_TIMEOUT: u64 = 5000;

/// A pending observation not refreshed within this many ms cannot be promoted.
const PROMOTION_MAX_GAP: u64 = 500;

/// Share of the particle budget injected at a promoted observation.
const PROMOTION_BURST: f32 = 0.05;

pub const GROUP_OVERLAP_FACTOR: f32 = 0.8;

const OPTICAL_QUALITY_THRESHOLD: f32 = 20.0;
const METRIC_QUALITY_THRESHOLD: f32 = 0.45;

/// Below this speed a reversed velocity defaults to one unit per second.
const REVERSAL_MIN_SPEED: f32 = 0.2;

const SIGMA_INFLATION: f32 = 0.01;
const MIN_DT: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    /// No full update since construction or the last re-initialization.
    Reinitialized,
    Tracking,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingObservation {
    pub position: na::Point2<f32>,
    pub first_seen: u64,
    pub last_seen: u64,
}

/// Cluster index of the previous cycle -> (observation, cluster centroid).
pub type ObservationsMapping = BTreeMap<usize, (Observation, Pose)>;

/// Label (identities separated by spaces) -> estimation.
pub type GroupEstimations = Vec<(String, Estimation)>;

#[derive(Debug)]
pub struct ObjectParticleFilter {
    particles_number: usize,
    sr0: f32,
    st0: f32,
    closeness_threshold: f32,
    optical_tracker: bool,
    time_to_wait_before_deleting: u64,
    time_to_wait_before_promoting: u64,
    velocity_stabilization_factor: f32,
    model_linear_velocity: f32,
    averaged_velocity_window: usize,
    world: WorldBounds,

    algorithm: ClusteringAlgorithm,
    clusterizer: Box<dyn Clusterizer>,
    sensor_model: Box<dyn SensorModel>,

    particles: Vec<PoseParticle>,
    best_particle: PoseParticle,
    clusters: Vec<Cluster>,
    estimations: Estimations,
    update_times: BTreeMap<u32, u64>,
    movements: BTreeMap<u32, na::Vector2<f32>>,
    averaged_velocities: BTreeMap<u32, RollingAvg>,
    target_models: Vec<(Model, u32)>,
    groups: GroupEstimations,
    observations_mapping: ObservationsMapping,
    pending: Vec<PendingObservation>,
    max_identity: u32,

    state: FilterState,
    observe_needed: bool,
    associated_and_promoted: usize,
    last_observe_ts: u64,
    last_shrink_ts: u64,
    current_ts: u64,
    dt: f32,
    rng: StdRng,
}

impl ObjectParticleFilter {
    pub fn new(cfg: &Config) -> Result<Self, Error> {
        let world = cfg.world()?;
        let algorithm: ClusteringAlgorithm = cfg.clustering.algorithm.parse()?;
        let sensor_model = sensor_model::from_config(&cfg.sensor_model, world)?;
        let p = &cfg.parameters;

        let rng = match p.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let unit = if p.optical_tracker { "pixels" } else { "meters" };
        let (sx, sy) = world.size();

        tracing::info!(
            map_size = ?(sx, sy),
            unit,
            optical_tracking = p.optical_tracker,
            model_linear_velocity = cfg.sensor_model.model_linear_velocity,
            time_to_wait_before_deleting = p.time_to_wait_before_deleting,
            time_to_wait_before_promoting = p.time_to_wait_before_promoting,
            closeness_threshold = p.closeness_threshold,
            "particle filter configured"
        );

        let mut filter = Self {
            particles_number: p.particles,
            sr0: p.sr0,
            st0: p.st0,
            closeness_threshold: p.closeness_threshold,
            optical_tracker: p.optical_tracker,
            time_to_wait_before_deleting: p.time_to_wait_before_deleting,
            time_to_wait_before_promoting: p.time_to_wait_before_promoting,
            velocity_stabilization_factor: p.velocity_stabilization_factor,
            model_linear_velocity: cfg.sensor_model.model_linear_velocity,
            averaged_velocity_window: p.averaged_velocity_window,
            world,
            algorithm,
            clusterizer: algorithm.build(),
            sensor_model,
            particles: Vec::with_capacity(p.particles),
            best_particle: PoseParticle::default(),
            clusters: Vec::new(),
            estimations: Estimations::new(),
            update_times: BTreeMap::new(),
            movements: BTreeMap::new(),
            averaged_velocities: BTreeMap::new(),
            target_models: Vec::new(),
            groups: Vec::new(),
            observations_mapping: ObservationsMapping::new(),
            pending: Vec::new(),
            max_identity: 0,
            state: FilterState::Reinitialized,
            observe_needed: false,
            associated_and_promoted: 0,
            last_observe_ts: 0,
            last_shrink_ts: 0,
            current_ts: 0,
            dt: MIN_DT,
            rng,
        };

        filter.init_from_uniform();

        Ok(filter)
    }

    /// Spreads the whole population uniformly over the world box.
    pub fn init_from_uniform(&mut self) {
        let world = self.world.finite();
        let rng = &mut self.rng;

        self.particles = (0..self.particles_number)
            .map(|_| {
                let x = world.x_min + (world.x_max - world.x_min) * rng.gen::<f32>();
                let y = world.y_min + (world.y_max - world.y_min) * rng.gen::<f32>();
                let theta = PI * (2.0 * rng.gen::<f32>() - 1.0);

                PoseParticle::new(Pose::new(x, y, theta), 1.0)
            })
            .collect();
    }

    #[inline]
    pub fn estimations(&self) -> &Estimations {
        &self.estimations
    }

    #[inline]
    pub fn observations_mapping(&self) -> &ObservationsMapping {
        &self.observations_mapping
    }

    #[inline]
    pub fn groups(&self) -> &GroupEstimations {
        &self.groups
    }

    #[inline]
    pub fn particles(&self) -> &[PoseParticle] {
        &self.particles
    }

    #[inline]
    pub fn best_particle(&self) -> &PoseParticle {
        &self.best_particle
    }

    #[inline]
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    #[inline]
    pub fn pending_observations(&self) -> &[PendingObservation] {
        &self.pending
    }

    #[inline]
    pub fn max_identity(&self) -> u32 {
        self.max_identity
    }

    #[inline]
    pub fn closeness_threshold(&self) -> f32 {
        self.closeness_threshold
    }

    fn pad_population(&mut self) {
        if self.particles.is_empty() {
            self.init_from_uniform();
            return;
        }

        let n = self.particles.len();
        let mut j = 0;

        while self.particles.len() < self.particles_number {
            let p = self.particles[j % n];
            self.particles.push(p);
            j += 1;
        }
    }

    fn check_for_reinitialization(&mut self) -> bool {
        if self.current_ts.saturating_sub(self.last_observe_ts) < REINITIALIZATION_TIMEOUT {
            return false;
        }

        tracing::warn!(
            since_ms = self.current_ts.saturating_sub(self.last_observe_ts),
            "no association for too long, re-initializing filter"
        );

        self.last_observe_ts = self.current_ts;
        self.clusters.clear();
        self.estimations.clear();
        self.movements.clear();
        self.update_times.clear();
        self.averaged_velocities.clear();
        self.groups.clear();
        self.observations_mapping.clear();
        self.pending.clear();
        self.clusterizer = self.algorithm.build();

        true
    }

    /// Fills the population at a newly confirmed observation: all of it when
    /// nothing is tracked yet, a small burst otherwise.
    fn inject_particles(&mut self, at: na::Point2<f32>) {
        let bootstrap = self.associated_and_promoted == 0
            && self.clusters.is_empty()
            && self.estimations.is_empty();

        let n = if bootstrap {
            self.particles.clear();
            self.particles_number
        } else {
            ((self.particles_number as f32 * PROMOTION_BURST) as usize).max(1)
        };

        let center = Pose::from_point(at);

        for _ in 0..n {
            let pose = particle::jitter(center, self.sr0, self.st0, &mut self.rng);
            self.particles.push(PoseParticle::new(pose, 1.0));
        }
    }

    fn add_particles_in_interesting_points(&mut self, reading: &mut ObjectSensorReading) {
        let now = self.current_ts;
        let thr = self.closeness_threshold;
        let promote_all = self.time_to_wait_before_promoting == 0;

        self.associated_and_promoted = 0;
        self.observe_needed = promote_all;

        let observations = std::mem::take(reading.observations_mut());
        let mut kept = Vec::with_capacity(observations.len());

        for obs in observations {
            let p = obs.cartesian();
            let mut associated = false;

            let mapping = &self.observations_mapping;
            let nearest_cluster = self
                .clusters
                .iter()
                .enumerate()
                .filter(|(i, _)| !mapping.contains_key(i))
                .map(|(i, c)| (i, na::distance(&p, &c.centroid.point())))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            if let Some((i, d)) = nearest_cluster {
                if d <= thr {
                    associated = true;
                    self.observe_needed = true;
                    self.associated_and_promoted += 1;

                    let centroid = self.clusters[i].centroid;
                    self.observations_mapping.insert(i, (obs.clone(), centroid));
                }
            }

            if !associated
                && self
                    .estimations
                    .values()
                    .any(|e| math::is_target_near(p, e.cartesian(), thr))
            {
                associated = true;
                self.observe_needed = true;
                self.associated_and_promoted += 1;
            }

            if !associated {
                let mut exists = false;

                if let Some(idx) = self
                    .pending
                    .iter()
                    .position(|pd| math::is_target_near(p, pd.position, thr))
                {
                    let pd = &self.pending[idx];
                    let promotable = now.saturating_sub(pd.last_seen) < PROMOTION_MAX_GAP
                        && now.saturating_sub(pd.first_seen) >= self.time_to_wait_before_promoting;

                    if promotable {
                        tracing::debug!(x = p.x, y = p.y, "promoting pending observation");

                        associated = true;
                        self.observe_needed = true;
                        self.pending.remove(idx);
                    } else {
                        exists = true;

                        let pd = &mut self.pending[idx];
                        pd.position = p;
                        pd.last_seen = now;
                    }
                }

                if associated || promote_all {
                    self.inject_particles(p);
                    self.associated_and_promoted += 1;
                } else if !exists {
                    tracing::trace!(x = p.x, y = p.y, "adding pending observation");

                    self.pending.push(PendingObservation {
                        position: p,
                        first_seen: now,
                        last_seen: now,
                    });
                }
            }

            if associated || promote_all {
                kept.push(obs);
            }
        }

        *reading.observations_mut() = kept;

        let ttl = self.time_to_wait_before_deleting;
        self.pending
            .retain(|pd| now.saturating_sub(pd.last_seen) <= ttl);
    }

    /// Grows the cluster budget at once, shrinks it by one per promotion
    /// interval.
    fn adapt_cluster_number(&mut self) {
        let count = self.associated_and_promoted;

        if count == 0 {
            return;
        }

        if count >= self.clusters.len() {
            self.clusterizer.set_max_cluster_number(count);
            self.last_shrink_ts = self.current_ts;
        } else if self.current_ts.saturating_sub(self.last_shrink_ts)
            >= self.time_to_wait_before_promoting
        {
            let current = self.clusterizer.current_cluster_number();

            self.clusterizer
                .set_max_cluster_number(if current > 1 { current - 1 } else { 1 });
            self.last_shrink_ts = self.current_ts;
        }
    }

    /// Drops estimations not refreshed within the deletion window and moves
    /// the surviving ones along their velocity. Entries in `valid` are kept
    /// as they are.
    fn expire_estimations(&mut self, valid: &[u32]) {
        let now = self.current_ts;
        let ttl = self.time_to_wait_before_deleting;
        let mut expired = Vec::new();

        for (id, est) in self.estimations.iter_mut() {
            if valid.contains(id) {
                continue;
            }

            let last = self.update_times.get(id).copied().unwrap_or(now);

            if now.saturating_sub(last) > ttl {
                expired.push(*id);
            } else {
                let v = est.observation.model.velocity;

                if math::within_velocity(&v, self.model_linear_velocity) {
                    let np = math::estimated_position(est.cartesian(), v, self.dt);
                    est.observation.set_cartesian(np);
                }
            }
        }

        for id in expired {
            tracing::debug!(id, "deleting estimation");

            self.estimations.remove(&id);
            self.update_times.remove(&id);
            self.averaged_velocities.remove(&id);
            self.movements.remove(&id);
        }
    }

    /// Movement since the previous estimation, blended with the motion the
    /// previous velocity predicts. `head_displacement` only decides whether
    /// the target kept its heading.
    fn blend_movement(
        &self,
        previous: &Estimation,
        head_displacement: &na::Vector2<f32>,
        observation: &Observation,
    ) -> na::Vector2<f32> {
        let vsf = self.velocity_stabilization_factor;
        let prev_v = previous.observation.model.velocity;
        let floor = (observation.cartesian() - previous.cartesian()) / vsf;

        if Direction::of(head_displacement) == Direction::of(&prev_v) {
            (prev_v * self.dt * 3.0 + floor) / 4.0
        } else {
            (prev_v * self.dt * 4.0 + floor) / 5.0
        }
    }

    fn refresh_estimation(
        &mut self,
        id: u32,
        cluster_index: usize,
        mut mapped: Observation,
        previous: Option<&Estimation>,
    ) {
        let thr = self.closeness_threshold;
        let vsf = self.velocity_stabilization_factor;
        let dt = self.dt;
        let mlv = self.model_linear_velocity;

        let mut new_movement = None;
        let mut too_close = false;

        if let Some(prev) = previous {
            let head_displacement = (mapped.head - prev.observation.head) / vsf;

            if head_displacement.norm() < thr {
                new_movement = Some(self.blend_movement(prev, &head_displacement, &mapped));
            } else {
                // approximate: searches every mapped observation, not only the
                // ones of the clusters still to be processed
                let recovered = (0..self.observations_mapping.len())
                    .filter_map(|w| {
                        self.observations_mapping
                            .get(&w)
                            .map(|(o, _)| (w, na::distance(&o.head, &prev.observation.head)))
                    })
                    .min_by(|a, b| a.1.total_cmp(&b.1));

                match recovered {
                    Some((w, d)) if d <= thr => {
                        if let Some((o, _)) = self.observations_mapping.get(&w) {
                            mapped = o.clone();
                        }

                        let head_displacement = (mapped.head - prev.observation.head) / vsf;
                        new_movement = Some(self.blend_movement(prev, &head_displacement, &mapped));
                    }
                    _ => too_close = true,
                }
            }

            if let Some(m) = new_movement {
                self.movements.insert(id, m);
            }
        }

        let cluster = &self.clusters[cluster_index];
        let sigma = particle::sigma(&cluster.particles, &cluster.centroid);
        let centroid = cluster.centroid.point();

        let est = match self.estimations.get_mut(&id) {
            Some(est) => est,
            None => return,
        };

        est.observation.set_cartesian(centroid);
        est.observation.head = mapped.head;
        est.observation.sigma = sigma;
        est.sigma = sigma;

        let mut model = est.observation.model.blend(&mapped.model);

        if let Some(prev) = previous {
            if new_movement.is_some() || too_close {
                let prev_model = &prev.observation.model;

                let instant = if too_close {
                    let iv = reversed(&prev_model.velocity);
                    let np = math::estimated_position(est.cartesian(), iv, dt);
                    est.observation.set_cartesian(np);

                    iv
                } else {
                    (mapped.head - prev.observation.head) / vsf
                };

                let mut v = instant / dt;

                if v.x > mlv {
                    v.x = prev_model.averaged_velocity.x;
                } else if v.x < -mlv {
                    v.x = -prev_model.averaged_velocity.x;
                }

                if v.y > mlv {
                    v.y = prev_model.averaged_velocity.y;
                } else if v.y < -mlv {
                    v.y = -prev_model.averaged_velocity.y;
                }

                let window = self.averaged_velocity_window;

                model.velocity = v;
                model.averaged_velocity = self
                    .averaged_velocities
                    .entry(id)
                    .or_insert_with(|| RollingAvg::new(window))
                    .push(v);
            }
        }

        if let Some(entry) = self.target_models.iter_mut().find(|(_, tid)| *tid == id) {
            entry.0 = model.clone();
        }

        est.observation.model = model;
    }

    fn update_estimation(
        &mut self,
        id: u32,
        cluster_index: usize,
        mapping_key: Option<usize>,
        previous: &Estimations,
    ) {
        let dt = self.dt;

        if self.groups.iter().any(|(label, _)| is_group_member(label, id)) {
            // grouped targets follow their own velocity
            if let Some(est) = self.estimations.get_mut(&id) {
                let np = math::estimated_position(est.cartesian(), est.observation.model.velocity, dt);
                est.observation.set_cartesian(np);
            }

            return;
        }

        let mapped = mapping_key
            .and_then(|k| self.observations_mapping.get(&k))
            .map(|(o, _)| o.clone());

        match mapped {
            Some(obs) => self.refresh_estimation(id, cluster_index, obs, previous.get(&id)),
            None => {
                if let Some(est) = self.estimations.get_mut(&id) {
                    let v = reversed(&est.observation.model.velocity);
                    est.observation.model.velocity = v;

                    let np = math::estimated_position(est.cartesian(), v, dt);
                    est.observation.set_cartesian(np);
                }
            }
        }

        self.update_times.insert(id, self.current_ts);
    }

    /// Turns `obs` into a tracked target positioned at the cluster,
    /// re-using the identity of a matching stored appearance model if one is
    /// free.
    fn create_identity(&mut self, obs: Observation, cluster_index: usize) -> u32 {
        let cluster = &self.clusters[cluster_index];

        let mut target = Observation {
            observation: PolarPoint::from_cartesian(cluster.centroid.point()),
            head: obs.head,
            sigma: particle::sigma(&cluster.particles, &cluster.centroid),
            model: obs.model,
        };

        let estimations = &self.estimations;
        let candidate = self
            .target_models
            .iter()
            .filter(|(_, id)| !estimations.contains_key(id))
            .filter_map(|(m, id)| {
                let (similar, distance) = target.model.histograms.similarity(&m.histograms);

                similar.then(|| (distance, *id, m.histograms.clone()))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0));

        let id = match candidate {
            Some((distance, id, histograms)) => {
                tracing::info!(id, distance, "re-identified target");

                target.model.histograms = histograms;
                id
            }
            None => {
                self.max_identity += 1;

                let id = self.max_identity;
                self.target_models.push((target.model.clone(), id));

                tracing::info!(id, "new target");
                id
            }
        };

        self.estimations.insert(id, Estimation::new(target));
        self.update_times.insert(id, self.current_ts);

        id
    }

    fn update_target_identity(&mut self, reading: &mut ObjectSensorReading) {
        let previous = self.estimations.clone();
        let now = self.current_ts;
        let thr = self.closeness_threshold;
        let ttl = self.time_to_wait_before_deleting;
        let dt = self.dt;
        let mlv = self.model_linear_velocity;

        let mut valid: Vec<u32> = Vec::new();
        let mut deleting: Vec<usize> = Vec::new();
        let mut pending: Vec<usize> = Vec::new();

        // clusters without a close observation are kept only while an
        // estimation still explains them
        for (i, cluster) in self.clusters.iter_mut().enumerate() {
            let c = cluster.centroid.point();
            let near_obs = reading
                .observations()
                .iter()
                .map(|o| na::distance(&c, &o.cartesian()))
                .fold(f32::MAX, f32::min);

            if near_obs < thr {
                continue;
            }

            let nearest = self
                .estimations
                .iter()
                .map(|(id, e)| (*id, na::distance(&c, &e.cartesian())))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match nearest {
                Some((id, d)) if d < thr => {
                    let stale = self
                        .update_times
                        .get(&id)
                        .map(|t| now.saturating_sub(*t) > ttl)
                        .unwrap_or(false);

                    if stale {
                        deleting.push(i);
                    } else {
                        valid.push(id);
                        pending.push(i);

                        if let Some(est) = self.estimations.get_mut(&id) {
                            let v = est.observation.model.velocity;

                            if math::within_velocity(&v, mlv) {
                                let np = math::estimated_position(c, v, dt);

                                cluster.centroid.x = np.x;
                                cluster.centroid.y = np.y;
                                est.observation.set_cartesian(np);
                            }
                        }
                    }
                }
                _ => deleting.push(i),
            }
        }

        // each identity created here consumes an observation that has no
        // entry in the mapping, shifting the lookups of later clusters
        let mut mapping_shift = 0;

        for cluster_index in 0..self.clusters.len() {
            if pending.contains(&cluster_index) || deleting.contains(&cluster_index) {
                continue;
            }

            let c = self.clusters[cluster_index].centroid.point();

            let nearest = self
                .estimations
                .iter()
                .filter(|(id, _)| !valid.contains(*id))
                .map(|(id, e)| (*id, na::distance(&c, &e.cartesian())))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match nearest {
                Some((id, d)) if d < thr => {
                    let key = cluster_index.checked_sub(mapping_shift);

                    self.update_estimation(id, cluster_index, key, &previous);
                    valid.push(id);
                }
                _ => {
                    let closest = reading
                        .observations()
                        .iter()
                        .enumerate()
                        .map(|(i, o)| (i, na::distance(&c, &o.cartesian())))
                        .min_by(|a, b| a.1.total_cmp(&b.1));

                    if let Some((oi, d)) = closest {
                        if d < thr {
                            mapping_shift += 1;

                            let obs = reading.observations_mut().remove(oi);
                            let id = self.create_identity(obs, cluster_index);

                            valid.push(id);
                        }
                    }
                }
            }
        }

        let mut index = 0;
        self.clusters.retain(|_| {
            let keep = !deleting.contains(&index);
            index += 1;
            keep
        });

        // a group member seen by the sensor keeps the whole group alive
        for (label, _) in &self.groups {
            let ids = group_identities(label);

            if ids.len() < 2 {
                continue;
            }

            let seen = ids.iter().any(|id| {
                self.estimations.get(id).map_or(false, |e| {
                    reading
                        .observations()
                        .iter()
                        .any(|o| math::is_target_near(e.cartesian(), o.cartesian(), thr))
                })
            });

            if seen {
                for id in &ids {
                    if let Some(t) = self.update_times.get_mut(id) {
                        *t = now;
                    }
                }
            }
        }

        self.expire_estimations(&valid);
    }

    fn normalize_weight(&mut self) {
        for cluster in &mut self.clusters {
            let total: f32 = cluster.particles.iter().map(|p| p.weight).sum();

            if total > 0.0 {
                for p in &mut cluster.particles {
                    p.weight /= total;
                }
            }
        }

        self.best_particle = PoseParticle::default();

        for p in &self.particles {
            if p.weight > self.best_particle.weight {
                self.best_particle = *p;
            }
        }
    }

    fn resample(&mut self) {
        for cluster in &mut self.clusters {
            let indexes = particle::resample_indexes(&cluster.particles, &mut self.rng);

            cluster.particles = particle::repeat_indexes(&cluster.particles, &indexes);
        }
    }

    fn apply_ego_motion(&mut self, new_pose: &Pose, old_pose: &Pose) {
        let dx = new_pose.x - old_pose.x;
        let dy = new_pose.y - old_pose.y;

        let delta_x = (-new_pose.theta).cos() * dx - (-new_pose.theta).sin() * dy;
        let delta_y = (-new_pose.theta).sin() * dx + (-new_pose.theta).cos() * dy;
        let delta_theta = math::ang_norm_pi_sig(new_pose.theta - old_pose.theta);
        let half = old_pose.theta + delta_theta / 2.0;

        let a = half.cos();
        let b = (FRAC_PI_2 + half).cos();
        let c = half.sin();
        let d = (FRAC_PI_2 + half).sin();

        for p in &mut self.particles {
            p.pose.x += delta_x * a + delta_y * b;
            p.pose.y += delta_x * c + delta_y * d;
            p.pose.theta = math::ang_norm_pi_sig(p.pose.theta + delta_theta);
        }
    }
}

impl Tracking for ObjectParticleFilter {
    #[inline]
    fn sensor(&self) -> &str {
        FILTER_NAME
    }

    fn predict(&mut self, new_pose: &Pose, old_pose: &Pose, t0: u64, t1: u64) {
        self.current_ts = t1;
        self.dt = (t1.saturating_sub(t0) as f32 / 1000.0).max(MIN_DT);

        if !self.estimations.is_empty() {
            let per_target = self.particles_number / self.estimations.len();

            self.particles.clear();

            for (id, est) in &self.estimations {
                let velocity = match self.movements.get(id) {
                    Some(m) => math::clamp_velocity(*m / self.dt, self.model_linear_velocity),
                    None => na::Vector2::zeros(),
                };

                let center = Pose::from_point(math::estimated_position(
                    est.cartesian(),
                    velocity,
                    self.dt,
                ));

                for _ in 0..per_target {
                    let pose = particle::jitter(center, self.sr0, self.st0, &mut self.rng);
                    self.particles.push(PoseParticle::new(pose, 1.0));
                }
            }
        }

        self.pad_population();
        self.apply_ego_motion(new_pose, old_pose);

        // unobserved estimates grow less certain
        for est in self.estimations.values_mut() {
            est.observation.sigma.x += SIGMA_INFLATION;
            est.observation.sigma.y += SIGMA_INFLATION;
            est.sigma = est.observation.sigma;
        }
    }

    fn observe(&mut self, reading: &mut ObjectSensorReading) {
        self.observations_mapping.clear();

        reading.observations_mut().sort_by(compare_observations);

        if self.state == FilterState::Tracking && self.check_for_reinitialization() {
            self.state = FilterState::Reinitialized;
        }

        self.add_particles_in_interesting_points(reading);

        if !self.observe_needed {
            self.expire_estimations(&[]);
            return;
        }

        self.state = FilterState::Tracking;
        self.last_observe_ts = self.current_ts;

        for p in &mut self.particles {
            p.weight = 1.0;
        }

        self.sensor_model.likelihood(reading, &mut self.particles);
        self.adapt_cluster_number();

        let quality_threshold = if self.optical_tracker {
            OPTICAL_QUALITY_THRESHOLD
        } else {
            METRIC_QUALITY_THRESHOLD
        };

        self.clusterizer.clusterize(&self.particles, quality_threshold);
        self.clusters = self.clusterizer.clusters().to_vec();
        self.clusters
            .sort_by(|a, b| b.particles.len().cmp(&a.particles.len()));

        self.update_target_identity(reading);

        if self.optical_tracker {
            self.groups = group_estimations(&self.estimations, GROUP_OVERLAP_FACTOR);
        }

        self.normalize_weight();
        self.resample();

        self.particles.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        self.particles.truncate(self.particles_number);
        self.pad_population();
    }
}

/// Opposite of `v`, about one unit per second on slow axes.
fn reversed(v: &na::Vector2<f32>) -> na::Vector2<f32> {
    let flip = |x: f32| {
        if x.abs() < REVERSAL_MIN_SPEED {
            if x > 0.0 {
                -1.0
            } else {
                1.0
            }
        } else {
            -x
        }
    };

    na::Vector2::new(flip(v.x), flip(v.y))
}

pub fn group_identities(label: &str) -> Vec<u32> {
    label
        .split_whitespace()
        .filter_map(|t| t.parse().ok())
        .collect()
}

fn is_group_member(label: &str, id: u32) -> bool {
    label.contains(' ') && group_identities(label).contains(&id)
}

fn overlap_box(e: &Estimation, factor: f32) -> BBox<Ltwh> {
    let p = e.cartesian();
    let m = &e.observation.model;

    BBox::ground_anchored(p.x, p.y, m.width, m.height, factor)
}

/// Merges estimations whose shrunk boxes overlap into group estimations
/// spanning all members; isolated estimations are returned under their own
/// identity.
pub fn group_estimations(estimations: &Estimations, factor: f32) -> GroupEstimations {
    let mut remaining: Vec<(u32, Estimation)> =
        estimations.iter().map(|(id, e)| (*id, e.clone())).collect();
    let mut groups = Vec::new();
    let mut i = 0;

    while i < remaining.len() {
        let anchor = overlap_box(&remaining[i].1, factor);
        let mut overlapping = Vec::new();
        let mut j = i + 1;

        while j < remaining.len() {
            if anchor.overlaps(&overlap_box(&remaining[j].1, factor)) {
                overlapping.push(remaining.remove(j));
            } else {
                j += 1;
            }
        }

        if overlapping.is_empty() {
            groups.push((remaining[i].0.to_string(), remaining[i].1.clone()));
            i += 1;
            continue;
        }

        overlapping.push(remaining.remove(i));

        let mut width_min = f32::MAX;
        let mut width_max = f32::MIN_POSITIVE;
        let mut height_min = f32::MAX;
        let mut height_max = f32::MIN_POSITIVE;
        let mut sigma = na::Vector2::zeros();

        for (_, e) in &overlapping {
            let p = e.cartesian();
            let m = &e.observation.model;
            let half_width = (m.width / 2.0) * factor;

            width_min = width_min.min(p.x - half_width);
            width_max = width_max.max(p.x + half_width);
            height_min = height_min.min(p.y - m.height * factor);
            // the top edge is scaled from the position itself
            height_max = height_max.max(p.y * factor);
            sigma = e.sigma;
        }

        let barycenter = width_min + (width_max - width_min) / 2.0;
        let mut observation = Observation::at(na::Point2::new(barycenter, height_max));
        observation.model.barycenter = barycenter;
        observation.model.height = height_max - height_min;
        observation.model.width = width_max - width_min;

        let label = overlapping
            .iter()
            .map(|(id, _)| id.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        groups.push((
            label,
            Estimation {
                observation,
                sigma: sigma / overlapping.len() as f32,
            },
        ));
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;

    fn filter() -> ObjectParticleFilter {
        let cfg = Config::from_json(&SAMPLE.replace("\"inf\"", "20").replace("\"-inf\"", "0"))
            .unwrap();

        ObjectParticleFilter::new(&cfg).unwrap()
    }

    fn estimation(x: f32, y: f32, w: f32, h: f32) -> Estimation {
        let mut obs = Observation::at(na::Point2::new(x, y));
        obs.model.width = w;
        obs.model.height = h;

        Estimation {
            observation: obs,
            sigma: na::Vector2::new(2.0, 2.0),
        }
    }

    #[test]
    fn starts_with_uniform_population() {
        let f = filter();

        assert_eq!(f.particles().len(), 200);
        assert!(f
            .particles()
            .iter()
            .all(|p| p.pose.x >= 0.0 && p.pose.x <= 20.0 && p.pose.y >= 0.0 && p.pose.y <= 20.0));
    }

    #[test]
    fn ego_motion_translates_particles() {
        let mut f = filter();
        let before: Vec<_> = f.particles().to_vec();

        f.predict(&Pose::new(1.0, 0.0, 0.0), &Pose::new(0.0, 0.0, 0.0), 0, 100);

        for (a, b) in before.iter().zip(f.particles()) {
            assert!((b.pose.x - a.pose.x - 1.0).abs() < 1e-4);
            assert!((b.pose.y - a.pose.y).abs() < 1e-4);
        }
    }

    #[test]
    fn reversal_heuristic() {
        let v = reversed(&na::Vector2::new(0.1, -0.5));

        assert_eq!(v, na::Vector2::new(-1.0, 0.5));
        assert_eq!(reversed(&na::Vector2::new(0.0, 0.0)), na::Vector2::new(1.0, 1.0));
    }

    #[test]
    fn overlapping_boxes_are_grouped() {
        let mut est = Estimations::new();
        est.insert(1, estimation(100.0, 200.0, 40.0, 100.0));
        est.insert(2, estimation(120.0, 200.0, 40.0, 100.0));
        est.insert(3, estimation(400.0, 200.0, 40.0, 100.0));

        let groups = group_estimations(&est, GROUP_OVERLAP_FACTOR);

        assert_eq!(groups.len(), 2);

        let (label, group) = &groups[0];
        let mut ids = group_identities(label);
        ids.sort_unstable();

        assert_eq!(ids, vec![1, 2]);
        assert!((group.observation.model.width - 52.0).abs() < 1e-2);
        assert!((group.observation.model.height - (160.0 - 120.0)).abs() < 1e-2);
        assert!((group.sigma.x - 1.0).abs() < 1e-6);
        assert_eq!(groups[1].0, "3");
    }

    fn optical_filter() -> ObjectParticleFilter {
        let json = SAMPLE
            .replace("\"-inf\"", "0")
            .replace("\"inf\"", "640")
            .replace("\"worldYMax\": 20", "\"worldYMax\": 480")
            .replace("\"opticalTracker\": false", "\"opticalTracker\": true")
            .replace("\"closenessThreshold\": 0.5", "\"closenessThreshold\": 30");

        ObjectParticleFilter::new(&Config::from_json(&json).unwrap()).unwrap()
    }

    fn seen_at(x: f32, y: f32) -> Observation {
        let mut obs = Observation::at(na::Point2::new(x, y));
        obs.model.width = 60.0;
        obs.model.height = 150.0;
        obs
    }

    #[test]
    fn long_silence_reinitializes() {
        let mut f = filter();
        let origin = Pose::default();
        let mut empty = ObjectSensorReading::new(FILTER_NAME);

        f.estimations.insert(1, estimation(5.0, 5.0, 1.0, 1.0));
        f.pending.push(PendingObservation {
            position: na::Point2::new(12.0, 12.0),
            first_seen: 3900,
            last_seen: 3900,
        });
        f.state = FilterState::Tracking;
        f.last_observe_ts = 0;

        f.predict(&origin, &origin, 3900, 4000);
        f.observe(&mut empty);

        assert_eq!(f.estimations().len(), 1);
        assert_eq!(f.pending_observations().len(), 1);

        f.predict(&origin, &origin, 4900, 5000);
        f.observe(&mut empty);

        assert!(f.estimations().is_empty());
        assert!(f.pending_observations().is_empty());
        assert_eq!(f.state, FilterState::Reinitialized);
        assert_eq!(f.particles().len(), 200);
    }

    #[test]
    fn first_confirmed_observation_takes_the_whole_population() {
        let mut f = filter();
        f.inject_particles(na::Point2::new(7.0, 3.0));

        assert_eq!(f.particles().len(), 200);
        assert!(f
            .particles()
            .iter()
            .all(|p| na::distance(&p.point(), &na::Point2::new(7.0, 3.0)) < 0.5));
    }

    #[test]
    fn later_promotions_add_a_small_burst() {
        let mut f = filter();
        f.estimations.insert(1, estimation(5.0, 5.0, 1.0, 1.0));

        let before = f.particles().to_vec();
        f.inject_particles(na::Point2::new(15.0, 15.0));

        assert_eq!(f.particles().len(), 210);
        assert_eq!(&f.particles()[..200], &before[..]);
        assert!(f.particles()[200..]
            .iter()
            .all(|p| na::distance(&p.point(), &na::Point2::new(15.0, 15.0)) < 0.5));
    }

    #[test]
    fn cluster_budget_grows_at_once_and_shrinks_slowly() {
        let mut f = filter();
        let blob = |x: f32| Cluster::new(vec![PoseParticle::new(Pose::new(x, x, 0.0), 1.0)]);

        f.current_ts = 1000;
        f.associated_and_promoted = 3;
        f.adapt_cluster_number();
        assert_eq!(f.clusterizer.current_cluster_number(), 3);

        f.clusters = vec![blob(1.0), blob(5.0), blob(9.0)];
        f.associated_and_promoted = 1;

        f.current_ts = 1200;
        f.adapt_cluster_number();
        assert_eq!(f.clusterizer.current_cluster_number(), 3);

        f.current_ts = 1300;
        f.adapt_cluster_number();
        assert_eq!(f.clusterizer.current_cluster_number(), 2);

        f.current_ts = 1400;
        f.adapt_cluster_number();
        assert_eq!(f.clusterizer.current_cluster_number(), 2);

        for ts in [1600, 1900, 2200] {
            f.current_ts = ts;
            f.adapt_cluster_number();
        }
        assert_eq!(f.clusterizer.current_cluster_number(), 1);
    }

    #[test]
    fn refresh_without_displacement_resets_velocity() {
        let mut f = filter();
        let mut est = estimation(5.0, 5.0, 1.0, 1.0);
        est.observation.model.velocity = na::Vector2::new(1.0, -1.0);
        est.observation.model.averaged_velocity = na::Vector2::new(0.5, -0.5);

        f.estimations.insert(4, est);
        f.clusters = vec![Cluster::new(vec![
            PoseParticle::new(Pose::new(5.1, 5.0, 0.0), 1.0),
            PoseParticle::new(Pose::new(5.3, 5.0, 0.0), 1.0),
        ])];

        f.refresh_estimation(4, 0, Observation::at(na::Point2::new(5.2, 5.0)), None);

        let model = &f.estimations()[&4].observation.model;
        assert_eq!(model.velocity, na::Vector2::zeros());
        assert_eq!(model.averaged_velocity, na::Vector2::zeros());
        assert!((f.estimations()[&4].cartesian().x - 5.2).abs() < 1e-3);
    }

    #[test]
    fn optical_observe_groups_overlapping_targets() {
        let mut f = optical_filter();
        let origin = Pose::default();

        f.estimations.insert(1, estimation(200.0, 300.0, 60.0, 150.0));
        f.estimations.insert(2, estimation(210.0, 300.0, 60.0, 150.0));
        f.update_times.insert(1, 0);
        f.update_times.insert(2, 0);
        f.state = FilterState::Tracking;

        let mut reading = ObjectSensorReading::with_observations(
            FILTER_NAME,
            vec![seen_at(200.0, 300.0), seen_at(210.0, 300.0)],
        );

        f.predict(&origin, &origin, 0, 100);
        f.observe(&mut reading);

        assert_eq!(f.estimations().len(), 2);
        assert_eq!(f.groups().len(), 1);

        let mut ids = group_identities(&f.groups()[0].0);
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn seen_group_member_keeps_the_group_alive() {
        let mut f = filter();

        f.estimations.insert(1, estimation(200.0, 300.0, 60.0, 150.0));
        f.estimations.insert(2, estimation(210.0, 300.0, 60.0, 150.0));
        f.estimations.insert(3, estimation(400.0, 300.0, 60.0, 150.0));
        for id in 1..=3 {
            f.update_times.insert(id, 0);
        }
        f.groups = group_estimations(&f.estimations, GROUP_OVERLAP_FACTOR);
        f.current_ts = 2500;
        f.dt = 0.1;

        let mut reading =
            ObjectSensorReading::with_observations(FILTER_NAME, vec![seen_at(200.0, 300.0)]);
        f.update_target_identity(&mut reading);

        assert_eq!(f.estimations().keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(f.update_times[&2], 2500);
    }

    #[test]
    fn group_membership_is_exact() {
        assert!(is_group_member("12 3", 3));
        assert!(!is_group_member("12 3", 1));
        assert!(!is_group_member("3", 3));
    }
}
