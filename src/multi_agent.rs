use crate::config::Config;
use crate::math;
use crate::observation::{AgentReading, Estimation, Estimations, Observation};
use crate::particle::{self, PoseParticle};

use nalgebra as na;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// Weight lost per second of age by the particles of a shared reading.
const WEIGHT_DECAY: f32 = 0.15;

/// Upper bound on the fusion distance, in world units.
const MAX_CLOSENESS_THRESHOLD: f32 = 0.8;

/// Fuses the estimations shared by several agents into global identities.
#[derive(Debug)]
pub struct ObjectParticleFilterMultiAgent {
    best_particles: usize,
    closeness_threshold: f32,
    time_to_wait_before_deleting: u64,
    particles: Vec<PoseParticle>,
    best_particle: PoseParticle,
    estimations: Estimations,
    update_times: BTreeMap<u32, u64>,
    sources: BTreeMap<u32, (String, u16)>,
    max_identity: u32,
    current_ts: u64,
    rng: StdRng,
}

impl ObjectParticleFilterMultiAgent {
    pub fn new(cfg: &Config) -> Self {
        let p = &cfg.parameters;
        let closeness_threshold = MAX_CLOSENESS_THRESHOLD.min(2.0 * p.closeness_threshold);

        tracing::info!(
            closeness_threshold,
            time_to_wait_before_deleting = p.time_to_wait_before_deleting,
            "distributed particle filter configured"
        );

        Self {
            best_particles: p.best_particles,
            closeness_threshold,
            time_to_wait_before_deleting: p.time_to_wait_before_deleting,
            particles: Vec::new(),
            best_particle: PoseParticle::default(),
            estimations: Estimations::new(),
            update_times: BTreeMap::new(),
            sources: BTreeMap::new(),
            max_identity: 0,
            current_ts: 0,
            rng: match p.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        }
    }

    #[inline]
    pub fn estimations(&self) -> &Estimations {
        &self.estimations
    }

    /// Address and port of the agent whose reading created identity `id`.
    #[inline]
    pub fn source(&self, id: u32) -> Option<(&str, u16)> {
        self.sources.get(&id).map(|(a, p)| (a.as_str(), *p))
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
    pub fn closeness_threshold(&self) -> f32 {
        self.closeness_threshold
    }

    pub fn observe(&mut self, readings: &[AgentReading], now: u64) {
        self.current_ts = now;
        self.particles.clear();
        self.best_particle = PoseParticle::default();

        for reading in readings {
            let age = now.saturating_sub(reading.timestamp) as f32 / 1000.0;
            let weight = (1.0 - WEIGHT_DECAY * age).max(0.0);

            for est in reading.estimations.values() {
                let samples = particle::sample_around(
                    est.cartesian(),
                    est.sigma,
                    self.best_particles,
                    &mut self.rng,
                );

                for mut p in samples {
                    p.weight = weight;

                    if p.weight > self.best_particle.weight {
                        self.best_particle = p;
                    }

                    self.particles.push(p);
                }
            }
        }

        self.update_target_identity(readings);
        self.resample();
    }

    fn update_target_identity(&mut self, readings: &[AgentReading]) {
        let thr = self.closeness_threshold;
        let mut pools: Vec<Vec<(u32, Estimation)>> = readings
            .iter()
            .map(|r| r.estimations.iter().map(|(id, e)| (*id, e.clone())).collect())
            .collect();

        for i in 0..pools.len() {
            while !pools[i].is_empty() {
                let (local_id, first) = pools[i].remove(0);
                let p = first.cartesian();
                let mut members = vec![first];

                for pool in pools.iter_mut().skip(i + 1) {
                    let mut k = 0;

                    while k < pool.len() {
                        if math::is_target_near(p, pool[k].1.cartesian(), thr) {
                            members.push(pool.remove(k).1);
                        } else {
                            k += 1;
                        }
                    }
                }

                let fused = fuse(&members);
                self.assign(local_id, fused, &readings[i]);
            }
        }

        let now = self.current_ts;
        let ttl = self.time_to_wait_before_deleting;
        let expired: Vec<u32> = self
            .update_times
            .iter()
            .filter(|(_, t)| now.saturating_sub(**t) > ttl)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            tracing::debug!(id, "deleting global estimation");

            self.estimations.remove(&id);
            self.update_times.remove(&id);
            self.sources.remove(&id);
        }
    }

    /// Stores `fused` under the nearest global identity, or under a new one
    /// that keeps the agent's local number when it is free.
    fn assign(&mut self, local_id: u32, fused: Estimation, reading: &AgentReading) {
        let p = fused.cartesian();
        let nearest = self
            .estimations
            .iter()
            .map(|(id, e)| (*id, na::distance(&p, &e.cartesian())))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let id = match nearest {
            Some((id, d)) if d <= self.closeness_threshold => id,
            _ => {
                let mut id = local_id;

                while id == 0 || self.estimations.contains_key(&id) {
                    self.max_identity += 1;
                    id = self.max_identity;
                }

                self.max_identity = self.max_identity.max(id);
                self.sources
                    .insert(id, (reading.address.clone(), reading.port));

                tracing::debug!(id, agent = %reading.address, port = reading.port, "new global estimation");
                id
            }
        };

        self.estimations.insert(id, fused);
        self.update_times.insert(id, self.current_ts);
    }

    fn resample(&mut self) {
        let indexes = particle::resample_indexes(&self.particles, &mut self.rng);

        self.particles = particle::repeat_indexes(&self.particles, &indexes);
    }
}

/// Inverse-sigma weighted mean of position and head. The model is the first
/// member's, the sigma the members' mean.
fn fuse(members: &[Estimation]) -> Estimation {
    let n = members.len() as f32;
    let all_sigma = members
        .iter()
        .fold(na::Vector2::zeros(), |acc: na::Vector2<f32>, e| acc + e.sigma);

    let first = &members[0];
    let (position, head) = if members.len() > 1 {
        let ratio = |s: f32, all: f32| if all > 0.0 { 1.0 - s / all } else { 1.0 };

        let mut norm = na::Vector2::<f32>::zeros();
        for e in members {
            norm.x += ratio(e.sigma.x, all_sigma.x);
            norm.y += ratio(e.sigma.y, all_sigma.y);
        }

        let mut position = na::Point2::origin();
        let mut head = na::Point2::origin();

        for e in members {
            let wx = ratio(e.sigma.x, all_sigma.x) / norm.x;
            let wy = ratio(e.sigma.y, all_sigma.y) / norm.y;
            let c = e.cartesian();

            position.x += c.x * wx;
            position.y += c.y * wy;
            head.x += e.observation.head.x * wx;
            head.y += e.observation.head.y * wy;
        }

        (position, head)
    } else {
        (first.cartesian(), first.observation.head)
    };

    let mut observation = Observation::at(position);
    observation.head = head;
    observation.sigma = all_sigma / n;
    observation.model = first.observation.model.clone();

    Estimation::new(observation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::particle::Pose;

    fn reading(port: u16, ts: u64, targets: &[(u32, f32, f32, f32)]) -> AgentReading {
        let estimations = targets
            .iter()
            .map(|&(id, x, y, s)| {
                let mut obs = Observation::at(na::Point2::new(x, y));
                obs.sigma = na::Vector2::new(s, s);

                (id, Estimation::new(obs))
            })
            .collect();

        AgentReading {
            address: "127.0.0.1".into(),
            port,
            agent_pose: Pose::default(),
            estimations,
            timestamp: ts,
        }
    }

    fn filter() -> ObjectParticleFilterMultiAgent {
        ObjectParticleFilterMultiAgent::new(&Config::from_json(SAMPLE).unwrap())
    }

    #[test]
    fn closeness_is_doubled_and_capped() {
        assert!((filter().closeness_threshold() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn fusion_favours_the_sharper_estimate() {
        let mut a = Observation::at(na::Point2::new(0.0, 0.0));
        a.sigma = na::Vector2::new(0.1, 0.1);
        let mut b = Observation::at(na::Point2::new(1.0, 1.0));
        b.sigma = na::Vector2::new(0.3, 0.3);

        let fused = fuse(&[Estimation::new(a), Estimation::new(b)]);
        let p = fused.cartesian();

        // weights 0.75 and 0.25
        assert!((p.x - 0.25).abs() < 1e-4);
        assert!((p.y - 0.25).abs() < 1e-4);
        assert!((fused.sigma.x - 0.2).abs() < 1e-6);
    }

    #[test]
    fn zero_sigma_fusion_is_a_plain_mean() {
        let a = Estimation::new(Observation::at(na::Point2::new(0.0, 0.0)));
        let b = Estimation::new(Observation::at(na::Point2::new(1.0, 0.0)));
        let p = fuse(&[a, b]).cartesian();

        assert!((p.x - 0.5).abs() < 1e-5);
    }

    #[test]
    fn local_identity_kept_when_free() {
        let mut f = filter();
        f.observe(&[reading(9000, 1000, &[(4, 5.0, 5.0, 0.1)])], 1000);

        assert_eq!(f.estimations().keys().copied().collect::<Vec<_>>(), vec![4]);
        assert_eq!(f.source(4), Some(("127.0.0.1", 9000)));
        assert_eq!(f.particles().len(), 50);
    }

    #[test]
    fn colliding_identity_gets_a_fresh_number() {
        let mut f = filter();
        f.observe(
            &[
                reading(9000, 1000, &[(1, 5.0, 5.0, 0.1)]),
                reading(9001, 1000, &[(1, 15.0, 5.0, 0.1)]),
            ],
            1000,
        );

        let ids: Vec<_> = f.estimations().keys().copied().collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1));
    }

    #[test]
    fn stale_readings_weigh_less_and_globals_expire() {
        let mut f = filter();
        f.observe(&[reading(9000, 0, &[(1, 5.0, 5.0, 0.1)])], 2000);

        assert!((f.best_particle().weight - 0.7).abs() < 1e-5);

        f.observe(&[], 4001);
        assert!(f.estimations().is_empty());
    }
}
