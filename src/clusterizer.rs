use crate::error::Error;
use crate::math;
use crate::particle::{Cluster, PoseParticle};

use nalgebra as na;
use std::fmt;
use std::str::FromStr;

/// Clusters built from outliers or from splitting need at least this many
/// particles to survive.
pub const MIN_SIZE_CLUSTER_AFTER_SPLITTING: usize = 10;

pub trait Clusterizer: fmt::Debug + Send {
    fn clusterize(&mut self, particles: &[PoseParticle], quality_threshold: f32);
    fn clusters(&self) -> &[Cluster];
    fn set_max_cluster_number(&mut self, k: usize);
    fn current_cluster_number(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusteringAlgorithm {
    KClusterizer,
    QTClusterizer,
}

impl ClusteringAlgorithm {
    pub fn build(&self) -> Box<dyn Clusterizer> {
        match self {
            ClusteringAlgorithm::KClusterizer => Box::new(KClusterizer::new(1)),
            ClusteringAlgorithm::QTClusterizer => Box::new(QTClusterizer::new(1)),
        }
    }
}

impl FromStr for ClusteringAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("KClusterizer") {
            Ok(ClusteringAlgorithm::KClusterizer)
        } else if s.eq_ignore_ascii_case("QTClusterizer") {
            Ok(ClusteringAlgorithm::QTClusterizer)
        } else {
            Err(Error::UnknownClusterizer(s.to_string()))
        }
    }
}

/// Keeps the `capacity` heaviest particles pushed into it, heaviest first.
#[derive(Debug, Clone)]
struct PriorityBuffer {
    items: Vec<PoseParticle>,
    capacity: usize,
}

impl PriorityBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn reset(&mut self) {
        self.items.clear();
    }

    fn push(&mut self, p: PoseParticle) {
        if self.capacity == 0 {
            return;
        }

        if self.items.len() == self.capacity {
            match self.items.last() {
                Some(last) if last.weight < p.weight => {
                    self.items.pop();
                }
                _ => return,
            }
        }

        let pos = self
            .items
            .iter()
            .position(|it| it.weight < p.weight)
            .unwrap_or(self.items.len());

        self.items.insert(pos, p);
    }

    fn iter(&self) -> impl Iterator<Item = &PoseParticle> {
        self.items.iter()
    }
}

#[inline]
fn distance(a: &PoseParticle, b: &PoseParticle) -> f32 {
    na::distance(&a.point(), &b.point())
}

/// Splits clusters whose farthest pair of members is further apart than
/// `quality_threshold`, then drops clusters whose centroid crowds another.
fn split_and_merge(clusters: &mut Vec<Cluster>, quality_threshold: f32) {
    let mut split = Vec::new();

    clusters.retain(|cluster| {
        let ps = &cluster.particles;
        let mut extremes = None;
        let mut max = f32::MIN_POSITIVE;

        for a in ps {
            for b in ps {
                let d = distance(a, b);

                if d > max {
                    max = d;
                    extremes = Some((*a, *b));
                }
            }
        }

        let (p1, p2) = match extremes {
            Some(e) if max > quality_threshold => e,
            _ => return true,
        };

        let half = 0.5 * quality_threshold;
        let mut part1 = Vec::new();
        let mut part2 = Vec::new();

        for p in ps {
            let d1 = distance(p, &p1);
            let d2 = distance(p, &p2);

            if d1 < d2 && d1 < half {
                part1.push(*p);
            } else if d2 < half {
                part2.push(*p);
            }
        }

        for part in [part1, part2] {
            if part.len() >= MIN_SIZE_CLUSTER_AFTER_SPLITTING {
                split.push(Cluster::new(part));
            }
        }

        false
    });

    clusters.extend(split);

    let near = 0.3 * quality_threshold;
    let mut i = 0;

    while i < clusters.len() {
        let c = clusters[i].centroid.point();
        let close = clusters
            .iter()
            .filter(|other| math::is_target_near(c, other.centroid.point(), near))
            .count();

        // `close` includes the cluster itself
        if close > 1 {
            clusters.remove(i);
        } else {
            i += 1;
        }
    }
}

/// K-means-like clusterizer seeded by the heaviest mutually distant
/// particles, with at most `max_clusters` seeds.
#[derive(Debug, Clone)]
pub struct KClusterizer {
    kpoints: PriorityBuffer,
    max_clusters: usize,
    clusters: Vec<Cluster>,
}

impl KClusterizer {
    pub fn new(max_clusters: usize) -> Self {
        Self {
            kpoints: PriorityBuffer::new(max_clusters),
            max_clusters,
            clusters: Vec::new(),
        }
    }

    fn is_far_from_all(&self, p: &PoseParticle, quality_threshold: f32) -> bool {
        self.kpoints
            .iter()
            .all(|k| distance(k, p) > quality_threshold)
    }
}

impl Clusterizer for KClusterizer {
    fn clusterize(&mut self, particles: &[PoseParticle], quality_threshold: f32) {
        self.clusters.clear();
        self.kpoints.reset();

        for p in particles {
            if self.is_far_from_all(p, quality_threshold) {
                self.kpoints.push(*p);
            }
        }

        let seeds: Vec<PoseParticle> = self.kpoints.iter().copied().collect();
        let mut members: Vec<Vec<PoseParticle>> = vec![Vec::new(); seeds.len()];
        let mut outliers = Vec::new();

        for p in particles {
            let nearest = seeds
                .iter()
                .enumerate()
                .map(|(i, k)| (i, distance(k, p)))
                .filter(|&(_, d)| d <= quality_threshold)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match nearest {
                Some((i, _)) => members[i].push(*p),
                None => outliers.push(*p),
            }
        }

        self.clusters = members
            .into_iter()
            .filter(|m| !m.is_empty())
            .map(Cluster::new)
            .collect();

        // outliers join a group per nearest centroid
        let centroids: Vec<na::Point2<f32>> =
            self.clusters.iter().map(|c| c.centroid.point()).collect();
        let mut outlier_groups: Vec<Vec<PoseParticle>> = vec![Vec::new(); centroids.len().max(1)];

        for p in outliers {
            let idx = centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, na::distance_squared(c, &p.point())))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);

            outlier_groups[idx].push(p);
        }

        for group in outlier_groups {
            if group.len() >= MIN_SIZE_CLUSTER_AFTER_SPLITTING {
                self.clusters.push(Cluster::new(group));
            }
        }

        split_and_merge(&mut self.clusters, quality_threshold);
    }

    #[inline]
    fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    fn set_max_cluster_number(&mut self, k: usize) {
        self.max_clusters = k;
        self.kpoints = PriorityBuffer::new(k);
    }

    #[inline]
    fn current_cluster_number(&self) -> usize {
        self.max_clusters
    }
}

/// Quality-threshold clusterizer: repeatedly takes the largest candidate
/// group whose members all lie within half the threshold of a seed particle.
#[derive(Debug, Clone)]
pub struct QTClusterizer {
    max_clusters: usize,
    clusters: Vec<Cluster>,
}

impl QTClusterizer {
    pub fn new(max_clusters: usize) -> Self {
        Self {
            max_clusters,
            clusters: Vec::new(),
        }
    }
}

impl Clusterizer for QTClusterizer {
    fn clusterize(&mut self, particles: &[PoseParticle], quality_threshold: f32) {
        self.clusters.clear();

        let radius = 0.5 * quality_threshold;
        let mut remaining: Vec<PoseParticle> = particles.to_vec();

        while !remaining.is_empty() && self.clusters.len() < self.max_clusters.max(1) {
            let mut best: Vec<usize> = Vec::new();

            for seed in &remaining {
                let candidate: Vec<usize> = remaining
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| distance(seed, p) <= radius)
                    .map(|(i, _)| i)
                    .collect();

                if candidate.len() > best.len() {
                    best = candidate;
                }
            }

            // the first cluster is always kept, later ones must be large enough
            if best.is_empty()
                || (!self.clusters.is_empty() && best.len() < MIN_SIZE_CLUSTER_AFTER_SPLITTING)
            {
                break;
            }

            let mut taken = Vec::with_capacity(best.len());

            for &i in best.iter().rev() {
                taken.push(remaining.swap_remove(i));
            }

            self.clusters.push(Cluster::new(taken));
        }

        split_and_merge(&mut self.clusters, quality_threshold);
    }

    #[inline]
    fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    fn set_max_cluster_number(&mut self, k: usize) {
        self.max_clusters = k;
    }

    #[inline]
    fn current_cluster_number(&self) -> usize {
        self.max_clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Pose;

    fn blob(cx: f32, cy: f32, n: usize, spread: f32) -> Vec<PoseParticle> {
        (0..n)
            .map(|i| {
                let a = i as f32 * 2.399;
                let r = spread * ((i % 7) as f32 / 7.0);

                PoseParticle::new(Pose::new(cx + r * a.cos(), cy + r * a.sin(), 0.0), 1.0)
            })
            .collect()
    }

    #[test]
    fn parses_algorithm_case_insensitively() {
        assert_eq!(
            "kclusterizer".parse::<ClusteringAlgorithm>().unwrap(),
            ClusteringAlgorithm::KClusterizer
        );
        assert_eq!(
            "QTCLUSTERIZER".parse::<ClusteringAlgorithm>().unwrap(),
            ClusteringAlgorithm::QTClusterizer
        );
        assert!("dbscan".parse::<ClusteringAlgorithm>().is_err());
    }

    #[test]
    fn no_particles_no_clusters() {
        let mut k = KClusterizer::new(3);
        k.clusterize(&[], 0.45);

        assert!(k.clusters().is_empty());
    }

    #[test]
    fn single_particle_single_cluster() {
        let mut k = KClusterizer::new(3);
        let p = PoseParticle::new(Pose::new(1.0, 2.0, 0.0), 1.0);
        k.clusterize(&[p], 0.45);

        assert_eq!(k.clusters().len(), 1);
        assert_eq!(k.clusters()[0].particles.len(), 1);
    }

    #[test]
    fn identical_particles_form_one_cluster() {
        let p = PoseParticle::new(Pose::new(1.0, 2.0, 0.3), 1.0);
        let ps = vec![p; 50];

        let mut k = KClusterizer::new(2);
        k.clusterize(&ps, 0.45);

        assert_eq!(k.clusters().len(), 1);
        assert_eq!(k.clusters()[0].particles.len(), 50);
    }

    #[test]
    fn two_blobs_two_clusters() {
        let mut ps = blob(2.0, 2.0, 60, 0.1);
        ps.extend(blob(6.0, 2.0, 60, 0.1));

        for algo in [ClusteringAlgorithm::KClusterizer, ClusteringAlgorithm::QTClusterizer] {
            let mut c = algo.build();
            c.set_max_cluster_number(2);
            c.clusterize(&ps, 0.45);

            assert_eq!(c.clusters().len(), 2, "{:?}", algo);
            assert_eq!(c.current_cluster_number(), 2);
        }
    }

    #[test]
    fn far_outliers_below_minimum_size_are_dropped() {
        let mut ps = blob(2.0, 2.0, 60, 0.1);
        ps.extend(blob(9.0, 9.0, 3, 0.05));

        let mut k = KClusterizer::new(1);
        k.clusterize(&ps, 0.45);

        assert_eq!(k.clusters().len(), 1);
        assert_eq!(k.clusters()[0].particles.len(), 60);
    }
}
