use ptrack::clusterizer::{ClusteringAlgorithm, MIN_SIZE_CLUSTER_AFTER_SPLITTING};
use ptrack::particle::{self, Pose, PoseParticle};

use nalgebra as na;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn population(seed: u64) -> Vec<PoseParticle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ps = Vec::new();

    for (cx, cy, n) in [(2.0, 2.0, 120), (8.0, 3.0, 80), (5.0, 9.0, 4)] {
        ps.extend(particle::sample_around(
            na::Point2::new(cx, cy),
            na::Vector2::new(0.05, 0.05),
            n,
            &mut rng,
        ));
    }

    ps
}

#[test]
fn clusters_partition_a_subset_of_the_input() {
    for algo in [ClusteringAlgorithm::KClusterizer, ClusteringAlgorithm::QTClusterizer] {
        for seed in 0..5 {
            let ps = population(seed);
            let mut c = algo.build();
            c.set_max_cluster_number(2);
            c.clusterize(&ps, 0.45);

            let mut seen: Vec<PoseParticle> = Vec::new();

            for cluster in c.clusters() {
                assert!(!cluster.particles.is_empty());

                for p in &cluster.particles {
                    assert!(ps.contains(p), "{:?}: foreign particle", algo);
                    assert!(!seen.contains(p), "{:?}: particle in two clusters", algo);
                    seen.push(*p);
                }
            }

            // the 4-particle blob is too small to survive
            assert!(c
                .clusters()
                .iter()
                .all(|cl| na::distance(&cl.centroid.point(), &na::Point2::new(5.0, 9.0)) > 1.0));
            assert!(c
                .clusters()
                .iter()
                .skip(1)
                .all(|cl| cl.particles.len() >= MIN_SIZE_CLUSTER_AFTER_SPLITTING));
        }
    }
}

#[test]
fn reclustering_is_stable() {
    let ps = population(11);

    for algo in [ClusteringAlgorithm::KClusterizer, ClusteringAlgorithm::QTClusterizer] {
        let mut c = algo.build();
        c.set_max_cluster_number(2);

        c.clusterize(&ps, 0.45);
        let first: Vec<Pose> = c.clusters().iter().map(|cl| cl.centroid).collect();

        c.clusterize(&ps, 0.45);
        let second: Vec<Pose> = c.clusters().iter().map(|cl| cl.centroid).collect();

        assert_eq!(first.len(), 2);
        assert_eq!(first.len(), second.len());

        for (a, b) in first.iter().zip(&second) {
            assert!(na::distance(&a.point(), &b.point()) < 1e-5);
        }
    }
}

#[test]
fn cluster_budget_limits_output() {
    let ps = population(3);
    let mut c = ClusteringAlgorithm::QTClusterizer.build();
    c.clusterize(&ps, 0.45);

    assert_eq!(c.current_cluster_number(), 1);
    assert_eq!(c.clusters().len(), 1);
    assert!(c.clusters()[0].particles.len() >= 110);
}
