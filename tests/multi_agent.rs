mod common;

use common::*;
use ptrack::{AgentReading, Estimation, Estimations, ObjectParticleFilterMultiAgent, Pose};

use nalgebra as na;

fn reading(port: u16, ts: u64, targets: &[(u32, f32, f32)]) -> AgentReading {
    let mut estimations = Estimations::new();

    for &(id, x, y) in targets {
        let mut obs = observation(x, y);
        obs.sigma = na::Vector2::new(0.1, 0.1);
        estimations.insert(id, Estimation::new(obs));
    }

    AgentReading {
        address: "127.0.0.1".into(),
        port,
        agent_pose: Pose::default(),
        estimations,
        timestamp: ts,
    }
}

#[test]
fn same_target_seen_by_two_agents_is_fused() {
    let mut f = ObjectParticleFilterMultiAgent::new(&config());

    f.observe(
        &[
            reading(9001, 1000, &[(1, 5.0, 5.0)]),
            reading(9002, 1000, &[(2, 5.1, 5.0)]),
        ],
        1000,
    );

    assert_eq!(f.estimations().len(), 1);

    let fused = f.estimations().values().next().unwrap();
    assert!(near(fused.cartesian(), 5.05, 5.0, 0.01));
    assert_eq!(f.particles().len(), 100);
}

#[test]
fn global_identity_follows_the_target() {
    let mut f = ObjectParticleFilterMultiAgent::new(&config());
    let mut x = 5.0;

    for t in (1000..3000).step_by(100) {
        f.observe(
            &[
                reading(9001, t, &[(3, x, 5.0)]),
                reading(9002, t, &[(8, x + 0.05, 5.0)]),
            ],
            t,
        );
        x += 0.05;
    }

    let ids: Vec<_> = f.estimations().keys().copied().collect();
    assert_eq!(ids, vec![3]);
    assert_eq!(f.source(3), Some(("127.0.0.1", 9001)));
}

#[test]
fn separate_targets_stay_separate() {
    let mut f = ObjectParticleFilterMultiAgent::new(&config());

    f.observe(
        &[
            reading(9001, 1000, &[(1, 2.0, 2.0), (2, 9.0, 9.0)]),
            reading(9002, 1000, &[(1, 2.1, 2.0)]),
        ],
        1000,
    );

    assert_eq!(f.estimations().len(), 2);
}
