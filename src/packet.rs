use crate::error::Error;
use crate::filter::ObservationsMapping;
use crate::math::{self, round_n};
use crate::observation::{AgentReading, Estimations};

use nalgebra as na;
use std::fmt::Write;

pub const AGENT_PACKET_HEADER: &str = "Agent";

const PALETTE_SIZE: usize = 50;

/// Drawing primitives understood by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Point2fOnMap = 0,
    Point2ofOnMap = 1,
    Point2fWithVelocityOnMap = 2,
    Line2dOnMap = 3,
    Circle = 4,
}

impl ObjectType {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

pub fn encode_agent_reading(reading: &AgentReading) -> Result<String, Error> {
    Ok(format!(
        "{} {}",
        AGENT_PACKET_HEADER,
        serde_json::to_string(reading)?
    ))
}

pub fn decode_agent_reading(text: &str) -> Result<AgentReading, Error> {
    let (header, body) = text
        .split_once(' ')
        .ok_or_else(|| Error::PacketError("missing header".to_string()))?;

    if header != AGENT_PACKET_HEADER {
        return Err(Error::PacketError(format!("unexpected header '{}'", header)));
    }

    serde_json::from_str(body).map_err(|e| Error::PacketError(e.to_string()))
}

/// Fixed identity -> color table, wrapping after 50 identities.
#[derive(Debug, Clone)]
pub struct Palette(Vec<String>);

impl Palette {
    pub fn new() -> Self {
        let mut colors = Vec::with_capacity(PALETTE_SIZE);

        for i in (0..256).step_by(63) {
            for j in (0..256).step_by(63) {
                for k in (0..256).step_by(128) {
                    colors.push(format!("#{:02x}{:02x}{:02x}", k, j, i));
                }
            }
        }

        Self(colors)
    }

    pub fn color(&self, id: u32) -> &str {
        let idx = (id.max(1) as usize - 1) % self.0.len();

        &self.0[idx]
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::new()
    }
}

/// Text packet for the viewer: a header declaring one drawing layer per
/// global estimation, one for the fresh perceptions and one per mapped
/// observation, followed by the matching payload items.
pub fn viewer_packet(
    agent_id: i32,
    estimations: &Estimations,
    perceptions: &[na::Point2<f32>],
    mapping: &ObservationsMapping,
    palette: &Palette,
) -> String {
    let layers = estimations.len() + usize::from(!perceptions.is_empty()) + mapping.len();
    let mut out = format!("{} {} ", agent_id, layers);

    // writing into a String cannot fail
    for id in estimations.keys() {
        let _ = write!(
            out,
            "EstimatedTargetModelsWithIdentityMultiAgent false {} 6 {} ",
            palette.color(*id),
            1.5 * agent_id as f32
        );
    }

    if !perceptions.is_empty() {
        out.push_str("TargetPerceptions false #0000ff 14 2");
    }

    for _ in mapping.iter() {
        out.push_str(" ObservationsMapping false #000000 0 2 ");
    }

    for est in estimations.values() {
        let p = est.cartesian();
        let end = math::estimated_position(p, est.observation.model.averaged_velocity, 1.0);

        let _ = write!(
            out,
            " 1 {} {} {} {} {}",
            ObjectType::Point2fWithVelocityOnMap.code(),
            round_n(p.x, 2),
            round_n(p.y, 2),
            round_n(end.x, 2),
            round_n(end.y, 2)
        );
    }

    if !perceptions.is_empty() {
        let _ = write!(out, " {}", perceptions.len());

        for p in perceptions {
            let _ = write!(
                out,
                " {} {} {}",
                ObjectType::Point2fOnMap.code(),
                round_n(p.x, 2),
                round_n(p.y, 2)
            );
        }
    }

    for (obs, centroid) in mapping.values() {
        let o = obs.cartesian();

        let _ = write!(
            out,
            " 1 {} {} {} {} {}",
            ObjectType::Line2dOnMap.code(),
            round_n(o.x, 2),
            round_n(o.y, 2),
            round_n(centroid.x, 2),
            round_n(centroid.y, 2)
        );
    }

    out
}

/// `id x y sigma_x sigma_y width height vx vy avx avy` per global
/// estimation, separated by ` ; `.
pub fn ros_bridge_line(estimations: &Estimations) -> String {
    estimations
        .iter()
        .map(|(id, e)| {
            let p = e.cartesian();
            let m = &e.observation.model;

            format!(
                "{} {} {} {} {} {} {} {} {} {} {}",
                id,
                p.x,
                p.y,
                e.sigma.x,
                e.sigma.y,
                m.width,
                m.height,
                m.velocity.x,
                m.velocity.y,
                m.averaged_velocity.x,
                m.averaged_velocity.y
            )
        })
        .collect::<Vec<_>>()
        .join(" ; ")
}
