use crate::circular_queue::CircularQueue;
use crate::config::{Config, Endpoint, WorldBounds};
use crate::error::Error;
use crate::filter::{ObjectParticleFilter, FILTER_NAME};
use crate::multi_agent::ObjectParticleFilterMultiAgent;
use crate::observation::{AgentReading, BoxRecord, Estimations, ObjectSensorReading, Observation};
use crate::packet::{self, Palette};
use crate::particle::Pose;
use crate::processor::Processor;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use nalgebra as na;
use serde_derive::Serialize;
use std::io::{self, BufRead, Write};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Capacity of the perception history.
pub const LAST_N_TARGET_PERCEPTIONS: usize = 200;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_PACKET_SIZE: usize = 65507;

#[derive(Debug, Serialize)]
struct ObjectResult {
    id: u32,
    h: f32,
    w: f32,
    xc: f32,
    yc: f32,
}

#[derive(Debug, Serialize)]
struct FrameResult {
    frame: usize,
    objects: Vec<ObjectResult>,
}

/// Sockets of an agent that shares its estimations.
#[derive(Debug)]
struct Network {
    peers: Vec<String>,
    message_period: u64,
    last_sent: Option<u64>,
    inbox: Receiver<AgentReading>,
    receiver: Option<JoinHandle<()>>,
}

/// Tracking agent: filters its own perceptions, shares the result with the
/// other agents and fuses what everybody shared.
#[derive(Debug)]
pub struct PTracker {
    agent_id: i32,
    address: String,
    port: u16,
    world: WorldBounds,
    processor: Processor<ObjectParticleFilter>,
    multi_agent: ObjectParticleFilterMultiAgent,
    history: CircularQueue<Observation>,
    fresh: usize,
    pose: Pose,
    last_ts: u64,
    iteration: usize,
    fusion_interval: usize,
    local_queue: Vec<AgentReading>,
    socket: Option<UdpSocket>,
    network: Option<Network>,
    viewer: Option<String>,
    ros_bridge: Option<String>,
    palette: Palette,
    alive: Arc<AtomicBool>,
}

fn endpoint(e: &Option<Endpoint>) -> Option<String> {
    e.as_ref()
        .filter(|e| e.enabled)
        .map(|e| format!("{}:{}", e.address, e.port))
}

fn spawn_receiver(
    socket: UdpSocket,
    tx: Sender<AgentReading>,
    alive: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, Error> {
    thread::Builder::new()
        .name("ptracker-receiver".into())
        .spawn(move || {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];

            while alive.load(Ordering::Relaxed) {
                let (n, from) = match socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                        continue
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "receive failed");
                        continue;
                    }
                };

                let text = String::from_utf8_lossy(&buf[..n]);

                match packet::decode_agent_reading(&text) {
                    Ok(reading) => match tx.try_send(reading) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!(%from, "agent queue full, dropping reading")
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    },
                    Err(e) => tracing::warn!(%from, error = %e, "discarding packet"),
                }
            }

            tracing::debug!("receiver stopped");
        })
        .map_err(Error::NetworkError)
}

impl PTracker {
    /// Builds the agent. `agent_id` overrides the configured one. Without an
    /// `agent` section the tracker runs standalone and shares nothing.
    pub fn new(cfg: &Config, agent_id: Option<i32>) -> Result<Self, Error> {
        let filter = ObjectParticleFilter::new(cfg)?;
        let multi_agent = ObjectParticleFilterMultiAgent::new(cfg);
        let alive = Arc::new(AtomicBool::new(true));

        let viewer = endpoint(&cfg.viewer);
        let ros_bridge = endpoint(&cfg.ros_bridge);

        let mut tracker_id = agent_id.unwrap_or(0);
        let mut address = "127.0.0.1".to_string();
        let mut port = 0;
        let mut fusion_interval = 1;
        let mut network = None;

        if let Some(agent) = &cfg.agent {
            tracker_id = agent_id.unwrap_or(agent.agent_id);

            let me = agent
                .agents
                .iter()
                .find(|a| a.id == tracker_id)
                .ok_or(Error::AgentNotListed(tracker_id))?;

            address = me.address.clone();
            port = me.port;
            fusion_interval = agent.fusion_interval.max(1);

            let listener = UdpSocket::bind(("0.0.0.0", port)).map_err(Error::NetworkError)?;
            listener
                .set_read_timeout(Some(RECEIVE_TIMEOUT))
                .map_err(Error::NetworkError)?;

            let (tx, rx) = channel::bounded(agent.max_queued_readings.max(1));
            let receiver = spawn_receiver(listener, tx, alive.clone())?;

            let peers = agent
                .agents
                .iter()
                .filter(|a| a.id != tracker_id)
                .map(|a| format!("{}:{}", a.address, a.port))
                .collect();

            let message_period = if agent.message_frequency > 0.0 {
                (1000.0 / agent.message_frequency) as u64
            } else {
                0
            };

            tracing::info!(agent_id = tracker_id, %address, port, "agent listening");

            network = Some(Network {
                peers,
                message_period,
                last_sent: None,
                inbox: rx,
                receiver: Some(receiver),
            });
        } else {
            tracing::info!(agent_id = tracker_id, "standalone mode");
        }

        let socket = if network.is_some() || viewer.is_some() || ros_bridge.is_some() {
            Some(UdpSocket::bind(("0.0.0.0", 0)).map_err(Error::NetworkError)?)
        } else {
            None
        };

        Ok(Self {
            agent_id: tracker_id,
            address,
            port,
            world: cfg.world()?,
            processor: Processor::new(filter, cfg.parameters.max_time_to_wait),
            multi_agent,
            history: CircularQueue::with_capacity(LAST_N_TARGET_PERCEPTIONS),
            fresh: 0,
            pose: Pose::default(),
            last_ts: 0,
            iteration: 0,
            fusion_interval,
            local_queue: Vec::new(),
            socket,
            network,
            viewer,
            ros_bridge,
            palette: Palette::new(),
            alive,
        })
    }

    #[inline]
    pub fn agent_id(&self) -> i32 {
        self.agent_id
    }

    #[inline]
    pub fn filter(&self) -> &ObjectParticleFilter {
        self.processor.filter()
    }

    #[inline]
    pub fn local_estimations(&self) -> &Estimations {
        self.processor.filter().estimations()
    }

    #[inline]
    pub fn global_estimations(&self) -> &Estimations {
        self.multi_agent.estimations()
    }

    pub fn set_agent_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }

    /// Appends new perceptions, in the agent frame, to the history.
    pub fn add_perceptions<I: IntoIterator<Item = Observation>>(&mut self, perceptions: I) {
        for obs in perceptions {
            self.history.push(obs);
            self.fresh += 1;
        }

        self.fresh = self.fresh.min(LAST_N_TARGET_PERCEPTIONS);
    }

    /// One tracking iteration at time `now` (ms) over the perceptions added
    /// since the previous one. Returns whether the fusion step ran.
    pub fn exec(&mut self, now: u64) -> bool {
        let fresh = std::mem::take(&mut self.fresh);

        let mut reading = ObjectSensorReading::new(FILTER_NAME);
        reading.set_agent_pose(self.pose);
        reading.set_observations_from_history(&self.history, fresh, &self.world);

        let perceptions: Vec<na::Point2<f32>> =
            reading.observations().iter().map(|o| o.cartesian()).collect();

        tracing::debug!(iteration = self.iteration + 1, perceptions = fresh, "new iteration");

        self.processor.process_reading(
            &self.pose,
            self.last_ts,
            now,
            std::slice::from_mut(&mut reading),
        );
        self.last_ts = now;

        let local = self.processor.filter().estimations();

        if !local.is_empty() {
            let shared = AgentReading {
                address: self.address.clone(),
                port: self.port,
                agent_pose: self.pose,
                estimations: local.clone(),
                timestamp: now,
            };

            self.share(&shared, now);
            self.local_queue.push(shared);
        }

        self.iteration += 1;

        if self.iteration % self.fusion_interval != 0 {
            return false;
        }

        let mut readings = std::mem::take(&mut self.local_queue);

        if let Some(net) = &self.network {
            readings.extend(net.inbox.try_iter());
        }

        self.multi_agent.observe(&readings, now);
        self.publish(&perceptions);

        true
    }

    fn share(&mut self, reading: &AgentReading, now: u64) {
        let (socket, net) = match (&self.socket, &mut self.network) {
            (Some(s), Some(n)) => (s, n),
            _ => return,
        };

        if let Some(last) = net.last_sent {
            if now.saturating_sub(last) <= net.message_period {
                return;
            }
        }

        let text = match packet::encode_agent_reading(reading) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "cannot encode agent reading");
                return;
            }
        };

        for peer in &net.peers {
            if let Err(e) = socket.send_to(text.as_bytes(), peer.as_str()) {
                tracing::warn!(%peer, error = %e, "sending to agent failed");
            }
        }

        net.last_sent = Some(now);
    }

    fn publish(&self, perceptions: &[na::Point2<f32>]) {
        let socket = match &self.socket {
            Some(s) => s,
            None => return,
        };

        let globals = self.multi_agent.estimations();

        if let Some(viewer) = &self.viewer {
            let text = packet::viewer_packet(
                self.agent_id,
                globals,
                perceptions,
                self.processor.filter().observations_mapping(),
                &self.palette,
            );

            if let Err(e) = socket.send_to(text.as_bytes(), viewer.as_str()) {
                tracing::warn!(error = %e, "sending to viewer failed");
            }
        }

        if let Some(ros) = &self.ros_bridge {
            if !globals.is_empty() {
                let line = packet::ros_bridge_line(globals);

                if let Err(e) = socket.send_to(line.as_bytes(), ros.as_str()) {
                    tracing::warn!(error = %e, "sending to ros bridge failed");
                }
            }
        }

        for (id, e) in globals {
            let p = e.cartesian();
            tracing::debug!(id, x = p.x, y = p.y, "global estimation");
        }
    }

    /// Replays an observation file, one JSON array of boxes per line, at
    /// `frame_rate` frames per second. With `realtime` set the replay sleeps
    /// between frames. Global estimations are written to `results` as one
    /// JSON object per frame. Stops early when `running` is cleared.
    pub fn run_offline<R: BufRead>(
        &mut self,
        frames: R,
        mut results: Option<&mut dyn Write>,
        frame_rate: f32,
        realtime: bool,
        running: &AtomicBool,
    ) -> Result<usize, Error> {
        let period = (1000.0 / frame_rate.max(0.001)) as u64;
        let mut count = 0;

        for (i, line) in frames.lines().enumerate() {
            if !running.load(Ordering::Relaxed) {
                tracing::info!(frame = i, "interrupted");
                break;
            }

            let line = line?;

            if line.trim().is_empty() {
                continue;
            }

            let boxes: Vec<BoxRecord> =
                serde_json::from_str(&line).map_err(|e| Error::ObservationFileError {
                    line: i + 1,
                    reason: e.to_string(),
                })?;

            self.add_perceptions(boxes.iter().map(Observation::from));
            self.exec(i as u64 * period);

            if let Some(out) = results.as_mut() {
                let result = FrameResult {
                    frame: i,
                    objects: self
                        .global_estimations()
                        .iter()
                        .map(|(id, e)| {
                            let p = e.cartesian();

                            ObjectResult {
                                id: *id,
                                h: e.observation.model.height,
                                w: e.observation.model.width,
                                xc: p.x,
                                yc: p.y,
                            }
                        })
                        .collect(),
                };

                serde_json::to_writer(&mut **out, &result).map_err(io::Error::from)?;
                writeln!(out)?;
            }

            count += 1;

            if realtime {
                thread::sleep(Duration::from_millis(period));
            }
        }

        if let Some(out) = results.as_mut() {
            out.flush()?;
        }

        Ok(count)
    }

    /// Stops the receiver thread and waits for it.
    pub fn shutdown(&mut self) {
        self.alive.store(false, Ordering::Relaxed);

        if let Some(handle) = self.network.as_mut().and_then(|n| n.receiver.take()) {
            if handle.join().is_err() {
                tracing::error!("receiver thread panicked");
            }
        }
    }
}

impl Drop for PTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
