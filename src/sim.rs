//! Simulated firmware node for bench work without hardware.
//!
//! Sits on the far end of a [`Loopback`] pair and speaks the node protocol:
//! answers version requests, stores staged targets and speeds, and steps its
//! simulated motors toward their targets over time. One instance serves
//! every node id reaching its endpoint.

use crate::can::{CanEndpoint, Loopback};
use crate::command::Command;
use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Counts moved per motion tick at full speed.
const MOTION_STEP: u32 = 4096;
const MOTION_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Clone, Copy)]
struct SimState {
    targets: [u16; 4],
    positions: [u16; 4],
    speeds: [u8; 4],
    halted: bool,
}

pub struct SimulatedNode {
    version: String,
    state: Mutex<SimState>,
}

impl SimulatedNode {
    /// Simulated firmware reporting version `0.1.0`.
    pub fn spawn(endpoint: Loopback) -> Arc<SimulatedNode> {
        Self::with_version(endpoint, "0.1.0")
    }

    /// Simulated firmware reporting an arbitrary version string; handy for
    /// exercising the handshake policy.
    pub fn with_version(endpoint: Loopback, version: &str) -> Arc<SimulatedNode> {
        let node = Arc::new(SimulatedNode {
            version: version.to_string(),
            state: Mutex::new(SimState::default()),
        });

        tokio::spawn(Self::serve(Arc::clone(&node), endpoint));
        tokio::spawn(Self::run_motion(Arc::downgrade(&node)));

        node
    }

    /// Where the simulated motors are right now.
    pub fn positions(&self) -> [u16; 4] {
        self.state.lock().positions
    }

    /// Forces the motors somewhere, as a bench script faking drift.
    pub fn set_positions(&self, positions: [u16; 4]) {
        self.state.lock().positions = positions;
    }

    async fn serve(node: Arc<SimulatedNode>, endpoint: Loopback) {
        loop {
            let Ok(record) = endpoint.recv_record().await else {
                break;
            };
            let Ok(Some(frame)) = Frame::decode(&record) else {
                continue;
            };

            let reply = node.handle(frame);
            let Ok(record) = reply.encode() else { continue };
            if endpoint.send_record(&record).await.is_err() {
                break;
            }
        }
        debug!("simulated node endpoint closed");
    }

    fn handle(&self, frame: Frame) -> Frame {
        let command = Command::parse(frame.cmd, &frame.data);
        let mut state = self.state.lock();

        let reply = match command {
            Command::Version(_) => Command::Version(self.version.clone()),
            Command::GetPosition(_) => Command::GetPosition(state.positions),
            Command::SetPosition(targets) => {
                state.targets = targets;
                Command::SetPosition(targets)
            }
            Command::SetSpeed(speeds) => {
                state.speeds = speeds;
                Command::SetSpeed(speeds)
            }
            Command::Home => {
                state.targets = [0; 4];
                state.positions = [0; 4];
                Command::Home
            }
            Command::AllStop => {
                state.halted = true;
                Command::AllStop
            }
            Command::AllStart => {
                state.halted = false;
                Command::AllStart
            }
            other => other,
        };

        Frame::new(frame.id, reply.code(), reply.tx_data())
    }

    async fn run_motion(node: Weak<SimulatedNode>) {
        let mut tick = tokio::time::interval(MOTION_INTERVAL);
        loop {
            tick.tick().await;
            let Some(node) = node.upgrade() else { break };
            node.step();
        }
    }

    fn step(&self) {
        let mut state = self.state.lock();
        if state.halted {
            return;
        }

        for i in 0..4 {
            let step = (MOTION_STEP * u32::from(state.speeds[i]) / 255) as i32;
            let current = i32::from(state.positions[i]);
            let target = i32::from(state.targets[i]);
            let delta = (target - current).clamp(-step, step);
            state.positions[i] = (current + delta) as u16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CanBus;
    use crate::command::codes;
    use crate::node::{NodeController, VersionPolicy};
    use crate::TalusError;

    async fn sim_node() -> (Arc<SimulatedNode>, Arc<NodeController>) {
        let (host, far) = Loopback::pair();
        let sim = SimulatedNode::spawn(far);
        let bus = CanBus::open(Arc::new(host));
        let node = NodeController::connect(bus, 0x2, Vec::new(), &VersionPolicy::default())
            .await
            .unwrap();
        (sim, node)
    }

    #[tokio::test(start_paused = true)]
    async fn motors_converge_on_their_targets() {
        let (sim, node) = sim_node().await;

        node.send(Command::SetSpeed([255, 128, 0, 0])).await.unwrap();
        node.send(Command::SetPosition([40960, 8192, 4096, 0]))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let positions = sim.positions();
        assert_eq!(positions[0], 40960);
        assert_eq!(positions[1], 8192);
        // speed zero never moves
        assert_eq!(positions[2], 0);

        let reported = node.refresh_positions().await.unwrap();
        assert_eq!(reported, positions);
    }

    #[tokio::test(start_paused = true)]
    async fn all_stop_freezes_motion_until_all_start() {
        let (sim, node) = sim_node().await;

        node.send(Command::SetSpeed([255; 4])).await.unwrap();
        node.send(Command::SetPosition([20000; 4])).await.unwrap();
        node.send(Command::AllStop).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sim.positions(), [0; 4]);

        node.send(Command::AllStart).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sim.positions(), [20000; 4]);
    }

    #[tokio::test]
    async fn home_returns_every_motor_to_zero() {
        let (sim, node) = sim_node().await;

        sim.set_positions([100, 200, 300, 400]);
        node.home().await.unwrap();
        assert_eq!(sim.positions(), [0; 4]);
    }

    #[tokio::test]
    async fn bad_version_fails_the_handshake() {
        let (host, far) = Loopback::pair();
        let _sim = SimulatedNode::with_version(far, "9.9.9");
        let bus = CanBus::open(Arc::new(host));
        let result = NodeController::connect(bus, 0x2, Vec::new(), &VersionPolicy::default()).await;
        assert!(matches!(
            result,
            Err(TalusError::VersionUnsupported { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_commands_echo_back() {
        let (_sim, node) = sim_node().await;
        let reply = node
            .send(Command::Unknown {
                code: codes::SCAN_I2C,
                data: vec![1, 2],
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Command::Unknown {
                code: codes::SCAN_I2C,
                data: vec![1, 2],
            }
        );
    }
}
