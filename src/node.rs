//! Node controller: reliable command exchanges with one firmware node.
//!
//! A node is one microcontroller on the bus driving up to four actuators.
//! `send` turns a one-shot command into a correlated exchange over a lossy,
//! reorderable bus: register a reply slot, transmit, retry on timeout, and
//! resolve to exactly one of reply / abort / retry-exhaustion / transport
//! error.

use crate::actuator::Actuator;
use crate::bus::CanBus;
use crate::command::{codes, Command};
use crate::frame::Frame;
use crate::{Result, TalusError};
use parking_lot::Mutex;
use semver::{Version, VersionReq};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Transmissions attempted before a send gives up.
pub const CMD_MAX_RETRIES: usize = 5;
/// Wait per transmission before retrying.
pub const CMD_TIMEOUT: Duration = Duration::from_millis(50);
/// Ceiling on the commit barrier.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Default firmware requirement.
pub const NODE_VERSION_REQ: &str = "~0.1.0";

/// Accepted firmware identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareVersion {
    Release(Version),
    Dev,
    Commit(String),
}

/// What firmware a node may run. Checked once, at construction.
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    pub requirement: VersionReq,
    pub allow_dev: bool,
    pub allowed_commits: Vec<String>,
}

impl Default for VersionPolicy {
    fn default() -> Self {
        VersionPolicy {
            requirement: VersionReq::parse(NODE_VERSION_REQ)
                .expect("default version requirement parses"),
            allow_dev: true,
            allowed_commits: Vec::new(),
        }
    }
}

impl VersionPolicy {
    /// Classifies a version reply. Accepts a semver release satisfying the
    /// requirement, the literal `DEV` while dev boards are allowed, or a
    /// 7-character commit hash on the allow-list.
    pub fn check(&self, node: u32, raw: &str) -> Result<FirmwareVersion> {
        if let Ok(version) = Version::parse(raw) {
            return if self.requirement.matches(&version) {
                Ok(FirmwareVersion::Release(version))
            } else {
                Err(TalusError::VersionUnsupported {
                    node,
                    version: raw.to_string(),
                    required: self.requirement.to_string(),
                })
            };
        }

        if raw == "DEV" && self.allow_dev {
            warn!(node, "running on DEV firmware");
            return Ok(FirmwareVersion::Dev);
        }

        if raw.len() == 7
            && raw.chars().all(|c| c.is_ascii_hexdigit())
            && self.allowed_commits.iter().any(|c| c == raw)
        {
            return Ok(FirmwareVersion::Commit(raw.to_string()));
        }

        Err(TalusError::UnknownVersion {
            node,
            version: raw.to_string(),
        })
    }
}

struct PendingSlot {
    resp: oneshot::Sender<Command>,
    abort: oneshot::Sender<()>,
}

/// Releases the correlation slot and the pending-work counter on every exit
/// path out of `send`, including cancellation.
struct SendGuard<'a> {
    node: &'a NodeController,
    key: u16,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.node.pending.lock().remove(&self.key);
        self.node.inflight.send_modify(|n| *n -= 1);
    }
}

pub struct NodeController {
    id: u32,
    bus: Arc<CanBus>,
    actuators: Vec<Arc<Actuator>>,
    pending: Mutex<HashMap<u16, PendingSlot>>,
    inflight: watch::Sender<usize>,
    tx_lock: tokio::sync::Mutex<()>,
    firmware: OnceLock<FirmwareVersion>,
}

impl NodeController {
    /// Registers with the bus, starts the listen task, then validates the
    /// node's firmware. A failed handshake fails construction.
    pub async fn connect(
        bus: Arc<CanBus>,
        id: u32,
        actuators: Vec<Arc<Actuator>>,
        policy: &VersionPolicy,
    ) -> Result<Arc<NodeController>> {
        if actuators.len() > 4 {
            return Err(TalusError::Config(format!(
                "node {id} configured with {} actuators, max 4",
                actuators.len()
            )));
        }

        let (inflight, _) = watch::channel(0);
        let node = Arc::new(NodeController {
            id,
            bus: Arc::clone(&bus),
            actuators,
            pending: Mutex::new(HashMap::new()),
            inflight,
            tx_lock: tokio::sync::Mutex::new(()),
            firmware: OnceLock::new(),
        });

        let inbox = bus.listen(id);
        tokio::spawn(Self::listen(Arc::downgrade(&node), inbox));

        let reply = node.send(Command::Version(String::new())).await?;
        let raw = match reply {
            Command::Version(raw) => raw,
            other => {
                return Err(TalusError::UnknownVersion {
                    node: id,
                    version: format!("unexpected reply 0x{:04X}", other.code()),
                })
            }
        };
        let firmware = policy.check(id, &raw)?;
        debug!(node = id, firmware = ?firmware, "node connected");
        let _ = node.firmware.set(firmware);

        Ok(node)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn actuators(&self) -> &[Arc<Actuator>] {
        &self.actuators
    }

    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.firmware.get().cloned()
    }

    /// Outstanding sends, as seen by the commit barrier.
    pub fn pending_sends(&self) -> usize {
        *self.inflight.borrow()
    }

    /// Sends a command and awaits the correlated reply.
    ///
    /// Exactly one of four outcomes: the parsed reply, `SendAborted` when a
    /// reset closes the slot, `MaxRetries` once the retries are exhausted,
    /// or the transport error from a failed write (never retried).
    pub async fn send(&self, cmd: Command) -> Result<Command> {
        let key = cmd.key();
        let frame = Frame::new(self.id, cmd.code(), cmd.tx_data());

        let (resp_tx, mut resp_rx) = oneshot::channel();
        let (abort_tx, mut abort_rx) = oneshot::channel();
        // Last writer wins on a key collision, as in the pending map this
        // replaces; the displaced sender observes an abort.
        self.pending.lock().insert(
            key,
            PendingSlot {
                resp: resp_tx,
                abort: abort_tx,
            },
        );
        self.inflight.send_modify(|n| *n += 1);
        let _guard = SendGuard { node: self, key };

        for attempt in 1..=CMD_MAX_RETRIES {
            self.transmit(&frame).await?;

            tokio::select! {
                biased;
                reply = &mut resp_rx => {
                    return reply.map_err(|_| TalusError::SendAborted);
                }
                _ = &mut abort_rx => {
                    return Err(TalusError::SendAborted);
                }
                _ = tokio::time::sleep(CMD_TIMEOUT) => {
                    if attempt < CMD_MAX_RETRIES {
                        trace!(
                            node = self.id,
                            code = format_args!("0x{key:04X}"),
                            attempt,
                            "no reply, retransmitting"
                        );
                    }
                }
            }
        }

        Err(TalusError::MaxRetries { code: frame.cmd })
    }

    /// Waits for every outstanding send to resolve, then issues the
    /// coordinated start.
    pub async fn commit(&self) -> Result<()> {
        let mut inflight = self.inflight.subscribe();
        tokio::time::timeout(COMMIT_TIMEOUT, inflight.wait_for(|&n| n == 0))
            .await
            .map_err(|_| TalusError::CommitTimeout)?
            .map_err(|_| TalusError::CommitTimeout)?;

        self.send(Command::AllStart).await?;
        Ok(())
    }

    /// Aborts every outstanding send, then stops the node. Aborted callers
    /// observe `SendAborted`; the node should be re-commanded from scratch.
    pub async fn reset(&self) -> Result<()> {
        let slots: Vec<PendingSlot> = self
            .pending
            .lock()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            let _ = slot.abort.send(());
        }

        self.send(Command::AllStop).await?;
        Ok(())
    }

    /// Transmits every actuator's staged target. Unpopulated slots are zero.
    pub async fn set_targets(&self) -> Result<()> {
        let mut targets = [0u16; 4];
        for (i, actuator) in self.actuators.iter().enumerate() {
            targets[i] = actuator.target_counts();
        }
        self.send(Command::SetPosition(targets)).await?;
        Ok(())
    }

    /// Transmits every actuator's staged speed. Unpopulated slots are zero.
    pub async fn set_speeds(&self) -> Result<()> {
        let mut speeds = [0u8; 4];
        for (i, actuator) in self.actuators.iter().enumerate() {
            speeds[i] = actuator.max_speed();
        }
        self.send(Command::SetSpeed(speeds)).await?;
        for actuator in &self.actuators {
            actuator.mark_speed_sent();
        }
        Ok(())
    }

    pub async fn home(&self) -> Result<()> {
        self.send(Command::Home).await?;
        Ok(())
    }

    /// Sets the firmware's position report interval.
    pub async fn update_interval(&self, interval: Duration) -> Result<()> {
        let ms = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);
        self.send(Command::UpdateInterval(ms)).await?;
        Ok(())
    }

    /// One position exchange. The listen task refreshes actuator state from
    /// the reply before it lands here.
    pub async fn refresh_positions(&self) -> Result<[u16; 4]> {
        match self.send(Command::GetPosition([0; 4])).await? {
            Command::GetPosition(positions) => Ok(positions),
            other => Err(TalusError::BadFrame(format!(
                "unexpected reply 0x{:04X} to a position request",
                other.code()
            ))),
        }
    }

    async fn transmit(&self, frame: &Frame) -> Result<()> {
        let _tx = self.tx_lock.lock().await;
        self.bus.send(frame).await
    }

    async fn listen(node: Weak<NodeController>, mut inbox: mpsc::Receiver<Frame>) {
        while let Some(frame) = inbox.recv().await {
            let Some(node) = node.upgrade() else { break };
            node.handle_frame(frame);
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let reply = Command::parse(frame.cmd, &frame.data);

        // Position reports refresh actuator state whether or not anyone is
        // waiting on them.
        if let Command::GetPosition(positions) = &reply {
            for (i, actuator) in self.actuators.iter().enumerate() {
                actuator.set_current_counts(positions[i]);
            }
        }

        let key = reply.key();
        match self.pending.lock().remove(&key) {
            Some(slot) => {
                if slot.resp.send(reply).is_err() {
                    trace!(node = self.id, key, "caller gone before its reply");
                }
            }
            None => trace!(
                node = self.id,
                key = format_args!("0x{key:04X}"),
                "reply with no pending command, dropped"
            ),
        }
    }
}
