//! Bus transport: one endpoint, many senders, per-node delivery.

use crate::can::{CanEndpoint, CanRecord};
use crate::frame::Frame;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Inbox capacity per registered node.
const INBOX_DEPTH: usize = 32;

/// Owns one CAN endpoint. Transmissions from any number of senders are
/// serialised through an internal mutex; a background task demultiplexes
/// received frames to per-node inboxes by node id.
pub struct CanBus {
    endpoint: Arc<dyn CanEndpoint>,
    tx_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<HashMap<u32, mpsc::Sender<Frame>>>,
}

impl CanBus {
    /// Wraps an endpoint and starts the receive task. The task exits when
    /// the endpoint fails or the bus is dropped.
    pub fn open(endpoint: Arc<dyn CanEndpoint>) -> Arc<CanBus> {
        let bus = Arc::new(CanBus {
            endpoint: Arc::clone(&endpoint),
            tx_lock: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(HashMap::new()),
        });

        tokio::spawn(Self::receive_loop(Arc::downgrade(&bus), endpoint));

        bus
    }

    /// Registers the inbox receiving every frame addressed to `node_id`.
    pub fn add_listener(&self, node_id: u32, inbox: mpsc::Sender<Frame>) {
        self.listeners.lock().insert(node_id, inbox);
    }

    /// Creates and registers an inbox for `node_id`.
    pub fn listen(&self, node_id: u32) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        self.add_listener(node_id, tx);
        rx
    }

    /// Encodes and writes one frame. Only the write itself holds the bus
    /// mutex; transport errors surface here and are never retried at this
    /// layer.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let record = frame.encode()?;
        let _tx = self.tx_lock.lock().await;
        self.endpoint.send_record(&record).await?;
        Ok(())
    }

    async fn receive_loop(bus: Weak<CanBus>, endpoint: Arc<dyn CanEndpoint>) {
        loop {
            let record = match endpoint.recv_record().await {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "bus receive failed, stopping");
                    break;
                }
            };

            let Some(bus) = bus.upgrade() else { break };
            bus.dispatch(&record);
        }
    }

    fn dispatch(&self, record: &CanRecord) {
        let frame = match Frame::decode(record) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        let listeners = self.listeners.lock();
        match listeners.get(&frame.id) {
            Some(inbox) => {
                if let Err(e) = inbox.try_send(frame) {
                    warn!(error = %e, "inbox unavailable, dropping frame");
                }
            }
            None => debug!(id = frame.id, "no listener, dropping frame"),
        }
    }
}
