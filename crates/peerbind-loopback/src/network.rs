//! In-process session transport
//!
//! Every attached device gets one delivery task. Events for a device are
//! queued and handed to its manager in order, so data sent before a close
//! always arrives before the close.

use peerbind_auth::{AuthManager, SessionTransport};
use peerbind_core::{DmError, DmResult, SessionSide, DM_OK};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
enum Delivery {
    Opened {
        session_id: i32,
        side: SessionSide,
        result: i32,
    },
    Data {
        session_id: i32,
        data: Vec<u8>,
    },
    Closed {
        session_id: i32,
    },
}

struct Node {
    manager: Weak<AuthManager>,
    tx: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
}

/// Two endpoints of an open session
#[derive(Debug, Clone)]
struct Link {
    client: String,
    server: String,
}

impl Link {
    fn other(&self, udid: &str) -> Option<&str> {
        if self.client == udid {
            Some(&self.server)
        } else if self.server == udid {
            Some(&self.client)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Inner {
    nodes: Mutex<HashMap<String, Node>>,
    links: Mutex<HashMap<i32, Link>>,
    muted: Mutex<HashSet<String>>,
    next_session: AtomicI32,
}

impl Inner {
    fn enqueue(&self, udid: &str, delivery: Delivery) {
        if self.is_muted(udid) {
            debug!("{} is muted, dropping {:?}", udid, delivery);
            return;
        }
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        match nodes.get(udid) {
            Some(node) => {
                let _ = node.tx.send(delivery);
            }
            None => debug!("No device {} attached", udid),
        }
    }

    fn is_muted(&self, udid: &str) -> bool {
        let muted = self.muted.lock().unwrap_or_else(|e| e.into_inner());
        muted.contains(udid)
    }

    fn is_attached(&self, udid: &str) -> bool {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.contains_key(udid)
    }
}

/// A set of simulated devices that can open sessions to each other
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Inner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport endpoint for the device `udid`
    pub fn transport(&self, udid: &str) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            inner: self.inner.clone(),
            udid: udid.to_string(),
        })
    }

    /// Start delivering session events for `udid` to `manager`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, udid: &str, manager: &Arc<AuthManager>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver(Arc::downgrade(manager), rx));
        let node = Node {
            manager: Arc::downgrade(manager),
            tx,
            task,
        };
        let mut nodes = self.inner.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = nodes.insert(udid.to_string(), node) {
            old.task.abort();
        }
        info!("Attached {} to loopback network", udid);
    }

    pub fn detach(&self, udid: &str) {
        let mut nodes = self.inner.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = nodes.remove(udid) {
            node.task.abort();
        }
    }

    /// Silently drop everything addressed to `udid`
    pub fn set_muted(&self, udid: &str, muted: bool) {
        let mut set = self.inner.muted.lock().unwrap_or_else(|e| e.into_inner());
        if muted {
            set.insert(udid.to_string());
        } else {
            set.remove(udid);
        }
    }

    pub fn open_sessions(&self) -> usize {
        let links = self.inner.links.lock().unwrap_or_else(|e| e.into_inner());
        links.len()
    }

    /// Hand a relationship change to every other attached device.
    ///
    /// Returns how many entries the receivers removed in total.
    pub fn broadcast_relationship(&self, from_udid: &str, payload: &str) -> usize {
        let receivers: Vec<(String, Arc<AuthManager>)> = {
            let nodes = self.inner.nodes.lock().unwrap_or_else(|e| e.into_inner());
            nodes
                .iter()
                .filter(|(udid, _)| udid.as_str() != from_udid)
                .filter_map(|(udid, node)| node.manager.upgrade().map(|m| (udid.clone(), m)))
                .collect()
        };
        receivers
            .into_iter()
            .filter(|(udid, _)| !self.inner.is_muted(udid))
            .map(|(udid, manager)| {
                match manager.on_relationship_broadcast(from_udid, payload) {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!("{} rejected broadcast from {}: {}", udid, from_udid, e);
                        0
                    }
                }
            })
            .sum()
    }
}

async fn deliver(manager: Weak<AuthManager>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match delivery {
            Delivery::Opened {
                session_id,
                side,
                result,
            } => manager.on_session_opened(session_id, side, result),
            Delivery::Data { session_id, data } => manager.on_data_received(session_id, &data),
            Delivery::Closed { session_id } => manager.on_session_closed(session_id),
        }
    }
}

/// One device's view of the network
pub struct LoopbackTransport {
    inner: Arc<Inner>,
    udid: String,
}

impl LoopbackTransport {
    pub fn udid(&self) -> &str {
        &self.udid
    }
}

impl SessionTransport for LoopbackTransport {
    fn open_session(&self, peer_udid: &str) -> DmResult<i32> {
        if peer_udid == self.udid || !self.inner.is_attached(peer_udid) {
            warn!("{} cannot reach {}", self.udid, peer_udid);
            return Err(DmError::AuthOpenSessionFailed);
        }
        let session_id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut links = self.inner.links.lock().unwrap_or_else(|e| e.into_inner());
            links.insert(
                session_id,
                Link {
                    client: self.udid.clone(),
                    server: peer_udid.to_string(),
                },
            );
        }
        debug!("Session {}: {} -> {}", session_id, self.udid, peer_udid);
        self.inner.enqueue(
            peer_udid,
            Delivery::Opened {
                session_id,
                side: SessionSide::Server,
                result: DM_OK,
            },
        );
        self.inner.enqueue(
            &self.udid,
            Delivery::Opened {
                session_id,
                side: SessionSide::Client,
                result: DM_OK,
            },
        );
        Ok(session_id)
    }

    fn close_session(&self, session_id: i32) {
        let link = {
            let mut links = self.inner.links.lock().unwrap_or_else(|e| e.into_inner());
            match links.get(&session_id) {
                Some(link) if link.other(&self.udid).is_some() => links.remove(&session_id),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };
        if let Some(peer) = link.other(&self.udid) {
            debug!("{} closed session {}", self.udid, session_id);
            self.inner.enqueue(peer, Delivery::Closed { session_id });
        }
    }

    fn send_bytes(&self, session_id: i32, data: &[u8]) -> DmResult<()> {
        let peer = {
            let links = self.inner.links.lock().unwrap_or_else(|e| e.into_inner());
            links
                .get(&session_id)
                .and_then(|link| link.other(&self.udid))
                .map(str::to_string)
        };
        let Some(peer) = peer else {
            debug!("{} sending on closed session {}", self.udid, session_id);
            return Err(DmError::SessionClosed);
        };
        self.inner.enqueue(
            &peer,
            Delivery::Data {
                session_id,
                data: data.to_vec(),
            },
        );
        Ok(())
    }
}
