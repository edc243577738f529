//! Local-client and neighbour-server tables, and the merged `client_list`
//! view (spec.md §4.4). Generalized from the teacher's `DiscoveryManager`
//! (`discovery.rs`) and `SignalingServer` (`signaling.rs`) peer tables,
//! which each keep a `HashMap` behind a lock plus a cached snapshot view —
//! here split into a client table (keyed by PEM) and a neighbour table
//! (keyed by URI, with its own cached remote-client list).

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::{Frame, ServerClients};

/// The send side of one connection's exclusive send critical section
/// (spec.md §5): a per-connection queue drained by a single writer task,
/// so fan-out from multiple router calls never interleaves partial
/// writes on the same socket.
#[derive(Clone)]
pub struct ConnHandle {
    sender: mpsc::UnboundedSender<Message>,
}

impl ConnHandle {
    pub fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self { sender }
    }

    /// Queue a frame for sending. A closed receiver (the writer task has
    /// exited) is reported so the caller can mark the connection for
    /// teardown; it is not a panic and does not abort the caller's fan-out.
    pub fn send(&self, frame: &Frame) -> bool {
        match crate::codec::emit(frame) {
            Ok(text) => self.sender.send(Message::Text(text)).is_ok(),
            Err(_) => false,
        }
    }
}

/// A peer server in the federation (spec.md §3's `Neighbours` entry).
pub struct NeighbourDescriptor {
    pub uri: String,
    pub public_key_pem: String,
    outbound: Mutex<Option<ConnHandle>>,
    remote_clients: Mutex<Vec<String>>,
}

impl NeighbourDescriptor {
    pub fn new(uri: String, public_key_pem: String) -> Self {
        Self {
            uri,
            public_key_pem,
            outbound: Mutex::new(None),
            remote_clients: Mutex::new(Vec::new()),
        }
    }

    pub fn set_outbound(&self, handle: Option<ConnHandle>) {
        *self.outbound.lock().unwrap() = handle;
    }

    pub fn outbound(&self) -> Option<ConnHandle> {
        self.outbound.lock().unwrap().clone()
    }

    pub fn is_live(&self) -> bool {
        self.outbound.lock().unwrap().is_some()
    }

    pub fn set_remote_clients(&self, clients: Vec<String>) {
        *self.remote_clients.lock().unwrap() = clients;
    }

    pub fn remote_clients(&self) -> Vec<String> {
        self.remote_clients.lock().unwrap().clone()
    }
}

/// Local-client and neighbour-server directory for one server process.
pub struct Directory {
    self_uri: String,
    /// PEM -> connection handle, in insertion order (the router forwards
    /// in directory insertion order, per spec.md §4.6).
    locals: RwLock<Vec<(String, ConnHandle)>>,
    neighbours: RwLock<Vec<Arc<NeighbourDescriptor>>>,
}

impl Directory {
    pub fn new(self_uri: impl Into<String>, neighbours: Vec<Arc<NeighbourDescriptor>>) -> Self {
        Self {
            self_uri: self_uri.into(),
            locals: RwLock::new(Vec::new()),
            neighbours: RwLock::new(neighbours),
        }
    }

    pub fn self_uri(&self) -> &str {
        &self.self_uri
    }

    /// `AddLocal`: idempotent insert, keyed by the client's PEM.
    pub fn add_local(&self, pem: String, handle: ConnHandle) {
        let mut locals = self.locals.write().unwrap();
        if let Some(entry) = locals.iter_mut().find(|(p, _)| p == &pem) {
            entry.1 = handle;
        } else {
            locals.push((pem, handle));
        }
    }

    /// `RemoveLocal`.
    pub fn remove_local(&self, pem: &str) {
        self.locals.write().unwrap().retain(|(p, _)| p != pem);
    }

    pub fn has_local(&self, pem: &str) -> bool {
        self.locals.read().unwrap().iter().any(|(p, _)| p == pem)
    }

    pub fn local_pems(&self) -> Vec<String> {
        self.locals.read().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    /// Local connection handles in directory insertion order.
    pub fn local_handles(&self) -> Vec<(String, ConnHandle)> {
        self.locals.read().unwrap().clone()
    }

    pub fn neighbours(&self) -> Vec<Arc<NeighbourDescriptor>> {
        self.neighbours.read().unwrap().clone()
    }

    pub fn find_neighbour(&self, uri: &str) -> Option<Arc<NeighbourDescriptor>> {
        self.neighbours
            .read()
            .unwrap()
            .iter()
            .find(|n| n.uri == uri)
            .cloned()
    }

    /// `UpdateNeighbourClients`: replaces the cached remote-client list for
    /// one neighbour. A `client_update` from an unconfigured neighbour is
    /// ignored (there is no descriptor to attach it to).
    pub fn update_neighbour_clients(&self, neighbour_uri: &str, clients: Vec<String>) {
        if let Some(neighbour) = self.find_neighbour(neighbour_uri) {
            neighbour.set_remote_clients(clients);
        }
    }

    /// `Snapshot`: the response to `client_list_request`.
    pub fn snapshot(&self) -> Frame {
        let mut servers = vec![ServerClients {
            address: self.self_uri.clone(),
            clients: self.local_pems(),
        }];
        for neighbour in self.neighbours() {
            servers.push(ServerClients {
                address: neighbour.uri.clone(),
                clients: neighbour.remote_clients(),
            });
        }
        Frame::ClientList { servers }
    }
}
