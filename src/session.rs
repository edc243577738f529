//! Per-connection state machine (spec.md §4.5): a socket starts in
//! `Init` knowing nothing, becomes either a `Client` or a `Neighbour` on
//! its first valid frame, and stays that way until the socket closes.

use std::sync::Arc;

use log::{info, warn};

use crate::codec::{Frame, SignedPayload};
use crate::crypto;
use crate::directory::{ConnHandle, Directory};
use crate::error::{ChatError, Result};
use crate::replay::ReplayGuard;
use crate::router::{self, Origin};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Init,
    Client { pem: String },
    Neighbour { uri: String },
    Closed,
}

/// Shared, cross-connection server context a [`Session`] routes against.
pub struct ServerState {
    pub directory: Directory,
    pub client_replay: ReplayGuard,
    pub neighbour_replay: ReplayGuard,
}

impl ServerState {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            client_replay: ReplayGuard::new(),
            neighbour_replay: ReplayGuard::new(),
        }
    }
}

/// One connection's state machine. Lives for the lifetime of a single
/// socket; `server.rs`'s accept loop owns one per task.
pub struct Session {
    state: SessionState,
    conn: ConnHandle,
    server: Arc<ServerState>,
}

impl Session {
    pub fn new(conn: ConnHandle, server: Arc<ServerState>) -> Self {
        Self {
            state: SessionState::Init,
            conn,
            server,
        }
    }

    /// Build a session already promoted to `Neighbour`, for the dialing
    /// side of a link (spec.md §4.7): the linker already knows which
    /// configured neighbour it reached, so its own read loop does not
    /// need to wait for a `server_hello` to identify the peer the way an
    /// inbound accept-side session does.
    pub fn new_neighbour(conn: ConnHandle, server: Arc<ServerState>, uri: String) -> Self {
        Self {
            state: SessionState::Neighbour { uri },
            conn,
            server,
        }
    }

    /// Whether this session is still unauthenticated. Callers use this
    /// (checked *before* [`Session::on_frame`], since a rejected first
    /// frame never promotes the state) to decide whether an `Err` from
    /// `on_frame` must tear the socket down rather than just be logged.
    pub fn is_init(&self) -> bool {
        matches!(self.state, SessionState::Init)
    }

    /// Process one inbound frame. An `Err` is the caller's signal to
    /// decide between soft rejection (log and keep reading) and tearing
    /// the socket down. Per spec.md §4.5/§7 the caller MUST tear down
    /// on `ChatError::SignatureInvalid` (at any state) and on any error
    /// encountered while [`Session::is_init`] was still true (an
    /// unauthenticated peer gets no second chance at the handshake) —
    /// calling [`Session::on_close`] afterward in both cases.
    pub fn on_frame(&mut self, frame: Frame) -> Result<()> {
        match self.state.clone() {
            SessionState::Init => self.on_init_frame(frame),
            SessionState::Client { pem } => self.on_client_frame(&pem, frame),
            SessionState::Neighbour { uri } => self.on_neighbour_frame(&uri, frame),
            SessionState::Closed => Err(ChatError::TransportClosed),
        }
    }

    /// Clean up directory/replay-guard state on socket close. Idempotent
    /// no-op from `Init` (nothing was ever registered).
    pub fn on_close(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Client { pem } => {
                self.server.directory.remove_local(&pem);
                self.server.client_replay.forget(&pem);
                router::broadcast_client_update(&self.server.directory);
                info!("client session closed, fingerprint={}", crypto::fingerprint_of_pem(&pem));
            }
            SessionState::Neighbour { uri } => {
                if let Some(neighbour) = self.server.directory.find_neighbour(&uri) {
                    neighbour.set_outbound(None);
                }
                self.server.neighbour_replay.forget(&uri);
                info!("neighbour session closed, uri={uri}");
            }
            SessionState::Init | SessionState::Closed => {}
        }
    }

    fn on_init_frame(&mut self, frame: Frame) -> Result<()> {
        let Frame::SignedData {
            data,
            counter,
            signature,
        } = &frame
        else {
            return Err(ChatError::MalformedFrame(
                "first frame must be signed_data/hello or signed_data/server_hello".into(),
            ));
        };

        match data {
            SignedPayload::Hello { public_key } => {
                let public = crypto::import_public(public_key)?;
                if !crypto::verify(data, *counter, signature, &public) {
                    return Err(ChatError::SignatureInvalid);
                }
                let pem = public_key.clone();
                if !self.server.client_replay.check(&pem, *counter) {
                    return Err(ChatError::ReplayDetected {
                        counter: *counter,
                        stored: self.server.client_replay.stored_counter(&pem).unwrap_or(0),
                    });
                }
                self.server.directory.add_local(pem.clone(), self.conn.clone());
                self.state = SessionState::Client { pem: pem.clone() };
                router::broadcast_client_update(&self.server.directory);
                self.conn.send(&self.server.directory.snapshot());
                info!("client hello accepted, fingerprint={}", crypto::fingerprint_of_pem(&pem));
                Ok(())
            }
            SignedPayload::ServerHello { sender } => {
                let neighbour = self
                    .server
                    .directory
                    .find_neighbour(sender)
                    .ok_or_else(|| ChatError::NeighbourUnreachable(sender.clone()))?;
                let public = crypto::import_public(&neighbour.public_key_pem)?;
                if !crypto::verify(data, *counter, signature, &public) {
                    return Err(ChatError::SignatureInvalid);
                }
                if !self.server.neighbour_replay.check(sender, *counter) {
                    return Err(ChatError::ReplayDetected {
                        counter: *counter,
                        stored: self.server.neighbour_replay.stored_counter(sender).unwrap_or(0),
                    });
                }
                neighbour.set_outbound(Some(self.conn.clone()));
                self.state = SessionState::Neighbour { uri: sender.clone() };
                info!("neighbour server_hello accepted, uri={sender}");
                Ok(())
            }
            SignedPayload::Chat { .. } | SignedPayload::PublicChat { .. } => Err(
                ChatError::MalformedFrame("chat frames require an established session".into()),
            ),
        }
    }

    fn on_client_frame(&mut self, pem: &str, frame: Frame) -> Result<()> {
        match frame {
            Frame::SignedData {
                ref data,
                counter,
                ref signature,
            } => {
                let public = crypto::import_public(pem)?;
                if !crypto::verify(data, counter, signature, &public) {
                    return Err(ChatError::SignatureInvalid);
                }
                if !self.server.client_replay.check(pem, counter) {
                    return Err(ChatError::ReplayDetected {
                        counter,
                        stored: self.server.client_replay.stored_counter(pem).unwrap_or(0),
                    });
                }
                match data {
                    SignedPayload::Chat { .. } | SignedPayload::PublicChat { .. } => {
                        router::route_signed(&self.server.directory, &frame, Origin::Client);
                        Ok(())
                    }
                    SignedPayload::Hello { .. } | SignedPayload::ServerHello { .. } => Err(
                        ChatError::MalformedFrame("hello frame outside of Init state".into()),
                    ),
                }
            }
            Frame::ClientListRequest => {
                self.conn.send(&self.server.directory.snapshot());
                Ok(())
            }
            Frame::ClientUpdateRequest | Frame::ClientUpdate { .. } => Err(
                ChatError::MalformedFrame("client_update is a server-to-server frame".into()),
            ),
        }
    }

    fn on_neighbour_frame(&mut self, uri: &str, frame: Frame) -> Result<()> {
        match frame {
            Frame::SignedData {
                ref data,
                counter,
                ref signature,
            } => {
                let neighbour = self
                    .server
                    .directory
                    .find_neighbour(uri)
                    .ok_or_else(|| ChatError::NeighbourUnreachable(uri.to_string()))?;
                let public = crypto::import_public(&neighbour.public_key_pem)?;
                if !crypto::verify(data, counter, signature, &public) {
                    return Err(ChatError::SignatureInvalid);
                }
                if !self.server.neighbour_replay.check(uri, counter) {
                    return Err(ChatError::ReplayDetected {
                        counter,
                        stored: self.server.neighbour_replay.stored_counter(uri).unwrap_or(0),
                    });
                }
                match data {
                    SignedPayload::Chat { .. } | SignedPayload::PublicChat { .. } => {
                        router::route_signed(&self.server.directory, &frame, Origin::Neighbour);
                        Ok(())
                    }
                    SignedPayload::Hello { .. } | SignedPayload::ServerHello { .. } => Err(
                        ChatError::MalformedFrame("server_hello outside of Init state".into()),
                    ),
                }
            }
            Frame::ClientListRequest => {
                self.conn.send(&self.server.directory.snapshot());
                Ok(())
            }
            Frame::ClientUpdateRequest => {
                self.conn.send(&Frame::ClientUpdate {
                    clients: self.server.directory.local_pems(),
                    server_address: Some(self.server.directory.self_uri().to_string()),
                });
                Ok(())
            }
            Frame::ClientUpdate { clients, .. } => {
                self.server.directory.update_neighbour_clients(uri, clients);
                Ok(())
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            warn!("session dropped without an explicit on_close call");
            self.on_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn session() -> (Session, mpsc::UnboundedReceiver<tokio_tungstenite::tungstenite::Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnHandle::new(tx);
        let server = Arc::new(ServerState::new(Directory::new("ws://self:1", vec![])));
        (Session::new(conn, server), rx)
    }

    fn hello_frame(kp: &KeyPair, counter: u64) -> Frame {
        let data = SignedPayload::Hello {
            public_key: kp.export_public().unwrap(),
        };
        let signature = kp.sign(&data, counter).unwrap();
        Frame::SignedData {
            data,
            counter,
            signature,
        }
    }

    #[test]
    fn valid_hello_promotes_to_client_and_replies_with_client_list() {
        let (mut s, mut rx) = session();
        let kp = KeyPair::generate().unwrap();
        s.on_frame(hello_frame(&kp, 0)).unwrap();
        assert!(matches!(s.state, SessionState::Client { .. }));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn hello_with_mismatched_signature_is_rejected() {
        let (mut s, _rx) = session();
        let kp = KeyPair::generate().unwrap();
        let mut frame = hello_frame(&kp, 0);
        if let Frame::SignedData { ref mut signature, .. } = frame {
            signature.replace_range(0..1, if signature.starts_with('A') { "B" } else { "A" });
        }
        let err = s.on_frame(frame).unwrap_err();
        assert!(matches!(err, ChatError::SignatureInvalid));
        assert!(matches!(s.state, SessionState::Init));
    }

    #[test]
    fn non_hello_frame_in_init_state_is_rejected() {
        let (mut s, _rx) = session();
        let err = s.on_frame(Frame::ClientListRequest).unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
    }

    #[test]
    fn replayed_counter_after_hello_is_rejected() {
        let (mut s, _rx) = session();
        let kp = KeyPair::generate().unwrap();
        s.on_frame(hello_frame(&kp, 5)).unwrap();

        let data = SignedPayload::PublicChat {
            sender: "c2VuZGVy".into(),
            message: "hi".into(),
        };
        let signature = kp.sign(&data, 5).unwrap();
        let frame = Frame::SignedData {
            data,
            counter: 5,
            signature,
        };
        let err = s.on_frame(frame).unwrap_err();
        assert!(matches!(err, ChatError::ReplayDetected { .. }));
    }

    #[test]
    fn on_close_removes_client_from_directory() {
        let (mut s, _rx) = session();
        let kp = KeyPair::generate().unwrap();
        s.on_frame(hello_frame(&kp, 0)).unwrap();
        let pem = kp.export_public().unwrap();
        assert!(s.server.directory.has_local(&pem));
        s.on_close();
        assert!(!s.server.directory.has_local(&pem));
    }

    #[test]
    fn client_session_rejects_client_update_frame() {
        let (mut s, _rx) = session();
        let kp = KeyPair::generate().unwrap();
        s.on_frame(hello_frame(&kp, 0)).unwrap();
        let err = s
            .on_frame(Frame::ClientUpdate {
                clients: vec![],
                server_address: None,
            })
            .unwrap_err();
        assert!(matches!(err, ChatError::MalformedFrame(_)));
        let _ = json!({});
    }
}
