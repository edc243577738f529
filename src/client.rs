//! Client-side envelope builder (spec.md §4.8): turns plaintext into a
//! signed, hybrid-encrypted `chat` frame, and turns an inbound frame
//! into either an update to the client's own view of the federation or
//! a decrypted message for the caller to display.
//!
//! Grounded on `original_source/src/client.py`'s `Client` class
//! (`send_hello`, `send_chat_message`, `request_client_list`,
//! `listen_for_chat_message`), reworked onto RSA/AES-GCM per
//! `src/crypto.rs` instead of the original's AES-CFB.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{info, warn};

use crate::codec::{ChatPlaintext, Frame, ServerClients, SignedPayload};
use crate::crypto::{self, KeyPair};
use crate::error::{ChatError, Result};
use crate::replay::ReplayGuard;

/// Something the caller (a CLI, a test) should react to after feeding a
/// frame through [`ClientHandle::on_inbound_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ClientListUpdated { known_clients: usize },
    ChatReceived {
        from_fingerprint: String,
        plaintext: ChatPlaintext,
    },
    PublicChatReceived { sender: String, message: String },
    UnknownSender,
    Ignored,
}

/// A connected client's local state: its own key pair, the federation
/// view built up from `client_list` responses, and the replay guard over
/// inbound messages (never forgotten, for the lifetime of the process —
/// see spec.md §4.3).
pub struct ClientHandle {
    keys: KeyPair,
    /// Optional display name (SPEC_FULL.md §4.8 supplement). Never sent
    /// on the wire; the `hello` payload stays exactly `{public_key}`.
    pub display_name: Option<String>,
    outgoing_counter: AtomicU64,
    pem_to_server: Mutex<HashMap<String, String>>,
    replay: ReplayGuard,
}

impl ClientHandle {
    pub fn new(keys: KeyPair, display_name: Option<String>) -> Self {
        Self {
            keys,
            display_name,
            outgoing_counter: AtomicU64::new(0),
            pem_to_server: Mutex::new(HashMap::new()),
            replay: ReplayGuard::new(),
        }
    }

    pub fn fingerprint(&self) -> Result<String> {
        self.keys.fingerprint()
    }

    fn next_counter(&self) -> u64 {
        self.outgoing_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// `SendHello`.
    pub fn build_hello(&self) -> Result<Frame> {
        let data = SignedPayload::Hello {
            public_key: self.keys.export_public()?,
        };
        let counter = self.next_counter();
        let signature = self.keys.sign(&data, counter)?;
        Ok(Frame::SignedData { data, counter, signature })
    }

    /// `RequestClientList`.
    pub fn build_client_list_request(&self) -> Frame {
        Frame::ClientListRequest
    }

    /// `SendChat`: `recipients` are the PEMs of every intended reader.
    /// Each gets its own RSA-OAEP-wrapped copy of a single fresh AES key;
    /// the payload does not name recipients directly, so an inbound
    /// reader identifies itself only by which wrapped key it can unwrap.
    pub fn build_chat(&self, recipients: &[String], plaintext: &ChatPlaintext) -> Result<Frame> {
        if recipients.is_empty() {
            return Err(ChatError::MalformedFrame("chat with no recipients".into()));
        }
        let sym_key = crypto::generate_sym_key();
        let iv = crypto::generate_iv();
        let plaintext_bytes = serde_json::to_vec(plaintext)?;
        let chat = crypto::sym_encrypt(&plaintext_bytes, &sym_key, &iv)?;

        // One entry per recipient in both lists, aligned positionally
        // (spec.md §3: "Entries align positionally with destination_servers").
        // Duplicates are intentional when two recipients share a home
        // server — other, non-this-crate implementations on the
        // federation may rely on that positional correspondence instead
        // of this crate's own "try every wrapped key" fallback.
        let mut symm_keys = Vec::with_capacity(recipients.len());
        let mut destination_servers = Vec::with_capacity(recipients.len());
        let pem_to_server = self.pem_to_server.lock().unwrap();
        for pem in recipients {
            let public = crypto::import_public(pem)?;
            symm_keys.push(crypto::wrap_key(&sym_key, &public)?);
            let server = pem_to_server.get(pem).cloned().ok_or_else(|| {
                ChatError::MalformedFrame("no known home server for recipient, refresh client list".into())
            })?;
            destination_servers.push(server);
        }
        drop(pem_to_server);

        let data = SignedPayload::Chat {
            destination_servers,
            iv: crypto::encode_iv(&iv),
            symm_keys,
            chat,
        };
        let counter = self.next_counter();
        let signature = self.keys.sign(&data, counter)?;
        Ok(Frame::SignedData { data, counter, signature })
    }

    /// `SendPublic`.
    pub fn build_public_chat(&self, message: impl Into<String>) -> Result<Frame> {
        let sender = BASE64.encode(self.fingerprint()?);
        let data = SignedPayload::PublicChat {
            sender,
            message: message.into(),
        };
        let counter = self.next_counter();
        let signature = self.keys.sign(&data, counter)?;
        Ok(Frame::SignedData { data, counter, signature })
    }

    /// `OnInboundFrame`: the single entry point for everything read off
    /// the wire.
    pub fn on_inbound_frame(&self, frame: &Frame) -> Result<ClientEvent> {
        match frame {
            Frame::ClientList { servers } => Ok(self.on_client_list(servers)),
            Frame::SignedData { data, counter, signature } => {
                self.on_signed_data(data, *counter, signature)
            }
            Frame::ClientListRequest | Frame::ClientUpdateRequest | Frame::ClientUpdate { .. } => {
                Ok(ClientEvent::Ignored)
            }
        }
    }

    fn on_client_list(&self, servers: &[ServerClients]) -> ClientEvent {
        let mut map = self.pem_to_server.lock().unwrap();
        map.clear();
        let mut count = 0;
        for entry in servers {
            for pem in &entry.clients {
                map.insert(pem.clone(), entry.address.clone());
                count += 1;
            }
        }
        info!("client list updated, {count} known clients across {} servers", servers.len());
        ClientEvent::ClientListUpdated { known_clients: count }
    }

    fn on_signed_data(&self, data: &SignedPayload, counter: u64, signature: &str) -> Result<ClientEvent> {
        match data {
            SignedPayload::Chat { symm_keys, iv, chat, .. } => {
                let Some((sender_pem, sender_fp)) = self.identify_sender(data, counter, signature)? else {
                    return Ok(ClientEvent::UnknownSender);
                };
                if !self.replay.check(&sender_fp, counter) {
                    return Err(ChatError::ReplayDetected {
                        counter,
                        stored: self.replay.stored_counter(&sender_fp).unwrap_or(0),
                    });
                }
                let _ = sender_pem;
                let iv = crypto::decode_iv(iv)?;
                let sym_key = symm_keys
                    .iter()
                    .find_map(|wrapped| self.keys.unwrap_key(wrapped).ok())
                    .ok_or(ChatError::DecryptionFailed)?;
                let plaintext = crypto::sym_decrypt(chat, &sym_key, &iv)?;
                let plaintext: ChatPlaintext = serde_json::from_slice(&plaintext)?;
                Ok(ClientEvent::ChatReceived {
                    from_fingerprint: sender_fp,
                    plaintext,
                })
            }
            SignedPayload::PublicChat { sender, message } => {
                let Some((_, sender_fp)) = self.identify_sender(data, counter, signature)? else {
                    return Ok(ClientEvent::UnknownSender);
                };
                if !self.replay.check(&sender_fp, counter) {
                    return Err(ChatError::ReplayDetected {
                        counter,
                        stored: self.replay.stored_counter(&sender_fp).unwrap_or(0),
                    });
                }
                Ok(ClientEvent::PublicChatReceived {
                    sender: sender.clone(),
                    message: message.clone(),
                })
            }
            SignedPayload::Hello { .. } | SignedPayload::ServerHello { .. } => {
                warn!("client received a handshake-only payload, ignoring");
                Ok(ClientEvent::Ignored)
            }
        }
    }

    /// Try every known PEM's public key until one verifies the
    /// signature. Returns `None` if no known sender matches — the
    /// caller should treat this as a signal to re-request the client
    /// list, per spec.md §4.8 (unknown sender -> drop, not an error).
    fn identify_sender(
        &self,
        data: &SignedPayload,
        counter: u64,
        signature: &str,
    ) -> Result<Option<(String, String)>> {
        let known_pems: Vec<String> = self.pem_to_server.lock().unwrap().keys().cloned().collect();
        for pem in known_pems {
            let Ok(public) = crypto::import_public(&pem) else { continue };
            if crypto::verify(data, counter, signature, &public) {
                return Ok(Some((pem.clone(), crypto::fingerprint_of_pem(&pem))));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ClientHandle {
        ClientHandle::new(KeyPair::generate().unwrap(), Some("alice".into()))
    }

    #[test]
    fn hello_then_client_list_populates_directory_view() {
        let alice = handle();
        let _ = alice.build_hello().unwrap();
        let bob_pem = KeyPair::generate().unwrap().export_public().unwrap();
        let event = alice.on_inbound_frame(&Frame::ClientList {
            servers: vec![ServerClients {
                address: "ws://s:1".into(),
                clients: vec![bob_pem],
            }],
        }).unwrap();
        assert_eq!(event, ClientEvent::ClientListUpdated { known_clients: 1 });
    }

    #[test]
    fn chat_round_trips_between_two_clients() {
        let alice = handle();
        let bob = handle();
        let alice_pem = alice.keys.export_public().unwrap();
        let bob_pem = bob.keys.export_public().unwrap();

        bob.on_inbound_frame(&Frame::ClientList {
            servers: vec![ServerClients {
                address: "ws://s:1".into(),
                clients: vec![alice_pem.clone(), bob_pem.clone()],
            }],
        }).unwrap();

        let plaintext = ChatPlaintext {
            participants: vec![alice_pem.clone(), bob_pem.clone()],
            message: "hi bob".into(),
        };
        let frame = alice.build_chat(&[bob_pem.clone()], &plaintext).unwrap();
        let event = bob.on_inbound_frame(&frame).unwrap();
        match event {
            ClientEvent::ChatReceived { plaintext: p, .. } => assert_eq!(p.message, "hi bob"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn chat_from_unknown_sender_is_reported_not_errored() {
        let alice = handle();
        let bob = handle();
        let bob_pem = bob.keys.export_public().unwrap();

        let plaintext = ChatPlaintext {
            participants: vec![bob_pem.clone()],
            message: "hi".into(),
        };
        let frame = alice.build_chat(&[bob_pem], &plaintext).unwrap();
        let event = bob.on_inbound_frame(&frame).unwrap();
        assert_eq!(event, ClientEvent::UnknownSender);
    }

    #[test]
    fn replayed_counter_from_known_sender_is_rejected() {
        let alice = handle();
        let bob = handle();
        let alice_pem = alice.keys.export_public().unwrap();
        let bob_pem = bob.keys.export_public().unwrap();
        bob.on_inbound_frame(&Frame::ClientList {
            servers: vec![ServerClients {
                address: "ws://s:1".into(),
                clients: vec![alice_pem, bob_pem.clone()],
            }],
        }).unwrap();

        let plaintext = ChatPlaintext { participants: vec![bob_pem.clone()], message: "hi".into() };
        let frame = alice.build_chat(&[bob_pem], &plaintext).unwrap();
        bob.on_inbound_frame(&frame).unwrap();
        let err = bob.on_inbound_frame(&frame).unwrap_err();
        assert!(matches!(err, ChatError::ReplayDetected { .. }));
    }

    #[test]
    fn public_chat_round_trips_without_encryption() {
        let alice = handle();
        let bob = handle();
        let alice_pem = alice.keys.export_public().unwrap();
        bob.on_inbound_frame(&Frame::ClientList {
            servers: vec![ServerClients { address: "ws://s:1".into(), clients: vec![alice_pem] }],
        }).unwrap();

        let frame = alice.build_public_chat("hello everyone").unwrap();
        let event = bob.on_inbound_frame(&frame).unwrap();
        match event {
            ClientEvent::PublicChatReceived { message, .. } => assert_eq!(message, "hello everyone"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
