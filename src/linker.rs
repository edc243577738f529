//! Neighbour linker (spec.md §4.7): dials every configured neighbour,
//! performs the `server_hello` handshake, and keeps reconnecting with
//! backoff for as long as the server process runs.
//!
//! Grounded on the teacher's `discovery.rs` broadcast loop (a background
//! tokio task retrying on a timer) and `signaling.rs`'s reconnect-on-drop
//! pattern, generalized from UDP broadcast discovery to explicit
//! outbound WebSocket dials against a fixed neighbour list.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::{self, Frame, SignedPayload};
use crate::crypto::KeyPair;
use crate::directory::{ConnHandle, NeighbourDescriptor};
use crate::session::{ServerState, Session};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Spawn one reconnect-forever task per configured neighbour. `self_uri`
/// is this server's own address, sent as `server_hello`'s `sender`.
pub fn spawn_all(
    server: Arc<ServerState>,
    self_uri: String,
    self_keys: Arc<KeyPair>,
    neighbours: Vec<Arc<NeighbourDescriptor>>,
) {
    for neighbour in neighbours {
        let server = server.clone();
        let self_uri = self_uri.clone();
        let self_keys = self_keys.clone();
        tokio::spawn(async move {
            reconnect_loop(server, self_uri, self_keys, neighbour).await;
        });
    }
}

async fn reconnect_loop(
    server: Arc<ServerState>,
    self_uri: String,
    self_keys: Arc<KeyPair>,
    neighbour: Arc<NeighbourDescriptor>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match dial_once(&server, &self_uri, &self_keys, &neighbour).await {
            Ok(()) => {
                info!("neighbour link to {} closed cleanly, reconnecting", neighbour.uri);
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!("neighbour link to {} failed: {e}", neighbour.uri);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
        tokio::time::sleep(backoff).await;
    }
}

async fn dial_once(
    server: &Arc<ServerState>,
    self_uri: &str,
    self_keys: &KeyPair,
    neighbour: &Arc<NeighbourDescriptor>,
) -> crate::error::Result<()> {
    let (stream, _) = tokio_tungstenite::connect_async(neighbour.uri.as_str())
        .await
        .map_err(|e| crate::error::ChatError::NeighbourUnreachable(e.to_string()))?;
    let (mut write, mut read) = stream.split();

    let data = SignedPayload::ServerHello {
        sender: self_uri.to_string(),
    };
    let counter = 0;
    let signature = self_keys.sign(&data, counter)?;
    let hello = Frame::SignedData {
        data,
        counter,
        signature,
    };
    write
        .send(Message::Text(codec::emit(&hello)?))
        .await
        .map_err(|e| crate::error::ChatError::NeighbourUnreachable(e.to_string()))?;
    write
        .send(Message::Text(codec::emit(&Frame::ClientUpdateRequest)?))
        .await
        .map_err(|e| crate::error::ChatError::NeighbourUnreachable(e.to_string()))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = ConnHandle::new(tx);
    neighbour.set_outbound(Some(conn.clone()));

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new_neighbour(conn, server.clone(), neighbour.uri.clone());
    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|e| crate::error::ChatError::NeighbourUnreachable(e.to_string()))?;
        let Message::Text(text) = msg else { continue };
        let was_init = session.is_init();
        match codec::parse(&text) {
            Ok(frame) => {
                if let Err(e) = session.on_frame(frame) {
                    warn!("dropping frame from neighbour {}: {e}", neighbour.uri);
                    if was_init || matches!(e, crate::error::ChatError::SignatureInvalid) {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("malformed frame from neighbour {}: {e}", neighbour.uri);
                if was_init {
                    break;
                }
            }
        }
    }
    session.on_close();
    writer_task.abort();
    Ok(())
}
