//! Server process bootstrap: bind a WebSocket listener, spawn the
//! neighbour linker, and run one [`Session`] per accepted connection.
//!
//! Grounded on the teacher's `lib.rs` `run()` (wiring shared state once,
//! then handing every connection off to its own task) generalized from
//! Tauri's IPC surface to a plain `tokio`/`tokio-tungstenite` accept loop.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::crypto::KeyPair;
use crate::directory::{ConnHandle, Directory, NeighbourDescriptor};
use crate::error::Result;
use crate::linker;
use crate::session::{ServerState, Session};

/// Run the server until the listener errors out or the process is
/// killed. Never returns on success.
pub async fn run(config: ServerConfig, keys: KeyPair) -> Result<()> {
    info!("server identity fingerprint={}", keys.fingerprint()?);

    let mut neighbours = Vec::new();
    for neighbour in &config.neighbours {
        let public_key_pem = neighbour.load_public_key_pem()?;
        neighbours.push(Arc::new(NeighbourDescriptor::new(
            neighbour.uri.to_string(),
            public_key_pem,
        )));
    }

    let directory = Directory::new(config.self_uri.clone(), neighbours.clone());
    let server = Arc::new(ServerState::new(directory));
    let keys = Arc::new(keys);

    linker::spawn_all(server.clone(), config.self_uri.clone(), keys.clone(), neighbours);

    let listener = TcpListener::bind((config.bind_addr.as_str(), config.bind_port)).await?;
    info!("listening on {}:{}", config.bind_addr, config.bind_port);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, server).await {
                warn!("connection from {peer_addr} ended with error: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    server: Arc<ServerState>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|_| crate::error::ChatError::TransportClosed)?;
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = ConnHandle::new(tx);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(conn, server);
    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|_| crate::error::ChatError::TransportClosed)?;
        let Message::Text(text) = msg else { continue };
        let was_init = session.is_init();
        match crate::codec::parse(&text) {
            Ok(frame) => {
                if let Err(e) = session.on_frame(frame) {
                    warn!("dropping frame: {e}");
                    if was_init || matches!(e, crate::error::ChatError::SignatureInvalid) {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("malformed frame: {e}");
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
