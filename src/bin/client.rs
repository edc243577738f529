//! `olaf-client` binary: connect to a server, send `hello`, print
//! whatever comes back. Not an interactive command shell (out of scope
//! per SPEC_FULL.md §1) — each stdin line is broadcast verbatim as a
//! `public_chat` message, nothing more.

use std::sync::Arc;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::Message;

use olaf_overlay::client::ClientEvent;
use olaf_overlay::codec;
use olaf_overlay::config::ClientConfig;
use olaf_overlay::crypto::KeyPair;
use olaf_overlay::ClientHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ClientConfig::parse();
    let keys = KeyPair::generate()?;
    let client = Arc::new(ClientHandle::new(keys, config.display_name.clone()));

    let (stream, _) = tokio_tungstenite::connect_async(config.server_uri.as_str()).await?;
    let (mut write, mut read) = stream.split();

    write.send(Message::Text(codec::emit(&client.build_hello()?)?)).await?;
    write
        .send(Message::Text(codec::emit(&client.build_client_list_request())?))
        .await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let stdin_client = client.clone();
    let stdin_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match stdin_client.build_public_chat(line) {
                Ok(frame) => match codec::emit(&frame) {
                    Ok(text) => {
                        if stdin_tx.send(Message::Text(text)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("failed to encode outgoing message: {e}"),
                },
                Err(e) => warn!("failed to build outgoing message: {e}"),
            }
        }
    });

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };
        let frame = match codec::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed frame from server: {e}");
                continue;
            }
        };
        match client.on_inbound_frame(&frame) {
            Ok(ClientEvent::ChatReceived { from_fingerprint, plaintext }) => {
                println!("[{from_fingerprint}] {}", plaintext.message);
            }
            Ok(ClientEvent::PublicChatReceived { sender, message }) => {
                println!("[public:{sender}] {message}");
            }
            Ok(ClientEvent::ClientListUpdated { known_clients }) => {
                info!("client list updated, {known_clients} known clients");
            }
            Ok(ClientEvent::UnknownSender) => {
                warn!("message from an unknown sender, requesting a fresh client list");
                let _ = tx.send(Message::Text(codec::emit(&client.build_client_list_request())?));
            }
            Ok(ClientEvent::Ignored) => {}
            Err(e) => warn!("dropping frame: {e}"),
        }
    }

    writer_task.abort();
    Ok(())
}
