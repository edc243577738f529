//! Process configuration (SPEC_FULL.md §10.3): a `clap`-derived struct
//! per binary, parsed once at startup. No interactive prompting, no
//! file-watching, no hot reload.

use clap::Parser;
use url::Url;

use crate::error::{ChatError, Result};

/// One configured neighbour: its URI and the path to its PEM-encoded
/// public key, pre-shared out of band (spec.md §3's `Neighbours` entry
/// carries the key alongside the address; this crate reads it from a
/// file rather than inlining PEM text on the command line).
#[derive(Debug, Clone)]
pub struct NeighbourArg {
    pub uri: Url,
    pub public_key_path: std::path::PathBuf,
}

impl std::str::FromStr for NeighbourArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (uri, path) = s
            .split_once('=')
            .ok_or_else(|| "expected URI=PATH_TO_PEM".to_string())?;
        Ok(Self {
            uri: Url::parse(uri).map_err(|e| e.to_string())?,
            public_key_path: path.into(),
        })
    }
}

impl NeighbourArg {
    pub fn load_public_key_pem(&self) -> Result<String> {
        std::fs::read_to_string(&self.public_key_path).map_err(ChatError::from)
    }
}

#[derive(Debug, Parser)]
#[command(name = "olaf-server", about = "Federated end-to-end encrypted chat overlay server")]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener on.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind_addr: String,

    /// Port to bind the WebSocket listener on.
    #[arg(long, default_value_t = 8765)]
    pub bind_port: u16,

    /// This server's own externally-reachable URI, used as `sender` in
    /// `server_hello` and as the `address` of its entry in `client_list`
    /// responses.
    #[arg(long)]
    pub self_uri: String,

    /// Neighbours to dial and link with on startup, as `URI=path/to/key.pem`.
    /// May be repeated.
    #[arg(long = "neighbour")]
    pub neighbours: Vec<NeighbourArg>,
}

#[derive(Debug, Parser)]
#[command(name = "olaf-client", about = "Federated end-to-end encrypted chat overlay client")]
pub struct ClientConfig {
    /// WebSocket URI of the server to connect to.
    #[arg(long)]
    pub server_uri: Url,

    /// Optional local display name (never sent on the wire).
    #[arg(long)]
    pub display_name: Option<String>,
}
