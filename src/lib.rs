//! Federated end-to-end encrypted chat overlay: per-server message
//! router plus the client-side signed/hybrid-encrypted envelope.
//!
//! The crate is split the way the spec's component design lays it out:
//! crypto primitives, wire codec, replay guard, directory, connection
//! session, router, neighbour linker, and the client envelope builder.

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod linker;
pub mod replay;
pub mod router;
pub mod server;
pub mod session;

pub use client::{ClientEvent, ClientHandle};
pub use codec::{ChatPlaintext, Frame, ServerClients, SignedPayload};
pub use crypto::KeyPair;
pub use error::{ChatError, Result};
