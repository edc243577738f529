//! Per-frame routing decisions (spec.md §4.6): which local sockets and
//! which neighbour sockets a validated frame is forwarded to.

use log::{debug, warn};

use crate::codec::{Frame, SignedPayload};
use crate::directory::Directory;

/// Which kind of session a frame arrived on, for loop-prevention
/// (spec.md §4.6, §9.5): frames received from a `Neighbour` session are
/// never re-forwarded to other neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Neighbour,
}

/// Deliver a validated `signed_data/chat` or `signed_data/public_chat`
/// frame to local clients and (if it came from a client) to neighbours.
///
/// Tie-break: forwarding walks the directory in insertion order. A send
/// failure to one recipient never aborts the fan-out to the rest — the
/// failing connection is logged and left for its own reader task to tear
/// down.
pub fn route_signed(directory: &Directory, frame: &Frame, origin: Origin) {
    let Frame::SignedData { data, .. } = frame else {
        warn!("route_signed called with a non-signed_data frame");
        return;
    };

    match data {
        SignedPayload::Chat {
            destination_servers,
            ..
        } => {
            if destination_servers.iter().any(|d| d == directory.self_uri()) {
                deliver_to_locals(directory, frame);
            }
            if origin == Origin::Client {
                // destination_servers may repeat an address (one entry per
                // recipient, positionally aligned with symm_keys) — forward
                // to each distinct neighbour once.
                let mut forwarded = Vec::new();
                for uri in destination_servers {
                    if !forwarded.contains(uri) {
                        forward_to_neighbour(directory, uri, frame);
                        forwarded.push(uri.clone());
                    }
                }
            }
        }
        SignedPayload::PublicChat { .. } => {
            deliver_to_locals(directory, frame);
            if origin == Origin::Client {
                flood_to_neighbours(directory, frame);
            }
        }
        SignedPayload::Hello { .. } | SignedPayload::ServerHello { .. } => {
            debug!("hello/server_hello frames are not routed, only session transitions");
        }
    }
}

fn deliver_to_locals(directory: &Directory, frame: &Frame) {
    for (pem, handle) in directory.local_handles() {
        if !handle.send(frame) {
            warn!("failed to deliver frame to local client {pem}, marking for teardown");
        }
    }
}

fn forward_to_neighbour(directory: &Directory, uri: &str, frame: &Frame) {
    let Some(neighbour) = directory.find_neighbour(uri) else {
        return;
    };
    let Some(outbound) = neighbour.outbound() else {
        debug!("neighbour {uri} has no live outbound handle, skipping");
        return;
    };
    if !outbound.send(frame) {
        warn!("failed to forward frame to neighbour {uri}");
    }
}

/// Every directly-connected neighbour gets exactly one copy; a
/// disconnected neighbour (no live outbound handle) is skipped, never an
/// error (spec.md §9.4).
fn flood_to_neighbours(directory: &Directory, frame: &Frame) {
    for neighbour in directory.neighbours() {
        let Some(outbound) = neighbour.outbound() else {
            continue;
        };
        if !outbound.send(frame) {
            warn!("failed to flood frame to neighbour {}", neighbour.uri);
        }
    }
}

/// `broadcast_client_update`: tell every live neighbour about a change to
/// this server's local-client set, skipping neighbours with no live
/// outbound handle (spec.md §9.4).
pub fn broadcast_client_update(directory: &Directory) {
    let update = Frame::ClientUpdate {
        clients: directory.local_pems(),
        server_address: Some(directory.self_uri().to_string()),
    };
    for neighbour in directory.neighbours() {
        let Some(outbound) = neighbour.outbound() else {
            continue;
        };
        if !outbound.send(&update) {
            warn!("failed to send client_update to neighbour {}", neighbour.uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ConnHandle, NeighbourDescriptor};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn handle() -> (ConnHandle, mpsc::UnboundedReceiver<tokio_tungstenite::tungstenite::Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnHandle::new(tx), rx)
    }

    fn chat_frame(destination_servers: Vec<&str>) -> Frame {
        Frame::SignedData {
            data: SignedPayload::Chat {
                destination_servers: destination_servers.into_iter().map(String::from).collect(),
                iv: "aXY=".into(),
                symm_keys: vec!["a2V5".into()],
                chat: "Y2lwaGVy".into(),
            },
            counter: 1,
            signature: "c2ln".into(),
        }
    }

    #[test]
    fn chat_not_addressed_to_this_server_has_zero_local_deliveries() {
        let dir = Directory::new("ws://self:1", vec![]);
        let (h, mut rx) = handle();
        dir.add_local("pem-a".into(), h);

        let frame = chat_frame(vec!["ws://other:9"]);
        route_signed(&dir, &frame, Origin::Client);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn chat_addressed_here_reaches_every_local_client() {
        let dir = Directory::new("ws://self:1", vec![]);
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        dir.add_local("pem-a".into(), h1);
        dir.add_local("pem-b".into(), h2);

        let frame = chat_frame(vec!["ws://self:1"]);
        route_signed(&dir, &frame, Origin::Client);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn chat_from_client_forwards_only_to_listed_neighbours() {
        let listed = Arc::new(NeighbourDescriptor::new("ws://listed:2".into(), "pem".into()));
        let (nh, mut nrx) = handle();
        listed.set_outbound(Some(nh));

        let unlisted = Arc::new(NeighbourDescriptor::new("ws://unlisted:3".into(), "pem".into()));
        let (uh, mut urx) = handle();
        unlisted.set_outbound(Some(uh));

        let dir = Directory::new("ws://self:1", vec![listed, unlisted]);
        let frame = chat_frame(vec!["ws://self:1", "ws://listed:2"]);
        route_signed(&dir, &frame, Origin::Client);

        assert!(nrx.try_recv().is_ok());
        assert!(urx.try_recv().is_err());
    }

    #[test]
    fn chat_from_neighbour_is_never_reforwarded_to_other_neighbours() {
        let neighbour = Arc::new(NeighbourDescriptor::new("ws://n:2".into(), "pem".into()));
        let (nh, mut nrx) = handle();
        neighbour.set_outbound(Some(nh));

        let dir = Directory::new("ws://self:1", vec![neighbour]);
        let frame = chat_frame(vec!["ws://self:1", "ws://n:2"]);
        route_signed(&dir, &frame, Origin::Neighbour);

        assert!(nrx.try_recv().is_err());
    }

    #[test]
    fn public_chat_floods_locals_and_neighbours_exactly_once() {
        let neighbour = Arc::new(NeighbourDescriptor::new("ws://n:2".into(), "pem".into()));
        let (nh, mut nrx) = handle();
        neighbour.set_outbound(Some(nh));

        let dir = Directory::new("ws://self:1", vec![neighbour]);
        let (lh, mut lrx) = handle();
        dir.add_local("pem-a".into(), lh);

        let frame = Frame::SignedData {
            data: SignedPayload::PublicChat {
                sender: "c2VuZGVy".into(),
                message: "hi".into(),
            },
            counter: 1,
            signature: "c2ln".into(),
        };
        route_signed(&dir, &frame, Origin::Client);

        assert!(lrx.try_recv().is_ok());
        assert!(nrx.try_recv().is_ok());
        assert!(nrx.try_recv().is_err(), "delivered more than once");
    }

    #[test]
    fn public_chat_from_neighbour_does_not_reflood() {
        let n1 = Arc::new(NeighbourDescriptor::new("ws://n1:2".into(), "pem".into()));
        let (h1, mut rx1) = handle();
        n1.set_outbound(Some(h1));

        let dir = Directory::new("ws://self:1", vec![n1]);
        let frame = Frame::SignedData {
            data: SignedPayload::PublicChat {
                sender: "c2VuZGVy".into(),
                message: "hi".into(),
            },
            counter: 1,
            signature: "c2ln".into(),
        };
        route_signed(&dir, &frame, Origin::Neighbour);

        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn broadcast_client_update_skips_disconnected_neighbours() {
        let live = Arc::new(NeighbourDescriptor::new("ws://live:2".into(), "pem".into()));
        let (lh, mut lrx) = handle();
        live.set_outbound(Some(lh));
        let dead = Arc::new(NeighbourDescriptor::new("ws://dead:3".into(), "pem".into()));

        let dir = Directory::new("ws://self:1", vec![live, dead]);
        broadcast_client_update(&dir);

        assert!(lrx.try_recv().is_ok());
    }
}
