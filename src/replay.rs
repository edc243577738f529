//! Per-peer monotonic counter tracking — the replay guard (spec.md §4.3).

use std::collections::HashMap;
use std::sync::Mutex;

/// `Check(peer_id, counter)`:
/// - unknown peer: record the counter, accept;
/// - `counter > stored`: update, accept;
/// - otherwise: reject.
///
/// Counters are dropped when the keyed session goes away (server: on
/// client disconnect; client: never, for the lifetime of the process —
/// see spec.md §4.3).
pub struct ReplayGuard {
    stored: Mutex<HashMap<String, u64>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self {
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the frame should be accepted, `false` on replay.
    /// The check-and-update is atomic under the guard's own lock.
    pub fn check(&self, peer_id: &str, counter: u64) -> bool {
        let mut stored = self.stored.lock().unwrap();
        match stored.get(peer_id) {
            None => {
                stored.insert(peer_id.to_string(), counter);
                true
            }
            Some(&last) if counter > last => {
                stored.insert(peer_id.to_string(), counter);
                true
            }
            Some(_) => false,
        }
    }

    /// Drop a peer's counter entry (server: on client disconnect).
    pub fn forget(&self, peer_id: &str) {
        self.stored.lock().unwrap().remove(peer_id);
    }

    pub fn stored_counter(&self, peer_id: &str) -> Option<u64> {
        self.stored.lock().unwrap().get(peer_id).copied()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_from_unknown_peer_is_accepted() {
        let guard = ReplayGuard::new();
        assert!(guard.check("peer-a", 0));
        assert_eq!(guard.stored_counter("peer-a"), Some(0));
    }

    #[test]
    fn strictly_increasing_counters_are_accepted() {
        let guard = ReplayGuard::new();
        assert!(guard.check("peer-a", 1));
        assert!(guard.check("peer-a", 2));
        assert!(guard.check("peer-a", 100));
    }

    #[test]
    fn equal_or_lower_counter_is_rejected() {
        let guard = ReplayGuard::new();
        assert!(guard.check("peer-a", 5));
        assert!(!guard.check("peer-a", 5));
        assert!(!guard.check("peer-a", 4));
        // The stored counter is unchanged by the rejected attempts.
        assert_eq!(guard.stored_counter("peer-a"), Some(5));
    }

    #[test]
    fn forgetting_a_peer_resets_its_window() {
        let guard = ReplayGuard::new();
        guard.check("peer-a", 10);
        guard.forget("peer-a");
        assert!(guard.check("peer-a", 0));
    }
}
