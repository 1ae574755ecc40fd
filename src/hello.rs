//! Hello protocol (C5): every rank announces itself upward once at
//! startup; the root accumulates the set of ranks seen and, once every
//! rank in the session has checked in, triggers runlevel 1 (§4.5).

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::message::{Flags, Message};
use crate::router::Router;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub rank: u32,
}

/// Root-resident bookkeeping; meaningless (but harmless) on a non-root
/// rank, which never calls `record`.
pub struct HelloTracker {
    size: u32,
    seen: Mutex<HashSet<u32>>,
}

impl HelloTracker {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Record that `rank` has said hello. Returns `true` the first time
    /// every rank in `[0, size)` has been recorded — the runlevel 1
    /// trigger, fired exactly once.
    pub fn record(&self, rank: u32) -> bool {
        let mut seen = self.seen.lock().unwrap();
        let was_incomplete = seen.len() < self.size as usize;
        seen.insert(rank);
        was_incomplete && seen.len() == self.size as usize
    }

    pub fn count(&self) -> u32 {
        self.seen.lock().unwrap().len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.size
    }
}

/// Send this rank's hello upstream. A broker-local rank always calls this
/// once during bootstrap. The root has no parent to send to, so it records
/// itself directly rather than dispatching a message it could never route
/// anywhere.
pub async fn send_hello(router: &Router) -> Result<(), BrokerError> {
    if router.overlay.parent_of_self().is_none() {
        router.record_hello(router.rank());
        return Ok(());
    }
    let mut msg = Message::request("cmb.hello", router.rank(), 0, &HelloPayload { rank: router.rank() })?;
    msg.flags.set(Flags::UPSTREAM);
    msg.flags.set(Flags::NORESPONSE);
    router.dispatch(msg).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_reports_completion_exactly_once() {
        let tracker = HelloTracker::new(2);
        assert!(!tracker.record(0));
        assert!(tracker.record(1));
        // Recording an already-seen rank again must not re-fire complete.
        assert!(!tracker.record(1));
        assert!(tracker.is_complete());
    }

    #[test]
    fn count_reflects_distinct_ranks_seen() {
        let tracker = HelloTracker::new(5);
        tracker.record(0);
        tracker.record(2);
        tracker.record(2);
        assert_eq!(tracker.count(), 2);
    }
}
