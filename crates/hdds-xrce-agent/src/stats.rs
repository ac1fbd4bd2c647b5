// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session counters.
//!
//! Updated by the session worker with relaxed atomic increments and read
//! from any thread through [`SessionStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters of one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    datagrams_received: AtomicU64,
    datagrams_sent: AtomicU64,
    messages_delivered: AtomicU64,
    messages_sent: AtomicU64,
    retransmissions: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    acknacks_sent: AtomicU64,
    acknacks_received: AtomicU64,
    duplicates: AtomicU64,
    discarded_messages: AtomicU64,
    protocol_violations: AtomicU64,
    send_failures: AtomicU64,
    resets: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub messages_delivered: u64,
    pub messages_sent: u64,
    pub retransmissions: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub acknacks_sent: u64,
    pub acknacks_received: u64,
    pub duplicates: u64,
    /// Partial messages dropped before reassembly completed.
    pub discarded_messages: u64,
    pub protocol_violations: u64,
    pub send_failures: u64,
    pub resets: u64,
}

macro_rules! counter {
    ($($add:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $add(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        add_datagrams_received => datagrams_received,
        add_datagrams_sent => datagrams_sent,
        add_messages_delivered => messages_delivered,
        add_messages_sent => messages_sent,
        add_retransmissions => retransmissions,
        add_heartbeats_sent => heartbeats_sent,
        add_heartbeats_received => heartbeats_received,
        add_acknacks_sent => acknacks_sent,
        add_acknacks_received => acknacks_received,
        add_duplicates => duplicates,
        add_discarded_messages => discarded_messages,
        add_protocol_violations => protocol_violations,
        add_send_failures => send_failures,
        add_resets => resets,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            datagrams_received: load(&self.datagrams_received),
            datagrams_sent: load(&self.datagrams_sent),
            messages_delivered: load(&self.messages_delivered),
            messages_sent: load(&self.messages_sent),
            retransmissions: load(&self.retransmissions),
            heartbeats_sent: load(&self.heartbeats_sent),
            heartbeats_received: load(&self.heartbeats_received),
            acknacks_sent: load(&self.acknacks_sent),
            acknacks_received: load(&self.acknacks_received),
            duplicates: load(&self.duplicates),
            discarded_messages: load(&self.discarded_messages),
            protocol_violations: load(&self.protocol_violations),
            send_failures: load(&self.send_failures),
            resets: load(&self.resets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = SessionStats::new();
        stats.add_retransmissions(3);
        stats.add_retransmissions(1);
        stats.add_duplicates(2);
        let snap = stats.snapshot();
        assert_eq!(snap.retransmissions, 4);
        assert_eq!(snap.duplicates, 2);
        assert_eq!(snap.datagrams_sent, 0);
    }
}
