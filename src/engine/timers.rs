use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::time::Instant;
use crate::engine::config::ChannelSettings;
use crate::ids::ConnectionId;

pub(crate) enum TimerEvent {
    HandshakeDeadline {
        conn: ConnectionId,
    },
    Reconnect {
        remote: SocketAddr,
        settings: ChannelSettings,
        starting_xid: u32,
    },
    StopGracePeriod,
}

/// Deadline-ordered timers, serviced by the engine loop. Timers can not be cancelled: whoever
///  handles a timer event checks if it is still relevant.
#[derive(Default)]
pub(crate) struct TimerQueue {
    entries: BTreeMap<(Instant, u64), TimerEvent>,
    seq: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, at: Instant, event: TimerEvent) {
        self.seq += 1;
        self.entries.insert((at, self.seq), event);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys()
            .next()
            .map(|(at, _)| *at)
    }

    /// Removes and returns all timers due at `now`, in deadline order
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut result = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            result.push(entry.remove());
        }
        result
    }
}
