use super::modular_cmp::seq_lt;
use super::pcb::Pcb;
use super::tcp_parsing::Control;
use std::time::{Duration, Instant};

/// The retransmission timeout a segment starts with; it doubles on every
/// re-emission.
pub const DEFAULT_RTO: Duration = Duration::from_millis(200);

/// How long a segment may go unacknowledged, counted from its first
/// transmission, before the connection is abandoned.
pub const RETRANSMIT_DEADLINE: Duration = Duration::from_secs(12);

/// One segment awaiting acknowledgment. Only the sequence number, control
/// bits, and payload are frozen here; the acknowledgment and window fields
/// are taken from the control block at re-emission time so a retransmitted
/// segment carries a current piggy-backed ACK.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    /// When the segment was first transmitted.
    pub first: Instant,
    /// When the segment was last (re)transmitted.
    pub last: Instant,
    /// The current retransmission timeout, relative to `last`.
    pub rto: Duration,
    pub seq: u32,
    pub ctl: Control,
    pub data: Vec<u8>,
}

impl Pcb {
    /// Appends a copy of a segment to the retransmission queue. Callers
    /// queue exactly the segments that consume sequence space: SYN, FIN,
    /// or segments carrying data.
    pub fn queue_for_retransmit(&mut self, now: Instant, seq: u32, ctl: Control, data: &[u8]) {
        self.queue.push_back(Entry {
            first: now,
            last: now,
            rto: DEFAULT_RTO,
            seq,
            ctl,
            data: data.to_vec(),
        });
    }

    /// Pops acknowledged segments off the head of the queue: every entry
    /// whose sequence number now falls below `snd.una`.
    pub fn retransmit_cleanup(&mut self) {
        while let Some(entry) = self.queue.front() {
            if !seq_lt(entry.seq, self.snd.una) {
                break;
            }
            let entry = self.queue.pop_front().unwrap();
            tracing::debug!(
                seq = entry.seq,
                ctl = %entry.ctl,
                len = entry.data.len(),
                "acknowledged, dropped from the retransmission queue"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tcp::pcb::PcbTable;

    #[test]
    fn cleanup_stops_at_the_first_unacknowledged_entry() {
        let mut table = PcbTable::new();
        let id = table.alloc(Instant::now()).unwrap();
        let pcb = table.get_mut(id).unwrap();
        let now = Instant::now();

        pcb.snd.iss = 100;
        pcb.queue_for_retransmit(now, 100, Control::SYN, &[]);
        pcb.queue_for_retransmit(now, 101, Control::ACK | Control::PSH, b"abcd");
        pcb.queue_for_retransmit(now, 105, Control::ACK | Control::PSH, b"efgh");

        pcb.snd.una = 105;
        pcb.retransmit_cleanup();
        assert_eq!(pcb.queue.len(), 1);
        assert_eq!(pcb.queue.front().unwrap().seq, 105);

        pcb.snd.una = 109;
        pcb.retransmit_cleanup();
        assert!(pcb.queue.is_empty());
    }

    #[test]
    fn cleanup_is_wrap_aware() {
        let mut table = PcbTable::new();
        let id = table.alloc(Instant::now()).unwrap();
        let pcb = table.get_mut(id).unwrap();
        let now = Instant::now();

        let near_wrap = u32::MAX - 1;
        pcb.snd.iss = near_wrap;
        pcb.queue_for_retransmit(now, near_wrap, Control::ACK | Control::PSH, b"abcd");
        pcb.snd.una = near_wrap.wrapping_add(4);
        pcb.retransmit_cleanup();
        assert!(pcb.queue.is_empty());
    }
}
