use super::retransmit::Entry;
use crate::protocols::utility::Endpoint;
use crate::sync::WaitContext;
use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::time::Instant;

/// The number of connection slots. Allocation fails once every slot holds a
/// live control block.
pub const PCB_COUNT: usize = 16;

/// The capacity of each control block's receive buffer. The advertised
/// receive window is always exactly the free portion of this buffer.
pub const RECEIVE_BUFFER: usize = 4096;

/// The connection states of RFC 793 section 3.2. A vacant table slot plays
/// the role of the traditional FREE state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection; the block exists but represents nothing yet.
    Closed,
    /// Waiting for a connection request from any remote TCP.
    Listen,
    /// Waiting for a matching connection request after having sent a
    /// connection request.
    SynSent,
    /// Waiting for a confirming connection request acknowledgment after
    /// having both received and sent a connection request.
    SynReceived,
    /// An open connection; the normal state for data transfer.
    Established,
    /// Waiting for a connection termination request from the remote TCP, or
    /// an acknowledgment of the termination request previously sent.
    FinWait1,
    /// Waiting for a connection termination request from the remote TCP.
    FinWait2,
    /// Waiting for a termination request acknowledgment from the remote
    /// TCP, both sides having initiated termination.
    Closing,
    /// Waiting for enough time to pass to be sure the remote TCP received
    /// the acknowledgment of its termination request.
    TimeWait,
    /// Waiting for a connection termination request from the local user.
    CloseWait,
    /// Waiting for an acknowledgment of the termination request previously
    /// sent to the remote TCP.
    LastAck,
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::Closing => write!(f, "CLOSING"),
            State::TimeWait => write!(f, "TIME-WAIT"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::LastAck => write!(f, "LAST-ACK"),
        }
    }
}

//      1         2          3          4
// ----------|----------|----------|----------
//        SND.UNA    SND.NXT    SND.UNA
//                             +SND.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers of unacknowledged data
// 3 - sequence numbers allowed for new data transmission (send window)
// 4 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub(crate) struct SendSequenceSpace {
    /// Oldest unacknowledged sequence number
    pub una: u32,
    /// Next sequence number to be sent
    pub nxt: u32,
    /// The size of the remote TCP's receive window
    pub wnd: u16,
    /// Urgent pointer, carried but unused
    pub up: u16,
    /// Segment sequence number used for last window update
    pub wl1: u32,
    /// Segment acknowledgment number used for last window update
    pub wl2: u32,
    /// Initial send sequence number
    pub iss: u32,
}

//     1          2          3
// ----------|----------|----------
//        RCV.NXT    RCV.NXT
//                  +RCV.WND
//
// 1 - old sequence numbers which have been acknowledged
// 2 - sequence numbers allowed for new reception
// 3 - future sequence numbers which are not yet allowed
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub(crate) struct ReceiveSequenceSpace {
    /// Next sequence number expected on an incoming segment; the lower edge
    /// of the receive window
    pub nxt: u32,
    /// The number of bytes of buffer free for the remote TCP to fill
    pub wnd: u16,
    /// Urgent pointer, carried but unused
    pub up: u16,
    /// Initial receive sequence number
    pub irs: u32,
}

/// Why a connection was torn down, recorded so that a blocked caller woken
/// by the teardown reports the precise condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abort {
    Reset,
    Refused,
    UserTimeout,
    RetransmitDeadline,
}

/// A protocol control block: the complete state of one connection.
pub(crate) struct Pcb {
    /// Whether the local side initiated the connection.
    pub active: bool,
    pub state: State,
    pub local: Endpoint,
    pub foreign: Endpoint,
    pub snd: SendSequenceSpace,
    pub rcv: ReceiveSequenceSpace,
    /// When the block was allocated, for the user timeout.
    pub start_time: Instant,
    /// When the block entered TIME-WAIT, for the 2·MSL expiration.
    pub time_wait: Option<Instant>,
    /// Received, not-yet-delivered data. `rcv.wnd` is always
    /// `RECEIVE_BUFFER - buf.len()`.
    pub buf: VecDeque<u8>,
    pub abort: Option<Abort>,
    pub ctx: WaitContext,
    /// The retransmission queue, in send order.
    pub queue: VecDeque<Entry>,
}

impl Pcb {
    fn new(now: Instant) -> Self {
        Self {
            active: false,
            state: State::Closed,
            local: Endpoint::ANY,
            foreign: Endpoint::ANY,
            snd: Default::default(),
            rcv: Default::default(),
            start_time: now,
            time_wait: None,
            buf: VecDeque::with_capacity(RECEIVE_BUFFER),
            abort: None,
            ctx: WaitContext::new(),
            queue: VecDeque::new(),
        }
    }
}

/// The fixed-capacity table of control blocks. User-visible connection ids
/// are indices into this table, stable for the life of the connection.
pub(crate) struct PcbTable {
    slots: [Option<Pcb>; PCB_COUNT],
}

impl PcbTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Claims the first vacant slot, initialized to CLOSED. Returns the new
    /// id, or `None` when every slot is occupied.
    pub fn alloc(&mut self, now: Instant) -> Option<usize> {
        let id = self.slots.iter().position(Option::is_none)?;
        self.slots[id] = Some(Pcb::new(now));
        Some(id)
    }

    pub fn get(&self, id: usize) -> Option<&Pcb> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Pcb> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// The wait context of a block that is known to be present. Sleeping
    /// callers hold the slot alive, so this cannot miss while they use it.
    pub fn ctx_mut(&mut self, id: usize) -> &mut WaitContext {
        &mut self
            .get_mut(id)
            .expect("a slot with waiters is never freed")
            .ctx
    }

    /// The socket lookup. An exact (local, foreign) match wins; otherwise a
    /// LISTEN block with a wildcard foreign endpoint and a matching local
    /// endpoint is used. A block's local address matches when it equals the
    /// given address or is the wildcard. When `foreign` is absent (a bind
    /// check), any block with a matching local endpoint wins.
    pub fn select(&self, local: &Endpoint, foreign: Option<&Endpoint>) -> Option<usize> {
        let mut listener = None;
        for (id, slot) in self.slots.iter().enumerate() {
            let Some(pcb) = slot else { continue };
            if (pcb.local.address.is_any() || pcb.local.address == local.address)
                && pcb.local.port == local.port
            {
                let Some(foreign) = foreign else {
                    return Some(id);
                };
                if pcb.foreign == *foreign {
                    return Some(id);
                }
                if pcb.state == State::Listen && pcb.foreign == Endpoint::ANY {
                    listener = Some(id);
                }
            }
        }
        listener
    }

    /// Frees a slot. If threads are still sleeping on the block the free is
    /// deferred: they are woken instead, and the last one to unwind calls
    /// release again and completes it.
    pub fn release(&mut self, id: usize) {
        let Some(pcb) = self.get_mut(id) else { return };
        if !pcb.ctx.can_destroy() {
            pcb.ctx.wake();
            return;
        }
        tracing::debug!(local = %pcb.local, foreign = %pcb.foreign, "control block released");
        self.slots[id] = None;
    }
}
