//! An implementation of the [Transmission Control
//! Protocol](https://datatracker.ietf.org/doc/html/rfc793), built around a
//! fixed table of protocol control blocks behind one mutex.
//!
//! Segment arrival, the blocking user commands, and the periodic timers all
//! serialize on that mutex. A user call that cannot make progress sleeps on
//! its control block's wait context, releasing the mutex until segment
//! processing wakes it. See section 3.9 of the RFC for the event processing
//! this module follows.

use crate::network::Device;
use crate::protocols::ipv4::{Iface, IpProtocol, Ipv4, Ipv4Address};
use crate::protocols::utility::Endpoint;
use crate::sync;
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;

mod modular_cmp;
mod pcb;
mod retransmit;
mod tcp_parsing;

use modular_cmp::{seq_gt, seq_in_window, seq_le, seq_lt};
use pcb::{Abort, Pcb, PcbTable};
pub use pcb::{State, PCB_COUNT, RECEIVE_BUFFER};
pub use retransmit::{DEFAULT_RTO, RETRANSMIT_DEADLINE};
pub use tcp_parsing::{Control, ParseError, TcpHeader};
use tcp_parsing::{TcpHeaderBuilder, HEADER_OCTETS};

/// A connection with no progress toward establishment or teardown for this
/// long is aborted. Raise it for long-lived idle connections.
pub const USER_TIMEOUT: Duration = Duration::from_secs(30);

/// The maximum segment lifetime. TIME-WAIT lasts twice this.
pub const MSL: Duration = Duration::from_secs(120);

/// Where initial send sequence numbers come from. Seeded generation gives
/// tests reproducible sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Iss {
    #[default]
    Random,
    FromSeed(u64),
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    #[error("no control block for the given id")]
    NoPcb,
    #[error("the control block table is full")]
    ResourceExhausted,
    #[error("the operation is not valid in the {0} state")]
    InvalidState(State),
    #[error("an active open requires a foreign endpoint")]
    ForeignRequired,
    #[error("the blocked call was interrupted")]
    Interrupted,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection aborted: user timeout")]
    UserTimeout,
    #[error("connection aborted: retransmission deadline exceeded")]
    RetransmitDeadline,
    #[error("no route to the foreign address")]
    Unreachable,
    #[error("failed to emit a segment")]
    OutputFailed,
}

impl From<Abort> for TcpError {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Reset => TcpError::ConnectionReset,
            Abort::Refused => TcpError::ConnectionRefused,
            Abort::UserTimeout => TcpError::UserTimeout,
            Abort::RetransmitDeadline => TcpError::RetransmitDeadline,
        }
    }
}

/// The fields of an arriving segment that the event processing consults,
/// with `len` counting sequence space: payload bytes plus one for SYN and
/// one for FIN.
#[derive(Debug, Clone, Copy)]
struct SegmentInfo {
    seq: u32,
    ack: u32,
    len: u32,
    wnd: u16,
    #[allow(dead_code)]
    up: u16,
}

/// The TCP layer: the control block table and the user command surface.
pub struct Tcp {
    ip: Arc<Ipv4>,
    pcbs: Mutex<PcbTable>,
    iss: Mutex<SmallRng>,
}

impl Tcp {
    /// TCP's protocol number in the IP header.
    pub const PROTOCOL: u8 = 6;

    pub fn new(ip: Arc<Ipv4>, iss: Iss) -> Arc<Self> {
        let rng = match iss {
            Iss::Random => SmallRng::from_entropy(),
            Iss::FromSeed(seed) => SmallRng::seed_from_u64(seed),
        };
        Arc::new(Self {
            ip,
            pcbs: Mutex::new(PcbTable::new()),
            iss: Mutex::new(rng),
        })
    }

    fn next_iss(&self) -> u32 {
        self.iss.lock().unwrap().next_u32()
    }

    /// Opens a connection and blocks until it is established.
    ///
    /// An active open sends a SYN to `foreign` and drives the client side
    /// of the handshake. A passive open listens on `local`, optionally
    /// filtered to a specific peer, and completes when a peer connects.
    /// The returned id addresses the connection in the other calls.
    pub fn open(
        &self,
        local: Endpoint,
        foreign: Option<Endpoint>,
        active: bool,
    ) -> Result<usize, TcpError> {
        if active && foreign.is_none() {
            return Err(TcpError::ForeignRequired);
        }
        let mut table = self.pcbs.lock().unwrap();
        let now = Instant::now();
        let Some(id) = table.alloc(now) else {
            tracing::error!("control block table is full");
            return Err(TcpError::ResourceExhausted);
        };
        let pcb = table.get_mut(id).expect("slot was just allocated");
        pcb.active = active;
        if active {
            let foreign = foreign.expect("validated above");
            tracing::debug!(%local, %foreign, "active open: connecting");
            pcb.local = local;
            pcb.foreign = foreign;
            pcb.rcv.wnd = RECEIVE_BUFFER as u16;
            pcb.snd.iss = self.next_iss();
            if let Err(e) = self.output(pcb, Control::SYN, &[], now) {
                tracing::error!(%e, "failed to transmit the opening segment");
                pcb.state = State::Closed;
                table.release(id);
                return Err(e);
            }
            let pcb = table.get_mut(id).expect("slot is still ours");
            pcb.snd.una = pcb.snd.iss;
            pcb.snd.nxt = pcb.snd.iss.wrapping_add(1);
            pcb.state = State::SynSent;
        } else {
            tracing::debug!(%local, "passive open: waiting for connection");
            pcb.local = local;
            if let Some(foreign) = foreign {
                pcb.foreign = foreign;
            }
            pcb.state = State::Listen;
        }
        loop {
            let state0 = table
                .get(id)
                .map(|pcb| pcb.state)
                .expect("the opening thread keeps the slot alive");
            let mut state = state0;
            while state == state0 {
                let (reacquired, interrupted) = sync::sleep(table, |t| t.ctx_mut(id));
                table = reacquired;
                if interrupted {
                    tracing::debug!("open interrupted");
                    let pcb = table.get_mut(id).expect("waiters keep the slot alive");
                    pcb.state = State::Closed;
                    table.release(id);
                    return Err(TcpError::Interrupted);
                }
                state = table
                    .get(id)
                    .map(|pcb| pcb.state)
                    .expect("waiters keep the slot alive");
            }
            match state {
                State::Established => {
                    let pcb = table.get(id).expect("the state was just observed");
                    tracing::debug!(
                        local = %pcb.local,
                        foreign = %pcb.foreign,
                        "connection established"
                    );
                    return Ok(id);
                }
                // A refused passive handshake reverts to LISTEN; keep
                // waiting for the next peer. Re-arming also tolerates
                // spurious condvar wake-ups in the pending states.
                State::Listen | State::SynSent | State::SynReceived => continue,
                state => {
                    tracing::error!(%state, "open failed");
                    let abort = table.get(id).and_then(|pcb| pcb.abort);
                    let pcb = table.get_mut(id).expect("the state was just observed");
                    pcb.state = State::Closed;
                    table.release(id);
                    return Err(abort.map(TcpError::from).unwrap_or(TcpError::InvalidState(state)));
                }
            }
        }
    }

    /// Initiates a close. In ESTABLISHED the connection enters FIN-WAIT-1;
    /// in CLOSE-WAIT, LAST-ACK. The block is reclaimed once the peer
    /// acknowledges the FIN (or the TIME-WAIT clock runs out).
    pub fn close(&self, id: usize) -> Result<(), TcpError> {
        let mut table = self.pcbs.lock().unwrap();
        let now = Instant::now();
        let Some(pcb) = table.get_mut(id) else {
            tracing::error!(id, "control block not found");
            return Err(TcpError::NoPcb);
        };
        match pcb.state {
            State::Established => {
                let _ = self.output(pcb, Control::ACK | Control::FIN, &[], now);
                pcb.snd.nxt = pcb.snd.nxt.wrapping_add(1);
                pcb.state = State::FinWait1;
            }
            State::CloseWait => {
                let _ = self.output(pcb, Control::ACK | Control::FIN, &[], now);
                pcb.snd.nxt = pcb.snd.nxt.wrapping_add(1);
                pcb.state = State::LastAck;
            }
            state => {
                tracing::error!(%state, "close is not valid in this state");
                return Err(TcpError::InvalidState(state));
            }
        }
        pcb.ctx.wake();
        Ok(())
    }

    /// Sends a byte stream, blocking while the send window is closed.
    /// Returns the number of bytes handed to the connection, which is less
    /// than `data.len()` only when the wait was interrupted after partial
    /// progress.
    pub fn send(&self, id: usize, data: &[u8]) -> Result<usize, TcpError> {
        let mut table = self.pcbs.lock().unwrap();
        if table.get(id).is_none() {
            tracing::error!(id, "control block not found");
            return Err(TcpError::NoPcb);
        }
        let mut sent = 0;
        loop {
            let (state, abort, foreign, snd) = {
                let pcb = table.get(id).ok_or(TcpError::NoPcb)?;
                (pcb.state, pcb.abort, pcb.foreign, pcb.snd)
            };
            match state {
                State::Established | State::CloseWait => {
                    if sent >= data.len() {
                        return Ok(sent);
                    }
                    let Some(iface) = self.ip.route_iface(foreign.address) else {
                        tracing::error!(%foreign, "no interface toward the peer");
                        return Err(TcpError::Unreachable);
                    };
                    let mss = (iface.device.mtu() as usize)
                        .saturating_sub((Ipv4::HEADER_OCTETS + HEADER_OCTETS) as usize);
                    let in_flight = snd.nxt.wrapping_sub(snd.una) as usize;
                    let capacity = (snd.wnd as usize).saturating_sub(in_flight);
                    if capacity == 0 {
                        let (reacquired, interrupted) = sync::sleep(table, |t| t.ctx_mut(id));
                        table = reacquired;
                        if interrupted {
                            tracing::debug!("send interrupted");
                            if sent == 0 {
                                let pcb = table.get_mut(id).expect("waiters keep the slot alive");
                                pcb.state = State::Closed;
                                table.release(id);
                                return Err(TcpError::Interrupted);
                            }
                            return Ok(sent);
                        }
                        continue;
                    }
                    let len = mss.min(data.len() - sent).min(capacity);
                    let chunk = &data[sent..sent + len];
                    let now = Instant::now();
                    let pcb = table.get_mut(id).expect("the state was just observed");
                    if let Err(e) = self.output(pcb, Control::ACK | Control::PSH, chunk, now) {
                        tracing::error!(%e, "send failed");
                        pcb.state = State::Closed;
                        table.release(id);
                        return Err(e);
                    }
                    pcb.snd.nxt = pcb.snd.nxt.wrapping_add(len as u32);
                    sent += len;
                }
                State::LastAck => {
                    tracing::error!("connection closing");
                    return Err(TcpError::InvalidState(state));
                }
                state => {
                    let error = abort.map(TcpError::from).unwrap_or(TcpError::InvalidState(state));
                    if state == State::Closed {
                        table.release(id);
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Receives up to `buf.len()` bytes, blocking while no data is
    /// buffered. Returns zero once the peer has closed and the residue is
    /// drained.
    pub fn receive(&self, id: usize, buf: &mut [u8]) -> Result<usize, TcpError> {
        let mut table = self.pcbs.lock().unwrap();
        if table.get(id).is_none() {
            tracing::error!(id, "control block not found");
            return Err(TcpError::NoPcb);
        }
        loop {
            let (state, abort, buffered) = {
                let pcb = table.get(id).ok_or(TcpError::NoPcb)?;
                (pcb.state, pcb.abort, pcb.buf.len())
            };
            match state {
                State::Established if buffered == 0 => {
                    let (reacquired, interrupted) = sync::sleep(table, |t| t.ctx_mut(id));
                    table = reacquired;
                    if interrupted {
                        tracing::debug!("receive interrupted");
                        let pcb = table.get_mut(id).expect("waiters keep the slot alive");
                        pcb.state = State::Closed;
                        table.release(id);
                        return Err(TcpError::Interrupted);
                    }
                }
                State::Established | State::CloseWait if buffered > 0 => {
                    let pcb = table.get_mut(id).expect("the state was just observed");
                    let len = buf.len().min(buffered);
                    for (dst, byte) in buf.iter_mut().zip(pcb.buf.drain(..len)) {
                        *dst = byte;
                    }
                    pcb.rcv.wnd += len as u16;
                    return Ok(len);
                }
                State::CloseWait => {
                    tracing::debug!("connection closing");
                    return Ok(0);
                }
                state => {
                    let error = abort.map(TcpError::from).unwrap_or(TcpError::InvalidState(state));
                    if state == State::Closed {
                        table.release(id);
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Interrupts every blocked caller; they unwind with
    /// [`TcpError::Interrupted`], releasing their control blocks.
    pub fn interrupt_all(&self) {
        let mut table = self.pcbs.lock().unwrap();
        for id in 0..PCB_COUNT {
            if let Some(pcb) = table.get_mut(id) {
                pcb.ctx.interrupt();
            }
        }
    }

    /// The retransmission scan, run every 100 ms: re-emits every queued
    /// segment that is past its timeout and abandons connections past the
    /// retransmission deadline.
    pub(crate) fn retransmit_tick(&self, now: Instant) {
        let mut table = self.pcbs.lock().unwrap();
        for id in 0..PCB_COUNT {
            let Some(pcb) = table.get_mut(id) else { continue };
            self.emit_all(pcb, now);
        }
    }

    /// The user-timeout scan, run every second: connections with no
    /// progress since allocation are aborted.
    pub(crate) fn user_timeout_tick(&self, now: Instant) {
        let mut table = self.pcbs.lock().unwrap();
        for id in 0..PCB_COUNT {
            let Some(pcb) = table.get_mut(id) else { continue };
            if pcb.state == State::TimeWait {
                continue;
            }
            if now.duration_since(pcb.start_time) >= USER_TIMEOUT {
                self.emit_all(pcb, now);
                tracing::error!(
                    local = %pcb.local,
                    foreign = %pcb.foreign,
                    "connection aborted: user timeout"
                );
                pcb.abort.get_or_insert(Abort::UserTimeout);
                pcb.state = State::Closed;
                table.release(id);
            }
        }
    }

    /// The TIME-WAIT scan, run every second: blocks quiet for 2·MSL are
    /// reclaimed.
    pub(crate) fn time_wait_tick(&self, now: Instant) {
        let mut table = self.pcbs.lock().unwrap();
        for id in 0..PCB_COUNT {
            let Some(pcb) = table.get_mut(id) else { continue };
            if pcb.state != State::TimeWait {
                continue;
            }
            let Some(entered) = pcb.time_wait else { continue };
            if now.duration_since(entered) >= MSL * 2 {
                pcb.state = State::Closed;
                table.release(id);
            }
        }
    }

    /// Serializes and transmits one segment that is not tied to a control
    /// block, such as a RST for an unmatched arrival.
    fn output_segment(
        &self,
        seq: u32,
        ack: u32,
        ctl: Control,
        wnd: u16,
        data: &[u8],
        local: Endpoint,
        foreign: Endpoint,
    ) -> Result<(), TcpError> {
        let segment = TcpHeaderBuilder::new(local, foreign, seq)
            .control(ctl)
            .acknowledgment(ack)
            .window(wnd)
            .build(data)
            .map_err(|e| {
                tracing::error!(%e, "could not build segment");
                TcpError::OutputFailed
            })?;
        tracing::trace!(%local, %foreign, seq, ack, %ctl, len = data.len(), "segment out");
        self.ip
            .output(Self::PROTOCOL, &segment, local.address, foreign.address)
            .map_err(|e| {
                tracing::error!(%e, "segment transmission failed");
                TcpError::OutputFailed
            })
    }

    /// Emits a segment for a control block. SYNs are sent with the initial
    /// sequence number, everything else from `snd.nxt`; segments that
    /// consume sequence space go on the retransmission queue before they
    /// are transmitted.
    fn output(
        &self,
        pcb: &mut Pcb,
        ctl: Control,
        data: &[u8],
        now: Instant,
    ) -> Result<(), TcpError> {
        let seq = if ctl.syn() { pcb.snd.iss } else { pcb.snd.nxt };
        if ctl.syn() || ctl.fin() || !data.is_empty() {
            pcb.queue_for_retransmit(now, seq, ctl, data);
        }
        self.output_segment(seq, pcb.rcv.nxt, ctl, pcb.rcv.wnd, data, pcb.local, pcb.foreign)
    }

    /// Walks the retransmission queue, re-emitting entries past their
    /// timeout with doubled back-off and abandoning the connection when an
    /// entry has gone unacknowledged past the deadline.
    fn emit_all(&self, pcb: &mut Pcb, now: Instant) {
        let local = pcb.local;
        let foreign = pcb.foreign;
        let ack = pcb.rcv.nxt;
        let wnd = pcb.rcv.wnd;
        let mut past_deadline = false;
        for entry in pcb.queue.iter_mut() {
            if now.duration_since(entry.first) >= RETRANSMIT_DEADLINE {
                past_deadline = true;
                break;
            }
            if now >= entry.last + entry.rto {
                tracing::debug!(seq = entry.seq, ctl = %entry.ctl, rto = ?entry.rto, "retransmit");
                let _ = self.output_segment(
                    entry.seq,
                    ack,
                    entry.ctl,
                    wnd,
                    &entry.data,
                    local,
                    foreign,
                );
                entry.last = now;
                entry.rto *= 2;
            }
        }
        if past_deadline {
            tracing::error!(%local, %foreign, "connection aborted: retransmission deadline");
            pcb.abort.get_or_insert(Abort::RetransmitDeadline);
            pcb.state = State::Closed;
            pcb.ctx.wake();
        }
    }

    /// Segments that match no connection, or one already CLOSED, are
    /// answered with a reset unless they carry one. (3.9, SEGMENT ARRIVES,
    /// CLOSED state.)
    fn reply_to_closed(
        &self,
        seg: &SegmentInfo,
        ctl: Control,
        local: Endpoint,
        foreign: Endpoint,
    ) {
        if ctl.rst() {
            return;
        }
        let _ = if ctl.ack() {
            self.output_segment(seg.ack, 0, Control::RST, 0, &[], local, foreign)
        } else {
            self.output_segment(
                0,
                seg.seq.wrapping_add(seg.len),
                Control::RST | Control::ACK,
                0,
                &[],
                local,
                foreign,
            )
        };
    }

    /// RFC 793 section 3.9, SEGMENT ARRIVES. Runs one state machine step
    /// under the table lock.
    fn segment_arrives(
        &self,
        table: &mut PcbTable,
        seg: &SegmentInfo,
        ctl: Control,
        text: &[u8],
        local: Endpoint,
        foreign: Endpoint,
        now: Instant,
    ) {
        let id = match table.select(&local, Some(&foreign)) {
            Some(id) if table.get(id).map(|pcb| pcb.state) != Some(State::Closed) => id,
            _ => {
                self.reply_to_closed(seg, ctl, local, foreign);
                return;
            }
        };
        let pcb = table.get_mut(id).expect("selected above");

        match pcb.state {
            State::Listen => {
                /* 1st check for a RST */
                if ctl.rst() {
                    return;
                }
                /* 2nd check for an ACK */
                if ctl.ack() {
                    let _ = self.output_segment(seg.ack, 0, Control::RST, 0, &[], local, foreign);
                    return;
                }
                /* 3rd check for a SYN */
                if ctl.syn() {
                    // Both ends of the connection are now concrete
                    pcb.local = local;
                    pcb.foreign = foreign;
                    pcb.rcv.wnd = RECEIVE_BUFFER as u16;
                    pcb.rcv.nxt = seg.seq.wrapping_add(1);
                    pcb.rcv.irs = seg.seq;
                    pcb.snd.iss = self.next_iss();
                    pcb.snd.wnd = seg.wnd;
                    pcb.snd.wl1 = seg.seq;
                    pcb.snd.wl2 = seg.ack;
                    let _ = self.output(pcb, Control::SYN | Control::ACK, &[], now);
                    pcb.snd.nxt = pcb.snd.iss.wrapping_add(1);
                    pcb.snd.una = pcb.snd.iss;
                    pcb.state = State::SynReceived;
                }
                /* 4th, other text or control: drop */
                return;
            }
            State::SynSent => {
                /* 1st check the ACK bit */
                let mut acceptable = false;
                if ctl.ack() {
                    if seq_le(seg.ack, pcb.snd.iss) || seq_gt(seg.ack, pcb.snd.nxt) {
                        let _ =
                            self.output_segment(seg.ack, 0, Control::RST, 0, &[], local, foreign);
                        return;
                    }
                    if seq_le(pcb.snd.una, seg.ack) && seq_le(seg.ack, pcb.snd.nxt) {
                        acceptable = true;
                    }
                }
                /* 2nd check the RST bit */
                if ctl.rst() {
                    if acceptable {
                        tracing::error!(%local, %foreign, "connection reset");
                        pcb.abort = Some(Abort::Reset);
                    }
                    pcb.state = State::Closed;
                    pcb.ctx.wake();
                    table.release(id);
                    return;
                }
                /* 3rd check security and precedence: ignored */
                /* 4th check the SYN bit */
                if ctl.syn() {
                    pcb.rcv.nxt = seg.seq.wrapping_add(1);
                    pcb.rcv.irs = seg.seq;
                    if acceptable {
                        pcb.snd.una = seg.ack;
                        pcb.retransmit_cleanup();
                    }
                    pcb.snd.wnd = seg.wnd;
                    pcb.snd.wl1 = seg.seq;
                    pcb.snd.wl2 = seg.ack;
                    if seq_gt(pcb.snd.una, pcb.snd.iss) {
                        // Our SYN has been acknowledged
                        pcb.state = State::Established;
                        let _ = self.output(pcb, Control::ACK, &[], now);
                        pcb.ctx.wake();
                    } else {
                        // Simultaneous open: both sides sent a SYN
                        pcb.state = State::SynReceived;
                        let _ = self.output(pcb, Control::SYN | Control::ACK, &[], now);
                    }
                }
                /* 5th, neither SYN nor RST: drop */
                return;
            }
            _ => {}
        }

        /* Otherwise: SYN-RECEIVED through LAST-ACK */

        /* 1st check the sequence number */
        let acceptable = if seg.len == 0 {
            if pcb.rcv.wnd == 0 {
                seg.seq == pcb.rcv.nxt
            } else {
                seq_in_window(seg.seq, pcb.rcv.nxt, pcb.rcv.wnd as u32)
            }
        } else if pcb.rcv.wnd == 0 {
            false
        } else {
            seq_in_window(seg.seq, pcb.rcv.nxt, pcb.rcv.wnd as u32)
                || seq_in_window(
                    seg.seq.wrapping_add(seg.len).wrapping_sub(1),
                    pcb.rcv.nxt,
                    pcb.rcv.wnd as u32,
                )
        };
        if !acceptable {
            if !ctl.rst() {
                let _ = self.output(pcb, Control::ACK, &[], now);
            }
            return;
        }

        /* 2nd check the RST bit */
        if ctl.rst() {
            match pcb.state {
                State::SynReceived => {
                    if pcb.active {
                        tracing::error!(%local, %foreign, "connection refused");
                        pcb.abort = Some(Abort::Refused);
                        pcb.state = State::Closed;
                        table.release(id);
                    } else {
                        // Back to LISTEN for the next peer, with the
                        // half-done handshake cleared out
                        pcb.foreign = Endpoint::ANY;
                        pcb.snd = Default::default();
                        pcb.rcv = Default::default();
                        pcb.queue.clear();
                        pcb.state = State::Listen;
                    }
                }
                State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait => {
                    tracing::error!(%local, %foreign, "connection reset");
                    pcb.queue.clear();
                    pcb.abort = Some(Abort::Reset);
                    pcb.state = State::Closed;
                    table.release(id);
                }
                _ => {
                    pcb.state = State::Closed;
                    table.release(id);
                }
            }
            return;
        }

        /* 3rd check security and precedence: ignored */

        /* 4th check the SYN bit: a SYN here is a protocol violation */
        if ctl.syn() {
            tracing::error!(%local, %foreign, "unexpected SYN on a synchronized connection");
            self.emit_all(pcb, now);
            pcb.abort.get_or_insert(Abort::Reset);
            pcb.state = State::Closed;
            table.release(id);
            return;
        }

        /* 5th check the ACK field */
        if !ctl.ack() {
            return;
        }
        let pcb = table.get_mut(id).expect("still present");
        if pcb.state == State::SynReceived {
            if seq_le(pcb.snd.una, seg.ack) && seq_le(seg.ack, pcb.snd.nxt) {
                pcb.state = State::Established;
                tracing::debug!(%local, %foreign, "connection established");
                pcb.ctx.wake();
            } else {
                let _ = self.output_segment(seg.ack, 0, Control::RST, 0, &[], local, foreign);
                return;
            }
        }
        match pcb.state {
            State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                if seq_lt(pcb.snd.una, seg.ack) && seq_le(seg.ack, pcb.snd.nxt) {
                    pcb.snd.una = seg.ack;
                    pcb.retransmit_cleanup();
                    if seq_lt(pcb.snd.wl1, seg.seq)
                        || (pcb.snd.wl1 == seg.seq && seq_le(pcb.snd.wl2, seg.ack))
                    {
                        pcb.snd.wnd = seg.wnd;
                        pcb.snd.wl1 = seg.seq;
                        pcb.snd.wl2 = seg.ack;
                    }
                    // The usable window may have opened; let blocked
                    // senders retry
                    pcb.ctx.wake();
                } else if seq_lt(seg.ack, pcb.snd.una) {
                    // Duplicate of something already acknowledged
                } else if seq_gt(seg.ack, pcb.snd.nxt) {
                    let _ = self.output(pcb, Control::ACK, &[], now);
                    return;
                }
                if pcb.state == State::FinWait1 && seg.ack == pcb.snd.nxt {
                    // Our FIN is acknowledged
                    pcb.state = State::FinWait2;
                }
            }
            State::Closing => {
                if seg.ack == pcb.snd.nxt {
                    pcb.state = State::TimeWait;
                    pcb.time_wait = Some(now);
                }
            }
            State::LastAck => {
                if seg.ack == pcb.snd.nxt {
                    pcb.state = State::Closed;
                    table.release(id);
                }
                return;
            }
            _ => {}
        }

        /* 6th check the URG bit: ignored */

        /* 7th process the segment text */
        let pcb = table.get_mut(id).expect("still present");
        let mut text_consumed = true;
        if !text.is_empty() {
            match pcb.state {
                State::Established | State::FinWait1 | State::FinWait2 => {
                    if seq_gt(seg.seq, pcb.rcv.nxt) {
                        // A gap; with no reassembly queue the peer must
                        // retransmit from rcv.nxt
                        text_consumed = false;
                    } else {
                        let offset = pcb.rcv.nxt.wrapping_sub(seg.seq) as usize;
                        if offset < text.len() {
                            let fresh = &text[offset..];
                            let take = fresh.len().min(pcb.rcv.wnd as usize);
                            pcb.buf.extend(fresh[..take].iter().copied());
                            pcb.rcv.nxt = pcb.rcv.nxt.wrapping_add(take as u32);
                            pcb.rcv.wnd -= take as u16;
                            text_consumed = take == fresh.len();
                            let _ = self.output(pcb, Control::ACK, &[], now);
                            pcb.ctx.wake();
                        }
                    }
                }
                _ => {
                    // CLOSE-WAIT and beyond: the peer said it was done;
                    // text is discarded
                }
            }
        }

        /* 8th check the FIN bit */
        if ctl.fin() && text_consumed {
            pcb.rcv.nxt = seg.seq.wrapping_add(seg.len);
            let _ = self.output(pcb, Control::ACK, &[], now);
            match pcb.state {
                State::SynReceived | State::Established => {
                    pcb.state = State::CloseWait;
                    pcb.ctx.wake();
                }
                State::FinWait1 => {
                    if ctl.ack() && seg.ack == pcb.snd.nxt {
                        // Our FIN was acknowledged by this same segment
                        pcb.state = State::TimeWait;
                        pcb.time_wait = Some(now);
                    } else {
                        pcb.state = State::Closing;
                    }
                }
                State::FinWait2 => {
                    pcb.state = State::TimeWait;
                    pcb.time_wait = Some(now);
                }
                _ => {}
            }
        }
    }
}

impl IpProtocol for Tcp {
    /// Validates an arriving segment and feeds it to the state machine.
    /// Malformed segments are dropped with a log entry and never fail a
    /// socket.
    fn input(&self, data: &[u8], src: Ipv4Address, dst: Ipv4Address, _iface: &Arc<Iface>) {
        if data.len() < HEADER_OCTETS as usize {
            tracing::debug!(len = data.len(), "segment too short");
            return;
        }
        if src.is_broadcast() || dst.is_broadcast() {
            tracing::debug!("segment to or from a broadcast address");
            return;
        }
        let header = match TcpHeader::from_bytes(data.iter().cloned(), src, dst) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(%e, "dropped segment");
                return;
            }
        };
        let header_length = header.data_offset as usize * 4;
        if header_length > data.len() {
            tracing::debug!("segment shorter than its data offset");
            return;
        }
        let text = &data[header_length..];
        let local = Endpoint::new(dst, header.dst_port);
        let foreign = Endpoint::new(src, header.src_port);
        let seg = SegmentInfo {
            seq: header.seq,
            ack: header.ack,
            len: text.len() as u32 + header.ctl.syn() as u32 + header.ctl.fin() as u32,
            wnd: header.wnd,
            up: header.up,
        };
        tracing::trace!(
            %foreign,
            %local,
            seq = header.seq,
            ack = header.ack,
            ctl = %header.ctl,
            len = text.len(),
            "segment in"
        );
        let mut table = self.pcbs.lock().unwrap();
        self.segment_arrives(&mut table, &seg, header.ctl, text, local, foreign, Instant::now());
    }
}
