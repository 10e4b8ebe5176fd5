//! The RFC 793 TCP state machine: segment pool, retransmission timer,
//! stream accumulator, and the active/listen demultiplex tables.
//!
//! A `TcpController` owns everything about one connection except the
//! driver it eventually sends through; every function here that needs
//! to transmit takes a `send: impl FnMut(&[u8]) -> bool` closure
//! supplied by the adapter, so this module stays link-layer-agnostic
//! the same way [`crate::udp`] does.

use heapless::Vec;
use log::warn;

use crate::config::{
    MAX_TCP, MAX_TCP_SEG, TCP_FIN_WAIT_TIMEOUT_TICKS, TCP_MSS, TCP_RETRANSMISSION_TIMEOUT_TICKS,
    TCP_SYN_RCVD_TIMEOUT_TICKS, TCP_WND,
};
use crate::error::{Error, Result};
use crate::wire::{
    endian, tcp_flags, EthernetAddress, EthernetFrame, EthernetProtocol, Ipv4Address, Ipv4Packet,
    Ipv4Protocol, Ipv4Repr, TcpPacket, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN, TCP_HEADER_LEN,
};
use crate::config::MTU_STORAGE;

/// Capability set an application installs on a TCP controller. Every
/// method has a no-op default, so a handler only overrides the events
/// it cares about; replaces the C quintuple of function pointers plus
/// an opaque argument.
pub trait TcpHandler {
    /// A segment was delivered in order: either a single PSH'd chunk,
    /// or the flushed tail of an accumulated run.
    fn on_recv(&mut self, _handle: TcpHandle, _data: &[u8]) {}

    /// A SYN arrived on a listening controller and a child was spawned
    /// to handle it; called on the *listener's* handler.
    fn on_accept(&mut self, _listener: TcpHandle, _child: TcpHandle) {}

    /// The controller reached `Closed` with a connect request pending
    /// re-issue, or a client-initiated handshake just completed.
    fn on_connect(&mut self, _handle: TcpHandle) {}

    /// The inactivity watchdog fired. Return `true` to keep the
    /// connection open; the default (`false`) is the core's own
    /// behavior when no watchdog callback was installed: close it.
    fn on_periodic_check(&mut self, _handle: TcpHandle) -> bool {
        false
    }

    /// The controller reached `Closed`, by handshake completion, RST,
    /// or retransmission exhaustion.
    fn on_closed(&mut self, _handle: TcpHandle, _err: Option<Error>) {}
}

impl TcpHandler for () {}

/// A slot index into the adapter's TCP controller pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHandle(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Created by `tcp_new`/`listen`/`connect`; never reaped automatically.
    Persistent,
    /// Spawned to serve one inbound SYN on a listening controller; swept
    /// once it reaches `Closed`.
    NonPersistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegState {
    Unused,
    Unsent,
    Unacked,
}

#[derive(Clone, Copy)]
struct Segment {
    state: SegState,
    ack_no_expected: u32,
    frame: [u8; MTU_STORAGE],
    frame_len: usize,
    retransmission_timer_slice: u32,
}

impl Segment {
    const fn unused() -> Segment {
        Segment {
            state: SegState::Unused,
            ack_no_expected: 0,
            frame: [0; MTU_STORAGE],
            frame_len: 0,
            retransmission_timer_slice: 0,
        }
    }
}

/// Per-connection knobs set through [`set_options`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOptions {
    /// Fold an ACK for received data into the next outgoing `write`
    /// instead of sending it standalone; [`ack`] flushes it.
    pub delay_ack_reply: bool,
}

/// Outcome of a single timer tick on one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    None,
    Closed,
}

pub struct TcpController<H> {
    kind: Kind,
    local_ip: Ipv4Address,
    local_port: u16,
    remote_ip: Ipv4Address,
    remote_port: u16,
    remote_mac: EthernetAddress,
    state: State,
    local_seqno: u32,
    remote_seqno: u32,
    remote_wnd: u16,
    local_wnd: u16,
    local_mss: u16,
    remote_mss: u16,
    last_ack_no: u32,
    remote_ack_pending: bool,
    state_timer_ticks: u32,
    counter_of_500ms: u32,
    nb_of_500ms: u32,
    control_segment: Segment,
    segments: [Segment; MAX_TCP_SEG],
    incoming_stream: [u8; TCP_MSS * MAX_TCP_SEG],
    stream_position: usize,
    stream_sequence: u32,
    seqno_ori: u32,
    options: TcpOptions,
    reconnect: Option<(Ipv4Address, u16)>,
    last_error: Option<Error>,
    pub handler: H,
}

impl<H> TcpController<H> {
    fn new(kind: Kind, local_ip: Ipv4Address, local_port: u16, handler: H) -> Self {
        TcpController {
            kind,
            local_ip,
            local_port,
            remote_ip: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            remote_mac: EthernetAddress::BROADCAST,
            state: State::Closed,
            local_seqno: 0,
            remote_seqno: 0,
            remote_wnd: TCP_WND,
            local_wnd: TCP_WND,
            local_mss: TCP_MSS as u16,
            remote_mss: TCP_MSS as u16,
            last_ack_no: 0,
            remote_ack_pending: false,
            state_timer_ticks: 0,
            counter_of_500ms: 0,
            nb_of_500ms: 0,
            control_segment: Segment::unused(),
            segments: [Segment::unused(); MAX_TCP_SEG],
            incoming_stream: [0; TCP_MSS * MAX_TCP_SEG],
            stream_position: 0,
            stream_sequence: 0,
            seqno_ori: 0,
            options: TcpOptions::default(),
            reconnect: None,
            last_error: None,
            handler,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_endpoint(&self) -> (Ipv4Address, u16) {
        (self.remote_ip, self.remote_port)
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }
}

/// `tcp_options`: installs [`TcpOptions`] on a controller.
pub fn set_options<H>(ctrl: &mut TcpController<H>, opts: TcpOptions) {
    ctrl.options = opts;
}

/// `tcp_check_connection`: arms (or disarms, with `n == 0`) the
/// inactivity watchdog.
pub fn set_watchdog<H>(ctrl: &mut TcpController<H>, n: u32) {
    ctrl.nb_of_500ms = n;
    ctrl.counter_of_500ms = 0;
}

/// Owns the fixed `MAX_TCP`-entry controller pool. Lives inside
/// `NetworkAdapter`.
pub struct TcpPool<H> {
    controllers: [Option<TcpController<H>>; MAX_TCP],
}

impl<H> TcpPool<H> {
    pub const fn new() -> TcpPool<H> {
        TcpPool {
            controllers: [const { None }; MAX_TCP],
        }
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        self.controllers.iter().position(|c| c.is_none())
    }

    pub fn get(&self, handle: TcpHandle) -> Option<&TcpController<H>> {
        self.controllers[handle.0].as_ref()
    }

    pub fn get_mut(&mut self, handle: TcpHandle) -> Option<&mut TcpController<H>> {
        self.controllers[handle.0].as_mut()
    }
}

impl<H> Default for TcpPool<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// `tcp_new`: allocates a `Persistent` controller, assigning an
/// ephemeral port if `port == 0`.
pub fn new_controller<H>(
    pool: &mut TcpPool<H>,
    local_ip: Ipv4Address,
    port: u16,
    next_ephemeral: &mut u16,
    handler: H,
) -> Result<TcpHandle> {
    use crate::config::{TCP_EPHEMERAL_END, TCP_EPHEMERAL_START};
    let slot = pool.alloc_slot().ok_or(Error::TcpMem)?;
    let port = if port == 0 {
        let p = *next_ephemeral;
        *next_ephemeral = if p >= TCP_EPHEMERAL_END {
            TCP_EPHEMERAL_START
        } else {
            p + 1
        };
        p
    } else {
        port
    };
    pool.controllers[slot] = Some(TcpController::new(Kind::Persistent, local_ip, port, handler));
    Ok(TcpHandle(slot))
}

/// `tcp_delete`: frees a `Closed` controller's slot.
pub fn delete<H>(pool: &mut TcpPool<H>, handle: TcpHandle) -> Result<()> {
    let ctrl = pool.get(handle).ok_or(Error::Val)?;
    if ctrl.state != State::Closed {
        return Err(Error::Val);
    }
    pool.controllers[handle.0] = None;
    Ok(())
}

/// Reaps `NonPersistent` controllers that reached `Closed`.
pub fn sweep<H>(pool: &mut TcpPool<H>) {
    for slot in pool.controllers.iter_mut() {
        let reap = matches!(slot, Some(c) if c.kind == Kind::NonPersistent && c.state == State::Closed);
        if reap {
            *slot = None;
        }
    }
}

/// Rebuilds the active/listen membership lists from pool state. Cheap
/// enough at `MAX_TCP`'s size to do in full on every registration or
/// removal rather than maintain incremental linked-list bookkeeping.
pub fn rebuild_lists<H>(
    pool: &TcpPool<H>,
    active: &mut Vec<TcpHandle, MAX_TCP>,
    listen: &mut Vec<TcpHandle, MAX_TCP>,
) {
    active.clear();
    listen.clear();
    for (i, slot) in pool.controllers.iter().enumerate() {
        if let Some(c) = slot {
            match c.state {
                State::Closed => {}
                State::Listen => {
                    let _ = listen.push(TcpHandle(i));
                }
                _ => {
                    let _ = active.push(TcpHandle(i));
                }
            }
        }
    }
}

pub fn demux_match_active<H>(
    pool: &TcpPool<H>,
    active: &[TcpHandle],
    local_port: u16,
    remote_ip: Ipv4Address,
    remote_port: u16,
) -> Option<TcpHandle> {
    active
        .iter()
        .copied()
        .find(|h| {
            pool.get(*h).is_some_and(|c| {
                c.local_port == local_port && c.remote_ip == remote_ip && c.remote_port == remote_port
            })
        })
}

pub fn demux_match_listener<H>(
    pool: &TcpPool<H>,
    listen: &[TcpHandle],
    local_port: u16,
) -> Option<TcpHandle> {
    listen
        .iter()
        .copied()
        .find(|h| pool.get(*h).is_some_and(|c| c.local_port == local_port))
}

/// `tcp_listen`: `Closed` -> `Listen`.
pub fn listen<H>(ctrl: &mut TcpController<H>) -> Result<()> {
    if ctrl.state != State::Closed {
        return Err(Error::Val);
    }
    ctrl.state = State::Listen;
    Ok(())
}

/// Sequence-space comparison that tolerates wraparound: true when `a`
/// is at or before `b` in modular arithmetic (RFC 1982 style).
fn seq_le(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

#[allow(clippy::too_many_arguments)]
fn emit_segment(
    frame: &mut [u8; MTU_STORAGE],
    local_mac: EthernetAddress,
    remote_mac: EthernetAddress,
    local_ip: Ipv4Address,
    remote_ip: Ipv4Address,
    local_port: u16,
    remote_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: &[u8],
) -> usize {
    let opts_len = if mss.is_some() { 4 } else { 0 };
    let tcp_header_len = TCP_HEADER_LEN + opts_len;
    let tcp_total = tcp_header_len + payload.len();
    let total_len = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + tcp_total;

    {
        let mut eth = EthernetFrame::new_unchecked(&mut frame[..total_len]);
        eth.set_destination(remote_mac);
        eth.set_source(local_mac);
        eth.set_ethertype(EthernetProtocol::Ipv4);
    }
    {
        let mut ip = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..total_len]);
        let repr = Ipv4Repr {
            src_addr: local_ip,
            dst_addr: remote_ip,
            protocol: Ipv4Protocol::Tcp,
            payload_len: tcp_total as u16,
        };
        repr.emit(&mut ip, false);

        let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
        tcp.set_src_port(local_port);
        tcp.set_dst_port(remote_port);
        tcp.set_seq_number(seq);
        tcp.set_ack_number(ack);
        tcp.clear_options();
        if let Some(mss) = mss {
            tcp.set_mss_option(mss);
        }
        tcp.set_flags(flags);
        tcp.set_window_len(window);
        tcp.set_urgent_ptr(0);
        tcp.payload_mut(tcp_total)[..payload.len()].copy_from_slice(payload);

        let pseudo = endian::pseudo_header_sum(
            local_ip.to_bits(),
            remote_ip.to_bits(),
            tcp_total as u16,
            Ipv4Protocol::Tcp.into(),
        );
        tcp.fill_checksum(pseudo, tcp_total);
    }
    total_len
}

/// Verifies a received segment's checksum, tolerating the
/// pseudo-header-only sum under `permissive-checksum`.
pub fn verify_checksum(
    packet: &TcpPacket<&[u8]>,
    src_ip: Ipv4Address,
    dst_ip: Ipv4Address,
    total_len: usize,
) -> bool {
    let pseudo = endian::pseudo_header_sum(
        src_ip.to_bits(),
        dst_ip.to_bits(),
        total_len as u16,
        Ipv4Protocol::Tcp.into(),
    );
    let body_sum = endian::ip_checksum(packet.as_bytes(total_len));
    let folded = endian::complement(endian::fold_checksum(pseudo + body_sum));
    if folded == 0xFFFF {
        return true;
    }
    if cfg!(feature = "permissive-checksum") {
        let pseudo_only = endian::complement(endian::fold_checksum(pseudo));
        return packet.checksum() == pseudo_only;
    }
    false
}

fn send_control<H>(
    ctrl: &mut TcpController<H>,
    local_mac: EthernetAddress,
    flags: u8,
    send: &mut impl FnMut(&[u8]) -> bool,
) {
    let seq = ctrl.local_seqno;
    let ack = ctrl.remote_seqno;
    let len = emit_segment(
        &mut ctrl.control_segment.frame,
        local_mac,
        ctrl.remote_mac,
        ctrl.local_ip,
        ctrl.remote_ip,
        ctrl.local_port,
        ctrl.remote_port,
        seq,
        ack,
        flags,
        ctrl.local_wnd,
        None,
        &[],
    );
    ctrl.control_segment.frame_len = len;
    let consumes_seq = flags & (tcp_flags::SYN | tcp_flags::FIN) != 0;
    if consumes_seq {
        ctrl.control_segment.ack_no_expected = seq.wrapping_add(1);
        ctrl.control_segment.state = SegState::Unacked;
        ctrl.control_segment.retransmission_timer_slice = 0;
    } else {
        ctrl.control_segment.state = SegState::Unused;
    }
    send(&ctrl.control_segment.frame[..len]);
    ctrl.remote_ack_pending = false;
}

fn send_standalone_ack<H>(
    ctrl: &mut TcpController<H>,
    local_mac: EthernetAddress,
    send: &mut impl FnMut(&[u8]) -> bool,
) {
    send_control(ctrl, local_mac, tcp_flags::ACK, send);
}

/// `ack`: flushes a pending delayed ACK, if any.
pub fn ack<H>(ctrl: &mut TcpController<H>, local_mac: EthernetAddress, mut send: impl FnMut(&[u8]) -> bool) {
    if ctrl.options.delay_ack_reply && ctrl.remote_ack_pending {
        send_standalone_ack(ctrl, local_mac, &mut send);
    }
}

/// Releases every `Unacked` segment (including the control segment)
/// whose expected ack number is at or before `incoming_ack`.
fn release_acked<H>(ctrl: &mut TcpController<H>, incoming_ack: u32) {
    if seq_le(ctrl.control_segment.ack_no_expected, incoming_ack)
        && ctrl.control_segment.state == SegState::Unacked
    {
        ctrl.control_segment.state = SegState::Unused;
    }
    for seg in ctrl.segments.iter_mut() {
        if seg.state == SegState::Unacked && seq_le(seg.ack_no_expected, incoming_ack) {
            seg.state = SegState::Unused;
        }
    }
    ctrl.last_ack_no = incoming_ack;
}

/// Transmits and promotes the earliest `Unsent` segment, if any.
fn transmit_next_unsent<H>(ctrl: &mut TcpController<H>, send: &mut impl FnMut(&[u8]) -> bool) {
    if let Some(idx) = ctrl.segments.iter().position(|s| s.state == SegState::Unsent) {
        let len = ctrl.segments[idx].frame_len;
        send(&ctrl.segments[idx].frame[..len]);
        ctrl.segments[idx].state = SegState::Unacked;
        ctrl.segments[idx].retransmission_timer_slice = 0;
    }
}

/// Picks the segment slot for the next outgoing chunk: the first
/// `Unused` slot following the last `Unacked` one, or the head `Unused`
/// slot otherwise.
fn pick_unused_segment<H>(ctrl: &TcpController<H>) -> Option<usize> {
    let last_unacked = ctrl
        .segments
        .iter()
        .enumerate()
        .rev()
        .find(|(_, s)| s.state == SegState::Unacked)
        .map(|(i, _)| i);
    if let Some(last) = last_unacked {
        if let Some((i, _)) = ctrl
            .segments
            .iter()
            .enumerate()
            .skip(last + 1)
            .find(|(_, s)| s.state == SegState::Unused)
        {
            return Some(i);
        }
    }
    ctrl.segments.iter().position(|s| s.state == SegState::Unused)
}

/// `tcp_write`: splits `data` into `remote_mss`-sized segments, sends
/// the first immediately, queues the rest `Unsent`.
pub fn write<H>(
    ctrl: &mut TcpController<H>,
    local_mac: EthernetAddress,
    data: &[u8],
    mut send: impl FnMut(&[u8]) -> bool,
) -> Result<()> {
    if ctrl.state != State::Established {
        return Err(Error::App);
    }
    if (ctrl.remote_wnd as usize) < ctrl.remote_mss as usize {
        return Err(Error::PeerWindow);
    }
    if data.is_empty() {
        return Ok(());
    }
    let mss = (ctrl.remote_mss as usize).max(1);
    let needed = data.len().div_ceil(mss);
    let free = ctrl.segments.iter().filter(|s| s.state == SegState::Unused).count();
    if needed > free {
        return Err(Error::SegMem);
    }

    let mut offset = 0;
    let mut first = true;
    while offset < data.len() {
        let chunk_len = (data.len() - offset).min(mss);
        let chunk = &data[offset..offset + chunk_len];
        let is_last = offset + chunk_len >= data.len();
        let idx = pick_unused_segment(ctrl).expect("checked by the free-count guard above");

        let seq = ctrl.local_seqno;
        let ack = ctrl.remote_seqno;
        let mut flags = tcp_flags::ACK;
        if is_last {
            flags |= tcp_flags::PSH;
        }

        let len = {
            let seg = &mut ctrl.segments[idx];
            emit_segment(
                &mut seg.frame,
                local_mac,
                ctrl.remote_mac,
                ctrl.local_ip,
                ctrl.remote_ip,
                ctrl.local_port,
                ctrl.remote_port,
                seq,
                ack,
                flags,
                ctrl.local_wnd,
                None,
                chunk,
            )
        };
        ctrl.segments[idx].frame_len = len;
        ctrl.segments[idx].ack_no_expected = seq.wrapping_add(chunk_len as u32);
        ctrl.segments[idx].retransmission_timer_slice = 0;
        ctrl.local_seqno = ctrl.local_seqno.wrapping_add(chunk_len as u32);
        ctrl.remote_ack_pending = false;

        if first {
            let bytes_len = ctrl.segments[idx].frame_len;
            send(&ctrl.segments[idx].frame[..bytes_len]);
            ctrl.segments[idx].state = SegState::Unacked;
            first = false;
        } else {
            ctrl.segments[idx].state = SegState::Unsent;
        }
        offset += chunk_len;
    }
    Ok(())
}

fn append_stream<H>(ctrl: &mut TcpController<H>, payload: &[u8]) -> Result<()> {
    if ctrl.stream_sequence == 0 {
        ctrl.seqno_ori = ctrl.remote_seqno;
    }
    let overrun = ctrl.stream_position + payload.len() > ctrl.incoming_stream.len()
        || ctrl.stream_sequence as usize >= MAX_TCP_SEG - 1;
    if overrun {
        ctrl.stream_position = 0;
        ctrl.stream_sequence = 0;
        return Err(Error::BufferOverrun);
    }
    ctrl.incoming_stream[ctrl.stream_position..ctrl.stream_position + payload.len()]
        .copy_from_slice(payload);
    ctrl.stream_position += payload.len();
    ctrl.stream_sequence += 1;
    Ok(())
}

fn deliver_stream_tail<H: TcpHandler>(
    ctrl: &mut TcpController<H>,
    handle: TcpHandle,
    payload: &[u8],
) -> Result<()> {
    if ctrl.stream_sequence == 0 {
        ctrl.handler.on_recv(handle, payload);
        return Ok(());
    }
    let expected = ctrl.stream_sequence * ctrl.local_mss as u32;
    let actual = ctrl.remote_seqno.wrapping_sub(ctrl.seqno_ori);
    if expected != actual {
        ctrl.stream_position = 0;
        ctrl.stream_sequence = 0;
        return Err(Error::Streaming);
    }
    if ctrl.stream_position + payload.len() > ctrl.incoming_stream.len() {
        ctrl.stream_position = 0;
        ctrl.stream_sequence = 0;
        return Err(Error::BufferOverrun);
    }
    ctrl.incoming_stream[ctrl.stream_position..ctrl.stream_position + payload.len()]
        .copy_from_slice(payload);
    ctrl.stream_position += payload.len();
    ctrl.handler.on_recv(handle, &ctrl.incoming_stream[..ctrl.stream_position]);
    ctrl.stream_position = 0;
    ctrl.stream_sequence = 0;
    Ok(())
}

/// Advances an already-matched (non-listening) controller against one
/// received segment. Returns `true` if the controller is now `Closed`
/// and the caller must unregister it from the active/listen lists.
#[allow(clippy::too_many_arguments)]
pub fn on_segment<H: TcpHandler>(
    ctrl: &mut TcpController<H>,
    handle: TcpHandle,
    flags: u8,
    seq: u32,
    ack: u32,
    window: u16,
    payload: &[u8],
    local_mac: EthernetAddress,
    mut send: impl FnMut(&[u8]) -> bool,
) -> bool {
    if flags & tcp_flags::RST != 0 {
        ctrl.state = State::Closed;
        ctrl.last_error = Some(Error::Rst);
        ctrl.handler.on_closed(handle, Some(Error::Rst));
        return true;
    }

    match ctrl.state {
        State::Established => {
            if flags & tcp_flags::ACK != 0 {
                ctrl.remote_wnd = window;
                release_acked(ctrl, ack);
                transmit_next_unsent(ctrl, &mut send);
            }
            if flags & tcp_flags::FIN != 0 {
                ctrl.remote_seqno = ctrl.remote_seqno.wrapping_add(1);
                send_control(ctrl, local_mac, tcp_flags::FIN | tcp_flags::ACK, &mut send);
                ctrl.local_seqno = ctrl.local_seqno.wrapping_add(1);
                ctrl.state = State::LastAck;
                return false;
            }
            if !payload.is_empty() && seq == ctrl.remote_seqno {
                let delivered = if flags & tcp_flags::PSH != 0 {
                    deliver_stream_tail(ctrl, handle, payload)
                } else {
                    append_stream(ctrl, payload)
                };
                if let Err(e) = delivered {
                    warn!("tcp: port {} stream reassembly failed: {}", ctrl.local_port, e);
                    ctrl.last_error = Some(e);
                }
                ctrl.remote_seqno = ctrl.remote_seqno.wrapping_add(payload.len() as u32);
                if ctrl.options.delay_ack_reply {
                    ctrl.remote_ack_pending = true;
                } else {
                    send_standalone_ack(ctrl, local_mac, &mut send);
                }
            }
            false
        }
        State::SynSent => {
            if flags & (tcp_flags::SYN | tcp_flags::ACK) == (tcp_flags::SYN | tcp_flags::ACK) {
                ctrl.remote_seqno = seq.wrapping_add(1);
                ctrl.remote_wnd = window;
                release_acked(ctrl, ack);
                ctrl.state = State::Established;
                send_standalone_ack(ctrl, local_mac, &mut send);
                ctrl.handler.on_connect(handle);
            } else if flags & tcp_flags::SYN != 0 {
                // Simultaneous open: both sides sent SYN first.
                ctrl.remote_seqno = seq.wrapping_add(1);
                send_standalone_ack(ctrl, local_mac, &mut send);
                ctrl.state = State::SynRcvd;
            }
            false
        }
        State::SynRcvd => {
            if flags & tcp_flags::ACK != 0 {
                ctrl.remote_wnd = window;
                release_acked(ctrl, ack);
                ctrl.state = State::Established;
            }
            false
        }
        State::FinWait1 => {
            if flags & tcp_flags::FIN != 0 {
                ctrl.remote_seqno = seq.wrapping_add(1);
                send_standalone_ack(ctrl, local_mac, &mut send);
                ctrl.state = State::Closing;
            } else if flags & tcp_flags::ACK != 0 {
                release_acked(ctrl, ack);
                ctrl.state = State::FinWait2;
            }
            false
        }
        State::FinWait2 => {
            if flags & tcp_flags::FIN != 0 {
                ctrl.remote_seqno = seq.wrapping_add(1);
                send_standalone_ack(ctrl, local_mac, &mut send);
                ctrl.state = State::TimeWait;
                ctrl.state_timer_ticks = 0;
            }
            false
        }
        State::Closing => {
            if flags & tcp_flags::ACK != 0 {
                ctrl.state = State::TimeWait;
                ctrl.state_timer_ticks = 0;
            }
            false
        }
        State::LastAck => {
            if flags & tcp_flags::ACK != 0 {
                ctrl.state = State::Closed;
                ctrl.handler.on_closed(handle, None);
                return true;
            }
            false
        }
        State::CloseWait | State::TimeWait | State::Listen | State::Closed => false,
    }
}

/// `tcp_connect`'s network half: emits the initial SYN and moves to
/// `SynSent`. `remote_mac` is the already-resolved (or just-failed) ARP
/// lookup, so a `MacAddrUnknown` propagates cleanly via `?`.
pub fn begin_connect<H>(
    ctrl: &mut TcpController<H>,
    remote_ip: Ipv4Address,
    remote_port: u16,
    remote_mac: Result<EthernetAddress>,
    local_mac: EthernetAddress,
    initial_seq: u32,
    mut send: impl FnMut(&[u8]) -> bool,
) -> Result<()> {
    if ctrl.state != State::Closed {
        return Err(Error::Val);
    }
    if remote_ip.is_unspecified() || remote_port == 0 {
        return Err(Error::Val);
    }
    ctrl.remote_ip = remote_ip;
    ctrl.remote_port = remote_port;
    ctrl.reconnect = Some((remote_ip, remote_port));
    let mac = remote_mac?;
    ctrl.remote_mac = mac;
    ctrl.local_seqno = initial_seq;

    let len = emit_segment(
        &mut ctrl.control_segment.frame,
        local_mac,
        mac,
        ctrl.local_ip,
        remote_ip,
        ctrl.local_port,
        remote_port,
        initial_seq,
        0,
        tcp_flags::SYN,
        ctrl.local_wnd,
        Some(TCP_MSS as u16),
        &[],
    );
    ctrl.control_segment.frame_len = len;
    ctrl.control_segment.ack_no_expected = initial_seq.wrapping_add(1);
    ctrl.control_segment.state = SegState::Unacked;
    ctrl.control_segment.retransmission_timer_slice = 0;
    send(&ctrl.control_segment.frame[..len]);
    ctrl.state = State::SynSent;
    Ok(())
}

/// Spawns a `NonPersistent` child off a listening controller for an
/// inbound SYN, replying SYN|ACK and entering `SynRcvd`. The child
/// inherits a clone of the listener's handler, so `H::on_accept` fires
/// on the listener while later events address the child by its own
/// handle.
#[allow(clippy::too_many_arguments)]
pub fn create_child<H: Clone + TcpHandler>(
    pool: &mut TcpPool<H>,
    listener: TcpHandle,
    remote_ip: Ipv4Address,
    remote_port: u16,
    remote_mac: EthernetAddress,
    remote_seq: u32,
    remote_mss: u16,
    local_mac: EthernetAddress,
    initial_local_seq: u32,
    mut send: impl FnMut(&[u8]) -> bool,
) -> Result<TcpHandle> {
    let (local_ip, local_port, handler_clone) = {
        let l = pool.get(listener).ok_or(Error::Val)?;
        (l.local_ip, l.local_port, l.handler.clone())
    };
    let slot = pool.alloc_slot().ok_or(Error::TcpMem)?;
    let mut child = TcpController::new(Kind::NonPersistent, local_ip, local_port, handler_clone);
    child.remote_ip = remote_ip;
    child.remote_port = remote_port;
    child.remote_mac = remote_mac;
    child.remote_seqno = remote_seq.wrapping_add(1);
    child.remote_mss = remote_mss.clamp(1, TCP_MSS as u16);
    child.local_seqno = initial_local_seq;

    let len = emit_segment(
        &mut child.control_segment.frame,
        local_mac,
        remote_mac,
        local_ip,
        remote_ip,
        local_port,
        remote_port,
        initial_local_seq,
        child.remote_seqno,
        tcp_flags::SYN | tcp_flags::ACK,
        child.local_wnd,
        Some(TCP_MSS as u16),
        &[],
    );
    child.control_segment.frame_len = len;
    child.control_segment.ack_no_expected = initial_local_seq.wrapping_add(1);
    child.control_segment.state = SegState::Unacked;
    send(&child.control_segment.frame[..len]);
    child.state = State::SynRcvd;

    pool.controllers[slot] = Some(child);
    let handle = TcpHandle(slot);
    if let Some(l) = pool.get_mut(listener) {
        l.handler.on_accept(listener, handle);
    }
    Ok(handle)
}

/// `tcp_close`: `Established` -> `FinWait1`, `CloseWait` -> `LastAck`.
/// Any other state is a no-op (matches the contract: closing an
/// already-closing connection does nothing).
pub fn close<H>(
    ctrl: &mut TcpController<H>,
    local_mac: EthernetAddress,
    mut send: impl FnMut(&[u8]) -> bool,
) {
    match ctrl.state {
        State::Established => {
            send_control(ctrl, local_mac, tcp_flags::FIN | tcp_flags::ACK, &mut send);
            ctrl.local_seqno = ctrl.local_seqno.wrapping_add(1);
            ctrl.state = State::FinWait1;
        }
        State::CloseWait => {
            send_control(ctrl, local_mac, tcp_flags::FIN | tcp_flags::ACK, &mut send);
            ctrl.local_seqno = ctrl.local_seqno.wrapping_add(1);
            ctrl.state = State::LastAck;
        }
        _ => {}
    }
}

/// `tcp_abort`: sends a RST immediately and forces `Closed`.
pub fn abort<H: TcpHandler>(
    ctrl: &mut TcpController<H>,
    handle: TcpHandle,
    local_mac: EthernetAddress,
    mut send: impl FnMut(&[u8]) -> bool,
) {
    if ctrl.state != State::Closed && ctrl.state != State::Listen {
        let len = emit_segment(
            &mut ctrl.control_segment.frame,
            local_mac,
            ctrl.remote_mac,
            ctrl.local_ip,
            ctrl.remote_ip,
            ctrl.local_port,
            ctrl.remote_port,
            ctrl.local_seqno,
            ctrl.remote_seqno,
            tcp_flags::RST,
            ctrl.local_wnd,
            None,
            &[],
        );
        send(&ctrl.control_segment.frame[..len]);
    }
    ctrl.state = State::Closed;
    ctrl.last_error = Some(Error::Rst);
    ctrl.handler.on_closed(handle, Some(Error::Rst));
}

/// One 500ms tick on a single controller: ages every `Unacked` segment
/// (every slot, not just the head, so the pool drains honestly rather
/// than blocking on the first-sent timer alone), retransmits the
/// oldest the first time its slice fires, resets and forces a RST if
/// any segment's slice crosses the retransmission ceiling, and walks
/// the per-state timeout ladder.
pub fn on_timer_tick<H: TcpHandler>(
    ctrl: &mut TcpController<H>,
    handle: TcpHandle,
    local_mac: EthernetAddress,
    mut send: impl FnMut(&[u8]) -> bool,
) -> TimerOutcome {
    match ctrl.state {
        State::Closed => {
            if ctrl.reconnect.is_some() {
                ctrl.handler.on_connect(handle);
            }
            return TimerOutcome::None;
        }
        State::Listen => return TimerOutcome::None,
        _ => {}
    }

    let mut expired = false;
    for seg in ctrl.segments.iter_mut() {
        if seg.state == SegState::Unacked {
            seg.retransmission_timer_slice += 1;
            if seg.retransmission_timer_slice >= TCP_RETRANSMISSION_TIMEOUT_TICKS {
                expired = true;
            }
        }
    }
    if ctrl.control_segment.state == SegState::Unacked {
        ctrl.control_segment.retransmission_timer_slice += 1;
        if ctrl.control_segment.retransmission_timer_slice >= TCP_RETRANSMISSION_TIMEOUT_TICKS {
            expired = true;
        }
    }
    if expired {
        warn!(
            "tcp: port {} retransmission ceiling hit, resetting connection to {}:{}",
            ctrl.local_port, ctrl.remote_ip, ctrl.remote_port
        );
        let len = emit_segment(
            &mut ctrl.control_segment.frame,
            local_mac,
            ctrl.remote_mac,
            ctrl.local_ip,
            ctrl.remote_ip,
            ctrl.local_port,
            ctrl.remote_port,
            ctrl.local_seqno,
            ctrl.remote_seqno,
            tcp_flags::RST,
            ctrl.local_wnd,
            None,
            &[],
        );
        send(&ctrl.control_segment.frame[..len]);
        ctrl.state = State::Closed;
        ctrl.last_error = Some(Error::Rst);
        ctrl.handler.on_closed(handle, Some(Error::Rst));
        return TimerOutcome::Closed;
    }

    if !ctrl.segments.iter().any(|s| s.state == SegState::Unacked) {
        transmit_next_unsent(ctrl, &mut send);
    }

    match ctrl.state {
        State::FinWait1 | State::FinWait2 | State::Closing => {
            ctrl.state_timer_ticks += 1;
            if ctrl.state_timer_ticks >= TCP_FIN_WAIT_TIMEOUT_TICKS {
                ctrl.state = State::TimeWait;
                ctrl.state_timer_ticks = 0;
            }
        }
        State::TimeWait | State::LastAck => {
            ctrl.state_timer_ticks += 1;
            if ctrl.state_timer_ticks >= TCP_FIN_WAIT_TIMEOUT_TICKS {
                ctrl.state = State::Closed;
                ctrl.handler.on_closed(handle, None);
                return TimerOutcome::Closed;
            }
        }
        State::SynRcvd => {
            ctrl.state_timer_ticks += 1;
            if ctrl.state_timer_ticks >= TCP_SYN_RCVD_TIMEOUT_TICKS {
                let len = emit_segment(
                    &mut ctrl.control_segment.frame,
                    local_mac,
                    ctrl.remote_mac,
                    ctrl.local_ip,
                    ctrl.remote_ip,
                    ctrl.local_port,
                    ctrl.remote_port,
                    ctrl.local_seqno,
                    ctrl.remote_seqno,
                    tcp_flags::RST,
                    ctrl.local_wnd,
                    None,
                    &[],
                );
                send(&ctrl.control_segment.frame[..len]);
                ctrl.state = State::Closed;
                ctrl.last_error = Some(Error::Rst);
                ctrl.handler.on_closed(handle, Some(Error::Rst));
                return TimerOutcome::Closed;
            }
        }
        _ => {}
    }

    if ctrl.state == State::Established && ctrl.nb_of_500ms > 0 {
        ctrl.counter_of_500ms += 1;
        if ctrl.counter_of_500ms >= ctrl.nb_of_500ms {
            ctrl.counter_of_500ms = 0;
            if !ctrl.handler.on_periodic_check(handle) {
                close(ctrl, local_mac, &mut send);
            }
        }
    }

    TimerOutcome::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TCP_EPHEMERAL_START;

    #[derive(Default, Clone)]
    struct Recorder {
        received: heapless::Vec<u8, 128>,
        accepted: Option<TcpHandle>,
        connected: bool,
        closed: Option<Option<Error>>,
    }

    impl TcpHandler for Recorder {
        fn on_recv(&mut self, _handle: TcpHandle, data: &[u8]) {
            self.received.clear();
            let _ = self.received.extend_from_slice(data);
        }
        fn on_accept(&mut self, _listener: TcpHandle, child: TcpHandle) {
            self.accepted = Some(child);
        }
        fn on_connect(&mut self, _handle: TcpHandle) {
            self.connected = true;
        }
        fn on_closed(&mut self, _handle: TcpHandle, err: Option<Error>) {
            self.closed = Some(err);
        }
    }

    fn local() -> (EthernetAddress, Ipv4Address) {
        (EthernetAddress::new([1; 6]), Ipv4Address::new(10, 0, 0, 1))
    }

    #[test]
    fn new_controller_assigns_ephemeral_port_when_zero() {
        let mut pool: TcpPool<()> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, Ipv4Address::new(10, 0, 0, 1), 0, &mut next, ()).unwrap();
        assert_eq!(pool.get(h).unwrap().local_port(), TCP_EPHEMERAL_START);
        assert_eq!(next, TCP_EPHEMERAL_START + 1);
    }

    #[test]
    fn connect_sends_syn_and_enters_syn_sent() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<Recorder> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, local_ip, 0, &mut next, Recorder::default()).unwrap();
        let ctrl = pool.get_mut(h).unwrap();

        let mut sent: heapless::Vec<usize, 2> = heapless::Vec::new();
        begin_connect(
            ctrl,
            Ipv4Address::new(10, 0, 0, 2),
            9000,
            Ok(EthernetAddress::new([2; 6])),
            local_mac,
            1000,
            |b| {
                let _ = sent.push(b.len());
                true
            },
        )
        .unwrap();

        assert_eq!(ctrl.state(), State::SynSent);
        let expected_len = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN + 4;
        assert_eq!(sent.as_slice(), &[expected_len]);
    }

    #[test]
    fn three_way_handshake_reaches_established_and_fires_on_connect() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<Recorder> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, local_ip, 0, &mut next, Recorder::default()).unwrap();

        {
            let ctrl = pool.get_mut(h).unwrap();
            begin_connect(
                ctrl,
                Ipv4Address::new(10, 0, 0, 2),
                9000,
                Ok(EthernetAddress::new([2; 6])),
                local_mac,
                1000,
                |_| true,
            )
            .unwrap();
        }

        let ctrl = pool.get_mut(h).unwrap();
        assert_eq!(ctrl.state(), State::SynSent);
        let closed = on_segment(
            ctrl,
            h,
            tcp_flags::SYN | tcp_flags::ACK,
            5000,
            1001,
            TCP_WND,
            &[],
            local_mac,
            |_| true,
        );
        assert!(!closed);
        assert_eq!(ctrl.state(), State::Established);
        assert!(ctrl.handler.connected);
    }

    #[test]
    fn write_rejects_when_not_established() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<()> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, local_ip, 1234, &mut next, ()).unwrap();
        let ctrl = pool.get_mut(h).unwrap();
        assert_eq!(write(ctrl, local_mac, b"hi", |_| true), Err(Error::App));
    }

    #[test]
    fn established_data_segment_is_delivered_and_acked() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<Recorder> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, local_ip, 1234, &mut next, Recorder::default()).unwrap();
        let ctrl = pool.get_mut(h).unwrap();
        ctrl.state = State::Established;
        ctrl.remote_ip = Ipv4Address::new(10, 0, 0, 2);
        ctrl.remote_port = 9000;
        ctrl.remote_mac = EthernetAddress::new([2; 6]);
        ctrl.remote_seqno = 500;
        ctrl.local_seqno = 1000;

        let mut ack_sent = 0;
        let closed = on_segment(
            ctrl,
            h,
            tcp_flags::PSH | tcp_flags::ACK,
            500,
            1000,
            TCP_WND,
            b"hello",
            local_mac,
            |_| {
                ack_sent += 1;
                true
            },
        );
        assert!(!closed);
        assert_eq!(ctrl.handler.received.as_slice(), b"hello");
        assert_eq!(ctrl.remote_seqno, 505);
        assert_eq!(ack_sent, 1);
    }

    #[test]
    fn rst_closes_and_fires_on_closed() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<Recorder> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, local_ip, 1234, &mut next, Recorder::default()).unwrap();
        let ctrl = pool.get_mut(h).unwrap();
        ctrl.state = State::Established;

        let closed = on_segment(ctrl, h, tcp_flags::RST, 0, 0, 0, &[], local_mac, |_| true);
        assert!(closed);
        assert_eq!(ctrl.state(), State::Closed);
        assert_eq!(ctrl.handler.closed, Some(Some(Error::Rst)));
    }

    #[test]
    fn close_from_established_moves_to_fin_wait_1() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<()> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, local_ip, 1234, &mut next, ()).unwrap();
        let ctrl = pool.get_mut(h).unwrap();
        ctrl.state = State::Established;
        close(ctrl, local_mac, |_| true);
        assert_eq!(ctrl.state(), State::FinWait1);
    }

    #[test]
    fn timer_tick_retransmits_unacked_segment_past_its_timeout() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<Recorder> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, local_ip, 1234, &mut next, Recorder::default()).unwrap();
        let ctrl = pool.get_mut(h).unwrap();
        ctrl.state = State::Established;
        ctrl.remote_wnd = TCP_WND;
        ctrl.remote_mac = EthernetAddress::new([2; 6]);
        write(ctrl, local_mac, b"abc", |_| true).unwrap();

        let mut outcome = TimerOutcome::None;
        for _ in 0..TCP_RETRANSMISSION_TIMEOUT_TICKS {
            outcome = on_timer_tick(ctrl, h, local_mac, |_| true);
        }
        assert_eq!(outcome, TimerOutcome::Closed);
        assert_eq!(ctrl.state(), State::Closed);
    }

    #[test]
    fn segment_pool_exhaustion_is_rejected() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<()> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let h = new_controller(&mut pool, local_ip, 1234, &mut next, ()).unwrap();
        let ctrl = pool.get_mut(h).unwrap();
        ctrl.state = State::Established;
        ctrl.remote_wnd = TCP_WND;
        ctrl.remote_mac = EthernetAddress::new([2; 6]);
        ctrl.remote_mss = 1;
        let huge = [0u8; MAX_TCP_SEG + 1];
        assert_eq!(write(ctrl, local_mac, &huge, |_| true), Err(Error::SegMem));
    }

    #[test]
    fn create_child_inherits_handler_and_fires_on_accept() {
        let (local_mac, local_ip) = local();
        let mut pool: TcpPool<Recorder> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let listener = new_controller(&mut pool, local_ip, 80, &mut next, Recorder::default()).unwrap();
        listen(pool.get_mut(listener).unwrap()).unwrap();

        let child = create_child(
            &mut pool,
            listener,
            Ipv4Address::new(10, 0, 0, 9),
            4000,
            EthernetAddress::new([9; 6]),
            100,
            TCP_MSS as u16,
            local_mac,
            9000,
            |_| true,
        )
        .unwrap();

        assert_eq!(pool.get(child).unwrap().state(), State::SynRcvd);
        assert_eq!(pool.get(listener).unwrap().handler.accepted, Some(child));
    }

    #[test]
    fn rebuild_lists_separates_listen_from_active() {
        let mut pool: TcpPool<()> = TcpPool::new();
        let mut next = TCP_EPHEMERAL_START;
        let l = new_controller(&mut pool, Ipv4Address::new(10, 0, 0, 1), 80, &mut next, ()).unwrap();
        listen(pool.get_mut(l).unwrap()).unwrap();
        let a = new_controller(&mut pool, Ipv4Address::new(10, 0, 0, 1), 9000, &mut next, ()).unwrap();
        pool.get_mut(a).unwrap().state = State::Established;

        let mut active = Vec::new();
        let mut listen_list = Vec::new();
        rebuild_lists(&pool, &mut active, &mut listen_list);
        assert_eq!(active.as_slice(), &[a]);
        assert_eq!(listen_list.as_slice(), &[l]);
    }
}
