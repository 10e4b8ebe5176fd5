//! Compile-time constants sizing every fixed-capacity structure in the
//! crate. All of these are deliberately `pub const` rather than cargo
//! features: array sizes need to be known at monomorphization time, and
//! an embedder who needs different bounds is expected to fork the
//! constant, not thread a generic parameter through every module.

/// Depth of the ingress ring (number of buffered frames between the ISR
/// and the dispatch loop).
pub const RECV_BUF_SIZE: usize = 10;

/// Per-slot storage size of the ingress ring and of every segment frame
/// buffer, i.e. the largest Ethernet frame the stack will build or
/// accept. Rounded up to a 4-byte multiple as the data model requires.
pub const NETWORK_MTU: usize = 1518;

/// `NETWORK_MTU` rounded up to a 4-byte multiple; this is the actual
/// per-slot storage size.
pub const MTU_STORAGE: usize = (NETWORK_MTU + 3) & !3;

/// Number of network adapters a single firmware image is expected to
/// run. The crate itself holds no adapter registry; this bounds how
/// many `NetworkAdapter` values an embedder is expected to construct.
pub const MAX_NET_ADAPTER: usize = 1;

/// Maximum number of live UDP controllers per adapter.
pub const MAX_UDP: usize = 4;

/// Maximum number of live TCP controllers per adapter.
pub const MAX_TCP: usize = 20;

/// Number of pre-allocated outgoing segments per TCP controller.
pub const MAX_TCP_SEG: usize = 10;

/// Number of entries in the ARP cache.
pub const ARP_TABLE_SIZE: usize = 10;

/// Default TCP receive window advertised by this stack.
pub const TCP_WND: u16 = 16384;

/// Default TCP maximum segment size advertised by this stack.
pub const TCP_MSS: usize = 1460;

/// Period of the TCP timer tick, in milliseconds.
pub const TCP_TIMER_PERIOD_MS: u32 = 500;

/// FIN_WAIT / CLOSING time-out, in milliseconds.
pub const TCP_FIN_WAIT_TIMEOUT_MS: u32 = 4000;

/// SYN_RCVD time-out, in milliseconds.
pub const TCP_SYN_RCVD_TIMEOUT_MS: u32 = 10000;

/// Per-segment retransmission time-out, in milliseconds.
pub const TCP_RETRANSMISSION_TIMEOUT_MS: u32 = 3000;

/// `TCP_FIN_WAIT_TIMEOUT_MS` expressed in 500ms ticks.
pub const TCP_FIN_WAIT_TIMEOUT_TICKS: u32 = TCP_FIN_WAIT_TIMEOUT_MS / TCP_TIMER_PERIOD_MS;

/// `TCP_SYN_RCVD_TIMEOUT_MS` expressed in 500ms ticks.
pub const TCP_SYN_RCVD_TIMEOUT_TICKS: u32 = TCP_SYN_RCVD_TIMEOUT_MS / TCP_TIMER_PERIOD_MS;

/// `TCP_RETRANSMISSION_TIMEOUT_MS` expressed in 500ms ticks.
pub const TCP_RETRANSMISSION_TIMEOUT_TICKS: u32 =
    TCP_RETRANSMISSION_TIMEOUT_MS / TCP_TIMER_PERIOD_MS;

/// First port of the TCP ephemeral range used when `tcp_new` is asked
/// for port 0.
pub const TCP_EPHEMERAL_START: u16 = 0x61A8;
/// Last port (inclusive) of the TCP ephemeral range.
pub const TCP_EPHEMERAL_END: u16 = 0x70FF;

/// First port of the UDP ephemeral range used when `udp_new` is asked
/// for port 0.
pub const UDP_EPHEMERAL_START: u16 = 0x7100;
/// Last port (inclusive) of the UDP ephemeral range.
pub const UDP_EPHEMERAL_END: u16 = 0x7FFF;

/// Identifier field used on outgoing ICMP echo requests (`ping`).
pub const ICMP_ECHO_IDENTIFIER: u16 = 0x2222;

/// Minimum payload length of an outgoing `ping` echo request.
pub const ICMP_ECHO_MIN_PAYLOAD: usize = 32;

// `tcp_init`'s original role was a runtime boundary check on TCP_MSS;
// here it is a compile-time assertion instead, since both operands are
// `const`.
const _: () = assert!(
    TCP_MSS + 54 /* Ethernet + IPv4 + TCP header ceiling */ <= MTU_STORAGE,
    "TCP_MSS does not fit inside a single MTU_STORAGE frame"
);
