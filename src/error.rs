//! The error taxonomy shared by every layer of the core.
//!
//! Every fallible core function returns `Result<T, Error>`. Errors never
//! propagate out of a callback: a callback that wants to signal failure
//! does so through its own return value, which the caller (the core, not
//! the application) may choose to ignore, exactly so the caller can choose to ignore it.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Application-level fault, e.g. `write` while not `Established`.
    App,
    /// Inbound stream exceeded the accumulator's capacity.
    BufferOverrun,
    /// Connection reset, by peer, local abort, or retransmission exhaustion.
    Rst,
    /// Bad parameter: IP = 0, port = 0 where forbidden, unroutable address.
    Val,
    /// ARP has not resolved the peer's MAC yet; a request has been sent.
    MacAddrUnknown,
    /// IP/TCP/UDP checksum mismatch.
    Checksum,
    /// Gap detected in in-order stream reassembly.
    Streaming,
    /// Peer's advertised window is smaller than its own MSS.
    PeerWindow,
    /// `write` would need more segments than are free.
    SegMem,
    /// Reserved for deferred-send variants; never returned today.
    CurSegMem,
    /// The UDP controller pool is exhausted.
    UdpMem,
    /// The TCP controller pool is exhausted.
    TcpMem,
    /// The network adapter pool is exhausted.
    NetAdapterMem,
    /// The injected driver reported a send failure.
    DeviceDriver,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::App => "application fault",
            Error::BufferOverrun => "stream accumulator overrun",
            Error::Rst => "connection reset",
            Error::Val => "invalid parameter",
            Error::MacAddrUnknown => "MAC address unknown, ARP request sent",
            Error::Checksum => "checksum mismatch",
            Error::Streaming => "stream reassembly gap",
            Error::PeerWindow => "peer window smaller than its MSS",
            Error::SegMem => "segment pool exhausted",
            Error::CurSegMem => "reserved",
            Error::UdpMem => "UDP controller pool exhausted",
            Error::TcpMem => "TCP controller pool exhausted",
            Error::NetAdapterMem => "network adapter pool exhausted",
            Error::DeviceDriver => "device driver send failure",
        };
        f.write_str(s)
    }
}

/// A rendered stack error: adapter name, the 4-tuple when applicable,
/// and the call site that raised it. `NetworkAdapter` keeps the last one
/// of these around.
#[derive(Debug, Clone, Copy)]
pub struct StackError {
    pub error: Error,
    pub adapter_name: [u8; 2],
    pub local_port: u16,
    pub remote_port: u16,
    pub function: &'static str,
    pub line: u32,
}

impl StackError {
    pub const fn new(error: Error, adapter_name: [u8; 2], function: &'static str, line: u32) -> Self {
        StackError {
            error,
            adapter_name,
            local_port: 0,
            remote_port: 0,
            function,
            line,
        }
    }

    pub const fn with_ports(mut self, local_port: u16, remote_port: u16) -> Self {
        self.local_port = local_port;
        self.remote_port = remote_port;
        self
    }
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}{}] {} (port {}<->{}) at {}:{}",
            self.adapter_name[0] as char,
            self.adapter_name[1] as char,
            self.error,
            self.local_port,
            self.remote_port,
            self.function,
            self.line,
        )
    }
}

/// Records the call site of an error into a `StackError` along with
/// the function name and source line.
macro_rules! stack_error {
    ($adapter:expr, $err:expr) => {
        $crate::error::StackError::new($err, $adapter, concat!(module_path!(), "::", "here"), line!())
    };
}
#[allow(unused_imports)]
pub(crate) use stack_error;
