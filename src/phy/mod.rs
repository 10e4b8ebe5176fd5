//! The link-layer driver interface the core is built against.
//! Installing the ISR, feeding the hardware timer, and implementing
//! the DMA/MMIO details of `recv`/`send` are the host's responsibility;
//! this crate only consumes the trait.
//!
//! The driver is injected and ISR-fed rather than token-polled, so one
//! trait with a blocking send and a non-blocking receive is enough.

use crate::config::MTU_STORAGE;

/// A link-layer driver: blocking send, non-blocking receive called
/// from interrupt context.
pub trait Driver {
    /// Copies at most one waiting frame into `buffer`, returning the
    /// number of bytes copied, or `None` if nothing is waiting.
    /// Called from the ISR; must not block.
    fn recv(&mut self, buffer: &mut [u8; MTU_STORAGE]) -> Option<usize>;

    /// Transmits exactly `buffer[..len]`. May block briefly on DMA
    /// completion. Returns `false` on a driver-reported failure.
    fn send(&mut self, buffer: &[u8], len: usize) -> bool;
}

#[cfg(test)]
pub(crate) mod test_driver {
    use super::*;
    use heapless::Deque;

    /// An in-memory `Driver` used by unit tests to inject and capture
    /// frames without a real link layer.
    #[derive(Default)]
    pub struct LoopbackDriver {
        pub inbox: Deque<([u8; MTU_STORAGE], usize), 16>,
        pub sent: Deque<([u8; MTU_STORAGE], usize), 16>,
        pub fail_next_send: bool,
    }

    impl LoopbackDriver {
        pub fn push_inbound(&mut self, frame: &[u8]) {
            let mut buf = [0u8; MTU_STORAGE];
            buf[..frame.len()].copy_from_slice(frame);
            let _ = self.inbox.push_back((buf, frame.len()));
        }
    }

    impl Driver for LoopbackDriver {
        fn recv(&mut self, buffer: &mut [u8; MTU_STORAGE]) -> Option<usize> {
            let (frame, len) = self.inbox.pop_front()?;
            *buffer = frame;
            Some(len)
        }

        fn send(&mut self, buffer: &[u8], len: usize) -> bool {
            if self.fail_next_send {
                self.fail_next_send = false;
                return false;
            }
            let mut buf = [0u8; MTU_STORAGE];
            buf[..len].copy_from_slice(&buffer[..len]);
            let _ = self.sent.push_back((buf, len));
            true
        }
    }
}
