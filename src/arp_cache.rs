//! The fixed-size IP→MAC cache and the route-selection helper that
//! decides which address ARP should resolve in the first place.

use crate::config::ARP_TABLE_SIZE;
use crate::error::{Error, Result};
use crate::wire::{EthernetAddress, Ipv4Address};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Unused,
    Resolved,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: EntryState,
    ip: Ipv4Address,
    mac: EthernetAddress,
}

impl Entry {
    const fn unused() -> Entry {
        Entry {
            state: EntryState::Unused,
            ip: Ipv4Address::UNSPECIFIED,
            mac: EthernetAddress::new([0; 6]),
        }
    }
}

/// Route selection: decides whether a destination is reachable
/// directly on the local subnet or must go through the gateway.
///
/// `gateway = Ipv4Address::UNSPECIFIED` means "no gateway configured".
pub fn route(dst_ip: Ipv4Address, gateway: Ipv4Address, mask: Ipv4Address) -> Ipv4Address {
    if gateway.is_unspecified() || dst_ip.mask(mask) == gateway.mask(mask) || dst_ip.is_broadcast()
    {
        dst_ip
    } else {
        gateway
    }
}

/// Fixed `ARP_TABLE_SIZE` entries with oldest-slot replacement.
#[derive(Debug)]
pub struct ArpCache {
    entries: [Entry; ARP_TABLE_SIZE],
    /// Advances modulo `ARP_TABLE_SIZE` every time a full cache must
    /// evict; points at the next slot to overwrite.
    older_index: usize,
}

impl ArpCache {
    pub const fn new() -> ArpCache {
        ArpCache {
            entries: [Entry::unused(); ARP_TABLE_SIZE],
            older_index: 0,
        }
    }

    /// Resolves `ip` to a MAC: linear scan hit, subnet-broadcast
    /// synthesis, or `Err(Error::Val)` the caller converts to
    /// `MacAddrUnknown` after emitting an ARP request.
    pub fn lookup(&self, ip: Ipv4Address, netmask: Ipv4Address) -> Result<EthernetAddress> {
        for entry in self.entries.iter() {
            if entry.state != EntryState::Unused && entry.ip == ip {
                return Ok(entry.mac);
            }
        }
        let host_bits = !netmask.to_bits();
        if (ip.to_bits() & host_bits) == (0xFFFF_FFFFu32 & host_bits) {
            return Ok(EthernetAddress::BROADCAST);
        }
        Err(Error::Val)
    }

    /// Inserts or updates `(ip, mac)`: broadcast MACs are never cached
    ///. Update-in-place on a matching IP; otherwise the
    /// first `Unused` slot; otherwise the `older_index` slot, which
    /// then advances modulo `ARP_TABLE_SIZE`.
    pub fn insert(&mut self, ip: Ipv4Address, mac: EthernetAddress) {
        if mac.is_broadcast() {
            return;
        }
        for entry in self.entries.iter_mut() {
            if entry.state != EntryState::Unused && entry.ip == ip {
                entry.mac = mac;
                return;
            }
        }
        for entry in self.entries.iter_mut() {
            if entry.state == EntryState::Unused {
                *entry = Entry {
                    state: EntryState::Resolved,
                    ip,
                    mac,
                };
                return;
            }
        }
        self.entries[self.older_index] = Entry {
            state: EntryState::Resolved,
            ip,
            mac,
        };
        self.older_index = (self.older_index + 1) % ARP_TABLE_SIZE;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state != EntryState::Unused)
            .count()
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}
