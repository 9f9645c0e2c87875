//! Listener fanout: UDP, TCP and DoT servers sharing one dispatcher.

pub mod dot;
pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
