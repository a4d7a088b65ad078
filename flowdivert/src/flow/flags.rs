//! Flow state bits.
//!
//! Local and tunnel closure are tracked per direction so that an
//! application shutdown and a provider close can race without one
//! overwriting the other.

use std::fmt;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowFlags(u32);

impl FlowFlags {
    /// A CONNECT has been sent to the provider.
    pub const CONNECT_STARTED: FlowFlags = FlowFlags(0x0000_0001);
    /// The application will read no more.
    pub const READ_CLOSED: FlowFlags = FlowFlags(0x0000_0002);
    /// The application will write no more.
    pub const WRITE_CLOSED: FlowFlags = FlowFlags(0x0000_0004);
    /// The read direction is closed between engine and provider.
    pub const TUNNEL_RD_CLOSED: FlowFlags = FlowFlags(0x0000_0008);
    /// The write direction is closed between engine and provider.
    pub const TUNNEL_WR_CLOSED: FlowFlags = FlowFlags(0x0000_0010);
    pub const HAS_TOKEN: FlowFlags = FlowFlags(0x0000_0020);
    pub const HAS_HMAC: FlowFlags = FlowFlags(0x0000_0040);
    /// Send a READ_NOTIFY once held provider data has been consumed.
    pub const NOTIFY_ON_RECEIVED: FlowFlags = FlowFlags(0x0000_0080);
    /// The CONNECT is deferred to the first write.
    pub const IMPLICIT_CONNECT: FlowFlags = FlowFlags(0x0000_0100);
    /// The local address came from the provider, not from a bind.
    pub const DID_SET_LOCAL_ADDR: FlowFlags = FlowFlags(0x0000_0200);
    /// Between a rejection and the alternate group's answer.
    pub const TRANSPARENT_FAILOVER: FlowFlags = FlowFlags(0x0000_0400);

    pub const fn empty() -> Self {
        FlowFlags(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: FlowFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FlowFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FlowFlags) {
        self.0 &= !other.0;
    }

    /// Both tunnel halves are closed.
    pub const fn tunnel_closed(&self) -> bool {
        self.contains(FlowFlags(Self::TUNNEL_RD_CLOSED.0 | Self::TUNNEL_WR_CLOSED.0))
    }
}

impl std::ops::BitOr for FlowFlags {
    type Output = FlowFlags;

    fn bitor(self, rhs: FlowFlags) -> FlowFlags {
        FlowFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for FlowFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(FlowFlags, &str); 11] = [
            (FlowFlags::CONNECT_STARTED, "CONNECT_STARTED"),
            (FlowFlags::READ_CLOSED, "READ_CLOSED"),
            (FlowFlags::WRITE_CLOSED, "WRITE_CLOSED"),
            (FlowFlags::TUNNEL_RD_CLOSED, "TUNNEL_RD_CLOSED"),
            (FlowFlags::TUNNEL_WR_CLOSED, "TUNNEL_WR_CLOSED"),
            (FlowFlags::HAS_TOKEN, "HAS_TOKEN"),
            (FlowFlags::HAS_HMAC, "HAS_HMAC"),
            (FlowFlags::NOTIFY_ON_RECEIVED, "NOTIFY_ON_RECEIVED"),
            (FlowFlags::IMPLICIT_CONNECT, "IMPLICIT_CONNECT"),
            (FlowFlags::DID_SET_LOCAL_ADDR, "DID_SET_LOCAL_ADDR"),
            (FlowFlags::TRANSPARENT_FAILOVER, "TRANSPARENT_FAILOVER"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_closed_needs_both_halves() {
        let mut flags = FlowFlags::empty();
        flags.insert(FlowFlags::TUNNEL_RD_CLOSED);
        assert!(!flags.tunnel_closed());
        flags.insert(FlowFlags::TUNNEL_WR_CLOSED);
        assert!(flags.tunnel_closed());
        flags.remove(FlowFlags::TUNNEL_RD_CLOSED);
        assert!(!flags.tunnel_closed());
    }

    #[test]
    fn test_debug_lists_set_bits() {
        let flags = FlowFlags::CONNECT_STARTED | FlowFlags::HAS_TOKEN;
        assert_eq!(format!("{:?}", flags), "{CONNECT_STARTED, HAS_TOKEN}");
    }
}
