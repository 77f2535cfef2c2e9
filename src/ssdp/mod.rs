//! SSDP: discovery messages and per-interface receivers.

mod message;
mod notify;
mod search;
mod server;

pub use message::{Nts, SsdpMessage};
pub(crate) use notify::SsdpNotifyReceiver;
pub(crate) use search::SsdpSearchServer;
pub(crate) use server::{SsdpServerDelegate, SsdpSocketRole};

/// IPv4 SSDP multicast address.
pub const SSDP_MCAST_V4: &str = "239.255.255.250";

/// IPv6 link-local SSDP multicast address.
pub const SSDP_MCAST_V6: &str = "ff02::c";

/// SSDP port.
pub const SSDP_PORT: u16 = 1900;

/// Default announcement validity when CACHE-CONTROL is absent or unusable.
pub const DEFAULT_MAX_AGE: u32 = 1800;

/// Search target matching every device and service.
pub const ST_ALL: &str = "ssdp:all";

/// Admission predicate applied to validated SSDP messages before they reach
/// the device loader. The default accepts everything.
pub trait SsdpMessageFilter: Send + Sync {
    fn accept(&self, message: &SsdpMessage) -> bool;
}

/// The default filter: accept all messages.
pub struct AcceptAllFilter;

impl SsdpMessageFilter for AcceptAllFilter {
    fn accept(&self, _message: &SsdpMessage) -> bool {
        true
    }
}
