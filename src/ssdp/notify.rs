//! Multicast NOTIFY receiver for one network interface.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::errors::ControlPointError;
use crate::network::{in_same_segment, InterfaceAddress};
use crate::ssdp::server::{SsdpServerDelegate, SsdpSocketRole};
use crate::ssdp::{Nts, SsdpMessage, SSDP_MCAST_V4, SSDP_MCAST_V6, SSDP_PORT};

pub(crate) type SsdpMessageSink = Arc<dyn Fn(SsdpMessage) + Send + Sync>;

/// Joins the SSDP group on one interface and forwards validated NOTIFY
/// messages.
pub(crate) struct SsdpNotifyReceiver {
    delegate: SsdpServerDelegate,
    segment_check: bool,
}

impl SsdpNotifyReceiver {
    pub fn new(
        interface: InterfaceAddress,
        segment_check: bool,
    ) -> Result<Self, ControlPointError> {
        let group = multicast_group(&interface.address);
        let delegate =
            SsdpServerDelegate::new(interface, SsdpSocketRole::Multicast { group }, "ssdp-notify")?;
        Ok(Self {
            delegate,
            segment_check,
        })
    }

    pub fn start(&mut self, listener: SsdpMessageSink) -> Result<(), ControlPointError> {
        let interface = self.delegate.interface().clone();
        let segment_check = self.segment_check;
        self.delegate.start(move |data, from| {
            if let Some(message) = validate_notify(data, from, &interface, segment_check) {
                listener(message);
            }
        })
    }

    pub fn stop(&mut self) {
        self.delegate.stop();
    }
}

pub(crate) fn multicast_group(address: &IpAddr) -> SocketAddr {
    if address.is_ipv4() {
        SocketAddr::new(SSDP_MCAST_V4.parse().unwrap(), SSDP_PORT)
    } else {
        SocketAddr::new(SSDP_MCAST_V6.parse().unwrap(), SSDP_PORT)
    }
}

/// Per-packet validation for NOTIFY reception.
fn validate_notify(
    data: &[u8],
    from: SocketAddr,
    interface: &InterfaceAddress,
    segment_check: bool,
) -> Option<SsdpMessage> {
    if segment_check {
        if let (IpAddr::V4(if_v4), IpAddr::V4(src_v4)) = (interface.address, from.ip()) {
            if !in_same_segment(if_v4, interface.prefix_length, src_v4) {
                debug!(
                    source = %from,
                    interface = interface.name.as_str(),
                    "Dropping NOTIFY from outside the interface segment"
                );
                return None;
            }
        }
    }

    let message = match SsdpMessage::parse(data, from, interface.address) {
        Ok(message) => message,
        Err(err) => {
            trace!(source = %from, error = %err, "Unparseable SSDP packet");
            return None;
        }
    };

    // Our own M-SEARCH transmissions loop back through the group.
    if message.method() == Some("M-SEARCH") {
        return None;
    }

    // Byebye carries no LOCATION to fetch and is exempt from the check.
    if message.nts() != Nts::ByeBye && !message.has_valid_location() {
        debug!(
            source = %from,
            location = message.location().unwrap_or(""),
            "Dropping SSDP message with mismatched LOCATION host"
        );
        return None;
    }

    Some(message)
}
