//! Multicast eventing receiver (UPnP 2.0).
//!
//! Devices may publish events to a dedicated multicast group instead of a
//! unicast callback. Packets are `NOTIFY * HTTP/1.1` datagrams tagged with
//! `LVL`, `SEQ`, `SVCID` and `USN`, carrying the same property-set body as
//! unicast GENA.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use crate::errors::ControlPointError;
use crate::gena::event_receiver::parse_property_set;
use crate::gena::{EVENT_MCAST_PORT, EVENT_MCAST_V4, EVENT_MCAST_V6, UPNP_EVENT, UPNP_PROPCHANGE};
use crate::network::InterfaceAddress;
use crate::ssdp::{SsdpMessage, SsdpServerDelegate, SsdpSocketRole};

/// `(uuid, svcid, lvl, seq, properties)` of one multicast event.
pub(crate) type MulticastEventSink =
    Arc<dyn Fn(String, String, String, u64, Vec<(String, String)>) + Send + Sync>;

pub(crate) struct MulticastEventReceiver {
    delegate: SsdpServerDelegate,
}

impl MulticastEventReceiver {
    pub fn new(interface: InterfaceAddress) -> Result<Self, ControlPointError> {
        let group = event_multicast_group(&interface);
        let delegate = SsdpServerDelegate::new(
            interface,
            SsdpSocketRole::Multicast { group },
            "event-multicast",
        )?;
        Ok(Self { delegate })
    }

    pub fn start(&mut self, sink: MulticastEventSink) -> Result<(), ControlPointError> {
        let interface = self.delegate.interface().clone();
        self.delegate.start(move |data, from| {
            let Ok(message) = SsdpMessage::parse(data, from, interface.address) else {
                trace!(source = %from, "Unparseable multicast event packet");
                return;
            };
            if message.method() != Some("NOTIFY")
                || message.header("NT") != Some(UPNP_EVENT)
                || message.header("NTS") != Some(UPNP_PROPCHANGE)
            {
                return;
            }
            let Some(svcid) = message.header("SVCID").map(str::to_string) else {
                trace!(source = %from, "Multicast event without SVCID");
                return;
            };
            let uuid = message.uuid().to_string();
            if uuid.is_empty() {
                return;
            }
            let lvl = message.header("LVL").unwrap_or("").to_string();
            let seq = message
                .header("SEQ")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let Some(properties) = parse_property_set(message.body()) else {
                return;
            };
            sink(uuid, svcid, lvl, seq, properties);
        })
    }

    pub fn stop(&mut self) {
        self.delegate.stop();
    }
}

fn event_multicast_group(interface: &InterfaceAddress) -> SocketAddr {
    if interface.address.is_ipv4() {
        SocketAddr::new(EVENT_MCAST_V4.parse().unwrap(), EVENT_MCAST_PORT)
    } else {
        SocketAddr::new(EVENT_MCAST_V6.parse().unwrap(), EVENT_MCAST_PORT)
    }
}
