//! M-SEARCH sender and unicast response receiver for one interface.
//!
//! Search sockets bind an ephemeral port rather than 1900: a control point
//! that shares the well-known port with a device-side server loses unicast
//! replies to kernel load balancing.

use tracing::{debug, trace};

use crate::errors::ControlPointError;
use crate::network::InterfaceAddress;
use crate::ssdp::notify::{multicast_group, SsdpMessageSink};
use crate::ssdp::server::{SsdpServerDelegate, SsdpSocketRole};
use crate::ssdp::{SsdpMessage, ST_ALL};

const SEARCH_MX: u32 = 1;

pub(crate) struct SsdpSearchServer {
    delegate: SsdpServerDelegate,
}

impl SsdpSearchServer {
    pub fn new(interface: InterfaceAddress) -> Result<Self, ControlPointError> {
        let delegate = SsdpServerDelegate::new(interface, SsdpSocketRole::Unicast, "ssdp-search")?;
        Ok(Self { delegate })
    }

    pub fn start(&mut self, listener: SsdpMessageSink) -> Result<(), ControlPointError> {
        let interface = self.delegate.interface().clone();
        self.delegate.start(move |data, from| {
            let message = match SsdpMessage::parse(data, from, interface.address) {
                Ok(message) => message,
                Err(err) => {
                    trace!(source = %from, error = %err, "Unparseable search response");
                    return;
                }
            };
            if !message.is_response() {
                return;
            }
            if !message.has_valid_location() {
                debug!(
                    source = %from,
                    location = message.location().unwrap_or(""),
                    "Dropping search response with mismatched LOCATION host"
                );
                return;
            }
            listener(message);
        })
    }

    /// Broadcast one M-SEARCH for `st` (default `ssdp:all`) on this
    /// interface.
    pub fn search(&self, st: Option<&str>) -> Result<(), ControlPointError> {
        let st = st.unwrap_or(ST_ALL);
        let ipv6 = self.delegate.interface().address.is_ipv6();
        let message = SsdpMessage::search_request(st, SEARCH_MX, ipv6);
        let group = multicast_group(&self.delegate.interface().address);
        debug!(
            st,
            interface = self.delegate.interface().name.as_str(),
            "Sending M-SEARCH"
        );
        self.delegate.send(&message.serialize(), group)
    }

    pub fn stop(&mut self) {
        self.delegate.stop();
    }
}
