//! # upnp-control
//!
//! A UPnP ControlPoint library: SSDP discovery across network interfaces,
//! asynchronous description loading into a queryable device registry, SOAP
//! action invocation, and GENA event subscriptions with automatic renewal.
//!
//! ```no_run
//! use std::sync::Arc;
//! use upnp_control::{ControlPoint, Device, DiscoveryListener};
//!
//! struct Printer;
//! impl DiscoveryListener for Printer {
//!     fn on_discover(&self, device: &Device) {
//!         println!("found {}", device.friendly_name());
//!     }
//!     fn on_lost(&self, device: &Device) {
//!         println!("lost {}", device.friendly_name());
//!     }
//! }
//!
//! let mut cp = ControlPoint::new().unwrap();
//! cp.add_discovery_listener(Arc::new(Printer));
//! cp.start().unwrap();
//! cp.search(None).unwrap();
//! ```

mod control_point;
mod device;
mod errors;
mod gena;
mod http;
mod network;
mod soap;
mod ssdp;

pub use control_point::{
    ControlPoint, ControlPointBuilder, DiscoveryListener, EventListener, MulticastEventListener,
    Protocol, SubscriptionListener,
};
pub use device::{
    Action, AllIconFilter, AllowedValueRange, Argument, Device, Direction, Icon, IconFilter,
    NoIconFilter, Service, StateVariable,
};
pub use errors::ControlPointError;
pub use http::{HttpClient, HttpHeaders, HttpRequest, HttpResponse, UreqClient};
pub use network::{interface_addresses, InterfaceAddress};
pub use ssdp::{AcceptAllFilter, Nts, SsdpMessage, SsdpMessageFilter};
