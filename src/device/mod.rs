//! The discovered-device object graph.
//!
//! Devices and services are cheap-to-clone handles over shared inner state.
//! Everything in the graph is immutable after the loader publishes it, with
//! two exceptions guarded by mutexes inside the shared inner: the SSDP
//! announcement (updated on re-announcement) and the per-service
//! subscription state.

mod builder;
pub(crate) mod description;
mod holder;
mod loader;

pub(crate) use builder::DeviceBuilder;
pub(crate) use holder::DeviceHolder;
pub(crate) use loader::DeviceLoader;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::gena::{SubscribeContext, SubscriptionState};
use crate::http::resolve_url;
use crate::ssdp::SsdpMessage;

/// Direction of an action argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// "in" (any case) maps to input, everything else to output.
    pub(crate) fn parse(raw: &str) -> Direction {
        if raw.eq_ignore_ascii_case("in") {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Numeric range constraint of a state variable.
#[derive(Debug, Clone)]
pub struct AllowedValueRange {
    pub minimum: String,
    pub maximum: String,
    pub step: Option<String>,
}

/// A state variable declared in a service's SCPD.
#[derive(Debug, Clone)]
pub struct StateVariable {
    name: String,
    data_type: String,
    send_events: bool,
    default_value: Option<String>,
    allowed_values: Vec<String>,
    allowed_range: Option<AllowedValueRange>,
}

impl StateVariable {
    pub(crate) fn new(
        name: String,
        data_type: String,
        send_events: bool,
        default_value: Option<String>,
        allowed_values: Vec<String>,
        allowed_range: Option<AllowedValueRange>,
    ) -> Self {
        Self {
            name,
            data_type,
            send_events,
            default_value,
            allowed_values,
            allowed_range,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Whether changes to this variable generate GENA notifications.
    pub fn send_events(&self) -> bool {
        self.send_events
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    pub fn allowed_values(&self) -> &[String] {
        &self.allowed_values
    }

    pub fn allowed_range(&self) -> Option<&AllowedValueRange> {
        self.allowed_range.as_ref()
    }
}

/// An argument of an action. The related state variable is held as an index
/// into the owning service's state variable list.
#[derive(Debug, Clone)]
pub struct Argument {
    name: String,
    direction: Direction,
    related_variable: usize,
}

impl Argument {
    pub(crate) fn new(name: String, direction: Direction, related_variable: usize) -> Self {
        Self {
            name,
            direction,
            related_variable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_input(&self) -> bool {
        self.direction == Direction::In
    }

    /// The state variable defining this argument's type.
    pub fn related_state_variable<'a>(&self, service: &'a Service) -> &'a StateVariable {
        &service.inner.state_variables[self.related_variable]
    }
}

/// A named operation on a service.
#[derive(Debug, Clone)]
pub struct Action {
    pub(crate) name: String,
    pub(crate) arguments: Vec<Argument>,
    pub(crate) service_type: String,
    pub(crate) control_url: String,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn find_argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|a| a.name == name)
    }

    /// Type of the service the action belongs to (used for SOAPACTION).
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Absolute control URL the action posts to.
    pub fn control_url(&self) -> &str {
        &self.control_url
    }
}

/// A device icon. The binary is only populated when the installed
/// [`IconFilter`] selected the icon for download.
#[derive(Debug, Clone)]
pub struct Icon {
    pub(crate) mime_type: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u32,
    pub(crate) url: String,
    pub(crate) binary: Option<Vec<u8>>,
}

impl Icon {
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Icon URL relative to the device base.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn binary(&self) -> Option<&[u8]> {
        self.binary.as_deref()
    }
}

/// Chooses which declared icons get their binaries downloaded during the
/// device load. The return value is a set of indices into the declared list.
pub trait IconFilter: Send + Sync {
    fn filter(&self, icons: &[Icon]) -> Vec<usize>;
}

/// Default filter: download nothing.
pub struct NoIconFilter;

impl IconFilter for NoIconFilter {
    fn filter(&self, _icons: &[Icon]) -> Vec<usize> {
        Vec::new()
    }
}

/// Convenience filter: download every declared icon.
pub struct AllIconFilter;

impl IconFilter for AllIconFilter {
    fn filter(&self, icons: &[Icon]) -> Vec<usize> {
        (0..icons.len()).collect()
    }
}

pub(crate) struct ServiceInner {
    pub(crate) udn: String,
    pub(crate) base_url: String,
    pub(crate) local_address: Option<IpAddr>,
    pub(crate) service_type: String,
    pub(crate) service_id: String,
    pub(crate) scpd_url: String,
    pub(crate) control_url: String,
    pub(crate) event_sub_url: String,
    pub(crate) description: String,
    pub(crate) actions: Vec<Action>,
    pub(crate) state_variables: Vec<StateVariable>,
    pub(crate) subscription: Mutex<SubscriptionState>,
    pub(crate) subscribe_context: Weak<SubscribeContext>,
}

/// A functional interface on a device.
///
/// Clones share the same inner state; in particular the subscription state
/// is common to every clone, so the copy held by the subscribe holder and
/// the copy held by the application observe the same SID.
#[derive(Clone)]
pub struct Service {
    pub(crate) inner: Arc<ServiceInner>,
}

impl Service {
    /// UDN of the owning device.
    pub fn udn(&self) -> &str {
        &self.inner.udn
    }

    pub fn service_type(&self) -> &str {
        &self.inner.service_type
    }

    pub fn service_id(&self) -> &str {
        &self.inner.service_id
    }

    /// Absolute SCPD URL.
    pub fn scpd_url(&self) -> &str {
        &self.inner.scpd_url
    }

    /// Absolute control URL.
    pub fn control_url(&self) -> &str {
        &self.inner.control_url
    }

    /// Absolute event subscription URL.
    pub fn event_sub_url(&self) -> &str {
        &self.inner.event_sub_url
    }

    /// Raw SCPD document text.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn actions(&self) -> &[Action] {
        &self.inner.actions
    }

    pub fn find_action(&self, name: &str) -> Option<&Action> {
        self.inner.actions.iter().find(|a| a.name == name)
    }

    pub fn state_variables(&self) -> &[StateVariable] {
        &self.inner.state_variables
    }

    pub fn find_state_variable(&self, name: &str) -> Option<&StateVariable> {
        self.inner.state_variables.iter().find(|v| v.name == name)
    }

    /// Resolve a URL relative to the owning device's base.
    pub fn absolute_url(&self, url: &str) -> String {
        resolve_url(&self.inner.base_url, url)
    }

    /// Address of the local interface the owning device was discovered on.
    pub fn local_address(&self) -> Option<IpAddr> {
        self.inner.local_address
    }

    pub fn subscription_id(&self) -> Option<String> {
        self.inner.subscription.lock().unwrap().sid.clone()
    }

    pub fn subscription_start(&self) -> Option<Instant> {
        self.inner.subscription.lock().unwrap().start
    }

    /// Granted subscription timeout; zero when unsubscribed.
    pub fn subscription_timeout(&self) -> Duration {
        self.inner.subscription.lock().unwrap().timeout
    }

    pub fn subscription_expiry(&self) -> Option<Instant> {
        self.inner.subscription.lock().unwrap().expire_at
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.inner.udn == other.inner.udn && self.inner.service_id == other.inner.service_id
    }
}

impl Eq for Service {}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.udn.hash(state);
        self.inner.service_id.hash(state);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("udn", &self.inner.udn)
            .field("service_id", &self.inner.service_id)
            .field("service_type", &self.inner.service_type)
            .finish()
    }
}

pub(crate) struct Announcement {
    pub(crate) ssdp: SsdpMessage,
    pub(crate) expire_at: Instant,
}

impl Announcement {
    pub(crate) fn new(ssdp: SsdpMessage) -> Self {
        let expire_at = Instant::now() + Duration::from_secs(u64::from(ssdp.max_age()));
        Self { ssdp, expire_at }
    }
}

pub(crate) struct DeviceInner {
    pub(crate) udn: String,
    pub(crate) device_type: String,
    pub(crate) friendly_name: String,
    pub(crate) manufacturer: Option<String>,
    pub(crate) manufacturer_url: Option<String>,
    pub(crate) model_name: Option<String>,
    pub(crate) model_url: Option<String>,
    pub(crate) model_description: Option<String>,
    pub(crate) model_number: Option<String>,
    pub(crate) serial_number: Option<String>,
    pub(crate) presentation_url: Option<String>,
    pub(crate) base_url: String,
    pub(crate) description: String,
    pub(crate) announcement: Mutex<Announcement>,
    pub(crate) icon_list: Vec<Icon>,
    pub(crate) service_list: Vec<Service>,
    pub(crate) device_list: Vec<Device>,
}

/// A discovered UPnP device (root or embedded).
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl Device {
    pub fn udn(&self) -> &str {
        &self.inner.udn
    }

    pub fn device_type(&self) -> &str {
        &self.inner.device_type
    }

    pub fn friendly_name(&self) -> &str {
        &self.inner.friendly_name
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.inner.manufacturer.as_deref()
    }

    pub fn manufacturer_url(&self) -> Option<&str> {
        self.inner.manufacturer_url.as_deref()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.inner.model_name.as_deref()
    }

    pub fn model_url(&self) -> Option<&str> {
        self.inner.model_url.as_deref()
    }

    pub fn model_description(&self) -> Option<&str> {
        self.inner.model_description.as_deref()
    }

    pub fn model_number(&self) -> Option<&str> {
        self.inner.model_number.as_deref()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.inner.serial_number.as_deref()
    }

    pub fn presentation_url(&self) -> Option<&str> {
        self.inner.presentation_url.as_deref()
    }

    /// Base URL every relative URL of this device resolves against.
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Raw description document text.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Resolve a URL relative to the device base.
    pub fn absolute_url(&self, url: &str) -> String {
        resolve_url(&self.inner.base_url, url)
    }

    /// Source address of the announcement that produced this device.
    pub fn ip_address(&self) -> Option<IpAddr> {
        self.inner
            .announcement
            .lock()
            .unwrap()
            .ssdp
            .source()
            .map(|a| a.ip())
    }

    /// The SSDP message currently backing this device.
    pub fn ssdp_message(&self) -> SsdpMessage {
        self.inner.announcement.lock().unwrap().ssdp.clone()
    }

    /// When the device expires unless re-announced.
    pub fn expire_at(&self) -> Instant {
        self.inner.announcement.lock().unwrap().expire_at
    }

    /// Replace the backing announcement and push the expiry out by the new
    /// max-age. Visible through every clone of this device.
    pub(crate) fn update_ssdp_message(&self, message: SsdpMessage) {
        let mut announcement = self.inner.announcement.lock().unwrap();
        *announcement = Announcement::new(message);
    }

    pub fn icon_list(&self) -> &[Icon] {
        &self.inner.icon_list
    }

    pub fn service_list(&self) -> &[Service] {
        &self.inner.service_list
    }

    /// Embedded child devices.
    pub fn device_list(&self) -> &[Device] {
        &self.inner.device_list
    }

    pub fn find_service_by_id(&self, service_id: &str) -> Option<&Service> {
        self.inner
            .service_list
            .iter()
            .find(|s| s.service_id() == service_id)
    }

    pub fn find_service_by_type(&self, service_type: &str) -> Option<&Service> {
        self.inner
            .service_list
            .iter()
            .find(|s| s.service_type() == service_type)
    }

    /// First action with the given name across this device's services.
    pub fn find_action(&self, name: &str) -> Option<&Action> {
        self.inner
            .service_list
            .iter()
            .find_map(|s| s.find_action(name))
    }

    /// Search this device and its embedded devices for a device type.
    pub fn find_device_by_type(&self, device_type: &str) -> Option<&Device> {
        if self.inner.device_type == device_type {
            return Some(self);
        }
        self.inner
            .device_list
            .iter()
            .find_map(|d| d.find_device_by_type(device_type))
    }

    /// Search this device and its embedded devices for a UDN.
    pub fn find_device_by_udn(&self, udn: &str) -> Option<&Device> {
        if self.inner.udn == udn {
            return Some(self);
        }
        self.inner
            .device_list
            .iter()
            .find_map(|d| d.find_device_by_udn(udn))
    }

    /// Services of this device and all embedded devices.
    pub fn all_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.inner.service_list.to_vec();
        for child in &self.inner.device_list {
            services.extend(child.all_services());
        }
        services
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.udn == other.inner.udn
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.udn.hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("udn", &self.inner.udn)
            .field("friendly_name", &self.inner.friendly_name)
            .field("device_type", &self.inner.device_type)
            .finish()
    }
}
