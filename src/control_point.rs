//! The ControlPoint facade.
//!
//! Owns the per-interface SSDP receivers, the device registry and loader,
//! the subscription manager and the GENA event receiver, and routes every
//! validated SSDP message to the right place. User listeners run on a
//! single callback thread so they observe a serial event order.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceHolder, DeviceLoader, IconFilter, NoIconFilter, Service};
use crate::errors::ControlPointError;
use crate::gena::{
    EventMessageListener, EventReceiver, MulticastEventReceiver, SubscribeContext,
};
use crate::http::{HttpClient, UreqClient};
use crate::network::{interface_addresses, InterfaceAddress};
use crate::ssdp::{
    AcceptAllFilter, Nts, SsdpMessage, SsdpMessageFilter, SsdpNotifyReceiver, SsdpSearchServer,
};

/// Address family selection for the SSDP sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    IPv4Only,
    IPv6Only,
    DualStack,
}

impl Protocol {
    fn admits(&self, address: &IpAddr) -> bool {
        match self {
            Protocol::IPv4Only => address.is_ipv4(),
            Protocol::IPv6Only => address.is_ipv6(),
            Protocol::DualStack => true,
        }
    }
}

/// Device appearance/disappearance notifications.
pub trait DiscoveryListener: Send + Sync {
    fn on_discover(&self, device: &Device);
    fn on_lost(&self, device: &Device);
}

/// GENA property-change notifications for subscribed services.
pub trait EventListener: Send + Sync {
    fn on_notify_event(&self, service: &Service, seq: u64, variable: &str, value: &str);
}

/// Multicast eventing notifications.
pub trait MulticastEventListener: Send + Sync {
    fn on_event(&self, uuid: &str, svcid: &str, lvl: &str, seq: u64, properties: &[(String, String)]);
}

/// Reports keep-renew subscriptions whose renewal failed.
pub trait SubscriptionListener: Send + Sync {
    fn on_expired(&self, service: &Service);
}

/// Copy-on-write listener set with idempotent registration.
struct ListenerSet<T: ?Sized> {
    listeners: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> ListenerSet<T> {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, listener: Arc<T>) {
        let mut listeners = self.listeners.lock().unwrap();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    fn remove(&self, listener: &Arc<T>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn snapshot(&self) -> Vec<Arc<T>> {
        self.listeners.lock().unwrap().clone()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded executor delivering all user callbacks in order.
struct CallbackExecutor {
    tx: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackExecutor {
    fn new() -> Self {
        let (tx, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name("callback-executor".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .expect("failed to spawn callback-executor");
        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    fn submit(&self, job: Job) {
        if let Some(tx) = &*self.tx.lock().unwrap() {
            let _ = tx.send(job);
        }
    }

    fn shutdown(&self) {
        self.tx.lock().unwrap().take();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Fresh,
    Running,
    Stopped,
    Terminated,
}

struct Shared {
    state: Mutex<Lifecycle>,
    holder: DeviceHolder,
    context: Arc<SubscribeContext>,
    loader: Mutex<Option<DeviceLoader>>,
    http: Arc<dyn HttpClient>,
    icon_filter: Arc<dyn IconFilter>,
    ssdp_filter: Arc<dyn SsdpMessageFilter>,
    discovery_listeners: ListenerSet<dyn DiscoveryListener>,
    event_listeners: ListenerSet<dyn EventListener>,
    multicast_listeners: ListenerSet<dyn MulticastEventListener>,
    subscription_listeners: ListenerSet<dyn SubscriptionListener>,
    executor: CallbackExecutor,
}

impl Shared {
    fn state(&self) -> Lifecycle {
        *self.state.lock().unwrap()
    }

    /// Route one validated SSDP message.
    fn on_receive_ssdp(self: &Arc<Self>, message: SsdpMessage) {
        let uuid = message.uuid().to_string();
        if uuid.is_empty() {
            debug!("Ignoring SSDP message without a usable USN");
            return;
        }

        let alive = if message.is_response() {
            true
        } else {
            match message.nts() {
                Nts::Alive | Nts::Update => true,
                Nts::ByeBye => false,
                Nts::Unknown => {
                    debug!(uuid = uuid.as_str(), "Ignoring NOTIFY with unknown NTS");
                    return;
                }
            }
        };

        if !alive {
            if let Some(loader) = &*self.loader.lock().unwrap() {
                loader.remove(&uuid);
            }
            if let Some(device) = self.holder.remove(&uuid) {
                self.lost_device(device);
            }
            return;
        }

        if let Some(device) = self.holder.get(&uuid) {
            // Known device: refresh the announcement and expiry only.
            device.update_ssdp_message(message);
            self.holder.touch();
            return;
        }

        // The filter gates loader admission only.
        if !self.ssdp_filter.accept(&message) {
            debug!(uuid = uuid.as_str(), "SSDP message rejected by filter");
            return;
        }
        if let Some(loader) = &*self.loader.lock().unwrap() {
            loader.accept(message);
        }
    }

    /// Publish a freshly loaded device.
    fn discover_device(self: &Arc<Self>, device: Device) {
        info!(
            udn = device.udn(),
            name = device.friendly_name(),
            "Device discovered"
        );
        self.holder.add(device.clone());
        let listeners = self.discovery_listeners.snapshot();
        self.executor.submit(Box::new(move || {
            for listener in listeners {
                listener.on_discover(&device);
            }
        }));
    }

    /// A device left the registry: unsubscribe its services and notify.
    fn lost_device(self: &Arc<Self>, device: Device) {
        info!(
            udn = device.udn(),
            name = device.friendly_name(),
            "Device lost"
        );
        for service in device.all_services() {
            if service.subscription_id().is_none() {
                continue;
            }
            if let Err(err) = service.unsubscribe() {
                debug!(
                    service = service.service_id(),
                    error = %err,
                    "Best-effort unsubscribe failed"
                );
                self.context.holder.remove(&service);
                service.expired();
            }
        }
        let listeners = self.discovery_listeners.snapshot();
        self.executor.submit(Box::new(move || {
            for listener in listeners {
                listener.on_lost(&device);
            }
        }));
    }

    fn subscription_expired(self: &Arc<Self>, service: Service) {
        let listeners = self.subscription_listeners.snapshot();
        self.executor.submit(Box::new(move || {
            for listener in listeners {
                listener.on_expired(&service);
            }
        }));
    }

    fn multicast_event(
        self: &Arc<Self>,
        uuid: String,
        svcid: String,
        lvl: String,
        seq: u64,
        properties: Vec<(String, String)>,
    ) {
        let listeners = self.multicast_listeners.snapshot();
        self.executor.submit(Box::new(move || {
            for listener in listeners {
                listener.on_event(&uuid, &svcid, &lvl, seq, &properties);
            }
        }));
    }
}

impl EventMessageListener for Shared {
    fn on_event_received(&self, sid: &str, seq: u64, properties: Vec<(String, String)>) -> bool {
        let Some(service) = self.context.holder.get(sid) else {
            return false;
        };
        for (name, value) in properties {
            let evented = service
                .find_state_variable(&name)
                .map(|v| v.send_events())
                .unwrap_or(false);
            if !evented {
                // Unknown or non-evented variables are dropped silently.
                debug!(
                    service = service.service_id(),
                    variable = name.as_str(),
                    "Dropping event for unknown variable"
                );
                continue;
            }
            let listeners = self.event_listeners.snapshot();
            let service = service.clone();
            self.executor.submit(Box::new(move || {
                for listener in listeners {
                    listener.on_notify_event(&service, seq, &name, &value);
                }
            }));
        }
        true
    }
}

/// Configuration builder for [`ControlPoint`].
pub struct ControlPointBuilder {
    interfaces: Option<Vec<InterfaceAddress>>,
    protocol: Protocol,
    notify_segment_check: bool,
    icon_filter: Arc<dyn IconFilter>,
    ssdp_filter: Arc<dyn SsdpMessageFilter>,
    http_client: Option<Arc<dyn HttpClient>>,
}

impl ControlPointBuilder {
    pub fn new() -> Self {
        Self {
            interfaces: None,
            protocol: Protocol::DualStack,
            notify_segment_check: false,
            icon_filter: Arc::new(NoIconFilter),
            ssdp_filter: Arc::new(AcceptAllFilter),
            http_client: None,
        }
    }

    /// Bind these interface addresses instead of enumerating the system.
    pub fn interfaces(mut self, interfaces: Vec<InterfaceAddress>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Drop NOTIFY messages whose source lies outside the interface prefix
    /// (IPv4 only).
    pub fn notify_segment_check(mut self, enabled: bool) -> Self {
        self.notify_segment_check = enabled;
        self
    }

    pub fn icon_filter(mut self, filter: Arc<dyn IconFilter>) -> Self {
        self.icon_filter = filter;
        self
    }

    pub fn ssdp_message_filter(mut self, filter: Arc<dyn SsdpMessageFilter>) -> Self {
        self.ssdp_filter = filter;
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(self) -> Result<ControlPoint, ControlPointError> {
        let mut interfaces = match self.interfaces {
            Some(interfaces) => interfaces,
            None => interface_addresses()?,
        };
        interfaces.retain(|i| self.protocol.admits(&i.address));
        // SSDP over IPv6 is scoped to the link; global addresses would bind
        // but never see group traffic.
        interfaces.retain(|i| match i.address {
            IpAddr::V4(_) => true,
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        });

        let http: Arc<dyn HttpClient> = match self.http_client {
            Some(client) => client,
            None => Arc::new(UreqClient::new()),
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(Lifecycle::Fresh),
            holder: DeviceHolder::new(),
            context: SubscribeContext::new(Arc::clone(&http)),
            loader: Mutex::new(None),
            http,
            icon_filter: self.icon_filter,
            ssdp_filter: self.ssdp_filter,
            discovery_listeners: ListenerSet::new(),
            event_listeners: ListenerSet::new(),
            multicast_listeners: ListenerSet::new(),
            subscription_listeners: ListenerSet::new(),
            executor: CallbackExecutor::new(),
        });

        Ok(ControlPoint {
            shared,
            interfaces,
            notify_segment_check: self.notify_segment_check,
            notify_receivers: Vec::new(),
            search_servers: Vec::new(),
            multicast_receivers: Vec::new(),
            event_receiver: None,
        })
    }
}

impl Default for ControlPointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The UPnP ControlPoint: discovers devices, loads their descriptions and
/// manages event subscriptions.
pub struct ControlPoint {
    shared: Arc<Shared>,
    interfaces: Vec<InterfaceAddress>,
    notify_segment_check: bool,
    notify_receivers: Vec<SsdpNotifyReceiver>,
    search_servers: Vec<SsdpSearchServer>,
    multicast_receivers: Vec<MulticastEventReceiver>,
    event_receiver: Option<EventReceiver>,
}

impl ControlPoint {
    pub fn builder() -> ControlPointBuilder {
        ControlPointBuilder::new()
    }

    /// Build a control point with defaults on all usable interfaces.
    pub fn new() -> Result<Self, ControlPointError> {
        ControlPointBuilder::new().build()
    }

    /// Start discovery: bind the event receiver and the per-interface SSDP
    /// sockets and launch the scheduler threads.
    ///
    /// Idempotent while running. Fails with `InvalidState` once the control
    /// point has been stopped, and with `Network` when not a single
    /// interface socket could be bound.
    pub fn start(&mut self) -> Result<(), ControlPointError> {
        match self.shared.state() {
            Lifecycle::Fresh => {}
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped | Lifecycle::Terminated => {
                return Err(ControlPointError::InvalidState(
                    "control point cannot be restarted".to_string(),
                ));
            }
        }

        let event_listener: Arc<dyn EventMessageListener> = Arc::clone(&self.shared) as Arc<dyn EventMessageListener>;
        let event_receiver = EventReceiver::start(event_listener)?;
        self.shared.context.set_event_port(event_receiver.local_port());
        self.event_receiver = Some(event_receiver);

        let loader_shared = Arc::clone(&self.shared);
        let loader = DeviceLoader::new(
            Arc::clone(&self.shared.http),
            Arc::clone(&self.shared.icon_filter),
            Arc::clone(&self.shared.context),
            Arc::new(move |device| loader_shared.discover_device(device)),
        );
        *self.shared.loader.lock().unwrap() = Some(loader);

        let expire_shared = Arc::clone(&self.shared);
        self.shared
            .holder
            .start(Arc::new(move |device| expire_shared.lost_device(device)));

        let renew_shared = Arc::clone(&self.shared);
        self.shared.context.holder.start(Arc::new(move |service| {
            renew_shared.subscription_expired(service)
        }));

        let mut bound = 0usize;
        for interface in self.interfaces.clone() {
            let sink_shared = Arc::clone(&self.shared);
            let sink: Arc<dyn Fn(SsdpMessage) + Send + Sync> =
                Arc::new(move |message| sink_shared.on_receive_ssdp(message));

            match SsdpNotifyReceiver::new(interface.clone(), self.notify_segment_check) {
                Ok(mut receiver) => match receiver.start(Arc::clone(&sink)) {
                    Ok(()) => {
                        self.notify_receivers.push(receiver);
                        bound += 1;
                    }
                    Err(err) => {
                        warn!(interface = interface.name.as_str(), error = %err, "Notify receiver failed to start")
                    }
                },
                Err(err) => {
                    warn!(interface = interface.name.as_str(), error = %err, "Notify socket bind failed")
                }
            }

            match SsdpSearchServer::new(interface.clone()) {
                Ok(mut server) => match server.start(Arc::clone(&sink)) {
                    Ok(()) => {
                        self.search_servers.push(server);
                        bound += 1;
                    }
                    Err(err) => {
                        warn!(interface = interface.name.as_str(), error = %err, "Search server failed to start")
                    }
                },
                Err(err) => {
                    warn!(interface = interface.name.as_str(), error = %err, "Search socket bind failed")
                }
            }

            match MulticastEventReceiver::new(interface.clone()) {
                Ok(mut receiver) => {
                    let mc_shared = Arc::clone(&self.shared);
                    match receiver.start(Arc::new(move |uuid, svcid, lvl, seq, properties| {
                        mc_shared.multicast_event(uuid, svcid, lvl, seq, properties)
                    })) {
                        Ok(()) => self.multicast_receivers.push(receiver),
                        Err(err) => {
                            warn!(interface = interface.name.as_str(), error = %err, "Multicast event receiver failed to start")
                        }
                    }
                }
                Err(err) => {
                    warn!(interface = interface.name.as_str(), error = %err, "Multicast event socket bind failed")
                }
            }
        }

        if bound == 0 && !self.interfaces.is_empty() {
            self.teardown_sockets();
            return Err(ControlPointError::Network(
                "no SSDP socket could be bound on any interface".to_string(),
            ));
        }

        *self.shared.state.lock().unwrap() = Lifecycle::Running;
        info!(
            interfaces = self.interfaces.len(),
            event_port = self.shared.context.event_port(),
            "Control point started"
        );
        Ok(())
    }

    /// Stop discovery: close sockets, drain the loader, unsubscribe every
    /// held subscription best-effort and clear the registry. Idempotent.
    /// A stopped control point cannot be started again.
    pub fn stop(&mut self) {
        if self.shared.state() != Lifecycle::Running {
            return;
        }
        *self.shared.state.lock().unwrap() = Lifecycle::Stopped;

        self.teardown_sockets();

        if let Some(mut loader) = self.shared.loader.lock().unwrap().take() {
            loader.stop();
        }

        for service in self.shared.context.holder.drain() {
            if service.subscription_id().is_none() {
                continue;
            }
            if let Err(err) = service.unsubscribe() {
                debug!(
                    service = service.service_id(),
                    error = %err,
                    "Best-effort unsubscribe failed during stop"
                );
                service.expired();
            }
        }
        self.shared.context.holder.stop();
        self.shared.holder.stop();

        for device in self.shared.holder.clear() {
            self.shared.lost_device(device);
        }
        info!("Control point stopped");
    }

    /// Stop if running, then release the event port and the callback
    /// executor. The control point is unusable afterwards.
    pub fn terminate(&mut self) {
        if self.shared.state() == Lifecycle::Terminated {
            return;
        }
        self.stop();
        if let Some(mut receiver) = self.event_receiver.take() {
            receiver.stop();
        }
        self.shared.context.set_event_port(0);
        self.shared.executor.shutdown();
        *self.shared.state.lock().unwrap() = Lifecycle::Terminated;
    }

    /// Broadcast an M-SEARCH for `st` (default `ssdp:all`) on every bound
    /// interface.
    pub fn search(&self, st: Option<&str>) -> Result<(), ControlPointError> {
        if self.shared.state() != Lifecycle::Running {
            return Err(ControlPointError::InvalidState(
                "search requires a started control point".to_string(),
            ));
        }
        for server in &self.search_servers {
            server.search(st)?;
        }
        Ok(())
    }

    pub fn get_device(&self, udn: &str) -> Option<Device> {
        self.shared.holder.get(udn)
    }

    pub fn device_list(&self) -> Vec<Device> {
        self.shared.holder.list()
    }

    pub fn device_list_size(&self) -> usize {
        self.shared.holder.size()
    }

    /// Service currently subscribed under the given SID.
    pub fn subscribed_service(&self, sid: &str) -> Option<Service> {
        self.shared.context.holder.get(sid)
    }

    /// Port of the local GENA callback server; zero while stopped.
    pub fn event_port(&self) -> u16 {
        self.shared.context.event_port()
    }

    pub fn add_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        self.shared.discovery_listeners.add(listener);
    }

    pub fn remove_discovery_listener(&self, listener: &Arc<dyn DiscoveryListener>) {
        self.shared.discovery_listeners.remove(listener);
    }

    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.shared.event_listeners.add(listener);
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn EventListener>) {
        self.shared.event_listeners.remove(listener);
    }

    pub fn add_multicast_event_listener(&self, listener: Arc<dyn MulticastEventListener>) {
        self.shared.multicast_listeners.add(listener);
    }

    pub fn remove_multicast_event_listener(&self, listener: &Arc<dyn MulticastEventListener>) {
        self.shared.multicast_listeners.remove(listener);
    }

    pub fn add_subscription_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.shared.subscription_listeners.add(listener);
    }

    pub fn remove_subscription_listener(&self, listener: &Arc<dyn SubscriptionListener>) {
        self.shared.subscription_listeners.remove(listener);
    }

    /// Entry point for SSDP messages (receivers feed this; tests inject).
    pub(crate) fn handle_ssdp_message(&self, message: SsdpMessage) {
        self.shared.on_receive_ssdp(message);
    }

    fn teardown_sockets(&mut self) {
        for mut receiver in self.notify_receivers.drain(..) {
            receiver.stop();
        }
        for mut server in self.search_servers.drain(..) {
            server.stop();
        }
        for mut receiver in self.multicast_receivers.drain(..) {
            receiver.stop();
        }
    }
}

impl Drop for ControlPoint {
    fn drop(&mut self) {
        self.terminate();
    }
}
