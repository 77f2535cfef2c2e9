//! Asynchronous description loading.
//!
//! Validated alive announcements for unknown devices land here. A small
//! worker pool downloads and parses descriptions; the loading map keyed by
//! UUID guarantees at most one in-flight load per device, with later
//! announcements coalesced into the pending builder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

use crate::device::builder::resolve_device;
use crate::device::description::{parse_device_description, parse_scpd, DeviceRecord};
use crate::device::{Device, DeviceBuilder, Icon, IconFilter};
use crate::errors::ControlPointError;
use crate::gena::SubscribeContext;
use crate::http::{resolve_url, HttpClient};
use crate::ssdp::SsdpMessage;

const LOAD_QUEUE_DEPTH: usize = 10;
const LOAD_WORKERS: usize = 3;

pub(crate) type DevicePublishedSink = Arc<dyn Fn(Device) + Send + Sync>;

pub(crate) struct DeviceLoader {
    loading: Arc<Mutex<HashMap<String, DeviceBuilder>>>,
    tx: Option<Sender<DeviceBuilder>>,
    workers: Vec<JoinHandle<()>>,
}

impl DeviceLoader {
    pub fn new(
        http: Arc<dyn HttpClient>,
        icon_filter: Arc<dyn IconFilter>,
        context: Arc<SubscribeContext>,
        on_loaded: DevicePublishedSink,
    ) -> Self {
        let loading: Arc<Mutex<HashMap<String, DeviceBuilder>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = bounded::<DeviceBuilder>(LOAD_QUEUE_DEPTH);

        let mut workers = Vec::with_capacity(LOAD_WORKERS);
        for n in 0..LOAD_WORKERS {
            let rx = rx.clone();
            let http = Arc::clone(&http);
            let icon_filter = Arc::clone(&icon_filter);
            let context = Arc::clone(&context);
            let loading = Arc::clone(&loading);
            let on_loaded = Arc::clone(&on_loaded);
            let handle = thread::Builder::new()
                .name(format!("device-loader-{}", n))
                .spawn(move || {
                    while let Ok(builder) = rx.recv() {
                        let uuid = builder.uuid().to_string();
                        match load_device(&*http, &*icon_filter, &context, &builder) {
                            Ok(device) => {
                                // A byebye may have cancelled this load, and
                                // a re-announcement may since have started a
                                // new one under the same UUID. Publish (and
                                // clear the entry) only while the map still
                                // holds *this* builder.
                                if take_if_current(&loading, &uuid, &builder) {
                                    on_loaded(device);
                                } else {
                                    debug!(
                                        uuid = uuid.as_str(),
                                        "Load was cancelled or superseded, discarding"
                                    );
                                }
                            }
                            Err(err) => {
                                take_if_current(&loading, &uuid, &builder);
                                warn!(uuid = uuid.as_str(), error = %err, "Device load failed");
                            }
                        }
                    }
                })
                .expect("failed to spawn device-loader");
            workers.push(handle);
        }

        Self {
            loading,
            tx: Some(tx),
            workers,
        }
    }

    /// Feed an alive/response announcement for a device that is not in the
    /// registry. Starts a load, or coalesces into the in-flight one.
    pub fn accept(&self, message: SsdpMessage) {
        let uuid = message.uuid().to_string();
        if uuid.is_empty() {
            return;
        }
        let mut loading = self.loading.lock().unwrap();
        if let Some(builder) = loading.get(&uuid) {
            builder.update_ssdp_message(message);
            return;
        }
        let builder = DeviceBuilder::new(message);
        loading.insert(uuid.clone(), builder.clone());
        drop(loading);

        if let Some(tx) = &self.tx {
            if tx.try_send(builder).is_err() {
                self.loading.lock().unwrap().remove(&uuid);
                warn!(uuid = uuid.as_str(), "Loader queue full, dropping announcement");
            }
        }
    }

    pub fn is_loading(&self, uuid: &str) -> bool {
        self.loading.lock().unwrap().contains_key(uuid)
    }

    /// Cancel a pending load (byebye while loading).
    pub fn remove(&self, uuid: &str) {
        self.loading.lock().unwrap().remove(uuid);
    }

    pub fn loading_count(&self) -> usize {
        self.loading.lock().unwrap().len()
    }

    /// Close the queue and wait for the workers to drain.
    pub fn stop(&mut self) {
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.loading.lock().unwrap().clear();
    }
}

impl Drop for DeviceLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Remove the loading-map entry for `uuid` only if it is still `builder`
/// itself. Returns whether it was. An entry belonging to a newer load is
/// left untouched.
fn take_if_current(
    loading: &Mutex<HashMap<String, DeviceBuilder>>,
    uuid: &str,
    builder: &DeviceBuilder,
) -> bool {
    let mut loading = loading.lock().unwrap();
    let current = loading
        .get(uuid)
        .map(|entry| entry.is(builder))
        .unwrap_or(false);
    if current {
        loading.remove(uuid);
    }
    current
}

/// The load pipeline: root description, SCPD per service, icons per the
/// installed filter, then the resolution pass.
fn load_device(
    http: &dyn HttpClient,
    icon_filter: &dyn IconFilter,
    context: &Arc<SubscribeContext>,
    builder: &DeviceBuilder,
) -> Result<Device, ControlPointError> {
    let message = builder.ssdp_message();
    let location = message
        .location()
        .ok_or_else(|| ControlPointError::protocol("announcement without LOCATION"))?
        .to_string();
    debug!(uuid = builder.uuid(), location = location.as_str(), "Loading device description");

    let xml = http.download_string(&location)?;
    let parsed = parse_device_description(&xml)?;
    let base_url = parsed.url_base.unwrap_or_else(|| location.clone());
    let mut record = parsed.device;

    load_scpds(http, &base_url, &mut record)?;
    download_icons(http, icon_filter, &base_url, &mut record);

    // Publish under the newest announcement observed during the load.
    let message = builder.ssdp_message();
    resolve_device(record, &xml, message, &base_url, context)
}

fn load_scpds(
    http: &dyn HttpClient,
    base_url: &str,
    record: &mut DeviceRecord,
) -> Result<(), ControlPointError> {
    for service in &mut record.services {
        let url = resolve_url(base_url, &service.scpd_url);
        let xml = http.download_string(&url)?;
        let (actions, variables) = parse_scpd(&xml)?;
        service.description = xml;
        service.actions = actions;
        service.state_variables = variables;
    }
    for child in &mut record.devices {
        load_scpds(http, base_url, child)?;
    }
    Ok(())
}

fn download_icons(
    http: &dyn HttpClient,
    icon_filter: &dyn IconFilter,
    base_url: &str,
    record: &mut DeviceRecord,
) {
    if !record.icons.is_empty() {
        let declared: Vec<Icon> = record
            .icons
            .iter()
            .map(|icon| Icon {
                mime_type: icon.mime_type.clone(),
                width: icon.width,
                height: icon.height,
                depth: icon.depth,
                url: icon.url.clone(),
                binary: None,
            })
            .collect();
        for idx in icon_filter.filter(&declared) {
            let Some(icon) = record.icons.get_mut(idx) else {
                continue;
            };
            let url = resolve_url(base_url, &icon.url);
            match http.download_binary(&url) {
                Ok(bytes) => icon.binary = Some(bytes),
                // A missing icon never fails the device load.
                Err(err) => warn!(url = url.as_str(), error = %err, "Icon download failed"),
            }
        }
    }
    for child in &mut record.devices {
        download_icons(http, icon_filter, base_url, child);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// HTTP stub serving canned downloads with a per-call counter and an
    /// optional artificial delay.
    pub struct MockDownloads {
        strings: HashMap<String, String>,
        binaries: HashMap<String, Vec<u8>>,
        pub download_count: AtomicUsize,
        pub delay: Duration,
    }

    impl MockDownloads {
        pub fn new() -> Self {
            Self {
                strings: HashMap::new(),
                binaries: HashMap::new(),
                download_count: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        pub fn with_string(mut self, url: &str, body: &str) -> Self {
            self.strings.insert(url.to_string(), body.to_string());
            self
        }

        pub fn with_binary(mut self, url: &str, body: &[u8]) -> Self {
            self.binaries.insert(url.to_string(), body.to_vec());
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl HttpClient for MockDownloads {
        fn post(
            &self,
            _request: &crate::http::HttpRequest,
        ) -> Result<crate::http::HttpResponse, ControlPointError> {
            Err(ControlPointError::Network("post not supported".to_string()))
        }

        fn download_string(&self, url: &str) -> Result<String, ControlPointError> {
            self.download_count.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.strings
                .get(url)
                .cloned()
                .ok_or_else(|| ControlPointError::Network(format!("404 {}", url)))
        }

        fn download_binary(&self, url: &str) -> Result<Vec<u8>, ControlPointError> {
            self.binaries
                .get(url)
                .cloned()
                .ok_or_else(|| ControlPointError::Network(format!("404 {}", url)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockDownloads;
    use super::*;
    use crate::device::NoIconFilter;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    const UDN: &str = "uuid:01234567-89ab-cdef-0123-456789abcdef";

    fn alive_message() -> SsdpMessage {
        alive_message_with_max_age(1800)
    }

    fn alive_message_with_max_age(max_age: u32) -> SsdpMessage {
        let raw = format!(
            "NOTIFY * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             CACHE-CONTROL: max-age={}\r\n\
             LOCATION: http://192.0.2.2:12345/device.xml\r\n\
             NT: upnp:rootdevice\r\n\
             NTS: ssdp:alive\r\n\
             USN: {}::upnp:rootdevice\r\n\
             \r\n",
            max_age, UDN
        );
        SsdpMessage::parse(
            raw.as_bytes(),
            "192.0.2.2:1900".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
        )
        .unwrap()
    }

    fn device_xml() -> String {
        format!(
            r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>TestServer</friendlyName>
    <UDN>{}</UDN>
    <iconList>
      <icon><mimetype>image/jpeg</mimetype><width>120</width><height>120</height><depth>24</depth><url>/icon/icon120.jpg</url></icon>
      <icon><mimetype>image/jpeg</mimetype><width>48</width><height>48</height><depth>24</depth><url>/icon/icon48.jpg</url></icon>
      <icon><mimetype>image/png</mimetype><width>120</width><height>120</height><depth>24</depth><url>/icon/icon120.png</url></icon>
      <icon><mimetype>image/png</mimetype><width>48</width><height>48</height><depth>24</depth><url>/icon/icon48.png</url></icon>
    </iconList>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ContentDirectory:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:ContentDirectory</serviceId>
        <SCPDURL>/cds.xml</SCPDURL>
        <controlURL>/cds/control</controlURL>
        <eventSubURL>/cds/event</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#,
            UDN
        )
    }

    const CDS_XML: &str = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <actionList>
    <action>
      <name>Browse</name>
      <argumentList>
        <argument><name>ObjectID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_ObjectID</relatedStateVariable></argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable sendEvents="no"><name>A_ARG_TYPE_ObjectID</name><dataType>string</dataType></stateVariable>
    <stateVariable sendEvents="yes"><name>SystemUpdateID</name><dataType>ui4</dataType></stateVariable>
  </serviceStateTable>
</scpd>"#;

    struct FirstIconOnly;
    impl IconFilter for FirstIconOnly {
        fn filter(&self, _icons: &[Icon]) -> Vec<usize> {
            vec![0]
        }
    }

    fn make_loader(
        http: Arc<dyn HttpClient>,
        icon_filter: Arc<dyn IconFilter>,
    ) -> (DeviceLoader, Arc<StdMutex<Vec<Device>>>) {
        let context = SubscribeContext::new_for_tests();
        let published = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let loader = DeviceLoader::new(
            http,
            icon_filter,
            context,
            Arc::new(move |device| {
                sink.lock().unwrap().push(device);
            }),
        );
        (loader, published)
    }

    fn wait_until(published: &Arc<StdMutex<Vec<Device>>>, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if published.lock().unwrap().len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn happy_path_builds_device_with_selected_icon() {
        let http = Arc::new(
            MockDownloads::new()
                .with_string("http://192.0.2.2:12345/device.xml", &device_xml())
                .with_string("http://192.0.2.2:12345/cds.xml", CDS_XML)
                .with_binary("http://192.0.2.2:12345/icon/icon120.jpg", b"jpegbytes"),
        );
        let (mut loader, published) = make_loader(http, Arc::new(FirstIconOnly));

        loader.accept(alive_message());
        assert!(wait_until(&published, 1), "device was not published");

        let devices = published.lock().unwrap();
        let device = &devices[0];
        assert_eq!(device.udn(), UDN);
        assert_eq!(device.friendly_name(), "TestServer");
        assert_eq!(device.icon_list().len(), 4);
        assert_eq!(device.icon_list()[0].binary(), Some(&b"jpegbytes"[..]));
        assert!(device.icon_list()[1].binary().is_none());
        assert!(device.icon_list()[2].binary().is_none());
        assert!(device.icon_list()[3].binary().is_none());

        let service = device
            .find_service_by_id("urn:upnp-org:serviceId:ContentDirectory")
            .unwrap();
        assert!(service.find_action("Browse").is_some());
        assert!(service
            .find_state_variable("SystemUpdateID")
            .unwrap()
            .send_events());
        assert_eq!(
            service.control_url(),
            "http://192.0.2.2:12345/cds/control"
        );
        drop(devices);
        assert_eq!(loader.loading_count(), 0);
        loader.stop();
    }

    #[test]
    fn failed_download_drops_load_silently() {
        let http = Arc::new(MockDownloads::new());
        let (mut loader, published) = make_loader(http, Arc::new(NoIconFilter));

        loader.accept(alive_message());
        let deadline = Instant::now() + Duration::from_secs(2);
        while loader.loading_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(loader.loading_count(), 0);
        assert!(published.lock().unwrap().is_empty());
        loader.stop();
    }

    #[test]
    fn concurrent_alives_coalesce_into_one_load() {
        let http = Arc::new(
            MockDownloads::new()
                .with_string("http://192.0.2.2:12345/device.xml", &device_xml())
                .with_string("http://192.0.2.2:12345/cds.xml", CDS_XML)
                .with_delay(Duration::from_millis(100)),
        );
        let counter = Arc::clone(&http);
        let (mut loader, published) = make_loader(http, Arc::new(NoIconFilter));

        loader.accept(alive_message());
        loader.accept(alive_message());
        assert!(wait_until(&published, 1), "device was not published");
        thread::sleep(Duration::from_millis(50));

        assert_eq!(published.lock().unwrap().len(), 1);
        // device.xml + cds.xml exactly once each.
        assert_eq!(counter.download_count.load(Ordering::SeqCst), 2);
        loader.stop();
    }

    #[test]
    fn byebye_mid_load_discards_the_device() {
        let http = Arc::new(
            MockDownloads::new()
                .with_string("http://192.0.2.2:12345/device.xml", &device_xml())
                .with_string("http://192.0.2.2:12345/cds.xml", CDS_XML)
                .with_delay(Duration::from_millis(200)),
        );
        let (mut loader, published) = make_loader(http, Arc::new(NoIconFilter));

        loader.accept(alive_message());
        assert!(loader.is_loading(UDN));
        loader.remove(UDN);
        assert!(!loader.is_loading(UDN));

        thread::sleep(Duration::from_millis(600));
        assert!(published.lock().unwrap().is_empty());
        loader.stop();
    }

    #[test]
    fn reannounce_during_cancelled_load_publishes_only_the_new_load() {
        let http = Arc::new(
            MockDownloads::new()
                .with_string("http://192.0.2.2:12345/device.xml", &device_xml())
                .with_string("http://192.0.2.2:12345/cds.xml", CDS_XML)
                .with_delay(Duration::from_millis(200)),
        );
        let (mut loader, published) = make_loader(http, Arc::new(NoIconFilter));

        // A load starts, is cancelled by byebye while its worker is still
        // downloading, and the device re-announces before the stale worker
        // returns. The stale worker must not publish, and must not knock
        // out the fresh load's map entry.
        loader.accept(alive_message());
        assert!(loader.is_loading(UDN));
        loader.remove(UDN);
        loader.accept(alive_message_with_max_age(600));
        assert!(loader.is_loading(UDN));

        assert!(wait_until(&published, 1), "fresh device was not published");
        // Give the stale worker time to finish and (wrongly) publish.
        thread::sleep(Duration::from_millis(600));

        let devices = published.lock().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].ssdp_message().max_age(), 600);
        drop(devices);
        assert_eq!(loader.loading_count(), 0);
        loader.stop();
    }
}
