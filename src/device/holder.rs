//! The authoritative UDN → Device registry.
//!
//! All mutations run under one mutex. A dedicated expirer thread sleeps
//! until the earliest device expiry and removes everything whose max-age
//! ran out; removals are reported so the control point can unsubscribe and
//! fire `on_lost`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::debug;

use crate::device::Device;

pub(crate) type ExpiredSink = Arc<dyn Fn(Device) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct DeviceHolder {
    inner: Arc<HolderInner>,
}

struct HolderInner {
    devices: Mutex<HashMap<String, Device>>,
    cond: Condvar,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceHolder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HolderInner {
                devices: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Start the expirer thread. `on_expire` runs outside the registry lock.
    pub fn start(&self, on_expire: ExpiredSink) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("device-expirer".to_string())
            .spawn(move || expire_loop(inner, on_expire))
            .expect("failed to spawn device-expirer");
        *self.inner.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cond.notify_all();
        let handle = self.inner.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn add(&self, device: Device) {
        let mut devices = self.inner.devices.lock().unwrap();
        devices.insert(device.udn().to_string(), device);
        self.inner.cond.notify_all();
    }

    pub fn remove(&self, udn: &str) -> Option<Device> {
        let mut devices = self.inner.devices.lock().unwrap();
        let removed = devices.remove(udn);
        if removed.is_some() {
            self.inner.cond.notify_all();
        }
        removed
    }

    pub fn get(&self, udn: &str) -> Option<Device> {
        self.inner.devices.lock().unwrap().get(udn).cloned()
    }

    pub fn list(&self) -> Vec<Device> {
        self.inner.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.inner.devices.lock().unwrap().len()
    }

    /// Drain every device (used by the stop cascade).
    pub fn clear(&self) -> Vec<Device> {
        let mut devices = self.inner.devices.lock().unwrap();
        let drained = devices.drain().map(|(_, d)| d).collect();
        self.inner.cond.notify_all();
        drained
    }

    /// Wake the expirer after an expiry timestamp moved.
    pub fn touch(&self) {
        self.inner.cond.notify_all();
    }
}

fn expire_loop(inner: Arc<HolderInner>, on_expire: ExpiredSink) {
    loop {
        let expired: Vec<Device> = {
            let mut devices = inner.devices.lock().unwrap();
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }
            let now = Instant::now();
            let earliest = devices.values().map(|d| d.expire_at()).min();
            match earliest {
                None => {
                    // Nothing to watch; park until a device is added.
                    let _guard = inner.cond.wait(devices).unwrap();
                    continue;
                }
                Some(at) if at > now => {
                    let (_guard, _timeout) =
                        inner.cond.wait_timeout(devices, at - now).unwrap();
                    continue;
                }
                Some(_) => {
                    let expired_udns: Vec<String> = devices
                        .values()
                        .filter(|d| d.expire_at() <= now)
                        .map(|d| d.udn().to_string())
                        .collect();
                    expired_udns
                        .iter()
                        .filter_map(|udn| devices.remove(udn))
                        .collect()
                }
            }
        };
        for device in expired {
            debug!(udn = device.udn(), "Device expired");
            on_expire(device);
        }
    }
}
