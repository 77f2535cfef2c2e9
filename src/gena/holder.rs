//! SID → Service map and the renewal scheduler.
//!
//! One thread sleeps until the nearest deadline: for keep-renew services
//! that is expiry minus a safety margin, for the rest expiry itself.
//! Keep-renew services get renewed in place; a failed renewal marks the
//! service expired and reports it. Services without keep-renew are dropped
//! silently once they lapse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::device::Service;

const RENEWAL_MARGIN: Duration = Duration::from_secs(10);
const MIN_RENEWAL_MARGIN: Duration = Duration::from_millis(500);

pub(crate) type ExpiredServiceSink = Arc<dyn Fn(Service) + Send + Sync>;

struct Entry {
    service: Service,
    keep_renew: bool,
}

impl Entry {
    /// When the scheduler has to act on this entry.
    fn trigger_at(&self) -> Option<Instant> {
        let expire_at = self.service.subscription_expiry()?;
        if self.keep_renew {
            let margin = renewal_margin(self.service.subscription_timeout());
            Some(expire_at - margin)
        } else {
            Some(expire_at)
        }
    }
}

/// The margin is ten seconds for ordinary subscriptions, scaled down for
/// short grants but never below half a second.
fn renewal_margin(timeout: Duration) -> Duration {
    RENEWAL_MARGIN.min((timeout / 2).max(MIN_RENEWAL_MARGIN))
}

#[derive(Clone)]
pub(crate) struct SubscribeHolder {
    inner: Arc<HolderInner>,
}

struct HolderInner {
    entries: Mutex<HashMap<String, Entry>>,
    cond: Condvar,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SubscribeHolder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HolderInner {
                entries: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Start the renewal thread. `on_expired` runs outside the holder lock
    /// whenever a keep-renew subscription could not be renewed.
    pub fn start(&self, on_expired: ExpiredServiceSink) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("subscription-renewer".to_string())
            .spawn(move || renewal_loop(inner, on_expired))
            .expect("failed to spawn subscription-renewer");
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

    /// Register a subscribed service under its SID. Re-adding replaces the
    /// keep-renew flag.
    pub fn add(&self, service: Service, keep_renew: bool) {
        let Some(sid) = service.subscription_id() else {
            warn!(
                service = service.service_id(),
                "Refusing to hold a service without a SID"
            );
            return;
        };
        let mut entries = self.inner.entries.lock().unwrap();
        entries.insert(
            sid,
            Entry {
                service,
                keep_renew,
            },
        );
        self.inner.cond.notify_all();
    }

    pub fn remove(&self, service: &Service) {
        let mut entries = self.inner.entries.lock().unwrap();
        entries.retain(|_, entry| entry.service != *service);
        self.inner.cond.notify_all();
    }

    pub fn get(&self, sid: &str) -> Option<Service> {
        self.inner
            .entries
            .lock()
            .unwrap()
            .get(sid)
            .map(|e| e.service.clone())
    }

    pub fn size(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    /// Remove and return every held service (the stop cascade).
    pub fn drain(&self) -> Vec<Service> {
        let mut entries = self.inner.entries.lock().unwrap();
        let drained = entries.drain().map(|(_, e)| e.service).collect();
        self.inner.cond.notify_all();
        drained
    }
}

fn renewal_loop(inner: Arc<HolderInner>, on_expired: ExpiredServiceSink) {
    loop {
        let mut to_renew: Vec<Service> = Vec::new();
        let mut to_drop: Vec<Service> = Vec::new();
        {
            let mut entries = inner.entries.lock().unwrap();
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }
            let now = Instant::now();
            let next = entries.values().filter_map(Entry::trigger_at).min();
            match next {
                None => {
                    let _guard = inner.cond.wait(entries).unwrap();
                    continue;
                }
                Some(at) if at > now => {
                    let (_guard, _timeout) =
                        inner.cond.wait_timeout(entries, at - now).unwrap();
                    continue;
                }
                Some(_) => {
                    // Entries whose subscription state was cleared elsewhere
                    // are stale; drop them instead of re-scheduling.
                    entries.retain(|_, e| e.service.subscription_expiry().is_some());
                    let due: Vec<String> = entries
                        .iter()
                        .filter(|(_, e)| e.trigger_at().map(|t| t <= now).unwrap_or(false))
                        .map(|(sid, _)| sid.clone())
                        .collect();
                    for sid in due {
                        let Some(entry) = entries.get(&sid) else {
                            continue;
                        };
                        if entry.keep_renew {
                            to_renew.push(entry.service.clone());
                        } else {
                            to_drop.push(entries.remove(&sid).unwrap().service);
                        }
                    }
                }
            }
        }

        for service in to_renew {
            match service.renew_subscribe() {
                Ok(()) => {
                    debug!(service = service.service_id(), "Subscription renewed");
                }
                Err(err) => {
                    warn!(
                        service = service.service_id(),
                        error = %err,
                        "Renewal failed, subscription expired"
                    );
                    let sid = service.subscription_id();
                    service.expired();
                    if let Some(sid) = sid {
                        inner.entries.lock().unwrap().remove(&sid);
                    }
                    on_expired(service);
                }
            }
        }
        for service in to_drop {
            debug!(
                service = service.service_id(),
                "Subscription lapsed without keep-renew"
            );
            service.expired();
        }
    }
}
