//! GENA eventing: subscriptions, renewal scheduling and NOTIFY reception.

mod event_receiver;
mod holder;
mod multicast;
pub(crate) mod subscription;

pub(crate) use event_receiver::{EventMessageListener, EventReceiver};
pub(crate) use holder::SubscribeHolder;
pub(crate) use multicast::MulticastEventReceiver;
pub(crate) use subscription::SubscriptionState;

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use crate::http::HttpClient;

/// `NT` value of every GENA message.
pub(crate) const UPNP_EVENT: &str = "upnp:event";

/// `NTS` value of property-change notifications.
pub(crate) const UPNP_PROPCHANGE: &str = "upnp:propchange";

/// Multicast eventing group (UPnP 2.0).
pub(crate) const EVENT_MCAST_V4: &str = "239.255.255.246";
pub(crate) const EVENT_MCAST_V6: &str = "ff02::130";
pub(crate) const EVENT_MCAST_PORT: u16 = 7900;

/// Shared state the subscription side of a [`Service`](crate::Service)
/// needs: the HTTP client, the advertised callback port and the holder that
/// drives renewals. Services hold this weakly so a dropped control point
/// turns subscription calls into `InvalidState` instead of leaking the
/// whole graph.
pub(crate) struct SubscribeContext {
    http: Arc<dyn HttpClient>,
    event_port: AtomicU16,
    pub(crate) holder: SubscribeHolder,
}

impl SubscribeContext {
    pub fn new(http: Arc<dyn HttpClient>) -> Arc<Self> {
        Arc::new(Self {
            http,
            event_port: AtomicU16::new(0),
            holder: SubscribeHolder::new(),
        })
    }

    pub fn http(&self) -> &Arc<dyn HttpClient> {
        &self.http
    }

    /// Port of the running event receiver; zero while stopped.
    pub fn event_port(&self) -> u16 {
        self.event_port.load(Ordering::SeqCst)
    }

    pub fn set_event_port(&self, port: u16) {
        self.event_port.store(port, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn new_for_tests() -> Arc<Self> {
        struct NoHttp;
        impl HttpClient for NoHttp {
            fn post(
                &self,
                _request: &crate::http::HttpRequest,
            ) -> Result<crate::http::HttpResponse, crate::errors::ControlPointError> {
                Err(crate::errors::ControlPointError::Network(
                    "no HTTP in tests".to_string(),
                ))
            }
            fn download_string(
                &self,
                _url: &str,
            ) -> Result<String, crate::errors::ControlPointError> {
                Err(crate::errors::ControlPointError::Network(
                    "no HTTP in tests".to_string(),
                ))
            }
            fn download_binary(
                &self,
                _url: &str,
            ) -> Result<Vec<u8>, crate::errors::ControlPointError> {
                Err(crate::errors::ControlPointError::Network(
                    "no HTTP in tests".to_string(),
                ))
            }
        }
        Self::new(Arc::new(NoHttp))
    }
}
