//! SUBSCRIBE / RENEW / UNSUBSCRIBE on a service.
//!
//! The state machine per service is Idle → Active(SID, expiry) with renew
//! looping back to Active and unsubscribe/expiry clearing everything. All
//! transitions go through the owning control point's HTTP client; the
//! subscribe holder drives periodic renewal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::device::Service;
use crate::errors::ControlPointError;
use crate::gena::{SubscribeContext, UPNP_EVENT};
use crate::http::{parse_host_port, HttpRequest};
use crate::network::format_ip;

/// Default and requested subscription lifetime.
pub(crate) const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(300);

const TIMEOUT_HEADER_VALUE: &str = "Second-300";

/// Live subscription fields of one service. All cleared together when the
/// subscription ends.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionState {
    pub sid: Option<String>,
    pub start: Option<Instant>,
    pub timeout: Duration,
    pub expire_at: Option<Instant>,
}

impl SubscriptionState {
    pub fn clear(&mut self) {
        self.sid = None;
        self.start = None;
        self.timeout = Duration::ZERO;
        self.expire_at = None;
    }

    fn activate(&mut self, sid: String, timeout: Duration) {
        let now = Instant::now();
        self.sid = Some(sid);
        self.start = Some(now);
        self.timeout = timeout;
        self.expire_at = Some(now + timeout);
    }
}

/// Parse a GENA TIMEOUT token.
///
/// `Second-<n>` yields n seconds. A missing, malformed or `infinite` token
/// falls back to the 300-second default (`infinite` is deprecated since
/// UPnP 2.0 and coerced to a finite value).
pub(crate) fn parse_timeout(raw: Option<&str>) -> Duration {
    let Some(value) = raw else {
        return DEFAULT_SUBSCRIPTION_TIMEOUT;
    };
    let lower = value.trim().to_ascii_lowercase();
    if lower.is_empty() || lower.contains("infinite") {
        return DEFAULT_SUBSCRIPTION_TIMEOUT;
    }
    let prefix = "second-";
    let Some(pos) = lower.find(prefix) else {
        return DEFAULT_SUBSCRIPTION_TIMEOUT;
    };
    match lower[pos + prefix.len()..].parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => DEFAULT_SUBSCRIPTION_TIMEOUT,
    }
}

fn host_header(url: &str) -> Option<String> {
    let (host, port) = parse_host_port(url)?;
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => Some(format!("{}:{}", format_ip(&ip), port)),
        Err(_) => Some(format!("{}:{}", host, port)),
    }
}

impl Service {
    fn subscribe_context(&self) -> Result<Arc<SubscribeContext>, ControlPointError> {
        self.inner.subscribe_context.upgrade().ok_or_else(|| {
            ControlPointError::InvalidState("control point is no longer running".to_string())
        })
    }

    /// Callback URL advertised to the publisher, in the angle-bracketed
    /// GENA form.
    fn callback(&self, context: &SubscribeContext) -> Result<String, ControlPointError> {
        let address = self.inner.local_address.ok_or_else(|| {
            ControlPointError::InvalidState(
                "service has no discovery interface address".to_string(),
            )
        })?;
        let port = context.event_port();
        if port == 0 {
            return Err(ControlPointError::InvalidState(
                "event receiver is not running".to_string(),
            ));
        }
        Ok(format!("<http://{}:{}/>", format_ip(&address), port))
    }

    /// Subscribe to this service's events. An already-active subscription
    /// is renewed in place, keeping its SID.
    ///
    /// With `keep_renew` the control point renews the subscription shortly
    /// before every expiry until [`Service::unsubscribe`] is called.
    pub fn subscribe(&self, keep_renew: bool) -> Result<(), ControlPointError> {
        let context = self.subscribe_context()?;
        let active = self.inner.subscription.lock().unwrap().sid.is_some();
        if active {
            self.renew_inner(&context)?;
            context.holder.add(self.clone(), keep_renew);
            return Ok(());
        }
        self.subscribe_inner(&context, keep_renew)
    }

    fn subscribe_inner(
        &self,
        context: &Arc<SubscribeContext>,
        keep_renew: bool,
    ) -> Result<(), ControlPointError> {
        let url = self.event_sub_url().to_string();
        let callback = self.callback(context)?;

        let mut request = HttpRequest::new("SUBSCRIBE", &url);
        if let Some(host) = host_header(&url) {
            request.headers.set("HOST", &host);
        }
        request.headers.set("NT", UPNP_EVENT);
        request.headers.set("CALLBACK", &callback);
        request.headers.set("TIMEOUT", TIMEOUT_HEADER_VALUE);
        request.headers.set("Content-Length", "0");

        let response = context.http().post(&request)?;
        if response.status != 200 {
            warn!(
                service = self.service_id(),
                status = response.status,
                "SUBSCRIBE rejected"
            );
            return Err(ControlPointError::Network(format!(
                "SUBSCRIBE returned HTTP {}",
                response.status
            )));
        }

        let sid = response
            .headers
            .get("SID")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| ControlPointError::protocol("SUBSCRIBE response missing SID"))?;
        let timeout = parse_timeout(response.headers.get("TIMEOUT"));
        if timeout.is_zero() {
            return Err(ControlPointError::protocol(
                "SUBSCRIBE response granted a zero timeout",
            ));
        }

        self.inner
            .subscription
            .lock()
            .unwrap()
            .activate(sid.clone(), timeout);
        context.holder.add(self.clone(), keep_renew);
        debug!(
            service = self.service_id(),
            sid = sid.as_str(),
            timeout_secs = timeout.as_secs(),
            "Subscribed"
        );
        Ok(())
    }

    /// Renew the active subscription. Falls back to a fresh subscribe when
    /// no subscription is held.
    pub fn renew_subscribe(&self) -> Result<(), ControlPointError> {
        let context = self.subscribe_context()?;
        let active = self.inner.subscription.lock().unwrap().sid.is_some();
        if !active {
            return self.subscribe_inner(&context, false);
        }
        self.renew_inner(&context)
    }

    fn renew_inner(&self, context: &Arc<SubscribeContext>) -> Result<(), ControlPointError> {
        let url = self.event_sub_url().to_string();
        let sid = self
            .inner
            .subscription
            .lock()
            .unwrap()
            .sid
            .clone()
            .ok_or_else(|| ControlPointError::InvalidState("not subscribed".to_string()))?;

        let mut request = HttpRequest::new("SUBSCRIBE", &url);
        if let Some(host) = host_header(&url) {
            request.headers.set("HOST", &host);
        }
        request.headers.set("SID", &sid);
        request.headers.set("TIMEOUT", TIMEOUT_HEADER_VALUE);
        request.headers.set("Content-Length", "0");

        let response = context.http().post(&request)?;
        if response.status != 200 {
            warn!(
                service = self.service_id(),
                status = response.status,
                "Renewal rejected"
            );
            return Err(ControlPointError::Network(format!(
                "SUBSCRIBE renewal returned HTTP {}",
                response.status
            )));
        }
        if response.headers.get("SID") != Some(sid.as_str()) {
            return Err(ControlPointError::protocol(
                "renewal response SID does not match",
            ));
        }
        let timeout = parse_timeout(response.headers.get("TIMEOUT"));
        if timeout.is_zero() {
            return Err(ControlPointError::protocol(
                "renewal response granted a zero timeout",
            ));
        }

        self.inner
            .subscription
            .lock()
            .unwrap()
            .activate(sid, timeout);
        debug!(
            service = self.service_id(),
            timeout_secs = timeout.as_secs(),
            "Renewed subscription"
        );
        Ok(())
    }

    /// End the subscription and deregister from the renewal scheduler.
    pub fn unsubscribe(&self) -> Result<(), ControlPointError> {
        let context = self.subscribe_context()?;
        let url = self.event_sub_url().to_string();
        let sid = self
            .inner
            .subscription
            .lock()
            .unwrap()
            .sid
            .clone()
            .ok_or_else(|| ControlPointError::InvalidState("not subscribed".to_string()))?;

        let mut request = HttpRequest::new("UNSUBSCRIBE", &url);
        if let Some(host) = host_header(&url) {
            request.headers.set("HOST", &host);
        }
        request.headers.set("SID", &sid);
        request.headers.set("Content-Length", "0");

        let response = context.http().post(&request)?;
        if response.status != 200 {
            warn!(
                service = self.service_id(),
                status = response.status,
                "UNSUBSCRIBE rejected"
            );
            return Err(ControlPointError::Network(format!(
                "UNSUBSCRIBE returned HTTP {}",
                response.status
            )));
        }

        context.holder.remove(self);
        self.inner.subscription.lock().unwrap().clear();
        debug!(service = self.service_id(), "Unsubscribed");
        Ok(())
    }

    /// Drop the subscription state without contacting the device (the
    /// subscription already lapsed on the publisher side).
    pub(crate) fn expired(&self) {
        self.inner.subscription.lock().unwrap().clear();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use crate::device::{Service, ServiceInner};
    use crate::errors::ControlPointError;
    use crate::gena::{SubscribeContext, SubscriptionState};
    use crate::http::{HttpClient, HttpRequest, HttpResponse};

    /// Canned-response HTTP client recording every request it served.
    pub struct MockHttp {
        pub responses: Mutex<Vec<HttpResponse>>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    impl MockHttp {
        pub fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
            let mut responses = responses;
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn subscribe_ok(sid: &str, timeout: &str) -> HttpResponse {
            let mut response = HttpResponse::new(200, "OK");
            response.headers.set("SID", sid);
            response.headers.set("TIMEOUT", timeout);
            response
        }
    }

    impl HttpClient for MockHttp {
        fn post(&self, request: &HttpRequest) -> Result<HttpResponse, ControlPointError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ControlPointError::Network("no canned response".to_string()))
        }

        fn download_string(&self, _url: &str) -> Result<String, ControlPointError> {
            Err(ControlPointError::Network("not supported".to_string()))
        }

        fn download_binary(&self, _url: &str) -> Result<Vec<u8>, ControlPointError> {
            Err(ControlPointError::Network("not supported".to_string()))
        }
    }

    /// A service wired to the given context, bypassing the loader.
    pub fn make_service(context: &Arc<SubscribeContext>, service_id: &str) -> Service {
        Service {
            inner: Arc::new(ServiceInner {
                udn: "uuid:test-device".to_string(),
                base_url: "http://192.0.2.9:8080/device.xml".to_string(),
                local_address: Some("192.0.2.1".parse().unwrap()),
                service_type: "urn:test:service:Thing:1".to_string(),
                service_id: service_id.to_string(),
                scpd_url: "http://192.0.2.9:8080/scpd.xml".to_string(),
                control_url: "http://192.0.2.9:8080/control".to_string(),
                event_sub_url: "http://192.0.2.9:8080/event".to_string(),
                description: String::new(),
                actions: Vec::new(),
                state_variables: Vec::new(),
                subscription: Mutex::new(SubscriptionState::default()),
                subscribe_context: Arc::downgrade(context),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{make_service, MockHttp};
    use super::*;
    use crate::gena::SubscribeContext;
    use crate::http::HttpResponse;

    #[test]
    fn timeout_token_parsing() {
        assert_eq!(parse_timeout(Some("Second-300")), Duration::from_secs(300));
        assert_eq!(parse_timeout(Some("second-1800")), Duration::from_secs(1800));
        assert_eq!(
            parse_timeout(Some("Second-infinite")),
            DEFAULT_SUBSCRIPTION_TIMEOUT
        );
        assert_eq!(parse_timeout(Some("infinite")), DEFAULT_SUBSCRIPTION_TIMEOUT);
        assert_eq!(parse_timeout(Some("garbage")), DEFAULT_SUBSCRIPTION_TIMEOUT);
        assert_eq!(parse_timeout(Some("")), DEFAULT_SUBSCRIPTION_TIMEOUT);
        assert_eq!(parse_timeout(None), DEFAULT_SUBSCRIPTION_TIMEOUT);
        assert_eq!(parse_timeout(Some("Second-0")), Duration::ZERO);
    }

    #[test]
    fn subscribe_success_populates_state() {
        let http = MockHttp::new(vec![MockHttp::subscribe_ok("sid-1", "Second-300")]);
        let context = SubscribeContext::new(http.clone());
        context.set_event_port(5000);
        let service = make_service(&context, "urn:test:serviceId:s1");

        service.subscribe(false).unwrap();

        assert_eq!(service.subscription_id().as_deref(), Some("sid-1"));
        assert_eq!(service.subscription_timeout(), Duration::from_secs(300));
        let start = service.subscription_start().unwrap();
        let expiry = service.subscription_expiry().unwrap();
        assert_eq!(expiry - start, Duration::from_secs(300));
        assert!(context.holder.get("sid-1").is_some());

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "SUBSCRIBE");
        assert_eq!(request.headers.get("NT"), Some("upnp:event"));
        assert_eq!(
            request.headers.get("CALLBACK"),
            Some("<http://192.0.2.1:5000/>")
        );
        assert_eq!(request.headers.get("TIMEOUT"), Some("Second-300"));
    }

    #[test]
    fn subscribe_while_active_renews_keeping_sid() {
        let http = MockHttp::new(vec![
            MockHttp::subscribe_ok("sid-1", "Second-300"),
            MockHttp::subscribe_ok("sid-1", "Second-300"),
        ]);
        let context = SubscribeContext::new(http.clone());
        context.set_event_port(5000);
        let service = make_service(&context, "urn:test:serviceId:s1");

        service.subscribe(false).unwrap();
        service.subscribe(true).unwrap();

        assert_eq!(service.subscription_id().as_deref(), Some("sid-1"));
        let requests = http.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        // The second request is a renewal: SID present, no CALLBACK.
        assert_eq!(requests[1].headers.get("SID"), Some("sid-1"));
        assert!(requests[1].headers.get("CALLBACK").is_none());
    }

    #[test]
    fn subscribe_failure_leaves_state_unchanged() {
        let http = MockHttp::new(vec![HttpResponse::new(503, "Service Unavailable")]);
        let context = SubscribeContext::new(http);
        context.set_event_port(5000);
        let service = make_service(&context, "urn:test:serviceId:s1");

        assert!(service.subscribe(false).is_err());
        assert!(service.subscription_id().is_none());
        assert_eq!(service.subscription_timeout(), Duration::ZERO);
    }

    #[test]
    fn subscribe_without_sid_in_response_fails() {
        let mut response = HttpResponse::new(200, "OK");
        response.headers.set("TIMEOUT", "Second-300");
        let http = MockHttp::new(vec![response]);
        let context = SubscribeContext::new(http);
        context.set_event_port(5000);
        let service = make_service(&context, "urn:test:serviceId:s1");

        let err = service.subscribe(false).unwrap_err();
        assert!(matches!(err, ControlPointError::Protocol(_)));
        assert!(service.subscription_id().is_none());
    }

    #[test]
    fn renew_with_mismatched_sid_fails() {
        let http = MockHttp::new(vec![
            MockHttp::subscribe_ok("sid-1", "Second-300"),
            MockHttp::subscribe_ok("sid-2", "Second-300"),
        ]);
        let context = SubscribeContext::new(http);
        context.set_event_port(5000);
        let service = make_service(&context, "urn:test:serviceId:s1");

        service.subscribe(false).unwrap();
        let err = service.renew_subscribe().unwrap_err();
        assert!(matches!(err, ControlPointError::Protocol(_)));
    }

    #[test]
    fn unsubscribe_clears_everything() {
        let http = MockHttp::new(vec![
            MockHttp::subscribe_ok("sid-1", "Second-300"),
            HttpResponse::new(200, "OK"),
        ]);
        let context = SubscribeContext::new(http.clone());
        context.set_event_port(5000);
        let service = make_service(&context, "urn:test:serviceId:s1");

        service.subscribe(false).unwrap();
        service.unsubscribe().unwrap();

        assert!(service.subscription_id().is_none());
        assert!(service.subscription_start().is_none());
        assert!(service.subscription_expiry().is_none());
        assert_eq!(service.subscription_timeout(), Duration::ZERO);
        assert!(context.holder.get("sid-1").is_none());

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests[1].method, "UNSUBSCRIBE");
        assert_eq!(requests[1].headers.get("SID"), Some("sid-1"));
    }

    #[test]
    fn subscribe_without_event_receiver_is_invalid_state() {
        let http = MockHttp::new(vec![MockHttp::subscribe_ok("sid-1", "Second-300")]);
        let context = SubscribeContext::new(http);
        let service = make_service(&context, "urn:test:serviceId:s1");

        let err = service.subscribe(false).unwrap_err();
        assert!(matches!(err, ControlPointError::InvalidState(_)));
    }
}
