//! Local HTTP server for GENA NOTIFY callbacks.
//!
//! Bound to an ephemeral port that every SUBSCRIBE advertises in its
//! CALLBACK header. Requests are answered before the event reaches user
//! listeners so publisher threads never wait on callback latency.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use xmltree::Element;

use crate::device::description::xml_children;
use crate::gena::{UPNP_EVENT, UPNP_PROPCHANGE};
use crate::http::{HttpRequest, HttpResponse};

const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives each accepted NOTIFY. Returns false when the SID is unknown so
/// the receiver can answer 412 Precondition Failed.
pub(crate) trait EventMessageListener: Send + Sync {
    fn on_event_received(&self, sid: &str, seq: u64, properties: Vec<(String, String)>) -> bool;
}

pub(crate) struct EventReceiver {
    port: u16,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventReceiver {
    /// Bind the callback port and start the accept loop.
    pub fn start(
        listener: Arc<dyn EventMessageListener>,
    ) -> Result<Self, crate::errors::ControlPointError> {
        let socket = TcpListener::bind(("0.0.0.0", 0))?;
        let port = socket.local_addr()?.port();
        let running = Arc::new(AtomicBool::new(true));

        let accept_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("event-receiver".to_string())
            .spawn(move || {
                for stream in socket.incoming() {
                    if !accept_running.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => handle_connection(stream, &listener),
                        Err(err) => {
                            warn!(error = %err, "Incoming notify connection failed");
                        }
                    }
                }
            })
            .map_err(crate::errors::ControlPointError::network)?;

        debug!(port, "Event receiver listening");
        Ok(Self {
            port,
            running,
            handle: Some(handle),
        })
    }

    /// Port to advertise in CALLBACK headers.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Poke the accept loop so it observes the stop flag.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(mut stream: TcpStream, listener: &Arc<dyn EventMessageListener>) {
    if let Err(err) = stream.set_read_timeout(Some(CONNECTION_READ_TIMEOUT)) {
        warn!(error = %err, "Failed to set read timeout on notify connection");
    }
    let request = {
        let mut reader = match stream.try_clone() {
            Ok(clone) => BufReader::new(clone),
            Err(err) => {
                warn!(error = %err, "Failed to clone notify connection");
                return;
            }
        };
        match HttpRequest::read_from(&mut reader) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "Failed to parse incoming notify request");
                let _ = HttpResponse::write_empty(&mut stream, 400, "Bad Request");
                return;
            }
        }
    };

    if request.method != "NOTIFY" {
        let _ = HttpResponse::write_empty(&mut stream, 405, "Method Not Allowed");
        return;
    }
    let nt = request.headers.get("NT");
    let nts = request.headers.get("NTS");
    let sid = request.headers.get("SID");
    if nt != Some(UPNP_EVENT) || nts != Some(UPNP_PROPCHANGE) || sid.is_none() {
        debug!(
            nt = nt.unwrap_or(""),
            nts = nts.unwrap_or(""),
            "Rejecting notify with missing GENA headers"
        );
        let _ = HttpResponse::write_empty(&mut stream, 400, "Bad Request");
        return;
    }
    let sid = sid.unwrap().to_string();
    let seq = request
        .headers
        .get("SEQ")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let Some(properties) = parse_property_set(&request.body) else {
        let _ = HttpResponse::write_empty(&mut stream, 400, "Bad Request");
        return;
    };

    if listener.on_event_received(&sid, seq, properties) {
        let _ = HttpResponse::write_empty(&mut stream, 200, "OK");
    } else {
        debug!(sid = sid.as_str(), "Notify for unknown SID");
        let _ = HttpResponse::write_empty(&mut stream, 412, "Precondition Failed");
    }
}

/// Extract (name, value) pairs from an `<e:propertyset>` body. Returns
/// `None` when the body is not parseable XML.
pub(crate) fn parse_property_set(body: &[u8]) -> Option<Vec<(String, String)>> {
    let root = Element::parse(std::io::Cursor::new(body)).ok()?;
    if root.name != "propertyset" {
        return None;
    }
    let mut properties = Vec::new();
    for property in xml_children(&root).filter(|e| e.name == "property") {
        for child in xml_children(property) {
            let value = child
                .get_text()
                .map(|cow| cow.into_owned())
                .unwrap_or_default();
            properties.push((child.name.clone(), value));
        }
    }
    Some(properties)
}
