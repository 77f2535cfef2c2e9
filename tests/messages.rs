use upnp_control::{HttpRequest, HttpResponse, Nts, SsdpMessage};

const ALIVE: &str = "NOTIFY * HTTP/1.1\r\n\
    HOST: 239.255.255.250:1900\r\n\
    CACHE-CONTROL: max-age=1800\r\n\
    LOCATION: http://192.0.2.2:12345/device.xml\r\n\
    NT: urn:schemas-upnp-org:device:MediaServer:1\r\n\
    NTS: ssdp:alive\r\n\
    SERVER: Linux/2.6 UPnP/1.0 test/1.0\r\n\
    USN: uuid:01234567-89ab-cdef-0123-456789abcdef::urn:schemas-upnp-org:device:MediaServer:1\r\n\
    \r\n";

#[test]
fn ssdp_message_exposes_derived_fields() {
    let message = SsdpMessage::parse(
        ALIVE.as_bytes(),
        "192.0.2.2:1900".parse().unwrap(),
        "192.0.2.1".parse().unwrap(),
    )
    .unwrap();

    assert_eq!(message.uuid(), "uuid:01234567-89ab-cdef-0123-456789abcdef");
    assert_eq!(message.nts(), Nts::Alive);
    assert_eq!(
        message.notification_type(),
        Some("urn:schemas-upnp-org:device:MediaServer:1")
    );
    assert_eq!(message.max_age(), 1800);
    assert_eq!(
        message.local_address(),
        Some("192.0.2.1".parse().unwrap())
    );
    assert!(message.has_valid_location());
}

#[test]
fn ssdp_parse_serialize_parse_keeps_the_header_bag() {
    let first = SsdpMessage::parse(
        ALIVE.as_bytes(),
        "192.0.2.2:1900".parse().unwrap(),
        "192.0.2.1".parse().unwrap(),
    )
    .unwrap();
    let second = SsdpMessage::parse(
        &first.serialize(),
        "192.0.2.2:1900".parse().unwrap(),
        "192.0.2.1".parse().unwrap(),
    )
    .unwrap();

    for name in ["HOST", "CACHE-CONTROL", "LOCATION", "NT", "NTS", "SERVER", "USN"] {
        assert_eq!(first.header(name), second.header(name), "header {}", name);
    }
    assert_eq!(first.uuid(), second.uuid());
}

#[test]
fn http_request_roundtrip() {
    let mut request = HttpRequest::new("SUBSCRIBE", "http://192.0.2.9/event");
    request.headers.set("NT", "upnp:event");
    request.headers.set("CALLBACK", "<http://192.0.2.1:5000/>");
    request.headers.set("TIMEOUT", "Second-300");

    let parsed = HttpRequest::parse(&request.serialize()).unwrap();
    assert_eq!(parsed.method, "SUBSCRIBE");
    assert_eq!(parsed.headers.get("callback"), Some("<http://192.0.2.1:5000/>"));
    assert_eq!(parsed.headers.get("TIMEOUT"), Some("Second-300"));
}

#[test]
fn http_response_roundtrip_with_body() {
    let mut response = HttpResponse::new(200, "OK");
    response.headers.set("SID", "uuid:sub-1");
    response.body = b"payload".to_vec();

    let parsed = HttpResponse::parse(&response.serialize()).unwrap();
    assert_eq!(parsed.status, 200);
    assert!(parsed.is_success());
    assert_eq!(parsed.headers.get("sid"), Some("uuid:sub-1"));
    assert_eq!(parsed.body, b"payload");
}
