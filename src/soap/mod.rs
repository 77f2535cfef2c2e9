//! SOAP codec for action invocation.
//!
//! Control actions are POSTed to the service control URL as a
//! `s:Envelope/s:Body/u:<Action>` document; the response carries a
//! `<Action>Response` element whose children are the out-arguments.

use std::collections::HashMap;

use tracing::warn;
use xmltree::Element;

use crate::device::description::{child_text, xml_children};
use crate::device::Action;
use crate::errors::ControlPointError;
use crate::http::{parse_host_port, HttpClient, HttpRequest};

const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";

impl Action {
    /// Invoke this action with the given in-arguments and return the
    /// out-argument map from the response.
    ///
    /// Arguments not declared by the action are sent anyway with a warning,
    /// matching what permissive devices accept in the field.
    pub fn invoke(
        &self,
        client: &dyn HttpClient,
        arguments: &[(&str, &str)],
    ) -> Result<HashMap<String, String>, ControlPointError> {
        for (name, _) in arguments {
            if self.find_argument(name).is_none() {
                warn!(
                    action = self.name(),
                    argument = *name,
                    "Argument is not declared by the action"
                );
            }
        }

        let envelope = build_action_envelope(self.service_type(), self.name(), arguments);
        let url = self.control_url().to_string();

        let mut request = HttpRequest::new("POST", &url);
        if let Some((host, port)) = parse_host_port(&url) {
            request.headers.set("HOST", &format!("{}:{}", host, port));
        }
        request
            .headers
            .set("SOAPACTION", &format!("\"{}#{}\"", self.service_type(), self.name()));
        request
            .headers
            .set("Content-Type", "text/xml; charset=\"utf-8\"");
        request
            .headers
            .set("Content-Length", &envelope.len().to_string());
        request.body = envelope.into_bytes();

        let response = client.post(&request)?;
        if response.status != 200 {
            if let Some(fault) = parse_fault(&response.body) {
                return Err(ControlPointError::Protocol(format!(
                    "{} returned UPnP error: {}",
                    self.name(),
                    fault
                )));
            }
            return Err(ControlPointError::Network(format!(
                "{} failed with HTTP {}",
                self.name(),
                response.status
            )));
        }
        parse_action_response(self.name(), &response.body)
    }
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn build_action_envelope(
    service_type: &str,
    action_name: &str,
    arguments: &[(&str, &str)],
) -> String {
    let mut body = String::new();
    for (name, value) in arguments {
        body.push_str(&format!(
            "<{name}>{value}</{name}>",
            name = name,
            value = xml_escape(value)
        ));
    }
    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"{ns}\" s:encodingStyle=\"{enc}\">\
         <s:Body>\
         <u:{action} xmlns:u=\"{service}\">{body}</u:{action}>\
         </s:Body>\
         </s:Envelope>",
        ns = SOAP_NS,
        enc = SOAP_ENCODING,
        action = action_name,
        service = service_type,
        body = body
    )
}

/// Extract the out-argument map from an action response envelope.
pub(crate) fn parse_action_response(
    action_name: &str,
    body: &[u8],
) -> Result<HashMap<String, String>, ControlPointError> {
    let root = Element::parse(std::io::Cursor::new(body))
        .map_err(|e| ControlPointError::Protocol(format!("bad SOAP response: {}", e)))?;
    if root.name != "Envelope" {
        return Err(ControlPointError::protocol("missing SOAP Envelope"));
    }
    let soap_body = xml_children(&root)
        .find(|e| e.name == "Body")
        .ok_or_else(|| ControlPointError::protocol("missing SOAP Body"))?;

    let expected = format!("{}Response", action_name);
    let response = xml_children(soap_body)
        .find(|e| e.name == expected)
        .ok_or_else(|| {
            ControlPointError::Protocol(format!("missing {} element in SOAP body", expected))
        })?;

    let mut out = HashMap::new();
    for child in xml_children(response) {
        let value = child
            .get_text()
            .map(|cow| cow.into_owned())
            .unwrap_or_default();
        out.insert(child.name.clone(), value);
    }
    Ok(out)
}

/// Pull the UPnPError code/description out of a fault body, if present.
pub(crate) fn parse_fault(body: &[u8]) -> Option<String> {
    let root = Element::parse(std::io::Cursor::new(body)).ok()?;
    let soap_body = xml_children(&root).find(|e| e.name == "Body")?;
    let fault = xml_children(soap_body).find(|e| e.name == "Fault")?;
    let detail = fault.get_child("detail")?;
    let upnp_error = xml_children(detail).find(|e| e.name == "UPnPError")?;
    let code = child_text(upnp_error, "errorCode").unwrap_or_default();
    let description = child_text(upnp_error, "errorDescription").unwrap_or_default();
    Some(format!("{} {}", code, description).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Argument, Direction};
    use crate::gena::subscription::test_support::MockHttp;
    use crate::http::HttpResponse;

    fn volume_action() -> Action {
        Action {
            name: "GetVolume".to_string(),
            arguments: vec![
                Argument::new("InstanceID".to_string(), Direction::In, 0),
                Argument::new("CurrentVolume".to_string(), Direction::Out, 1),
            ],
            service_type: "urn:schemas-upnp-org:service:RenderingControl:1".to_string(),
            control_url: "http://192.0.2.9:8080/rc/control".to_string(),
        }
    }

    #[test]
    fn envelope_contains_escaped_arguments() {
        let envelope = build_action_envelope(
            "urn:schemas-upnp-org:service:AVTransport:1",
            "SetAVTransportURI",
            &[("InstanceID", "0"), ("CurrentURI", "http://x/?a=1&b=<2>")],
        );
        assert!(envelope.contains(
            "<u:SetAVTransportURI xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\">"
        ));
        assert!(envelope.contains("<CurrentURI>http://x/?a=1&amp;b=&lt;2&gt;</CurrentURI>"));
        assert!(envelope.contains("</s:Envelope>"));
    }

    #[test]
    fn invoke_parses_out_arguments() {
        let mut response = HttpResponse::new(200, "OK");
        response.body = br#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1">
      <CurrentVolume>42</CurrentVolume>
    </u:GetVolumeResponse>
  </s:Body>
</s:Envelope>"#
            .to_vec();
        let http = MockHttp::new(vec![response]);

        let out = volume_action()
            .invoke(&*http, &[("InstanceID", "0")])
            .unwrap();
        assert_eq!(out.get("CurrentVolume").map(String::as_str), Some("42"));

        let requests = http.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert_eq!(
            request.headers.get("SOAPACTION"),
            Some("\"urn:schemas-upnp-org:service:RenderingControl:1#GetVolume\"")
        );
        assert!(String::from_utf8_lossy(&request.body).contains("<InstanceID>0</InstanceID>"));
    }

    #[test]
    fn invoke_surfaces_upnp_fault() {
        let mut response = HttpResponse::new(500, "Internal Server Error");
        response.body = br#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>718</errorCode>
          <errorDescription>Invalid InstanceID</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#
            .to_vec();
        let http = MockHttp::new(vec![response]);

        let err = volume_action()
            .invoke(&*http, &[("InstanceID", "99")])
            .unwrap_err();
        match err {
            ControlPointError::Protocol(message) => {
                assert!(message.contains("718"));
                assert!(message.contains("Invalid InstanceID"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn missing_response_element_is_protocol_error() {
        let err = parse_action_response("GetVolume", b"<s:Envelope xmlns:s=\"x\"><s:Body></s:Body></s:Envelope>")
            .unwrap_err();
        assert!(matches!(err, ControlPointError::Protocol(_)));
    }
}
