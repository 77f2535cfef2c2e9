//! Description document parsing.
//!
//! The device description and the per-service SCPD documents are parsed
//! into plain record structures first; linking (arguments to state
//! variables, services to their device) happens in a single resolution pass
//! in `builder`.

use tracing::trace;
use xmltree::{Element, XMLNode};

use crate::device::{AllowedValueRange, StateVariable};
use crate::errors::ControlPointError;

#[derive(Debug, Default)]
pub(crate) struct DeviceRecord {
    pub device_type: Option<String>,
    pub friendly_name: Option<String>,
    pub udn: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_url: Option<String>,
    pub model_name: Option<String>,
    pub model_url: Option<String>,
    pub model_description: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub presentation_url: Option<String>,
    pub icons: Vec<IconRecord>,
    pub services: Vec<ServiceRecord>,
    pub devices: Vec<DeviceRecord>,
}

#[derive(Debug, Default)]
pub(crate) struct IconRecord {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub url: String,
    pub binary: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub(crate) struct ServiceRecord {
    pub service_type: String,
    pub service_id: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
    /// Raw SCPD text, filled by the loader.
    pub description: String,
    /// Parsed SCPD contents, filled by the loader.
    pub actions: Vec<ActionRecord>,
    pub state_variables: Vec<StateVariable>,
}

#[derive(Debug, Default)]
pub(crate) struct ActionRecord {
    pub name: String,
    pub arguments: Vec<ArgumentRecord>,
}

#[derive(Debug, Default)]
pub(crate) struct ArgumentRecord {
    pub name: String,
    pub direction: String,
    pub related_state_variable: String,
}

/// Parsed root description: optional URLBase plus the root device record.
#[derive(Debug)]
pub(crate) struct DescriptionRecord {
    pub url_base: Option<String>,
    pub device: DeviceRecord,
}

/// Parse a device description document.
pub(crate) fn parse_device_description(xml: &str) -> Result<DescriptionRecord, ControlPointError> {
    let root = Element::parse(xml.as_bytes())?;
    let url_base = child_text(&root, "URLBase").filter(|u| !u.is_empty());
    let device_element = root
        .get_child("device")
        .ok_or_else(|| ControlPointError::invalid_description("missing device element"))?;
    Ok(DescriptionRecord {
        url_base,
        device: parse_device_element(device_element),
    })
}

fn parse_device_element(element: &Element) -> DeviceRecord {
    let mut record = DeviceRecord {
        device_type: child_text(element, "deviceType"),
        friendly_name: child_text(element, "friendlyName"),
        udn: child_text(element, "UDN"),
        manufacturer: child_text(element, "manufacturer"),
        manufacturer_url: child_text(element, "manufacturerURL"),
        model_name: child_text(element, "modelName"),
        model_url: child_text(element, "modelURL"),
        model_description: child_text(element, "modelDescription"),
        model_number: child_text(element, "modelNumber"),
        serial_number: child_text(element, "serialNumber"),
        presentation_url: child_text(element, "presentationURL"),
        ..DeviceRecord::default()
    };

    if let Some(icon_list) = element.get_child("iconList") {
        for icon in xml_children(icon_list).filter(|e| e.name == "icon") {
            record.icons.push(parse_icon_element(icon));
        }
    }

    if let Some(service_list) = element.get_child("serviceList") {
        for service in xml_children(service_list).filter(|e| e.name == "service") {
            if let Some(service) = parse_service_element(service) {
                record.services.push(service);
            }
        }
    }

    if let Some(device_list) = element.get_child("deviceList") {
        for child in xml_children(device_list).filter(|e| e.name == "device") {
            record.devices.push(parse_device_element(child));
        }
    }

    record
}

fn parse_icon_element(element: &Element) -> IconRecord {
    IconRecord {
        mime_type: child_text(element, "mimetype").unwrap_or_default(),
        width: child_number(element, "width"),
        height: child_number(element, "height"),
        depth: child_number(element, "depth"),
        url: child_text(element, "url").unwrap_or_default(),
        binary: None,
    }
}

fn parse_service_element(element: &Element) -> Option<ServiceRecord> {
    let service_type = child_text(element, "serviceType")?;
    let service_id = child_text(element, "serviceId")?;
    let scpd_url = child_text(element, "SCPDURL")?;
    let control_url = child_text(element, "controlURL")?;
    let event_sub_url = child_text(element, "eventSubURL")?;
    Some(ServiceRecord {
        service_type,
        service_id,
        scpd_url,
        control_url,
        event_sub_url,
        ..ServiceRecord::default()
    })
}

/// Parse a service SCPD document into its actions and state variables.
pub(crate) fn parse_scpd(
    xml: &str,
) -> Result<(Vec<ActionRecord>, Vec<StateVariable>), ControlPointError> {
    let root = Element::parse(xml.as_bytes())?;

    let mut actions = Vec::new();
    if let Some(action_list) = root.get_child("actionList") {
        for action in xml_children(action_list).filter(|e| e.name == "action") {
            let Some(name) = child_text(action, "name") else {
                trace!("Skipping SCPD action without a name");
                continue;
            };
            let mut record = ActionRecord {
                name,
                arguments: Vec::new(),
            };
            if let Some(argument_list) = action.get_child("argumentList") {
                for argument in xml_children(argument_list).filter(|e| e.name == "argument") {
                    record.arguments.push(ArgumentRecord {
                        name: child_text(argument, "name").unwrap_or_default(),
                        direction: child_text(argument, "direction").unwrap_or_default(),
                        related_state_variable: child_text(argument, "relatedStateVariable")
                            .unwrap_or_default(),
                    });
                }
            }
            actions.push(record);
        }
    }

    let mut variables = Vec::new();
    if let Some(table) = root.get_child("serviceStateTable") {
        for variable in xml_children(table).filter(|e| e.name == "stateVariable") {
            let Some(name) = child_text(variable, "name") else {
                trace!("Skipping SCPD state variable without a name");
                continue;
            };
            // Per the UPnP architecture sendEvents defaults to yes.
            let send_events = variable
                .attributes
                .get("sendEvents")
                .map(|v| !v.eq_ignore_ascii_case("no"))
                .unwrap_or(true);
            let allowed_values = variable
                .get_child("allowedValueList")
                .map(|list| {
                    xml_children(list)
                        .filter(|e| e.name == "allowedValue")
                        .filter_map(element_text)
                        .collect()
                })
                .unwrap_or_default();
            let allowed_range = variable.get_child("allowedValueRange").and_then(|range| {
                Some(AllowedValueRange {
                    minimum: child_text(range, "minimum")?,
                    maximum: child_text(range, "maximum")?,
                    step: child_text(range, "step"),
                })
            });
            variables.push(StateVariable::new(
                name,
                child_text(variable, "dataType").unwrap_or_default(),
                send_events,
                child_text(variable, "defaultValue"),
                allowed_values,
                allowed_range,
            ));
        }
    }

    Ok((actions, variables))
}

/// Iterate over the element children of an XML node.
pub(crate) fn xml_children(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(elem) => Some(elem),
        _ => None,
    })
}

/// Text content of the first child with the given local name.
pub(crate) fn child_text(element: &Element, name: &str) -> Option<String> {
    xml_children(element)
        .find(|child| child.name == name)
        .and_then(element_text)
}

fn element_text(element: &Element) -> Option<String> {
    element.get_text().map(|cow| cow.trim().to_string())
}

fn child_number(element: &Element, name: &str) -> u32 {
    child_text(element, name)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>TestServer</friendlyName>
    <manufacturer>TestCorp</manufacturer>
    <modelName>TestModel</modelName>
    <UDN>uuid:01234567-89ab-cdef-0123-456789abcdef</UDN>
    <iconList>
      <icon>
        <mimetype>image/jpeg</mimetype>
        <width>120</width>
        <height>120</height>
        <depth>24</depth>
        <url>/icon/icon120.jpg</url>
      </icon>
      <icon>
        <mimetype>image/png</mimetype>
        <width>48</width>
        <height>48</height>
        <depth>24</depth>
        <url>/icon/icon48.png</url>
      </icon>
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
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:Embedded:1</deviceType>
        <friendlyName>Embedded</friendlyName>
        <UDN>uuid:embedded-1</UDN>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn parse_full_device_description() {
        let parsed = parse_device_description(DEVICE_XML).unwrap();
        assert!(parsed.url_base.is_none());
        let device = parsed.device;
        assert_eq!(
            device.udn.as_deref(),
            Some("uuid:01234567-89ab-cdef-0123-456789abcdef")
        );
        assert_eq!(device.friendly_name.as_deref(), Some("TestServer"));
        assert_eq!(device.icons.len(), 2);
        assert_eq!(device.icons[0].width, 120);
        assert_eq!(device.icons[0].url, "/icon/icon120.jpg");
        assert_eq!(device.services.len(), 1);
        assert_eq!(
            device.services[0].service_id,
            "urn:upnp-org:serviceId:ContentDirectory"
        );
        assert_eq!(device.devices.len(), 1);
        assert_eq!(device.devices[0].udn.as_deref(), Some("uuid:embedded-1"));
    }

    #[test]
    fn missing_device_element_is_invalid() {
        let err = parse_device_description(
            r#"<?xml version="1.0"?><root xmlns="urn:schemas-upnp-org:device-1-0"></root>"#,
        )
        .unwrap_err();
        assert!(matches!(err, ControlPointError::InvalidDescription(_)));
    }

    const SCPD_XML: &str = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <actionList>
    <action>
      <name>SetVolume</name>
      <argumentList>
        <argument>
          <name>DesiredVolume</name>
          <direction>in</direction>
          <relatedStateVariable>Volume</relatedStateVariable>
        </argument>
      </argumentList>
    </action>
    <action>
      <name>GetVolume</name>
      <argumentList>
        <argument>
          <name>CurrentVolume</name>
          <direction>out</direction>
          <relatedStateVariable>Volume</relatedStateVariable>
        </argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable sendEvents="yes">
      <name>Volume</name>
      <dataType>ui2</dataType>
      <defaultValue>0</defaultValue>
      <allowedValueRange>
        <minimum>0</minimum>
        <maximum>100</maximum>
        <step>1</step>
      </allowedValueRange>
    </stateVariable>
    <stateVariable sendEvents="no">
      <name>Mode</name>
      <dataType>string</dataType>
      <allowedValueList>
        <allowedValue>NORMAL</allowedValue>
        <allowedValue>SHUFFLE</allowedValue>
      </allowedValueList>
    </stateVariable>
  </serviceStateTable>
</scpd>"#;

    #[test]
    fn parse_scpd_actions_and_variables() {
        let (actions, variables) = parse_scpd(SCPD_XML).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name, "SetVolume");
        assert_eq!(actions[0].arguments.len(), 1);
        assert_eq!(actions[0].arguments[0].direction, "in");
        assert_eq!(actions[0].arguments[0].related_state_variable, "Volume");

        assert_eq!(variables.len(), 2);
        let volume = &variables[0];
        assert_eq!(volume.name(), "Volume");
        assert!(volume.send_events());
        assert_eq!(volume.data_type(), "ui2");
        assert_eq!(volume.default_value(), Some("0"));
        let range = volume.allowed_range().unwrap();
        assert_eq!(range.minimum, "0");
        assert_eq!(range.maximum, "100");

        let mode = &variables[1];
        assert!(!mode.send_events());
        assert_eq!(mode.allowed_values(), &["NORMAL", "SHUFFLE"]);
    }

    #[test]
    fn send_events_defaults_to_yes() {
        let xml = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <serviceStateTable>
    <stateVariable>
      <name>X</name>
      <dataType>string</dataType>
    </stateVariable>
  </serviceStateTable>
</scpd>"#;
        let (_, variables) = parse_scpd(xml).unwrap();
        assert!(variables[0].send_events());
    }
}
