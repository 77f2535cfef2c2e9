//! In-flight device construction.
//!
//! While a description load is running the device exists only as a
//! [`DeviceBuilder`] in the loading map. Re-announcements arriving mid-load
//! update the builder's SSDP message; the finished device publishes under
//! the newest announcement. The final `resolve_device` pass turns the plain
//! parse records into the linked object graph.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::device::description::{DeviceRecord, ServiceRecord};
use crate::device::{
    Action, Announcement, Argument, Device, DeviceInner, Direction, Icon, Service, ServiceInner,
};
use crate::errors::ControlPointError;
use crate::gena::{SubscribeContext, SubscriptionState};
use crate::http::resolve_url;
use crate::ssdp::SsdpMessage;

/// Pending load for one UUID. Clones share the backing message so the
/// loader worker and the SSDP dispatch path see the same announcement.
#[derive(Clone)]
pub(crate) struct DeviceBuilder {
    inner: Arc<BuilderInner>,
}

struct BuilderInner {
    uuid: String,
    ssdp: Mutex<SsdpMessage>,
}

impl DeviceBuilder {
    pub fn new(message: SsdpMessage) -> Self {
        Self {
            inner: Arc::new(BuilderInner {
                uuid: message.uuid().to_string(),
                ssdp: Mutex::new(message),
            }),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    /// True when `other` is a handle to this same pending load.
    pub fn is(&self, other: &DeviceBuilder) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Coalesce a newer announcement into the in-flight load.
    pub fn update_ssdp_message(&self, message: SsdpMessage) {
        *self.inner.ssdp.lock().unwrap() = message;
    }

    pub fn ssdp_message(&self) -> SsdpMessage {
        self.inner.ssdp.lock().unwrap().clone()
    }
}

/// Resolution pass: link the parsed records into the device graph.
///
/// Fails with `InvalidDescription` when a required element is missing, a
/// serviceId is duplicated within one device, or an argument references a
/// state variable that does not exist even after trimming.
pub(crate) fn resolve_device(
    record: DeviceRecord,
    description: &str,
    ssdp: SsdpMessage,
    base_url: &str,
    context: &Arc<SubscribeContext>,
) -> Result<Device, ControlPointError> {
    let udn = record
        .udn
        .clone()
        .ok_or_else(|| ControlPointError::invalid_description("device has no UDN"))?;
    let device_type = record
        .device_type
        .clone()
        .ok_or_else(|| ControlPointError::invalid_description("device has no deviceType"))?;
    let friendly_name = record
        .friendly_name
        .clone()
        .ok_or_else(|| ControlPointError::invalid_description("device has no friendlyName"))?;

    let local_address = ssdp.local_address();

    let mut service_list = Vec::with_capacity(record.services.len());
    let mut seen_ids = HashSet::new();
    for service_record in record.services {
        if !seen_ids.insert(service_record.service_id.clone()) {
            return Err(ControlPointError::InvalidDescription(format!(
                "duplicate serviceId {} on {}",
                service_record.service_id, udn
            )));
        }
        service_list.push(resolve_service(
            service_record,
            &udn,
            base_url,
            local_address,
            context,
        )?);
    }

    let mut device_list = Vec::with_capacity(record.devices.len());
    for child in record.devices {
        device_list.push(resolve_device(
            child,
            description,
            ssdp.clone(),
            base_url,
            context,
        )?);
    }

    let icon_list = record
        .icons
        .into_iter()
        .map(|icon| Icon {
            mime_type: icon.mime_type,
            width: icon.width,
            height: icon.height,
            depth: icon.depth,
            url: icon.url,
            binary: icon.binary,
        })
        .collect();

    Ok(Device {
        inner: Arc::new(DeviceInner {
            udn,
            device_type,
            friendly_name,
            manufacturer: record.manufacturer,
            manufacturer_url: record.manufacturer_url,
            model_name: record.model_name,
            model_url: record.model_url,
            model_description: record.model_description,
            model_number: record.model_number,
            serial_number: record.serial_number,
            presentation_url: record.presentation_url,
            base_url: base_url.to_string(),
            description: description.to_string(),
            announcement: Mutex::new(Announcement::new(ssdp)),
            icon_list,
            service_list,
            device_list,
        }),
    })
}

fn resolve_service(
    record: ServiceRecord,
    udn: &str,
    base_url: &str,
    local_address: Option<std::net::IpAddr>,
    context: &Arc<SubscribeContext>,
) -> Result<Service, ControlPointError> {
    let state_variables = record.state_variables;
    let variable_index: HashMap<&str, usize> = state_variables
        .iter()
        .enumerate()
        .map(|(idx, v)| (v.name(), idx))
        .collect();

    let mut actions = Vec::with_capacity(record.actions.len());
    for action_record in &record.actions {
        let mut arguments = Vec::with_capacity(action_record.arguments.len());
        for argument in &action_record.arguments {
            let name = argument.related_state_variable.as_str();
            let related = match variable_index.get(name) {
                Some(idx) => *idx,
                None => {
                    // Some vendors pad the reference with whitespace; retry
                    // once with the trimmed name.
                    let trimmed = name.trim();
                    match variable_index.get(trimmed) {
                        Some(idx) => {
                            warn!(
                                service = record.service_id.as_str(),
                                variable = name,
                                "relatedStateVariable has surrounding blanks"
                            );
                            *idx
                        }
                        None => {
                            return Err(ControlPointError::InvalidDescription(format!(
                                "no StateVariable {} for argument {} of {}",
                                name, argument.name, action_record.name
                            )));
                        }
                    }
                }
            };
            arguments.push(Argument::new(
                argument.name.clone(),
                Direction::parse(&argument.direction),
                related,
            ));
        }
        actions.push(Action {
            name: action_record.name.clone(),
            arguments,
            service_type: record.service_type.clone(),
            control_url: resolve_url(base_url, &record.control_url),
        });
    }

    Ok(Service {
        inner: Arc::new(ServiceInner {
            udn: udn.to_string(),
            base_url: base_url.to_string(),
            local_address,
            service_type: record.service_type,
            service_id: record.service_id,
            scpd_url: resolve_url(base_url, &record.scpd_url),
            control_url: resolve_url(base_url, &record.control_url),
            event_sub_url: resolve_url(base_url, &record.event_sub_url),
            description: record.description,
            actions,
            state_variables,
            subscription: Mutex::new(SubscriptionState::default()),
            subscribe_context: Arc::downgrade(context),
        }),
    })
}
