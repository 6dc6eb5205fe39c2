//! Live registry of device capability and availability.
//!
//! One coarse lock guards the whole map. Every mutation happens under the
//! write guard and returns a copy of the resulting device so callers can fan
//! it out without holding the lock.

use crate::errors::{Error, Result};
use crate::model::{ActuatorView, Capabilities, Device};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Fields announced by a birth message.
#[derive(Debug, Clone, Default)]
pub struct Birth {
    pub location: Option<String>,
    pub name: Option<String>,
    pub platform: Option<String>,
    pub firmware: Option<String>,
    pub capabilities: Capabilities,
    pub telemetry_interval_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    default_location: String,
}

impl DeviceRegistry {
    pub fn new(default_location: impl Into<String>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            default_location: default_location.into(),
        }
    }

    /// Creates or merges a device. Capabilities are replaced wholesale;
    /// optional metadata keeps its known value when the birth omits it.
    pub fn upsert_from_birth(&self, id: &str, birth: Birth, now: i64) -> Device {
        let mut devices = self.devices.write();
        let device = devices.entry(id.to_string()).or_insert_with(|| {
            info!("Registering new device {}", id);
            Device {
                id: id.to_string(),
                location: self.default_location.clone(),
                name: None,
                platform: None,
                firmware: None,
                telemetry_interval_ms: None,
                capabilities: Capabilities::default(),
                custom_names: BTreeMap::new(),
                online: false,
                last_seen: now,
            }
        });

        if let Some(location) = birth.location.filter(|l| !l.is_empty()) {
            device.location = location;
        }
        device.name = birth.name.or(device.name.take());
        device.platform = birth.platform.or(device.platform.take());
        device.firmware = birth.firmware.or(device.firmware.take());
        device.telemetry_interval_ms = birth.telemetry_interval_ms.or(device.telemetry_interval_ms);
        device.capabilities = birth.capabilities;
        device.online = true;
        device.last_seen = now;

        debug!(
            "Device {} capabilities: {} sensors, {} actuators",
            id,
            device.capabilities.sensors.len(),
            device.capabilities.actuators.len()
        );
        device.clone()
    }

    /// Clears liveness only; capabilities stay for display.
    pub fn mark_offline(&self, id: &str) -> Result<Device> {
        self.mutate(id, |device| {
            device.online = false;
            Ok(())
        })
    }

    /// Records that the device was heard from. Unknown devices are ignored.
    pub fn touch(&self, id: &str, now: i64) -> bool {
        let mut devices = self.devices.write();
        match devices.get_mut(id) {
            Some(device) => {
                device.last_seen = device.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    pub fn sync_actuator_state(&self, device_id: &str, actuator_id: &str, value: Value) -> Result<Device> {
        self.mutate(device_id, |device| {
            let actuator = device
                .capabilities
                .actuators
                .iter_mut()
                .find(|a| a.id == actuator_id)
                .ok_or_else(|| Error::ActuatorNotFound {
                    device_id: device_id.to_string(),
                    actuator_id: actuator_id.to_string(),
                })?;
            actuator.state = Some(value);
            Ok(())
        })
    }

    /// Labels a declared actuator. The label outlives later births.
    pub fn set_custom_name(&self, device_id: &str, actuator_id: &str, name: String) -> Result<Device> {
        self.mutate(device_id, |device| {
            if !device.capabilities.actuators.iter().any(|a| a.id == actuator_id) {
                return Err(Error::ActuatorNotFound {
                    device_id: device_id.to_string(),
                    actuator_id: actuator_id.to_string(),
                });
            }
            device.custom_names.insert(actuator_id.to_string(), name);
            Ok(())
        })
    }

    pub fn clear_custom_name(&self, device_id: &str, actuator_id: &str) -> Result<Device> {
        self.mutate(device_id, |device| {
            device.custom_names.remove(actuator_id);
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn online(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .values()
            .filter(|d| d.online)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Flattened actuators of one device, or of every device when `device_id`
    /// is `None`. An unknown device is an error, not an empty list.
    pub fn actuators(&self, device_id: Option<&str>) -> Result<Vec<ActuatorView>> {
        let devices = match device_id {
            Some(id) => vec![self.get(id).ok_or_else(|| Error::DeviceNotFound(id.to_string()))?],
            None => self.all(),
        };

        Ok(devices
            .iter()
            .flat_map(|device| {
                device.capabilities.actuators.iter().map(move |a| ActuatorView {
                    device_id: device.id.clone(),
                    actuator_id: a.id.clone(),
                    kind: a.kind.clone(),
                    display_name: device.actuator_display_name(a),
                    declared_name: a.name.clone(),
                    custom_name: device.custom_names.get(&a.id).cloned(),
                    state: a.state.clone(),
                    location: device.location.clone(),
                    online: device.online,
                })
            })
            .collect())
    }

    /// See [`Device::metric_key`]. Unregistered devices keep raw ids.
    pub fn metric_key(&self, device_id: &str, reading_id: &str) -> String {
        match self.devices.read().get(device_id) {
            Some(device) => device.metric_key(reading_id),
            None => reading_id.to_string(),
        }
    }

    pub fn location_of(&self, device_id: &str) -> String {
        self.devices
            .read()
            .get(device_id)
            .map(|d| d.location.clone())
            .unwrap_or_else(|| self.default_location.clone())
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<Device>
    where
        F: FnOnce(&mut Device) -> Result<()>,
    {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        f(device)?;
        Ok(device.clone())
    }
}
