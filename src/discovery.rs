//! Home Assistant MQTT discovery descriptor for each bridged heater.
//!
//! The descriptor is a pure function of `(serial, name)`: struct field order
//! fixes the JSON key order, so republishing unchanged inputs yields the same
//! bytes.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::{
    error::BrokerError,
    mqtt::{
        topic::{discovery_topic, mode_command_topic, status_topic, temperature_command_topic},
        LocalBroker,
    },
    thermowatt::models::{Mode, FIELD_AVG_TEMPERATURE, FIELD_MODE_CODE, FIELD_SETPOINT},
};

pub const MIN_TEMP: i64 = 20;
pub const MAX_TEMP: i64 = 75;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptor {
    pub unique_id: String,
    pub name: String,
    pub optimistic: bool,
    pub temperature_unit: &'static str,
    pub precision: f64,
    pub min_temp: i64,
    pub max_temp: i64,
    pub current_temperature_topic: String,
    pub current_temperature_template: String,
    pub temperature_state_topic: String,
    pub temperature_state_template: String,
    pub temperature_command_topic: String,
    pub temperature_command_template: &'static str,
    pub mode_state_topic: String,
    pub mode_state_template: String,
    pub modes: Vec<&'static str>,
    pub mode_command_topic: String,
    pub mode_command_template: String,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub name: String,
}

impl Descriptor {
    pub fn new(serial: &str, name: &str) -> Self {
        let status = status_topic(serial);
        let display_name = format!("Boiler {name}");

        Self {
            unique_id: format!("thermowatt_{serial}"),
            name: display_name.clone(),
            optimistic: false,
            temperature_unit: "C",
            precision: 1.0,
            min_temp: MIN_TEMP,
            max_temp: MAX_TEMP,
            current_temperature_topic: status.clone(),
            current_temperature_template: format!("{{{{ value_json.{FIELD_AVG_TEMPERATURE} | float }}}}"),
            temperature_state_topic: status.clone(),
            temperature_state_template: format!("{{{{ value_json.{FIELD_SETPOINT} | float }}}}"),
            temperature_command_topic: temperature_command_topic(serial),
            temperature_command_template: "{{ value | int }}",
            mode_state_topic: status,
            mode_state_template: mode_state_template(),
            modes: Mode::ALL.iter().map(|m| m.hub_label()).collect(),
            mode_command_topic: mode_command_topic(serial),
            mode_command_template: mode_command_template(),
            device: DeviceInfo {
                identifiers: vec![format!("thermowatt_{serial}")],
                manufacturer: "Thermowatt",
                model: "Smart water heater",
                name: display_name,
            },
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        // Plain structs of strings and numbers always serialise.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Holiday variants all carry this bit in `Cmd`.
const HOLIDAY_FLAG: u16 = 64;

/// Renders the `Cmd` status code as a hub mode label. Unknown codes read as
/// `off`.
fn mode_state_template() -> String {
    let mut template = format!("{{% set cmd = value_json.{FIELD_MODE_CODE} | int(0) %}}");
    let mut first = true;
    for mode in Mode::ALL.iter().filter(|m| **m != Mode::Off) {
        let keyword = if first { "if" } else { "elif" };
        first = false;
        let test = match mode {
            Mode::Holiday => format!("(cmd // {HOLIDAY_FLAG}) % 2 == 1"),
            other => format!("cmd == {}", other.code()),
        };
        template.push_str(&format!("{{% {keyword} {test} %}}{}", mode.hub_label()));
    }
    template.push_str(&format!("{{% else %}}{}{{% endif %}}", Mode::Off.hub_label()));
    template
}

/// Turns a hub mode label into the payload for `P/{serial}/CMD/MODE`.
fn mode_command_template() -> String {
    let mut template = String::new();
    let mut first = true;
    for mode in Mode::ALL.iter().filter(|m| **m != Mode::Off) {
        let keyword = if first { "if" } else { "elif" };
        first = false;
        template.push_str(&format!(
            "{{% {keyword} value == '{}' %}}{}",
            mode.hub_label(),
            mode.token()
        ));
    }
    template.push_str(&format!("{{% else %}}{}{{% endif %}}", Mode::Off.token()));
    template
}

/// Publishes retained discovery descriptors to the local broker.
#[derive(Clone)]
pub struct DiscoveryPublisher {
    broker: Arc<dyn LocalBroker>,
}

impl DiscoveryPublisher {
    pub fn new(broker: Arc<dyn LocalBroker>) -> Self {
        Self { broker }
    }

    pub async fn publish(&self, serial: &str, name: &str) -> Result<(), BrokerError> {
        let payload = Descriptor::new(serial, name).to_payload();
        self.broker
            .publish_retained(&discovery_topic(serial), payload)
            .await?;
        info!(serial = %serial, name = %name, "Published discovery descriptor");
        Ok(())
    }
}
