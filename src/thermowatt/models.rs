use std::{fmt, str::FromStr};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Authentication: POST /login, POST /refresh
// ---------------------------------------------------------------------------

/// App identification the cloud expects alongside operator credentials.
pub const APP_NAME: &str = "thermowatt";
pub const APP_VERSION: &str = "01.03.21";
pub const APP_LANG: &str = "en";

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub app: &'static str,
    pub version: &'static str,
    pub lang: &'static str,
    pub install_id: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
    pub install_id: String,
}

/// Token pair returned by both login and refresh.
#[derive(Debug, Deserialize)]
pub struct TokenResult {
    pub access_token: String,
    pub refresh_token: String,
}

// ---------------------------------------------------------------------------
// Inventory: GET /user-info
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UserInfo {
    #[serde(default, rename = "termostati")]
    pub heaters: Vec<HeaterInfo>,
}

/// One water heater listed in the account inventory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeaterInfo {
    #[serde(rename = "seriale")]
    pub serial: String,
    #[serde(rename = "nome")]
    pub name: String,
}

// ---------------------------------------------------------------------------
// Status snapshot: GET /status, P/{serial}/STATUS
//
// The cloud reports telemetry as a flat object whose values are strings:
//   { "T_Avg": "48", "T_SetPoint": "60", "Cmd": "9", ... }
// The bridge treats it as opaque apart from the fields a command overrides.
// ---------------------------------------------------------------------------

pub const FIELD_AVG_TEMPERATURE: &str = "T_Avg";
pub const FIELD_SETPOINT: &str = "T_SetPoint";
pub const FIELD_MODE_CODE: &str = "Cmd";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusSnapshot(Map<String, Value>);

impl StatusSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw status payload. Returns `None` unless it is a JSON object.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Value>(payload).ok()? {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Overwrite one field, keeping the cloud's string encoding.
    pub fn set_field(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_owned(), Value::String(value.into()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_payload(&self) -> Vec<u8> {
        // A map of strings always serialises.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Operating modes
// ---------------------------------------------------------------------------

/// Heater operating mode and its numeric cloud code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Off,
    Eco,
    Manual,
    Auto,
    Holiday,
}

impl Mode {
    pub const ALL: [Mode; 5] = [Mode::Manual, Mode::Eco, Mode::Auto, Mode::Holiday, Mode::Off];

    /// Value the cloud reports in the `Cmd` status field.
    pub fn code(self) -> u16 {
        match self {
            Mode::Manual => 9,
            Mode::Eco => 3,
            Mode::Auto => 17,
            Mode::Holiday => 65,
            Mode::Off => 16,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }

    /// Token used on `P/{serial}/CMD/MODE`.
    pub fn token(self) -> &'static str {
        match self {
            Mode::Off => "Off",
            Mode::Eco => "Eco",
            Mode::Manual => "Manual",
            Mode::Auto => "Auto",
            Mode::Holiday => "Holiday",
        }
    }

    /// Operation mode name shown by the automation hub.
    pub fn hub_label(self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::Eco => "eco",
            Mode::Manual => "performance",
            Mode::Auto => "auto",
            Mode::Holiday => "electric",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.token().eq_ignore_ascii_case(s))
            .ok_or_else(|| s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Control operations: POST /manual | /eco | /auto | /holiday | /off
// ---------------------------------------------------------------------------

/// A state-changing call against the cloud for one heater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudOperation {
    SetManual { setpoint: i64 },
    SetEco,
    SetAuto,
    SetHoliday { end_date: NaiveDate },
    SetOff,
}

impl CloudOperation {
    pub fn path(&self) -> &'static str {
        match self {
            CloudOperation::SetManual { .. } => "/manual",
            CloudOperation::SetEco => "/eco",
            CloudOperation::SetAuto => "/auto",
            CloudOperation::SetHoliday { .. } => "/holiday",
            CloudOperation::SetOff => "/off",
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            CloudOperation::SetManual { .. } => Mode::Manual,
            CloudOperation::SetEco => Mode::Eco,
            CloudOperation::SetAuto => Mode::Auto,
            CloudOperation::SetHoliday { .. } => Mode::Holiday,
            CloudOperation::SetOff => Mode::Off,
        }
    }

    pub fn body(&self, serial: &str) -> Value {
        match self {
            CloudOperation::SetManual { setpoint } => {
                json!({ "serial": serial, "T_SetPoint": setpoint.to_string() })
            }
            CloudOperation::SetHoliday { end_date } => {
                json!({ "serial": serial, "end_date": end_date.format("%Y-%m-%d").to_string() })
            }
            _ => json!({ "serial": serial }),
        }
    }
}
