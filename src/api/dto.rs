use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::registry::Device;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthDto {
    /// `ok`, or `auth_halted` after an unrecoverable cloud auth failure
    pub status: String,
    pub install_id: Uuid,
    pub devices: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeviceDto {
    pub serial: String,
    pub name: String,
    /// Degrees Celsius, used when switching to Manual
    pub favorite_setpoint: i64,
    /// Status updates are suppressed until this instant
    pub cooldown_until: Option<DateTime<Utc>>,
    pub suppressed: bool,
}

impl DeviceDto {
    pub fn from_device(d: Device, now: DateTime<Utc>) -> Self {
        Self {
            suppressed: d.is_suppressed(now),
            serial: d.serial,
            name: d.name,
            favorite_setpoint: d.favorite_setpoint,
            cooldown_until: d.cooldown_until,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeviceStatusDto {
    pub serial: String,
    /// Last status document published for the device
    #[schema(value_type = Object)]
    pub status: Value,
}
