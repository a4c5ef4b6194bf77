use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::{
    error::DiscoveryError,
    store::{DeviceRecord, StateStore},
    thermowatt::{
        models::{HeaterInfo, StatusSnapshot},
        ThermowattClient,
    },
};

/// Point-in-time view of one bridged heater.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub serial: String,
    pub name: String,
    /// Setpoint used when switching to Manual mode.
    pub favorite_setpoint: i64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Device {
    fn from_record(serial: &str, record: &DeviceRecord) -> Self {
        Self {
            serial: serial.to_owned(),
            name: record.name.clone(),
            favorite_setpoint: record.favorite_setpoint,
            cooldown_until: record.cooldown_until,
        }
    }

    /// Whether status updates arriving at `at` must be suppressed.
    pub fn is_suppressed(&self, at: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| at < until)
    }
}

/// Exclusive right to change what the local broker shows for one device.
///
/// The relay holds it across "check cooldown, record, publish" and the
/// dispatcher across "arm cooldown, inject", so a stale status can never be
/// published after an optimistic one.
pub type DeviceGuard = OwnedMutexGuard<()>;

/// Serial → device map shared by the dispatcher, the relay and the API.
///
/// Backed by the [`StateStore`]: every read or write of a device's cooldown
/// and setpoint happens under the store's single lock. Only devices present
/// in the latest cloud inventory are visible; records of devices that
/// dropped out are kept so their setpoint survives a later return.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    store: StateStore,
    guards: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl DeviceRegistry {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            guards: Arc::default(),
        }
    }

    /// Query the cloud inventory and merge it into the registry.
    ///
    /// Existing devices keep their setpoint and cooldown; only the display
    /// name is refreshed. Devices missing from the inventory stop being
    /// bridged. An empty inventory is an error.
    pub async fn discover(
        &self,
        client: &ThermowattClient,
    ) -> Result<Vec<HeaterInfo>, DiscoveryError> {
        let heaters = client.user_info().await?;
        if heaters.is_empty() {
            return Err(DiscoveryError::Empty);
        }

        for heater in &heaters {
            self.upsert(&heater.serial, &heater.name).await;
        }
        let retired = self
            .store
            .update(|s| {
                let mut retired = Vec::new();
                for (serial, device) in s.devices.iter_mut() {
                    if device.active && !heaters.iter().any(|h| &h.serial == serial) {
                        device.active = false;
                        retired.push(serial.clone());
                    }
                }
                retired
            })
            .await;
        if !retired.is_empty() {
            info!(serials = ?retired, "Devices no longer in the cloud inventory");
        }
        info!(count = heaters.len(), "Discovered water heaters");
        self.flush().await;
        Ok(heaters)
    }

    /// Insert a device or rename an existing one, and start bridging it.
    pub async fn upsert(&self, serial: &str, name: &str) {
        self.store
            .update(|s| {
                let device = s
                    .devices
                    .entry(serial.to_owned())
                    .and_modify(|d| d.name = name.to_owned())
                    .or_insert_with(|| DeviceRecord::new(name));
                device.active = true;
            })
            .await;
    }

    /// Wait for exclusive access to `serial`'s published state.
    pub async fn lock_device(&self, serial: &str) -> DeviceGuard {
        let guard = {
            let mut guards = self.guards.lock().unwrap_or_else(|p| p.into_inner());
            guards.entry(serial.to_owned()).or_default().clone()
        };
        guard.lock_owned().await
    }

    pub async fn get(&self, serial: &str) -> Option<Device> {
        self.store
            .read(|s| {
                s.devices
                    .get(serial)
                    .filter(|d| d.active)
                    .map(|d| Device::from_record(serial, d))
            })
            .await
    }

    pub async fn contains(&self, serial: &str) -> bool {
        self.store
            .read(|s| s.devices.get(serial).is_some_and(|d| d.active))
            .await
    }

    pub async fn serials(&self) -> Vec<String> {
        self.store
            .read(|s| {
                s.devices
                    .iter()
                    .filter(|(_, d)| d.active)
                    .map(|(serial, _)| serial.clone())
                    .collect()
            })
            .await
    }

    /// All bridged devices ordered by serial.
    pub async fn snapshot(&self) -> Vec<Device> {
        self.store
            .read(|s| {
                s.devices
                    .iter()
                    .filter(|(_, d)| d.active)
                    .map(|(serial, d)| Device::from_record(serial, d))
                    .collect()
            })
            .await
    }

    /// Extend the device's cooldown to `until`. Never moves it backwards.
    /// Returns the effective expiry, or `None` for an unknown serial.
    pub async fn arm_cooldown(&self, serial: &str, until: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.store
            .update(|s| {
                let device = s.devices.get_mut(serial)?;
                let effective = device.cooldown_until.map_or(until, |cur| cur.max(until));
                device.cooldown_until = Some(effective);
                Some(effective)
            })
            .await
    }

    pub async fn cooldown_until(&self, serial: &str) -> Option<DateTime<Utc>> {
        self.store
            .read(|s| s.devices.get(serial).and_then(|d| d.cooldown_until))
            .await
    }

    /// `true` while a command's cooldown is still running at `at`.
    pub async fn is_suppressed(&self, serial: &str, at: DateTime<Utc>) -> bool {
        self.cooldown_until(serial)
            .await
            .is_some_and(|until| at < until)
    }

    pub async fn remember_setpoint(&self, serial: &str, degrees: i64) -> bool {
        self.store
            .update(|s| match s.devices.get_mut(serial) {
                Some(d) => {
                    d.favorite_setpoint = degrees;
                    true
                }
                None => false,
            })
            .await
    }

    pub async fn last_status(&self, serial: &str) -> Option<StatusSnapshot> {
        self.store
            .read(|s| s.devices.get(serial).and_then(|d| d.last_status.clone()))
            .await
    }

    pub async fn record_status(&self, serial: &str, status: StatusSnapshot) {
        self.store
            .update(|s| {
                if let Some(d) = s.devices.get_mut(serial) {
                    d.last_status = Some(status);
                }
            })
            .await;
    }

    /// Persist the registry. Failures are logged, never propagated.
    pub async fn flush(&self) -> bool {
        match self.store.persist().await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.store.path().display(), error = %e, "Failed to persist registry");
                false
            }
        }
    }
}
