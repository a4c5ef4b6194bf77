//! Local command handling: `P/{serial}/CMD/{TEMP|MODE}` → cloud operation,
//! plus an optimistic status injection so the hub reflects the change before
//! the cloud does.
//!
//! # Consistency trade-off
//!
//! With [`InjectionPolicy::Always`] the injected status is published and the
//! cooldown armed even when the cloud call fails. The hub then shows the
//! requested state until the next authoritative status after the cooldown,
//! which either confirms it or reverts it. This favours responsiveness over
//! strict consistency. [`InjectionPolicy::OnCloudSuccess`] only injects once
//! the cloud accepted the operation.

use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    discovery::{MAX_TEMP, MIN_TEMP},
    error::{CloudError, DispatchError},
    mqtt::{topic::status_topic, LocalBroker, ParsedTopic, TopicKind},
    registry::DeviceRegistry,
    thermowatt::{
        models::{CloudOperation, Mode, StatusSnapshot, FIELD_MODE_CODE, FIELD_SETPOINT},
        ThermowattClient,
    },
};

/// How long Holiday mode lasts when set from the hub.
pub const HOLIDAY_DAYS: i64 = 30;

/// A command received from the local hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetTemperature { serial: String, degrees: i64 },
    SetMode { serial: String, mode: Mode },
}

impl Command {
    /// Decode the payload of a command topic.
    pub fn parse(topic: &ParsedTopic, payload: &[u8]) -> Result<Self, DispatchError> {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();
        let serial = topic.serial.clone();

        match topic.kind {
            TopicKind::SetTemperature => {
                let value: f64 = text
                    .parse()
                    .ok()
                    .filter(|v: &f64| v.is_finite())
                    .ok_or_else(|| DispatchError::InvalidTemperature(text.to_owned()))?;
                let degrees = (value.round() as i64).clamp(MIN_TEMP, MAX_TEMP);
                Ok(Command::SetTemperature { serial, degrees })
            }
            TopicKind::SetMode => {
                let mode = Mode::from_str(text).map_err(DispatchError::UnknownMode)?;
                Ok(Command::SetMode { serial, mode })
            }
            TopicKind::Status | TopicKind::GetStatus => Err(DispatchError::NotACommand(format!(
                "{}/{:?}",
                topic.serial, topic.kind
            ))),
        }
    }

    pub fn serial(&self) -> &str {
        match self {
            Command::SetTemperature { serial, .. } | Command::SetMode { serial, .. } => serial,
        }
    }
}

/// What a command does, computed before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub operation: CloudOperation,
    /// Status fields to overwrite in the injected snapshot.
    pub overlay: Vec<(&'static str, String)>,
    /// New favorite setpoint to remember once the cloud accepts the command.
    pub remember_setpoint: Option<i64>,
    pub is_holiday: bool,
}

/// Map a command to its cloud operation and status overlay.
///
/// | Command          | Operation    | Cmd | Setpoint                    |
/// |------------------|--------------|-----|-----------------------------|
/// | Manual           | /manual      | 9   | remembered favorite         |
/// | Eco              | /eco         | 3   | –                           |
/// | Auto             | /auto        | 17  | –                           |
/// | Holiday          | /holiday     | 65  | – (ends `now + 30 days`)    |
/// | Off              | /off         | 16  | –                           |
/// | temperature `n`  | /manual      | 9   | `n`, becomes the favorite   |
pub fn plan_command(command: &Command, favorite_setpoint: i64, now: DateTime<Utc>) -> CommandPlan {
    let code = |mode: Mode| (FIELD_MODE_CODE, mode.code().to_string());

    match command {
        Command::SetTemperature { degrees, .. } => CommandPlan {
            operation: CloudOperation::SetManual { setpoint: *degrees },
            overlay: vec![code(Mode::Manual), (FIELD_SETPOINT, degrees.to_string())],
            remember_setpoint: Some(*degrees),
            is_holiday: false,
        },
        Command::SetMode { mode, .. } => {
            let (operation, overlay) = match mode {
                Mode::Manual => (
                    CloudOperation::SetManual { setpoint: favorite_setpoint },
                    vec![code(Mode::Manual), (FIELD_SETPOINT, favorite_setpoint.to_string())],
                ),
                Mode::Eco => (CloudOperation::SetEco, vec![code(Mode::Eco)]),
                Mode::Auto => (CloudOperation::SetAuto, vec![code(Mode::Auto)]),
                Mode::Holiday => (
                    CloudOperation::SetHoliday { end_date: holiday_end(now) },
                    vec![code(Mode::Holiday)],
                ),
                Mode::Off => (CloudOperation::SetOff, vec![code(Mode::Off)]),
            };
            CommandPlan {
                operation,
                overlay,
                remember_setpoint: None,
                is_holiday: *mode == Mode::Holiday,
            }
        }
    }
}

/// Calendar date `HOLIDAY_DAYS` after `now` (UTC).
pub fn holiday_end(now: DateTime<Utc>) -> NaiveDate {
    (now + TimeDelta::days(HOLIDAY_DAYS)).date_naive()
}

/// When the optimistic status is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectionPolicy {
    /// Inject regardless of the cloud call's outcome.
    #[default]
    Always,
    /// Inject only after the cloud accepted the operation.
    OnCloudSuccess,
}

impl FromStr for InjectionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "always" => Ok(Self::Always),
            "on_cloud_success" => Ok(Self::OnCloudSuccess),
            other => Err(anyhow::anyhow!("unknown injection policy: {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub cooldown: TimeDelta,
    /// Added on top of `cooldown` for Holiday commands.
    pub holiday_buffer: TimeDelta,
    pub policy: InjectionPolicy,
}

/// Result of a command that passed validation.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub command: Command,
    pub cloud_accepted: bool,
    /// Snapshot published to the local status topic, if any.
    pub injected: Option<StatusSnapshot>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct CommandDispatcher {
    client: ThermowattClient,
    registry: DeviceRegistry,
    broker: Arc<dyn LocalBroker>,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
}

impl CommandDispatcher {
    pub fn new(
        client: ThermowattClient,
        registry: DeviceRegistry,
        broker: Arc<dyn LocalBroker>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            client,
            registry,
            broker,
            clock,
            settings,
        }
    }

    /// Handle one message from a local command topic.
    pub async fn handle(
        &self,
        topic: &ParsedTopic,
        payload: &[u8],
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(device) = self.registry.get(&topic.serial).await else {
            return Err(DispatchError::UnknownDevice(topic.serial.clone()));
        };
        let command = Command::parse(topic, payload)?;
        let now = self.clock.now();
        let plan = plan_command(&command, device.favorite_setpoint, now);
        let serial = command.serial().to_owned();

        info!(serial = %serial, command = ?command, "Dispatching local command");

        let mut window = self.settings.cooldown;
        if plan.is_holiday {
            window += self.settings.holiday_buffer;
        }

        let mut outcome = DispatchOutcome {
            command: command.clone(),
            cloud_accepted: false,
            injected: None,
            cooldown_until: None,
        };

        match self.settings.policy {
            InjectionPolicy::Always => {
                (outcome.cooldown_until, outcome.injected) =
                    self.arm_and_inject(&serial, now + window, &plan).await;
                outcome.cloud_accepted = self.deliver(&serial, &plan).await;
            }
            InjectionPolicy::OnCloudSuccess => {
                outcome.cloud_accepted = self.deliver(&serial, &plan).await;
                if outcome.cloud_accepted {
                    (outcome.cooldown_until, outcome.injected) =
                        self.arm_and_inject(&serial, now + window, &plan).await;
                }
            }
        }

        if outcome.cloud_accepted {
            if let Some(degrees) = plan.remember_setpoint {
                self.registry.remember_setpoint(&serial, degrees).await;
            }
            self.registry.flush().await;
        }

        Ok(outcome)
    }

    /// Send the operation to the cloud. Failures are logged, not returned.
    async fn deliver(&self, serial: &str, plan: &CommandPlan) -> bool {
        match self.client.send_operation(serial, &plan.operation).await {
            Ok(()) => {
                debug!(serial = %serial, mode = %plan.operation.mode(), "Cloud accepted command");
                true
            }
            Err(e @ CloudError::Auth(_)) => {
                error!(serial = %serial, error = %e, "Command not delivered: cloud authentication failed");
                false
            }
            Err(e) => {
                error!(serial = %serial, error = %e, "Command not delivered to cloud");
                false
            }
        }
    }

    /// Arm the cooldown and publish the optimistic status under the device
    /// lock, so no relayed status can land between the two.
    async fn arm_and_inject(
        &self,
        serial: &str,
        until: DateTime<Utc>,
        plan: &CommandPlan,
    ) -> (Option<DateTime<Utc>>, Option<StatusSnapshot>) {
        let _guard = self.registry.lock_device(serial).await;
        let cooldown_until = self.registry.arm_cooldown(serial, until).await;
        let injected = self.inject(serial, plan).await;
        (cooldown_until, injected)
    }

    /// Overlay the plan onto the last known status and publish it locally.
    async fn inject(&self, serial: &str, plan: &CommandPlan) -> Option<StatusSnapshot> {
        let mut snapshot = match self.registry.last_status(serial).await {
            Some(s) => s,
            None => match self.client.status(serial).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(serial = %serial, error = %e, "No baseline status; injecting overlay only");
                    StatusSnapshot::new()
                }
            },
        };
        for (field, value) in &plan.overlay {
            snapshot.set_field(field, value.clone());
        }
        self.registry.record_status(serial, snapshot.clone()).await;

        match self
            .broker
            .publish_retained(&status_topic(serial), snapshot.to_payload())
            .await
        {
            Ok(()) => {
                debug!(serial = %serial, "Injected optimistic status");
                Some(snapshot)
            }
            Err(e) => {
                error!(serial = %serial, error = %e, "Failed to publish optimistic status");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
