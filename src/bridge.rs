use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    discovery::DiscoveryPublisher,
    dispatcher::{CommandDispatcher, DispatcherSettings},
    error::{BootError, BrokerError, DispatchError, DiscoveryError, RelayError},
    mqtt::{
        cloud_options, parse_topic,
        topic::{mode_command_topic, status_topic, temperature_command_topic},
        LocalBroker, MessageHandler, MqttBroker,
    },
    registry::DeviceRegistry,
    relay::{request_push_status, StatusRelay},
    thermowatt::{models::HeaterInfo, ThermowattClient},
};

/// Wires the session, registry, dispatcher and relay together and owns the
/// boot sequence.
pub struct Bridge {
    client: ThermowattClient,
    registry: DeviceRegistry,
    discovery: DiscoveryPublisher,
    dispatcher: CommandDispatcher,
    relay: StatusRelay,
    local: Arc<dyn LocalBroker>,
}

impl Bridge {
    pub fn new(
        client: ThermowattClient,
        registry: DeviceRegistry,
        local: Arc<dyn LocalBroker>,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        let dispatcher = CommandDispatcher::new(
            client.clone(),
            registry.clone(),
            local.clone(),
            clock.clone(),
            settings,
        );
        let relay = StatusRelay::new(client.clone(), registry.clone(), local.clone(), clock);
        Self {
            discovery: DiscoveryPublisher::new(local.clone()),
            client,
            registry,
            dispatcher,
            relay,
            local,
        }
    }

    pub fn client(&self) -> &ThermowattClient {
        &self.client
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &StatusRelay {
        &self.relay
    }

    /// Authenticate, discover the inventory, publish one discovery
    /// descriptor per heater and subscribe to their command topics.
    pub async fn boot(&self) -> Result<Vec<HeaterInfo>, BootError> {
        let heaters = self.establish_inventory().await?;

        for heater in &heaters {
            self.discovery
                .publish(&heater.serial, &heater.name)
                .await
                .map_err(BootError::LocalBroker)?;
        }
        self.subscribe_commands()
            .await
            .map_err(BootError::LocalBroker)?;

        info!(devices = heaters.len(), "Bridge ready");
        Ok(heaters)
    }

    /// Stored tokens are tried first; if they are rejected the operator
    /// credentials are used once.
    async fn establish_inventory(&self) -> Result<Vec<HeaterInfo>, BootError> {
        if !self.client.has_tokens().await {
            self.client.authenticate().await.map_err(BootError::Auth)?;
            return Ok(self.registry.discover(&self.client).await?);
        }

        info!("Reusing stored session tokens");
        match self.registry.discover(&self.client).await {
            Err(DiscoveryError::Cloud(e)) if e.is_auth() => {
                warn!(error = %e, "Stored session rejected; logging in again");
                self.client.authenticate().await.map_err(BootError::Auth)?;
                Ok(self.registry.discover(&self.client).await?)
            }
            other => Ok(other?),
        }
    }

    async fn subscribe_commands(&self) -> Result<(), BrokerError> {
        for serial in self.registry.serials().await {
            self.local.subscribe(&temperature_command_topic(&serial)).await?;
            self.local.subscribe(&mode_command_topic(&serial)).await?;
        }
        Ok(())
    }

    /// Entry point for messages from the local broker.
    pub async fn on_local_command(&self, topic: &str, payload: &[u8]) {
        let parsed = match parse_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Ignoring message on unexpected topic");
                return;
            }
        };
        if !parsed.is_command() {
            debug!(topic = %topic, "Ignoring non-command message");
            return;
        }

        match self.dispatcher.handle(&parsed, payload).await {
            Ok(outcome) => info!(
                serial = %parsed.serial,
                cloud_accepted = outcome.cloud_accepted,
                injected = outcome.injected.is_some(),
                "Command handled"
            ),
            Err(DispatchError::UnknownDevice(serial)) => {
                warn!(serial = %serial, "Command for unknown device dropped");
            }
            Err(e) => warn!(topic = %topic, error = %e, "Invalid command dropped"),
        }
    }

    /// Entry point for messages from the cloud push channel.
    pub async fn on_cloud_event(&self, topic: &str, payload: &[u8]) {
        match self.relay.on_cloud_event(topic, payload).await {
            Ok(outcome) => debug!(topic = %topic, outcome = ?outcome, "Cloud status event"),
            Err(RelayError::UnknownDevice(serial)) => {
                warn!(serial = %serial, "Status for unknown device dropped");
            }
            Err(e) => error!(topic = %topic, error = %e, "Failed to relay cloud status"),
        }
    }

    /// Flush the registry before exit.
    pub async fn shutdown(&self) {
        if self.registry.flush().await {
            info!("Registry flushed");
        }
    }
}

/// Routes local broker messages to [`Bridge::on_local_command`].
pub struct LocalCommandHandler(pub Arc<Bridge>);

#[async_trait]
impl MessageHandler for LocalCommandHandler {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        self.0.on_local_command(topic, payload).await;
    }
}

/// Routes push channel messages to [`Bridge::on_cloud_event`].
pub struct CloudEventHandler(pub Arc<Bridge>);

#[async_trait]
impl MessageHandler for CloudEventHandler {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        self.0.on_cloud_event(topic, payload).await;
    }
}

/// Connection details for the cloud IoT push endpoint.
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub host: String,
    pub port: u16,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub connect_timeout: Duration,
}

/// Open one TLS push connection per bridged heater, subscribe to its status
/// topic and request an initial status.
pub async fn start_push_channels(
    bridge: Arc<Bridge>,
    settings: &PushSettings,
    shutdown: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let handler: Arc<dyn MessageHandler> = Arc::new(CloudEventHandler(bridge.clone()));
    let mut tasks = Vec::new();

    for serial in bridge.registry().serials().await {
        let options = cloud_options(
            &format!("HA_Bridge_{serial}"),
            &settings.host,
            settings.port,
            &settings.ca_path,
            &settings.cert_path,
            &settings.key_path,
        )?;
        let (channel, eventloop) = MqttBroker::new(format!("cloud-{serial}"), options);
        tasks.push(tokio::spawn(channel.clone().run(
            eventloop,
            handler.clone(),
            shutdown.clone(),
        )));

        channel
            .wait_connected(settings.connect_timeout)
            .await
            .with_context(|| format!("push channel for {serial} did not connect"))?;
        channel
            .subscribe(&status_topic(&serial))
            .await
            .with_context(|| format!("failed to subscribe push channel for {serial}"))?;
        request_push_status(channel.as_ref(), &serial)
            .await
            .with_context(|| format!("failed to request status for {serial}"))?;
        info!(serial = %serial, host = %settings.host, "Push channel subscribed");
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::TimeDelta;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        clock::ManualClock,
        dispatcher::InjectionPolicy,
        mqtt::RetainedStore,
        relay::RelayOutcome,
        store::{DeviceRecord, PersistedState, SessionTokens, StateStore},
        thermowatt::{transport::fake::FakeCloud, Credentials},
    };

    struct Harness {
        cloud: Arc<FakeCloud>,
        broker: RetainedStore,
        store: StateStore,
        bridge: Bridge,
        _dir: tempfile::TempDir,
    }

    fn harness_with(state: PersistedState) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_state(dir.path().join("state.json"), state);
        let cloud = Arc::new(FakeCloud::new());
        cloud.add_heater("A1", "Kitchen");
        cloud.add_heater("B2", "Garage");
        cloud.set_status("A1", json!({ "T_Avg": "48", "Cmd": "3" }));

        let client = ThermowattClient::new(
            cloud.clone(),
            store.clone(),
            Credentials { email: "e".into(), password: "p".into() },
        );
        let broker = RetainedStore::new();
        let bridge = Bridge::new(
            client,
            DeviceRegistry::new(store.clone()),
            Arc::new(broker.clone()),
            Arc::new(ManualClock::at_unix(1_000)),
            DispatcherSettings {
                cooldown: TimeDelta::seconds(60),
                holiday_buffer: TimeDelta::seconds(30),
                policy: InjectionPolicy::Always,
            },
        );
        Harness { cloud, broker, store, bridge, _dir: dir }
    }

    fn stored_tokens() -> PersistedState {
        PersistedState {
            tokens: Some(SessionTokens {
                access_token: "stored-access".into(),
                refresh_token: "stored-refresh".into(),
            }),
            ..PersistedState::fresh()
        }
    }

    #[tokio::test]
    async fn boot_publishes_discovery_and_subscribes_commands() {
        let h = harness_with(PersistedState::fresh());
        let heaters = h.bridge.boot().await.unwrap();

        assert_eq!(heaters.len(), 2);
        assert_eq!(h.cloud.paths(), vec!["/login", "/user-info"]);
        assert!(h.broker.retained("homeassistant/water_heater/A1/config").is_some());
        assert!(h.broker.retained("homeassistant/water_heater/B2/config").is_some());
        assert_eq!(
            h.broker.subscriptions(),
            vec!["P/A1/CMD/MODE", "P/A1/CMD/TEMP", "P/B2/CMD/MODE", "P/B2/CMD/TEMP"]
        );
    }

    #[tokio::test]
    async fn boot_reuses_stored_tokens_without_login() {
        let h = harness_with(stored_tokens());
        h.cloud.trust("stored-access", "stored-refresh");

        h.bridge.boot().await.unwrap();
        assert_eq!(h.cloud.count("/login"), 0);
        assert_eq!(h.cloud.paths(), vec!["/user-info"]);
    }

    #[tokio::test]
    async fn rejected_stored_tokens_fall_back_to_one_login() {
        let h = harness_with(stored_tokens());

        h.bridge.boot().await.unwrap();
        assert_eq!(
            h.cloud.paths(),
            vec!["/user-info", "/refresh", "/login", "/user-info"]
        );
        assert!(!h.bridge.client().is_halted());
    }

    #[tokio::test]
    async fn rejected_login_fails_boot_with_auth_exit_code() {
        let h = harness_with(PersistedState::fresh());
        h.cloud.with(|s| s.accept_login = false);

        let err = h.bridge.boot().await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(h.broker.history().is_empty());
    }

    #[tokio::test]
    async fn empty_inventory_fails_boot_with_discovery_exit_code() {
        let h = harness_with(PersistedState::fresh());
        h.cloud.with(|s| s.heaters.clear());

        let err = h.bridge.boot().await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn local_commands_for_unknown_devices_are_dropped() {
        let h = harness_with(PersistedState::fresh());
        h.bridge.boot().await.unwrap();
        let published = h.broker.history().len();
        let calls = h.cloud.paths().len();

        h.bridge.on_local_command("P/ZZZ/CMD/MODE", b"Eco").await;
        h.bridge.on_local_command("not/a/topic", b"Eco").await;
        h.bridge.on_local_command("P/A1/STATUS", b"{}").await;

        assert_eq!(h.broker.history().len(), published);
        assert_eq!(h.cloud.paths().len(), calls);
    }

    #[tokio::test]
    async fn local_command_reaches_cloud_and_local_status() {
        let h = harness_with(PersistedState::fresh());
        h.bridge.boot().await.unwrap();

        h.bridge.on_local_command("P/A1/CMD/MODE", b"eco").await;
        assert_eq!(h.cloud.count("/eco"), 1);
        assert_eq!(h.broker.retained_json("P/A1/STATUS").unwrap()["Cmd"], "3");
    }

    #[tokio::test]
    async fn shutdown_persists_registry() {
        let h = harness_with(PersistedState::fresh());
        h.bridge.boot().await.unwrap();
        h.bridge.registry().remember_setpoint("B2", 44).await;

        h.bridge.shutdown().await;
        let on_disk = crate::store::load(h.store.path()).await;
        assert_eq!(on_disk.devices["B2"].favorite_setpoint, 44);
        assert!(on_disk.tokens.is_some());
    }

    #[tokio::test]
    async fn persisted_devices_missing_from_inventory_are_not_bridged() {
        let mut state = PersistedState::fresh();
        state.devices.insert("OLD".into(), DeviceRecord::new("Cellar"));
        let h = harness_with(state);
        h.bridge.boot().await.unwrap();

        assert_eq!(
            h.broker.subscriptions(),
            vec!["P/A1/CMD/MODE", "P/A1/CMD/TEMP", "P/B2/CMD/MODE", "P/B2/CMD/TEMP"]
        );
        assert!(h.broker.retained("homeassistant/water_heater/OLD/config").is_none());

        let calls = h.cloud.paths().len();
        h.bridge.on_local_command("P/OLD/CMD/MODE", b"Eco").await;
        assert_eq!(h.cloud.paths().len(), calls);

        h.bridge.relay().poll_once().await;
        assert_eq!(h.cloud.count("/status"), 2);
    }

    /// Parks the first retained publish until released.
    #[derive(Default)]
    struct GatedBroker {
        inner: RetainedStore,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LocalBroker for GatedBroker {
        async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.publish_retained(topic, payload).await
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.inner.subscribe(topic).await
        }
    }

    #[tokio::test]
    async fn status_in_flight_cannot_overwrite_command_injection() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_state(dir.path().join("state.json"), PersistedState::fresh());
        let client = ThermowattClient::new(
            Arc::new(FakeCloud::new()),
            store.clone(),
            Credentials { email: "e".into(), password: "p".into() },
        );
        client.authenticate().await.unwrap();

        let gate = Arc::new(GatedBroker::default());
        let bridge = Arc::new(Bridge::new(
            client,
            DeviceRegistry::new(store),
            gate.clone(),
            Arc::new(ManualClock::at_unix(1_000)),
            DispatcherSettings {
                cooldown: TimeDelta::seconds(60),
                holiday_buffer: TimeDelta::seconds(30),
                policy: InjectionPolicy::Always,
            },
        ));
        bridge.registry().upsert("A1", "Kitchen").await;
        gate.armed.store(true, Ordering::SeqCst);

        // A pushed status passes the cooldown check and stalls in publish.
        let push = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .relay()
                    .on_cloud_event("P/A1/STATUS", br#"{"Cmd":"3","T_SetPoint":"55"}"#)
                    .await
            })
        };
        gate.entered.notified().await;

        let command = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.on_local_command("P/A1/CMD/MODE", b"Manual").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.registry().cooldown_until("A1").await, None);

        gate.release.notify_one();
        assert_eq!(push.await.unwrap().unwrap(), RelayOutcome::Forwarded);
        command.await.unwrap();

        let status = gate.inner.retained_json("P/A1/STATUS").unwrap();
        assert_eq!(status["Cmd"], "9");
        assert_eq!(status["T_SetPoint"], "60");
        assert!(bridge.registry().cooldown_until("A1").await.is_some());
    }
}
