use std::{sync::Arc, time::Duration};

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{BrokerError, RelayError},
    mqtt::{
        parse_topic,
        topic::{get_status_topic, status_topic},
        LocalBroker, TopicKind,
    },
    registry::DeviceRegistry,
    thermowatt::{models::StatusSnapshot, ThermowattClient},
};

/// What happened to one status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Forwarded,
    /// Dropped because a command cooldown was still running.
    Suppressed,
}

/// Moves authoritative heater status from the cloud to the local broker,
/// honouring each device's command cooldown.
#[derive(Clone)]
pub struct StatusRelay {
    client: ThermowattClient,
    registry: DeviceRegistry,
    broker: Arc<dyn LocalBroker>,
    clock: Arc<dyn Clock>,
}

impl StatusRelay {
    pub fn new(
        client: ThermowattClient,
        registry: DeviceRegistry,
        broker: Arc<dyn LocalBroker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            registry,
            broker,
            clock,
        }
    }

    /// Fetch one device's status and forward it unless suppressed.
    pub async fn poll_device(&self, serial: &str) -> Result<RelayOutcome, RelayError> {
        if self.registry.is_suppressed(serial, self.clock.now()).await {
            debug!(serial = %serial, "Cooldown active; skipping status fetch");
            return Ok(RelayOutcome::Suppressed);
        }

        let snapshot = self.client.status(serial).await?;

        // A command may have landed while the fetch was in flight.
        let _guard = self.registry.lock_device(serial).await;
        if self.registry.is_suppressed(serial, self.clock.now()).await {
            debug!(serial = %serial, "Cooldown armed during fetch; dropping status");
            return Ok(RelayOutcome::Suppressed);
        }

        let payload = snapshot.to_payload();
        self.forward(serial, Some(snapshot), payload).await?;
        Ok(RelayOutcome::Forwarded)
    }

    /// One pass over every known device. Per-device failures are logged and
    /// do not stop the pass.
    pub async fn poll_once(&self) {
        if self.client.is_halted() {
            warn!("Cloud session halted; skipping status poll");
            return;
        }

        for serial in self.registry.serials().await {
            match self.poll_device(&serial).await {
                Ok(outcome) => debug!(serial = %serial, outcome = ?outcome, "Status poll"),
                Err(RelayError::Cloud(e)) if e.is_auth() => {
                    error!(serial = %serial, error = %e, "Status poll stopped by authentication failure");
                    return;
                }
                Err(e) => {
                    error!(serial = %serial, error = %e, "Failed to relay status");
                }
            }
        }
    }

    /// Poll every `interval` until `shutdown` fires. The first pass runs
    /// immediately.
    pub async fn run_pull(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Status polling loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll_once().await,
            }
        }

        info!("Status polling loop stopped");
    }

    /// Handle one message pushed by the cloud on `P/{serial}/STATUS`. The
    /// payload is forwarded byte for byte.
    pub async fn on_cloud_event(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<RelayOutcome, RelayError> {
        let parsed = parse_topic(topic)?;
        if parsed.kind != TopicKind::Status {
            return Err(RelayError::NotAStatus(topic.to_owned()));
        }
        if !self.registry.contains(&parsed.serial).await {
            return Err(RelayError::UnknownDevice(parsed.serial));
        }

        let _guard = self.registry.lock_device(&parsed.serial).await;
        if self.registry.is_suppressed(&parsed.serial, self.clock.now()).await {
            debug!(serial = %parsed.serial, "Cooldown active; dropping pushed status");
            return Ok(RelayOutcome::Suppressed);
        }

        let snapshot = StatusSnapshot::from_payload(payload);
        if snapshot.is_none() {
            warn!(serial = %parsed.serial, "Pushed status is not a JSON object; forwarding as is");
        }
        self.forward(&parsed.serial, snapshot, payload.to_vec()).await?;
        Ok(RelayOutcome::Forwarded)
    }

    /// Record and publish a status. Callers hold the device lock.
    async fn forward(
        &self,
        serial: &str,
        snapshot: Option<StatusSnapshot>,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        if let Some(snapshot) = snapshot {
            self.registry.record_status(serial, snapshot).await;
        }
        self.broker
            .publish_retained(&status_topic(serial), payload)
            .await?;
        debug!(serial = %serial, "Forwarded status to local broker");
        Ok(())
    }
}

/// Ask the cloud push channel to send a fresh status for `serial`.
pub async fn request_push_status(
    channel: &dyn LocalBroker,
    serial: &str,
) -> Result<(), BrokerError> {
    channel.publish(&get_status_topic(serial), Vec::new()).await
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;
    use crate::{
        clock::ManualClock,
        mqtt::RetainedStore,
        store::{PersistedState, StateStore},
        thermowatt::{transport::fake::FakeCloud, Credentials},
    };

    struct Harness {
        cloud: Arc<FakeCloud>,
        broker: RetainedStore,
        registry: DeviceRegistry,
        clock: ManualClock,
        relay: StatusRelay,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_state(dir.path().join("s.json"), PersistedState::fresh());
        let cloud = Arc::new(FakeCloud::new());
        cloud.set_status("A1", json!({ "T_Avg": "48", "Cmd": "3" }));
        cloud.set_status("B2", json!({ "T_Avg": "39", "Cmd": "17" }));

        let client = ThermowattClient::new(
            cloud.clone(),
            store.clone(),
            Credentials { email: "e".into(), password: "p".into() },
        );
        client.authenticate().await.unwrap();

        let registry = DeviceRegistry::new(store);
        registry.upsert("A1", "Kitchen").await;
        registry.upsert("B2", "Garage").await;

        let broker = RetainedStore::new();
        let clock = ManualClock::at_unix(1_000);
        let relay = StatusRelay::new(
            client,
            registry.clone(),
            Arc::new(broker.clone()),
            Arc::new(clock.clone()),
        );
        Harness { cloud, broker, registry, clock, relay, _dir: dir }
    }

    fn at(secs: i64) -> chrono::DateTime<chrono::Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn poll_forwards_every_device() {
        let h = harness().await;
        h.relay.poll_once().await;

        assert_eq!(h.broker.retained_json("P/A1/STATUS").unwrap()["Cmd"], "3");
        assert_eq!(h.broker.retained_json("P/B2/STATUS").unwrap()["Cmd"], "17");
        assert!(h.registry.last_status("A1").await.is_some());
    }

    #[tokio::test]
    async fn poll_skips_suppressed_device_without_fetching() {
        let h = harness().await;
        h.registry.arm_cooldown("A1", at(1_060)).await;
        let fetches_before = h.cloud.count("/status");

        assert_eq!(h.relay.poll_device("A1").await.unwrap(), RelayOutcome::Suppressed);
        assert_eq!(h.cloud.count("/status"), fetches_before);
        assert!(h.broker.retained("P/A1/STATUS").is_none());

        h.clock.set_unix(1_060);
        assert_eq!(h.relay.poll_device("A1").await.unwrap(), RelayOutcome::Forwarded);
    }

    #[tokio::test]
    async fn failing_device_does_not_stop_the_pass() {
        let h = harness().await;
        h.cloud.with(|s| {
            s.statuses.remove("A1");
        });

        h.relay.poll_once().await;
        assert!(h.broker.retained("P/A1/STATUS").is_none());
        assert!(h.broker.retained("P/B2/STATUS").is_some());
    }

    #[tokio::test]
    async fn pushed_status_inside_cooldown_is_dropped() {
        let h = harness().await;
        h.registry.arm_cooldown("A1", at(1_060)).await;

        h.clock.set_unix(1_030);
        let outcome = h
            .relay
            .on_cloud_event("P/A1/STATUS", br#"{"Cmd":"3"}"#)
            .await
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Suppressed);
        assert!(h.broker.history().is_empty());

        h.clock.set_unix(1_065);
        let outcome = h
            .relay
            .on_cloud_event("P/A1/STATUS", br#"{"Cmd":"9"}"#)
            .await
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Forwarded);
        assert_eq!(h.broker.retained("P/A1/STATUS").unwrap(), br#"{"Cmd":"9"}"#.to_vec());
    }

    #[tokio::test]
    async fn pushed_status_at_expiry_is_forwarded() {
        let h = harness().await;
        h.registry.arm_cooldown("A1", at(1_060)).await;
        h.clock.set_unix(1_060);

        let outcome = h.relay.on_cloud_event("P/A1/STATUS", b"{}").await.unwrap();
        assert_eq!(outcome, RelayOutcome::Forwarded);
    }

    #[tokio::test]
    async fn pushed_payload_is_forwarded_verbatim() {
        let h = harness().await;
        let raw = br#"{ "Cmd" : "3",  "T_Avg":"51" }"#;

        h.relay.on_cloud_event("P/B2/STATUS", raw).await.unwrap();
        assert_eq!(h.broker.retained("P/B2/STATUS").unwrap(), raw.to_vec());
        assert_eq!(
            h.registry.last_status("B2").await.unwrap().field("T_Avg"),
            Some("51")
        );
    }

    #[tokio::test]
    async fn cooldown_on_one_device_does_not_affect_another() {
        let h = harness().await;
        h.registry.arm_cooldown("A1", at(1_060)).await;

        assert_eq!(
            h.relay.on_cloud_event("P/B2/STATUS", b"{}").await.unwrap(),
            RelayOutcome::Forwarded
        );
    }

    #[tokio::test]
    async fn unknown_or_malformed_topics_are_rejected() {
        let h = harness().await;
        assert!(matches!(
            h.relay.on_cloud_event("P/ZZZ/STATUS", b"{}").await,
            Err(RelayError::UnknownDevice(ref s)) if s == "ZZZ"
        ));
        assert!(matches!(
            h.relay.on_cloud_event("P/A1/CMD/MODE", b"Eco").await,
            Err(RelayError::NotAStatus(_))
        ));
        assert!(matches!(
            h.relay.on_cloud_event("garbage", b"{}").await,
            Err(RelayError::Topic(_))
        ));
        assert!(h.broker.history().is_empty());
    }

    #[tokio::test]
    async fn halted_session_skips_poll() {
        let h = harness().await;
        h.cloud.expire_everything();
        h.relay.poll_once().await;
        let calls = h.cloud.paths().len();

        h.relay.poll_once().await;
        assert_eq!(h.cloud.paths().len(), calls);
        assert!(h.broker.history().is_empty());
    }

    #[tokio::test]
    async fn get_status_request_is_empty_and_not_retained() {
        let channel = RetainedStore::new();
        request_push_status(&channel, "A1").await.unwrap();

        let history = channel.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].topic, "P/A1/CMD/GET_STATUS");
        assert!(history[0].payload.is_empty());
        assert!(!history[0].retained);
    }

    #[tokio::test]
    async fn pull_loop_polls_immediately_and_stops_on_shutdown() {
        let h = harness().await;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            h.relay
                .clone()
                .run_pull(Duration::from_secs(60), shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.broker.retained("P/A1/STATUS").is_some());

        shutdown.cancel();
        task.await.unwrap();
    }
}
