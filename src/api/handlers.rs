use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use utoipa::OpenApi;

use super::{
    dto::{DeviceDto, DeviceStatusDto, HealthDto},
    errors::AppError,
};
use crate::{clock::Clock, registry::DeviceRegistry, thermowatt::ThermowattClient};

#[derive(Clone)]
pub struct AppState {
    pub registry: DeviceRegistry,
    pub client: ThermowattClient,
    pub clock: Arc<dyn Clock>,
}

/// Liveness plus cloud session state.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Bridge health", body = HealthDto),
    ),
    tag = "bridge"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthDto> {
    let status = if state.client.is_halted() {
        "auth_halted"
    } else {
        "ok"
    };
    Json(HealthDto {
        status: status.to_owned(),
        install_id: state.client.install_id().await,
        devices: state.registry.serials().await.len(),
    })
}

/// Every bridged heater with its setpoint and cooldown.
#[utoipa::path(
    get,
    path = "/devices",
    responses(
        (status = 200, description = "Bridged devices", body = Vec<DeviceDto>),
    ),
    tag = "devices"
)]
pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceDto>> {
    let now = state.clock.now();
    let devices = state.registry.snapshot().await;
    Json(
        devices
            .into_iter()
            .map(|d| DeviceDto::from_device(d, now))
            .collect(),
    )
}

/// Last status document relayed or injected for one heater.
#[utoipa::path(
    get,
    path = "/devices/{serial}/status",
    params(
        ("serial" = String, Path, description = "Heater serial number"),
    ),
    responses(
        (status = 200, description = "Last known status", body = DeviceStatusDto),
        (status = 404, description = "Unknown device or no status yet"),
    ),
    tag = "devices"
)]
pub async fn device_status(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> Result<Json<DeviceStatusDto>, AppError> {
    if !state.registry.contains(&serial).await {
        return Err(AppError::not_found(format!("unknown device {serial}")));
    }
    let snapshot = state
        .registry
        .last_status(&serial)
        .await
        .ok_or_else(|| AppError::not_found(format!("no status received for {serial} yet")))?;

    Ok(Json(DeviceStatusDto {
        serial,
        status: serde_json::to_value(snapshot)?,
    }))
}

// ---------------------------------------------------------------------------
// OpenAPI document (used in api/mod.rs)
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(health, list_devices, device_status),
    components(schemas(HealthDto, DeviceDto, DeviceStatusDto)),
    tags(
        (name = "bridge", description = "Bridge health"),
        (name = "devices", description = "Bridged water heaters"),
    ),
    info(
        title = "Thermowatt Bridge API",
        version = "0.1.0",
        description = "Read-only operator API for the Thermowatt to MQTT bridge"
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use axum_test::TestServer;
    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        api::router,
        clock::ManualClock,
        store::{PersistedState, StateStore},
        thermowatt::{models::StatusSnapshot, transport::fake::FakeCloud, Credentials},
    };

    struct Fixture {
        server: TestServer,
        registry: DeviceRegistry,
        client: ThermowattClient,
        cloud: Arc<FakeCloud>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_state(dir.path().join("s.json"), PersistedState::fresh());
        let cloud = Arc::new(FakeCloud::new());
        let client = ThermowattClient::new(
            cloud.clone(),
            store.clone(),
            Credentials { email: "e".into(), password: "p".into() },
        );
        client.authenticate().await.unwrap();

        let registry = DeviceRegistry::new(store);
        registry.upsert("B2", "Garage").await;
        registry.upsert("A1", "Kitchen").await;

        let state = AppState {
            registry: registry.clone(),
            client: client.clone(),
            clock: Arc::new(ManualClock::at_unix(1_000)),
        };
        Fixture {
            server: TestServer::new(router(state)).unwrap(),
            registry,
            client,
            cloud,
            _dir: dir,
        }
    }

    // -----------------------------------------------------------------------
    // GET /health
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_reports_ok_and_device_count() {
        let f = fixture().await;
        let resp = f.server.get("/health").await;
        resp.assert_status_ok();

        let body: Value = resp.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["devices"], 2);
        assert_eq!(body["install_id"], f.client.install_id().await.to_string());
    }

    #[tokio::test]
    async fn health_reports_auth_halted() {
        let f = fixture().await;
        f.cloud.expire_everything();
        assert!(f.client.user_info().await.is_err());

        let body: Value = f.server.get("/health").await.json();
        assert_eq!(body["status"], "auth_halted");
    }

    // -----------------------------------------------------------------------
    // GET /devices
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn devices_are_listed_by_serial_with_cooldown() {
        let f = fixture().await;
        f.registry
            .arm_cooldown("A1", DateTime::from_timestamp(1_060, 0).unwrap())
            .await;

        let resp = f.server.get("/devices").await;
        resp.assert_status_ok();
        let body: Vec<Value> = resp.json();

        assert_eq!(body.len(), 2);
        assert_eq!(body[0]["serial"], "A1");
        assert_eq!(body[0]["favorite_setpoint"], 60);
        assert_eq!(body[0]["suppressed"], true);
        assert_eq!(body[0]["cooldown_until"], "1970-01-01T00:17:40Z");
        assert_eq!(body[1]["serial"], "B2");
        assert_eq!(body[1]["suppressed"], false);
        assert_eq!(body[1]["cooldown_until"], Value::Null);
    }

    // -----------------------------------------------------------------------
    // GET /devices/{serial}/status
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn device_status_returns_last_snapshot() {
        let f = fixture().await;
        let snapshot = StatusSnapshot::from_payload(br#"{"T_Avg":"48","Cmd":"9"}"#).unwrap();
        f.registry.record_status("A1", snapshot).await;

        let resp = f.server.get("/devices/A1/status").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["serial"], "A1");
        assert_eq!(body["status"], json!({ "T_Avg": "48", "Cmd": "9" }));
    }

    #[tokio::test]
    async fn device_status_is_404_without_status_or_device() {
        let f = fixture().await;
        f.server
            .get("/devices/B2/status")
            .expect_failure()
            .await
            .assert_status_not_found();
        f.server
            .get("/devices/ZZZ/status")
            .expect_failure()
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn openapi_document_lists_every_route() {
        let f = fixture().await;
        let body: Value = f.server.get("/api-docs/openapi.json").await.json();
        let paths = body["paths"].as_object().unwrap();
        assert!(paths.contains_key("/health"));
        assert!(paths.contains_key("/devices"));
        assert!(paths.contains_key("/devices/{serial}/status"));
    }
}
