//! REST control surface

use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use intercept_core::{
    ControlError, Correlator, ModeController, ModeKind, ModeParams, ObservationLog, SignalHistory,
};
use serde::Deserialize;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::ws_handler;

/// Shared application state
pub struct AppState {
    pub controller: ModeController,
    pub observations: Arc<ObservationLog>,
    pub correlator: Correlator,
    pub history: Arc<SignalHistory>,
}

pub fn router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/ws", get(ws_handler::ws_handler))
        .route("/health", get(health))
        .route("/api/modes", get(list_modes))
        .route("/api/modes/:mode", get(mode_status))
        .route("/api/modes/:mode/start", post(start_mode))
        .route("/api/modes/:mode/stop", post(stop_mode))
        .route("/api/modes/:mode/reset", post(reset_mode))
        .route("/api/devices", get(list_devices))
        .route("/api/killall", post(kill_all))
        .route("/api/correlations", get(correlations))
        .route("/api/correlations/analyze", post(analyze_pair))
        .route("/api/history", post(add_history))
        .route("/api/history/:mode/:device_id", get(device_history));

    let app = match static_dir {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api,
    };

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("unknown mode: {0}")]
    UnknownMode(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Control(err) => match err {
                ControlError::DeviceBusy { .. }
                | ControlError::AlreadyActive(_)
                | ControlError::Stopping(_)
                | ControlError::InError(_) => StatusCode::CONFLICT,
                ControlError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
                ControlError::NoDevice(_) => StatusCode::NOT_FOUND,
                ControlError::LaunchFailure { .. } => StatusCode::BAD_GATEWAY,
                ControlError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::UnknownMode(_) | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Control(err) => err.kind(),
            ApiError::UnknownMode(_) => "unknown_mode",
            ApiError::BadRequest(_) => "invalid_parameter",
            ApiError::NotFound(_) => "not_found",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "kind": self.kind(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

fn parse_mode(name: &str) -> Result<ModeKind, ApiError> {
    name.parse()
        .map_err(|_| ApiError::UnknownMode(name.to_string()))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.health())
}

async fn list_modes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.modes())
}

async fn mode_status(
    State(state): State<Arc<AppState>>,
    UrlPath(mode): UrlPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = parse_mode(&mode)?;
    Ok(Json(state.controller.status(mode)))
}

/// Body is optional; an empty body means all defaults
async fn start_mode(
    State(state): State<Arc<AppState>>,
    UrlPath(mode): UrlPath<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let mode = parse_mode(&mode)?;
    let params: ModeParams = if body.iter().all(u8::is_ascii_whitespace) {
        ModeParams::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid parameters: {}", e)))?
    };

    match state.controller.start(mode, &params).await {
        Ok(status) => Ok(Json(status)),
        Err(e) => {
            warn!("Start of {} refused: {}", mode, e);
            Err(e.into())
        }
    }
}

async fn stop_mode(
    State(state): State<Arc<AppState>>,
    UrlPath(mode): UrlPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = parse_mode(&mode)?;
    Ok(Json(state.controller.stop(mode).await))
}

async fn reset_mode(
    State(state): State<Arc<AppState>>,
    UrlPath(mode): UrlPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = parse_mode(&mode)?;
    Ok(Json(state.controller.reset(mode).await))
}

async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.devices())
}

async fn kill_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Kill-all requested over HTTP");
    let report = state.controller.kill_all().await;
    state.observations.clear();
    Json(report)
}

#[derive(Debug, Deserialize)]
struct CorrelationQuery {
    min_confidence: Option<f64>,
}

async fn correlations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CorrelationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let correlator = match query.min_confidence {
        Some(min) if !(0.0..=1.0).contains(&min) => {
            return Err(ApiError::BadRequest(format!(
                "min_confidence must be between 0 and 1, got {}",
                min
            )))
        }
        Some(min) => state.correlator.clone().with_min_confidence(min),
        None => state.correlator.clone(),
    };
    Ok(Json(correlator.correlate_log(&state.observations)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalyzeRequest {
    wifi_address: Option<String>,
    bt_address: Option<String>,
}

/// Score one WiFi/Bluetooth pair, however weak the match
async fn analyze_pair(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: AnalyzeRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request: {}", e)))?;
    let (Some(wifi), Some(bt)) = (
        request.wifi_address.filter(|a| !a.trim().is_empty()),
        request.bt_address.filter(|a| !a.trim().is_empty()),
    ) else {
        return Err(ApiError::BadRequest("wifi_address and bt_address are required".to_string()));
    };

    let wifi = state
        .observations
        .find_wifi(&wifi)
        .ok_or_else(|| ApiError::NotFound(format!("WiFi device {} not seen", wifi)))?;
    let bt = state
        .observations
        .find_bluetooth(&bt)
        .ok_or_else(|| ApiError::NotFound(format!("Bluetooth device {} not seen", bt)))?;

    Ok(Json(serde_json::json!({
        "correlation": state.correlator.analyze(&wifi, &bt),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HistoryQuery {
    limit: usize,
    since_minutes: u64,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            since_minutes: 60,
        }
    }
}

async fn device_history(
    State(state): State<Arc<AppState>>,
    UrlPath((mode, device_id)): UrlPath<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = parse_mode(&mode)?;
    if query.limit == 0 {
        return Err(ApiError::BadRequest("limit must be at least 1".to_string()));
    }
    let history = state.history.query(mode, &device_id, query.limit, query.since_minutes);
    Ok(Json(serde_json::json!({
        "mode": mode,
        "device_id": device_id,
        "history": history,
    })))
}

#[derive(Debug, Deserialize)]
struct NewReading {
    mode: String,
    device_id: String,
    signal_strength: f64,
    metadata: Option<serde_json::Value>,
}

/// Record a reading from outside the event stream
async fn add_history(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let reading: NewReading = serde_json::from_slice(&body).map_err(|e| {
        ApiError::BadRequest(format!("mode, device_id and signal_strength are required: {}", e))
    })?;
    let mode = parse_mode(&reading.mode)?;
    if reading.device_id.trim().is_empty() || !reading.signal_strength.is_finite() {
        return Err(ApiError::BadRequest("device_id and a finite signal_strength are required".to_string()));
    }

    state
        .history
        .add_now(mode, &reading.device_id, reading.signal_strength, reading.metadata);
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "recorded": true }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use intercept_core::arbiter::{MonitorControl, MonitorError};
    use intercept_core::config::ToolCommand;
    use intercept_core::event::{BluetoothDevice, EventPayload, WifiNetwork};
    use intercept_core::{Config, Device, DeviceClass, DeviceRegistry, Event, EventBroadcaster, ResourceArbiter};
    use tower::ServiceExt;

    struct NoMonitor;

    #[async_trait::async_trait]
    impl MonitorControl for NoMonitor {
        async fn enable(&self, iface: &str) -> Result<String, MonitorError> {
            Ok(iface.to_string())
        }

        async fn disable(&self, iface: &str) -> Result<String, MonitorError> {
            Ok(iface.to_string())
        }
    }

    fn state(config: Config) -> Arc<AppState> {
        let registry = DeviceRegistry::new(vec![Device::new(DeviceClass::Sdr, "1-1").with_index(0)]);
        let arbiter = Arc::new(ResourceArbiter::new(&registry, Arc::new(NoMonitor)));
        let controller = ModeController::new(config, arbiter, Arc::new(EventBroadcaster::new(16)));
        Arc::new(AppState {
            controller,
            observations: Arc::new(ObservationLog::new()),
            correlator: Correlator::default(),
            history: Arc::new(SignalHistory::default()),
        })
    }

    fn sleeping_sensor() -> Config {
        let mut config = Config::default();
        config.tools.rtl_433 = ToolCommand::with_args("sh", ["-c", "exec sleep 30", "rtl_433"]);
        config.supervisor.startup_check_ms = 100;
        config.supervisor.grace_period_ms = 500;
        config
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_lists_every_mode() {
        let app = router(state(Config::default()), None);
        let (status, body) = call(app, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["modes"].as_array().unwrap().len(), 6);
        assert_eq!(body["live_processes"], 0);
    }

    #[tokio::test]
    async fn test_unknown_mode_is_404() {
        let app = router(state(Config::default()), None);
        let (status, body) = call(app, "POST", "/api/modes/morse/start", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "unknown_mode");
    }

    #[tokio::test]
    async fn test_bad_parameters_are_400() {
        let app = router(state(Config::default()), None);
        let (status, body) = call(app.clone(), "POST", "/api/modes/pager/start", r#"{"frequency_mhz": 9000}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "invalid_parameter");

        let (status, _) = call(app, "POST", "/api/modes/pager/start", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_device_is_404() {
        let app = router(state(Config::default()), None);
        let (status, body) = call(app, "POST", "/api/modes/bluetooth_scan/start", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "no_device");
    }

    #[tokio::test]
    async fn test_launch_failure_is_502() {
        let mut config = Config::default();
        config.tools.rtl_433 = ToolCommand::new("/nonexistent/rtl_433");
        let app = router(state(config), None);
        let (status, body) = call(app, "POST", "/api/modes/sensor/start", "").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "launch_failure");
    }

    #[tokio::test]
    async fn test_start_conflict_and_stop() {
        let app = router(state(sleeping_sensor()), None);

        let (status, body) = call(app.clone(), "POST", "/api/modes/sensor/start", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "running");

        let (status, body) = call(app.clone(), "POST", "/api/modes/adsb/start", "{}").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "device_busy");

        let (_, devices) = call(app.clone(), "GET", "/api/devices", "").await;
        assert_eq!(devices[0]["holder"], "sensor");

        let (status, body) = call(app.clone(), "POST", "/api/modes/sensor/stop", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");

        let (_, body) = call(app, "POST", "/api/killall", "").await;
        assert_eq!(body["live_processes"], 0);
    }

    #[tokio::test]
    async fn test_health_counts_drops_of_stalled_subscriber() {
        let state = state(Config::default());
        let _stalled = state.controller.subscribe();
        for seq in 1..=40 {
            state.controller.broadcaster().publish(Event::new(
                ModeKind::BluetoothScan,
                seq,
                EventPayload::BluetoothDevice(BluetoothDevice {
                    address: "AA:BB:CC:44:55:66".into(),
                    name: None,
                    rssi: Some(-60),
                }),
            ));
        }
        let app = router(state, None);

        let (status, body) = call(app, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["broadcast"]["published"], 40);
        assert_eq!(body["broadcast"]["dropped_total"], 24);
        assert_eq!(body["broadcast"]["subscribers"][0]["dropped"], 24);
    }

    #[tokio::test]
    async fn test_numeric_strings_start_a_mode() {
        let app = router(state(sleeping_sensor()), None);
        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/modes/sensor/start",
            r#"{"device_index": "0", "frequency_mhz": "433.92", "ppm": "0"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["device_class"], "sdr");
        call(app, "POST", "/api/killall", "").await;
    }

    #[tokio::test]
    async fn test_start_from_error_is_409() {
        let mut config = Config::default();
        config.tools.rtl_433 = ToolCommand::new("/nonexistent/rtl_433");
        let app = router(state(config), None);
        let (status, _) = call(app.clone(), "POST", "/api/modes/sensor/start", "").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, body) = call(app.clone(), "POST", "/api/modes/sensor/start", "").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "in_error");

        let (_, body) = call(app, "POST", "/api/modes/sensor/reset", "").await;
        assert_eq!(body["state"], "idle");
    }

    #[tokio::test]
    async fn test_analyze_pair() {
        let state = state(Config::default());
        state.observations.record(&Event::new(
            ModeKind::WifiScan,
            1,
            EventPayload::WifiNetwork(WifiNetwork {
                bssid: "AA:BB:CC:11:22:33".into(),
                ssid: None,
                channel: Some(1),
                signal_dbm: Some(-30),
            }),
        ));
        state.observations.record(&Event::new(
            ModeKind::BluetoothScan,
            1,
            EventPayload::BluetoothDevice(BluetoothDevice {
                address: "11:22:33:44:55:66".into(),
                name: None,
                rssi: Some(-90),
            }),
        ));
        let app = router(state, None);

        let (status, body) = call(
            app.clone(),
            "POST",
            "/api/correlations/analyze",
            r#"{"wifi_address": "aa:bb:cc:11:22:33", "bt_address": "11:22:33:44:55:66"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["correlation"]["wifi_address"], "AA:BB:CC:11:22:33");
        assert!(body["correlation"]["confidence"].as_f64().unwrap() <= 0.5);

        let (status, body) = call(app.clone(), "POST", "/api/correlations/analyze", r#"{"wifi_address": "x"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_parameter");

        let (status, body) = call(
            app,
            "POST",
            "/api/correlations/analyze",
            r#"{"wifi_address": "AA:BB:CC:11:22:33", "bt_address": "00:00:00:00:00:00"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_signal_history_round_trip() {
        let state = state(Config::default());
        state.history.record(&Event::new(
            ModeKind::WifiScan,
            1,
            EventPayload::WifiNetwork(WifiNetwork {
                bssid: "AA:BB:CC:11:22:33".into(),
                ssid: None,
                channel: Some(1),
                signal_dbm: Some(-61),
            }),
        ));
        let app = router(state, None);

        let (status, _) = call(
            app.clone(),
            "POST",
            "/api/history",
            r#"{"mode": "wifi_scan", "device_id": "AA:BB:CC:11:22:33", "signal_strength": -58, "metadata": {"channel": 1}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(app.clone(), "GET", "/api/history/wifi_scan/AA:BB:CC:11:22:33?limit=10", "").await;
        assert_eq!(status, StatusCode::OK);
        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["signal"], -61.0);
        assert_eq!(history[1]["signal"], -58.0);
        assert_eq!(history[1]["metadata"]["channel"], 1);

        let (status, _) = call(app.clone(), "POST", "/api/history", r#"{"mode": "wifi_scan"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(app.clone(), "GET", "/api/history/morse/x", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(app, "GET", "/api/history/wifi_scan/x?limit=0", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_correlations_endpoint() {
        let state = state(Config::default());
        state.observations.record(&Event::new(
            ModeKind::WifiScan,
            1,
            EventPayload::WifiNetwork(WifiNetwork {
                bssid: "AA:BB:CC:11:22:33".into(),
                ssid: Some("Phone".into()),
                channel: Some(11),
                signal_dbm: Some(-50),
            }),
        ));
        state.observations.record(&Event::new(
            ModeKind::BluetoothScan,
            1,
            EventPayload::BluetoothDevice(BluetoothDevice {
                address: "AA:BB:CC:44:55:66".into(),
                name: Some("Phone".into()),
                rssi: Some(-52),
            }),
        ));
        let app = router(state, None);

        let (status, body) = call(app.clone(), "GET", "/api/correlations", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["bt_address"], "AA:BB:CC:44:55:66");

        let (status, _) = call(app, "GET", "/api/correlations?min_confidence=2", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
