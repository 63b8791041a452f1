//! Ingest side of the reporting cycle: accepts report payloads and serves
//! the most recent one back. Nothing is kept across restarts.

use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
pub const UNKNOWN_DEVICE: &str = "unknown";

/// One accepted report. Only `temperature` is required; the temperature-only
/// senders leave the rest out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f32>,
    #[serde(default = "unknown_device")]
    pub device_id: String,
    /// Sender's milliseconds; stamped with the receive time when absent
    #[serde(default)]
    pub timestamp: Option<u64>,
}

fn unknown_device() -> String {
    UNKNOWN_DEVICE.to_string()
}

impl IngestRecord {
    pub fn parse(body: &[u8]) -> Result<IngestRecord, anyhow::Error> {
        let mut record: IngestRecord =
            serde_json::from_slice(body).map_err(|e| anyhow::anyhow!("Invalid report: {e}"))?;
        record
            .timestamp
            .get_or_insert_with(|| Local::now().timestamp_millis().max(0) as u64);
        Ok(record)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LatestReport(Arc<Mutex<Option<IngestRecord>>>);

impl LatestReport {
    pub fn get(&self) -> Option<IngestRecord> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, record: IngestRecord) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(record);
    }
}

pub fn router(latest: LatestReport) -> Router {
    Router::new()
        .route("/api/data", get(latest_report).post(receive_report))
        .with_state(latest)
}

/// The last accepted report, or `{}` before the first one.
async fn latest_report(State(latest): State<LatestReport>) -> Response {
    match latest.get() {
        Some(record) => Json(record).into_response(),
        None => Json(json!({})).into_response(),
    }
}

async fn receive_report(State(latest): State<LatestReport>, body: Bytes) -> Response {
    match IngestRecord::parse(&body) {
        Ok(record) => {
            log::info!("Received data: {record:?}");
            latest.replace(record);
            Json(json!({"status": "success"})).into_response()
        }
        Err(e) => {
            log::warn!("{e:#}");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": e.to_string()})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::SensorReading;
    use crate::report::{Endpoint, ReportOutcome, Reporter, UreqTransport};
    use axum::body::{self, Body};
    use axum::http::{Method, Request};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    async fn call(latest: &LatestReport, method: Method, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri("/api/data")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(latest.clone()).oneshot(request).await.unwrap();
        let code = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (code, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_empty_until_first_report() {
        let latest = LatestReport::default();

        let (code, value) = call(&latest, Method::GET, "").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn test_stores_latest_report() {
        let latest = LatestReport::default();
        let first = r#"{"temperature":34.5,"humidity":61.0,"sound":42.0,"battery":80.0,"device_id":"hive-1","timestamp":1000}"#;
        let second = r#"{"temperature":35.0,"humidity":60.0,"battery":79.0,"device_id":"hive-1","timestamp":2000}"#;

        let (code, value) = call(&latest, Method::POST, first).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(value, json!({"status": "success"}));
        call(&latest, Method::POST, second).await;

        let (_, value) = call(&latest, Method::GET, "").await;
        assert_eq!(value["temperature"], 35.0);
        assert_eq!(value["timestamp"], 2000);
        assert!(value.get("sound").is_none());
    }

    #[tokio::test]
    async fn test_rejects_report_without_temperature() {
        let latest = LatestReport::default();
        call(&latest, Method::POST, r#"{"temperature":20.0,"timestamp":1}"#).await;

        for body in [r#"{"humidity":50.0}"#, "not json", ""] {
            let (code, value) = call(&latest, Method::POST, body).await;
            assert_eq!(code, StatusCode::BAD_REQUEST);
            assert_eq!(value["status"], "error");
        }
        assert_eq!(latest.get().unwrap().temperature, 20.0);
    }

    #[test]
    fn test_temperature_only_report_gets_defaults() {
        let record = IngestRecord::parse(br#"{"temperature":22.25}"#).unwrap();

        assert_eq!(record.device_id, UNKNOWN_DEVICE);
        assert_eq!(record.humidity, None);
        assert!(record.timestamp.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_accepts_reporter_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let latest = LatestReport::default();
        let app = router(latest.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let outcome = tokio::task::spawn_blocking(move || {
            let endpoint = Endpoint {
                host: address.ip().to_string(),
                port: address.port(),
                path: "/api/data".to_string(),
                secure: false,
            };
            let transport = UreqTransport::new(Duration::from_secs(5));
            let mut reporter = Reporter::new(Box::new(transport), &endpoint, "hive-1", true);
            let reading = SensorReading {
                temperature: 31.5,
                humidity: 64.0,
                sound_level: 48.0,
                battery_percent: 90.0,
                ..SensorReading::new(7000)
            };
            reporter.send(&reading)
        })
        .await
        .unwrap();

        assert_eq!(outcome, ReportOutcome::Success);
        let record = latest.get().unwrap();
        assert_eq!(record.temperature, 31.5);
        assert_eq!(record.sound, Some(48.0));
        assert_eq!(record.battery, Some(90.0));
        assert_eq!(record.device_id, "hive-1");
        assert_eq!(record.timestamp, Some(7000));
    }
}
