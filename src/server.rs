//! Local status server: latest readings and two mutable settings over HTTP.

use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use embedded_hal::digital::OutputPin;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::clock::Cadence;
use crate::indicator::Led;
use crate::traits::{AnalogInput, EnvironmentSensor};

pub const DEFAULT_SAMPLE_RATE: u32 = 5;
pub const SAMPLE_RATE_RANGE: std::ops::RangeInclusive<u32> = 1..=60;
pub const DEFAULT_DEVICE_NAME: &str = "Hive Monitor";

const STATUS_PAGE: &str = include_str!("status.html");

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readings {
    pub temperature: f32,
    pub humidity: f32,
    pub light: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub led_enabled: bool,
    /// Seconds between sensor reads
    pub sample_rate: u32,
    pub device_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            led_enabled: true,
            sample_rate: DEFAULT_SAMPLE_RATE,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusState {
    pub readings: Readings,
    pub settings: Settings,
}

#[derive(Debug, Clone, Default)]
pub struct SharedStatus(Arc<Mutex<StatusState>>);

impl SharedStatus {
    pub fn new(settings: Settings) -> SharedStatus {
        SharedStatus(Arc::new(Mutex::new(StatusState {
            readings: Readings::default(),
            settings,
        })))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut StatusState) -> R) -> R {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn settings(&self) -> Settings {
        self.with(|state| state.settings.clone())
    }

    pub fn set_readings(&self, readings: Readings) {
        self.with(|state| state.readings = readings);
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub temperature: f32,
    pub humidity: f32,
    pub light: u16,
    pub led_enabled: bool,
    pub sample_rate: u32,
    pub device_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub led_enabled: Option<bool>,
    pub sample_rate: Option<u32>,
}

pub fn router(status: SharedStatus) -> Router {
    Router::new()
        .route("/api/data", get(read_data).fallback(status_page))
        .route("/api/config", post(update_config).fallback(status_page))
        .fallback(status_page)
        .with_state(status)
}

async fn read_data(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.with(|state| StatusSnapshot {
        temperature: state.readings.temperature,
        humidity: state.readings.humidity,
        light: state.readings.light,
        led_enabled: state.settings.led_enabled,
        sample_rate: state.settings.sample_rate,
        device_name: state.settings.device_name.clone(),
    });
    Json(snapshot)
}

/// An empty or non-JSON body toggles the LED; a JSON body sets the
/// settings it names.
async fn update_config(State(status): State<SharedStatus>, body: Bytes) -> Response {
    let update = serde_json::from_slice::<ConfigUpdate>(&body).ok();

    if let Some(rate) = update.as_ref().and_then(|update| update.sample_rate) {
        if !SAMPLE_RATE_RANGE.contains(&rate) {
            let message = format!(
                "sampleRate must be between {} and {}",
                SAMPLE_RATE_RANGE.start(),
                SAMPLE_RATE_RANGE.end()
            );
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "error", "message": message})),
            )
                .into_response();
        }
    }

    let settings = status.with(|state| {
        match update {
            Some(update) => {
                if let Some(enabled) = update.led_enabled {
                    state.settings.led_enabled = enabled;
                }
                if let Some(rate) = update.sample_rate {
                    state.settings.sample_rate = rate;
                }
            }
            None => state.settings.led_enabled = !state.settings.led_enabled,
        }
        state.settings.clone()
    });
    log::info!(
        "Configuration updated: ledEnabled={} sampleRate={}",
        settings.led_enabled,
        settings.sample_rate
    );

    Json(json!({"status": "success", "message": "Configuration updated"})).into_response()
}

async fn status_page() -> Html<&'static str> {
    Html(STATUS_PAGE)
}

/// Re-reads the sensors every `sampleRate` seconds and keeps the LED in
/// line with `ledEnabled`.
pub struct StatusSampler<P> {
    sensor: Box<dyn EnvironmentSensor + Send>,
    light: Box<dyn AnalogInput + Send>,
    led: Led<P>,
    status: SharedStatus,
    cadence: Cadence,
}

impl<P: OutputPin> StatusSampler<P> {
    pub fn new(
        sensor: Box<dyn EnvironmentSensor + Send>,
        light: Box<dyn AnalogInput + Send>,
        led: Led<P>,
        status: SharedStatus,
    ) -> StatusSampler<P> {
        let interval_ms = u64::from(status.settings().sample_rate) * 1000;
        StatusSampler {
            sensor,
            light,
            led,
            status,
            cadence: Cadence::new(interval_ms),
        }
    }

    pub fn tick(&mut self, now_ms: u64) {
        let settings = self.status.settings();
        self.led.set(settings.led_enabled);

        let interval_ms = u64::from(settings.sample_rate) * 1000;
        if interval_ms != self.cadence.interval_ms() {
            log::info!("Sample rate changed to {} s", settings.sample_rate);
            self.cadence = Cadence::new(interval_ms);
        }
        if !self.cadence.due(now_ms) {
            return;
        }

        let mut readings = self.status.with(|state| state.readings);
        match self.sensor.read() {
            Ok(climate) => {
                readings.temperature = climate.temperature;
                readings.humidity = climate.humidity;
            }
            Err(e) => log::error!("{e:#}"),
        }
        match self.light.read() {
            Ok(light) => readings.light = light,
            Err(e) => log::error!("Failed to read light level: {e:#}"),
        }

        log::info!("{readings:?}");
        self.status.set_readings(readings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::tests::RecordingPin;
    use crate::measurement::Climate;
    use axum::body::{self, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    struct FixedSensor;

    impl EnvironmentSensor for FixedSensor {
        fn init(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        fn read(&mut self) -> Result<Climate, anyhow::Error> {
            Ok(Climate {
                temperature: 21.5,
                humidity: 47.0,
            })
        }
    }

    struct FailingAdc;

    impl AnalogInput for FailingAdc {
        fn read(&mut self) -> Result<u16, anyhow::Error> {
            Err(anyhow::anyhow!("SPI unavailable"))
        }
    }

    struct FixedAdc(u16);

    impl AnalogInput for FixedAdc {
        fn read(&mut self) -> Result<u16, anyhow::Error> {
            Ok(self.0)
        }
    }

    async fn call(status: &SharedStatus, method: Method, uri: &str, body: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(status.clone()).oneshot(request).await.unwrap();
        let code = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (code, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_get_data() {
        let status = SharedStatus::new(Settings::default());
        status.set_readings(Readings {
            temperature: 24.5,
            humidity: 52.0,
            light: 612,
        });

        let (code, body) = call(&status, Method::GET, "/api/data", "").await;
        assert_eq!(code, StatusCode::OK);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["temperature"], 24.5);
        assert_eq!(value["humidity"], 52.0);
        assert_eq!(value["light"], 612);
        assert_eq!(value["ledEnabled"], true);
        assert_eq!(value["sampleRate"], DEFAULT_SAMPLE_RATE);
        assert_eq!(value["deviceName"], DEFAULT_DEVICE_NAME);
    }

    #[tokio::test]
    async fn test_post_config_without_body_toggles_led() {
        let status = SharedStatus::new(Settings::default());

        let (code, body) = call(&status, Method::POST, "/api/config", "").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, r#"{"message":"Configuration updated","status":"success"}"#);
        assert!(!status.settings().led_enabled);

        call(&status, Method::POST, "/api/config", "").await;
        assert!(status.settings().led_enabled);
    }

    #[tokio::test]
    async fn test_post_config_with_json_sets_values() {
        let status = SharedStatus::new(Settings::default());

        let (code, _) = call(
            &status,
            Method::POST,
            "/api/config",
            r#"{"ledEnabled":false,"sampleRate":30,"deviceName":"ignored"}"#,
        )
        .await;
        assert_eq!(code, StatusCode::OK);

        let settings = status.settings();
        assert!(!settings.led_enabled);
        assert_eq!(settings.sample_rate, 30);
        assert_eq!(settings.device_name, DEFAULT_DEVICE_NAME);
    }

    #[tokio::test]
    async fn test_post_config_rejects_bad_sample_rate() {
        let status = SharedStatus::new(Settings::default());

        let (code, body) = call(&status, Method::POST, "/api/config", r#"{"sampleRate":0}"#).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body.contains("\"status\":\"error\""));
        assert_eq!(status.settings(), Settings::default());
    }

    #[tokio::test]
    async fn test_other_paths_serve_page() {
        let status = SharedStatus::new(Settings::default());

        for (method, uri) in [
            (Method::GET, "/"),
            (Method::GET, "/index.html"),
            (Method::GET, "/api/config"),
            (Method::DELETE, "/api/data"),
        ] {
            let (code, body) = call(&status, method, uri, "").await;
            assert_eq!(code, StatusCode::OK);
            assert!(body.starts_with("<!DOCTYPE html>"));
        }
    }

    #[test]
    fn test_sampler_reads_at_sample_rate() {
        let status = SharedStatus::new(Settings::default());
        let pin = RecordingPin::default();
        let mut sampler = StatusSampler::new(
            Box::new(FixedSensor),
            Box::new(FixedAdc(700)),
            Led::new(pin.clone(), false),
            status.clone(),
        );

        sampler.tick(1000);
        assert_eq!(status.with(|state| state.readings), Readings::default());
        assert_eq!(pin.last(), Some(true));

        sampler.tick(5000);
        let readings = status.with(|state| state.readings);
        assert_eq!(readings.temperature, 21.5);
        assert_eq!(readings.humidity, 47.0);
        assert_eq!(readings.light, 700);
    }

    #[test]
    fn test_sampler_follows_settings() {
        let status = SharedStatus::new(Settings::default());
        let pin = RecordingPin::default();
        let mut sampler = StatusSampler::new(
            Box::new(FixedSensor),
            Box::new(FailingAdc),
            Led::new(pin.clone(), false),
            status.clone(),
        );

        status.with(|state| {
            state.readings.light = 42;
            state.settings.led_enabled = false;
            state.settings.sample_rate = 1;
        });
        sampler.tick(1000);

        assert_eq!(pin.last(), Some(false));
        let readings = status.with(|state| state.readings);
        assert_eq!(readings.temperature, 21.5);
        assert_eq!(readings.light, 42);
    }
}
