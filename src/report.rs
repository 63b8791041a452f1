use std::time::Duration;

use anyhow::Context;

use crate::indicator::{BlinkPattern, FAILURE_BLINK, SUCCESS_BLINK};
use crate::measurement::{ReportPayload, SensorReading};
use crate::traits::HttpTransport;

pub const REPORT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_PATH: &str = "/api/data";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Status code recorded when the request never got a response.
pub const TRANSPORT_ERROR: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Success,
    Failure,
}

impl ReportOutcome {
    /// 2xx is success; anything else, including negative transport codes, is failure.
    pub fn from_status(code: i32) -> ReportOutcome {
        if (200..300).contains(&code) {
            ReportOutcome::Success
        } else {
            ReportOutcome::Failure
        }
    }

    pub fn blink_pattern(self) -> BlinkPattern {
        match self {
            ReportOutcome::Success => SUCCESS_BLINK,
            ReportOutcome::Failure => FAILURE_BLINK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
}

impl Endpoint {
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let path = self.path.trim_start_matches('/');
        format!("{scheme}://{}:{}/{path}", self.host, self.port)
    }
}

#[derive(Debug)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> UreqTransport {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        UreqTransport { agent }
    }
}

impl HttpTransport for UreqTransport {
    fn post_json(&mut self, url: &str, body: &str) -> Result<u16, anyhow::Error> {
        match self
            .agent
            .post(url)
            .set("Content-Type", "application/json")
            .send_string(body)
        {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(e) => Err(anyhow::anyhow!("HTTP POST failed for '{url}': {e}")),
        }
    }
}

/// Serializes readings and performs one POST per call.
pub struct Reporter {
    transport: Box<dyn HttpTransport + Send>,
    url: String,
    device_id: String,
    with_sound: bool,
}

impl Reporter {
    pub fn new(
        transport: Box<dyn HttpTransport + Send>,
        endpoint: &Endpoint,
        device_id: impl Into<String>,
        with_sound: bool,
    ) -> Reporter {
        Reporter {
            transport,
            url: endpoint.url(),
            device_id: device_id.into(),
            with_sound,
        }
    }

    pub fn payload(&self, reading: &SensorReading) -> Result<String, anyhow::Error> {
        let payload = ReportPayload::new(reading, &self.device_id, self.with_sound);
        serde_json::to_string(&payload).context("Failed to serialize report")
    }

    /// One exchange, never retried.
    pub fn send(&mut self, reading: &SensorReading) -> ReportOutcome {
        let body = match self.payload(reading) {
            Ok(body) => body,
            Err(e) => {
                log::error!("{e:#}");
                return ReportOutcome::Failure;
            }
        };

        log::debug!("Sending {body} to {}", self.url);
        let code = match self.transport.post_json(&self.url, &body) {
            Ok(code) => i32::from(code),
            Err(e) => {
                log::error!("{e:#}");
                TRANSPORT_ERROR
            }
        };

        let outcome = ReportOutcome::from_status(code);
        match outcome {
            ReportOutcome::Success => log::info!("Report accepted ({code})"),
            ReportOutcome::Failure => log::warn!("Report rejected ({code})"),
        }
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Replies with a fixed result and keeps every request body.
    #[derive(Debug, Clone)]
    pub(crate) struct ScriptedTransport {
        pub(crate) reply: Result<u16, &'static str>,
        pub(crate) requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(reply: Result<u16, &'static str>) -> ScriptedTransport {
            ScriptedTransport {
                reply,
                requests: Arc::default(),
            }
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn post_json(&mut self, url: &str, body: &str) -> Result<u16, anyhow::Error> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), body.to_string()));
            self.reply.map_err(|e| anyhow::anyhow!(e))
        }
    }

    pub(crate) fn endpoint() -> Endpoint {
        Endpoint {
            host: "10.0.0.5".to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            secure: false,
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ReportOutcome::from_status(200), ReportOutcome::Success);
        assert_eq!(ReportOutcome::from_status(204), ReportOutcome::Success);
        assert_eq!(ReportOutcome::from_status(299), ReportOutcome::Success);
        assert_eq!(ReportOutcome::from_status(301), ReportOutcome::Failure);
        assert_eq!(ReportOutcome::from_status(500), ReportOutcome::Failure);
        assert_eq!(ReportOutcome::from_status(TRANSPORT_ERROR), ReportOutcome::Failure);
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint().url(), "http://10.0.0.5:3000/api/data");

        let secure = Endpoint {
            secure: true,
            port: 443,
            path: "ingest".to_string(),
            ..endpoint()
        };
        assert_eq!(secure.url(), "https://10.0.0.5:443/ingest");
    }

    #[test]
    fn test_send_posts_payload() {
        let transport = ScriptedTransport::new(Ok(204));
        let mut reporter = Reporter::new(Box::new(transport.clone()), &endpoint(), "hive-1", true);
        let reading = SensorReading {
            temperature: 30.0,
            humidity: 60.0,
            sound_level: 55.0,
            battery_percent: 90.0,
            ..SensorReading::new(5000)
        };

        assert_eq!(reporter.send(&reading), ReportOutcome::Success);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "http://10.0.0.5:3000/api/data");
        let body: serde_json::Value = serde_json::from_str(&requests[0].1).unwrap();
        assert_eq!(body["device_id"], "hive-1");
        assert_eq!(body["sound"], 55.0);
        assert_eq!(body["timestamp"], 5000);
    }

    #[test]
    fn test_send_failures() {
        let reading = SensorReading::new(0);

        let mut reporter = Reporter::new(Box::new(ScriptedTransport::new(Ok(500))), &endpoint(), "hive-1", false);
        assert_eq!(reporter.send(&reading), ReportOutcome::Failure);

        let mut reporter = Reporter::new(
            Box::new(ScriptedTransport::new(Err("connection refused"))),
            &endpoint(),
            "hive-1",
            false,
        );
        assert_eq!(reporter.send(&reading), ReportOutcome::Failure);
    }

    #[test]
    fn test_outcome_blink_patterns() {
        assert_eq!(ReportOutcome::Success.blink_pattern(), SUCCESS_BLINK);
        assert_eq!(ReportOutcome::Failure.blink_pattern(), FAILURE_BLINK);
    }
}
