use chrono::{DateTime, Local};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub captured_at: DateTime<Local>,
    pub temperature: f32,
    pub humidity: f32,
    pub sound_level: f32,
    pub battery_percent: f32,
    pub timestamp_ms: u64,
}

impl SensorReading {
    pub fn new(timestamp_ms: u64) -> SensorReading {
        SensorReading {
            captured_at: Local::now(),
            temperature: 0.0,
            humidity: 0.0,
            sound_level: 0.0,
            battery_percent: 0.0,
            timestamp_ms,
        }
    }
}

/// Body of one report POST
#[derive(Debug, Serialize)]
pub struct ReportPayload<'a> {
    pub temperature: f32,
    pub humidity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<f32>,
    pub battery: f32,
    pub device_id: &'a str,
    pub timestamp: u64,
}

impl<'a> ReportPayload<'a> {
    pub fn new(reading: &SensorReading, device_id: &'a str, with_sound: bool) -> Self {
        ReportPayload {
            temperature: reading.temperature,
            humidity: reading.humidity,
            sound: with_sound.then_some(reading.sound_level),
            battery: reading.battery_percent,
            device_id,
            timestamp: reading.timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> SensorReading {
        SensorReading {
            temperature: 21.5,
            humidity: 48.0,
            sound_level: 42.0,
            battery_percent: 80.0,
            ..SensorReading::new(12_345)
        }
    }

    #[test]
    fn test_payload_keys() {
        let payload = ReportPayload::new(&reading(), "hive-1", true);
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["temperature"], 21.5);
        assert_eq!(value["humidity"], 48.0);
        assert_eq!(value["sound"], 42.0);
        assert_eq!(value["battery"], 80.0);
        assert_eq!(value["device_id"], "hive-1");
        assert_eq!(value["timestamp"], 12_345);
    }

    #[test]
    fn test_payload_without_sound() {
        let payload = ReportPayload::new(&reading(), "hive-1", false);
        let value = serde_json::to_value(&payload).unwrap();

        assert!(value.get("sound").is_none());
        assert_eq!(value.as_object().unwrap().len(), 5);
    }
}
