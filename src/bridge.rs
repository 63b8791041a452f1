//! Control loops for the reporting and sensing device roles.
//!
//! Each loop owns its components and a `DeviceContext`; components read and
//! update the context only through the loop's `tick`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Local;
use clap::ValueEnum;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::audio::{self, SampleSlot};
use crate::battery::BatteryGauge;
use crate::clock::{Cadence, MonotonicClock};
use crate::indicator::{BatteryState, RgbLed, SoundState, StatusLed};
use crate::link::{ConnectionState, ConnectionSupervisor, Credentials};
use crate::measurement::SensorReading;
use crate::report::Reporter;
use crate::sampler::{Change, EnvironmentalSampler};
use crate::telemetry::{self, Telemetry, TelemetryPublisher};
use crate::traits::{AnalogInput, BusRequester, EnvironmentSensor};

pub const LOOP_INTERVAL: Duration = Duration::from_millis(10);

/// Which metric the RGB LED follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RgbSource {
    #[default]
    Sound,
    Battery,
}

/// Latest state shared between the components of one device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceContext {
    pub reading: SensorReading,
    pub connection: ConnectionState,
}

impl DeviceContext {
    pub fn new() -> DeviceContext {
        DeviceContext {
            reading: SensorReading::new(0),
            connection: ConnectionState::Disconnected,
        }
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// What one poll of a reading source changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Polled {
    pub sound: bool,
    pub climate: bool,
}

/// Sensors attached to this device.
pub struct LocalSensors {
    sensor: Box<dyn EnvironmentSensor + Send>,
    sampler: EnvironmentalSampler,
    microphone: Option<Arc<SampleSlot>>,
}

impl LocalSensors {
    pub fn new(
        sensor: Box<dyn EnvironmentSensor + Send>,
        sampler: EnvironmentalSampler,
        microphone: Option<Arc<SampleSlot>>,
    ) -> LocalSensors {
        LocalSensors {
            sensor,
            sampler,
            microphone,
        }
    }

    pub fn has_microphone(&self) -> bool {
        self.microphone.is_some()
    }

    pub fn poll(&mut self, now_ms: u64, ctx: &mut DeviceContext) -> Polled {
        let mut polled = Polled::default();

        if let Some(level) = self
            .microphone
            .as_ref()
            .and_then(|slot| slot.consume(audio::sound_level))
        {
            ctx.reading.sound_level = level;
            polled.sound = true;
        }

        match self.sampler.poll(now_ms, self.sensor.as_mut()) {
            Ok(Some((climate, change))) => {
                ctx.reading.temperature = climate.temperature;
                ctx.reading.humidity = climate.humidity;
                ctx.reading.timestamp_ms = now_ms;
                ctx.reading.captured_at = Local::now();
                polled.climate = true;

                if change == Change::Significant {
                    log::info!("Significant change detected!");
                }
                log::info!(
                    "Temperature = {:.2} °C, Humidity = {:.2} %, Microphone = {:.2} dB",
                    climate.temperature,
                    climate.humidity,
                    ctx.reading.sound_level
                );
            }
            Ok(None) => {}
            Err(e) => log::error!("{e:#}"),
        }

        polled
    }
}

/// Where the reporting device gets temperature, humidity and sound.
pub enum Source {
    Local(LocalSensors),
    Bus {
        bus: Box<dyn BusRequester + Send>,
        cadence: Cadence,
    },
}

impl Source {
    pub fn bus(bus: Box<dyn BusRequester + Send>, interval_ms: u64) -> Source {
        Source::Bus {
            bus,
            cadence: Cadence::new(interval_ms),
        }
    }

    pub fn has_sound(&self) -> bool {
        match self {
            Source::Local(sensors) => sensors.has_microphone(),
            Source::Bus { .. } => true,
        }
    }

    pub fn poll(&mut self, now_ms: u64, ctx: &mut DeviceContext) -> Polled {
        match self {
            Source::Local(sensors) => sensors.poll(now_ms, ctx),
            Source::Bus { bus, cadence } => {
                if !cadence.due(now_ms) {
                    return Polled::default();
                }

                let received = telemetry::request_telemetry(bus.as_mut());
                ctx.reading.temperature = received.temperature;
                ctx.reading.humidity = received.humidity;
                ctx.reading.sound_level = received.sound_level;
                ctx.reading.timestamp_ms = now_ms;
                ctx.reading.captured_at = Local::now();
                log::debug!("Received {received:?}");

                Polled {
                    sound: true,
                    climate: true,
                }
            }
        }
    }
}

/// Reporting device: gather, serialize, send, indicate.
pub struct ReportingNode<P, D> {
    source: Source,
    battery: BatteryGauge<Box<dyn AnalogInput + Send>, D>,
    status: StatusLed<P>,
    rgb: RgbLed<P>,
    rgb_source: RgbSource,
    delay: D,
    supervisor: ConnectionSupervisor,
    credentials: Option<Credentials>,
    reporter: Reporter,
    cadence: Cadence,
    ctx: DeviceContext,
}

impl<P: OutputPin, D: DelayNs> ReportingNode<P, D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Source,
        battery: BatteryGauge<Box<dyn AnalogInput + Send>, D>,
        status: StatusLed<P>,
        rgb: RgbLed<P>,
        rgb_source: RgbSource,
        delay: D,
        supervisor: ConnectionSupervisor,
        credentials: Option<Credentials>,
        reporter: Reporter,
        report_interval_ms: u64,
    ) -> ReportingNode<P, D> {
        ReportingNode {
            source,
            battery,
            status,
            rgb,
            rgb_source,
            delay,
            supervisor,
            credentials,
            reporter,
            cadence: Cadence::new(report_interval_ms),
            ctx: DeviceContext::new(),
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Establishes the link before the first tick.
    pub fn start(&mut self) {
        self.ensure_link();
        self.status.update(self.ctx.connection, 0);
    }

    pub fn tick(&mut self, now_ms: u64) {
        let polled = self.source.poll(now_ms, &mut self.ctx);
        if polled.sound && self.rgb_source == RgbSource::Sound {
            self.rgb
                .show(SoundState::from_decibels(self.ctx.reading.sound_level).into());
        }

        self.status.update(self.ctx.connection, now_ms);

        if self.cadence.due(now_ms) {
            self.report(now_ms);
        }
    }

    fn ensure_link(&mut self) {
        self.supervisor.poll();
        if self.supervisor.state() != ConnectionState::Connected {
            match &self.credentials {
                Some(credentials) => {
                    if let Err(e) = self.supervisor.connect(credentials, &mut self.status) {
                        log::error!("{e:#}");
                    }
                }
                None => log::warn!("Link is down and no credentials are configured"),
            }
        }
        self.ctx.connection = self.supervisor.state();
    }

    fn report(&mut self, now_ms: u64) {
        match self.battery.read_percent() {
            Ok(percent) => self.ctx.reading.battery_percent = percent,
            Err(e) => log::warn!("Failed to read battery, keeping last value: {e:#}"),
        }
        if self.rgb_source == RgbSource::Battery {
            self.rgb
                .show(BatteryState::from_percent(self.ctx.reading.battery_percent).into());
        }

        self.ensure_link();
        if self.ctx.connection != ConnectionState::Connected {
            log::warn!("Skipping report while the link is down");
            self.status.update(self.ctx.connection, now_ms);
            return;
        }

        self.ctx.reading.timestamp_ms = now_ms;
        self.ctx.reading.captured_at = Local::now();
        log::info!("{:?}", self.ctx.reading);

        let outcome = self.reporter.send(&self.ctx.reading);
        self.status.blink(outcome.blink_pattern(), &mut self.delay);
        self.status.update(self.ctx.connection, now_ms);
    }
}

/// Sensing device: samples, drives the sound LED and keeps the telemetry
/// buffer current for bus requests.
pub struct SensingNode<P> {
    sensors: LocalSensors,
    rgb: RgbLed<P>,
    publisher: TelemetryPublisher,
    ctx: DeviceContext,
}

impl<P: OutputPin> SensingNode<P> {
    pub fn new(sensors: LocalSensors, rgb: RgbLed<P>, publisher: TelemetryPublisher) -> SensingNode<P> {
        SensingNode {
            sensors,
            rgb,
            publisher,
            ctx: DeviceContext::new(),
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn tick(&mut self, now_ms: u64) {
        let polled = self.sensors.poll(now_ms, &mut self.ctx);

        if polled.sound {
            self.rgb
                .show(SoundState::from_decibels(self.ctx.reading.sound_level).into());
        }
        if polled.sound || polled.climate {
            self.publisher.publish(&Telemetry {
                temperature: self.ctx.reading.temperature,
                humidity: self.ctx.reading.humidity,
                sound_level: self.ctx.reading.sound_level,
            });
        }
    }
}

/// Calls `tick` with the current time until `running` is cleared.
pub fn run_loop(running: &AtomicBool, clock: MonotonicClock, mut tick: impl FnMut(u64)) {
    while running.load(Ordering::Relaxed) {
        tick(clock.now_ms());
        thread::sleep(LOOP_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::BatteryModel;
    use crate::indicator::tests::{CountingDelay, RecordingPin};
    use crate::indicator::{DisconnectedPattern, Led};
    use crate::link::tests::{ScriptedLink, credentials, fast_policy};
    use crate::measurement::Climate;
    use crate::report::tests::{ScriptedTransport, endpoint};
    use crate::telemetry::FALLBACK;

    struct FixedSensor(Climate);

    impl EnvironmentSensor for FixedSensor {
        fn init(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        fn read(&mut self) -> Result<Climate, anyhow::Error> {
            Ok(self.0)
        }
    }

    struct FixedAdc(u16);

    impl AnalogInput for FixedAdc {
        fn read(&mut self) -> Result<u16, anyhow::Error> {
            Ok(self.0)
        }
    }

    struct FailingBus;

    impl BusRequester for FailingBus {
        fn request(&mut self, _buf: &mut [u8]) -> Result<usize, anyhow::Error> {
            Err(anyhow::anyhow!("no acknowledge"))
        }
    }

    struct Rig {
        status: RecordingPin,
        red: RecordingPin,
        green: RecordingPin,
        blue: RecordingPin,
        transport: ScriptedTransport,
        link: ScriptedLink,
    }

    fn local_source(microphone: Option<Arc<SampleSlot>>) -> Source {
        Source::Local(LocalSensors::new(
            Box::new(FixedSensor(Climate {
                temperature: 34.5,
                humidity: 61.0,
            })),
            EnvironmentalSampler::new(1000),
            microphone,
        ))
    }

    fn rgb(rig: &Rig) -> RgbLed<RecordingPin> {
        RgbLed::new(
            Led::new(rig.red.clone(), false),
            Led::new(rig.green.clone(), false),
            Led::new(rig.blue.clone(), false),
        )
    }

    fn node(
        source: Source,
        reply: Result<u16, &'static str>,
        link: ScriptedLink,
        credentials: Option<Credentials>,
        rgb_source: RgbSource,
    ) -> (Rig, ReportingNode<RecordingPin, CountingDelay>) {
        let rig = Rig {
            status: RecordingPin::default(),
            red: RecordingPin::default(),
            green: RecordingPin::default(),
            blue: RecordingPin::default(),
            transport: ScriptedTransport::new(reply),
            link,
        };
        let battery: Box<dyn AnalogInput + Send> = Box::new(FixedAdc(1023));

        let node = ReportingNode::new(
            source,
            BatteryGauge::new(battery, CountingDelay::default(), BatteryModel::default()),
            StatusLed::new(Led::new(rig.status.clone(), false), DisconnectedPattern::Off),
            rgb(&rig),
            rgb_source,
            CountingDelay::default(),
            ConnectionSupervisor::new(Box::new(rig.link.clone()), fast_policy(Some(2))),
            credentials,
            Reporter::new(Box::new(rig.transport.clone()), &endpoint(), "hive-1", true),
            1000,
        );
        (rig, node)
    }

    fn sent_bodies(rig: &Rig) -> Vec<serde_json::Value> {
        rig.transport
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| serde_json::from_str(body).unwrap())
            .collect()
    }

    #[test]
    fn test_report_cycle_success() {
        let link = ScriptedLink::new(vec![ConnectionState::Connected]);
        let (rig, mut node) = node(local_source(None), Ok(201), link, None, RgbSource::Sound);

        node.tick(500);
        assert!(sent_bodies(&rig).is_empty());

        node.tick(1000);
        let bodies = sent_bodies(&rig);
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["temperature"], 34.5);
        assert_eq!(bodies[0]["humidity"], 61.0);
        assert_eq!(bodies[0]["battery"], 100.0);
        assert_eq!(bodies[0]["timestamp"], 1000);

        // Three fast blinks, then steady on for a connected link.
        let levels = rig.status.levels();
        let tail = &levels[levels.len() - 7..];
        assert_eq!(tail, &[true, false, true, false, true, false, true]);
        assert_eq!(node.context().connection, ConnectionState::Connected);
    }

    #[test]
    fn test_report_cycle_failure_blinks_twice() {
        let link = ScriptedLink::new(vec![ConnectionState::Connected]);
        let (rig, mut node) = node(local_source(None), Ok(500), link, None, RgbSource::Sound);

        node.tick(1000);

        assert_eq!(sent_bodies(&rig).len(), 1);
        let levels = rig.status.levels();
        let tail = &levels[levels.len() - 5..];
        assert_eq!(tail, &[true, false, true, false, true]);
    }

    #[test]
    fn test_link_down_without_credentials_skips_send() {
        let link = ScriptedLink::new(vec![ConnectionState::Disconnected]);
        let (rig, mut node) = node(local_source(None), Ok(200), link, None, RgbSource::Sound);

        node.tick(1000);

        assert!(sent_bodies(&rig).is_empty());
        assert_eq!(rig.link.begin_count(), 0);
        assert_eq!(rig.status.last(), Some(false));
    }

    #[test]
    fn test_link_loss_triggers_reconnect_before_send() {
        use ConnectionState::*;

        let link = ScriptedLink::new(vec![Disconnected, Connecting, Connected]);
        let (rig, mut node) = node(
            local_source(None),
            Ok(200),
            link,
            Some(credentials()),
            RgbSource::Sound,
        );

        node.tick(1000);

        assert_eq!(rig.link.begin_count(), 1);
        assert_eq!(sent_bodies(&rig).len(), 1);
        assert_eq!(node.context().connection, Connected);
    }

    #[test]
    fn test_bus_fault_reports_fallback() {
        let link = ScriptedLink::new(vec![ConnectionState::Connected]);
        let source = Source::bus(Box::new(FailingBus), 1000);
        let (rig, mut node) = node(source, Ok(200), link, None, RgbSource::Sound);

        node.tick(1000);

        let bodies = sent_bodies(&rig);
        assert_eq!(bodies[0]["temperature"], f64::from(FALLBACK.temperature));
        assert_eq!(bodies[0]["humidity"], f64::from(FALLBACK.humidity));
        assert_eq!(bodies[0]["sound"], f64::from(FALLBACK.sound_level));
        // 30 dB is "normal".
        assert_eq!(rig.green.last(), Some(true));
    }

    #[test]
    fn test_rgb_follows_battery() {
        let link = ScriptedLink::new(vec![ConnectionState::Connected]);
        let (rig, mut node) = node(local_source(None), Ok(200), link, None, RgbSource::Battery);

        node.tick(1000);

        assert_eq!(rig.green.last(), Some(true));
        assert_eq!(rig.red.last(), Some(false));
        assert_eq!(rig.blue.last(), Some(false));
    }

    #[test]
    fn test_microphone_drives_sound_led() {
        let slot = Arc::new(SampleSlot::new());
        let block: Vec<i16> = (0..256).map(|i| if i % 2 == 0 { 1000 } else { -1000 }).collect();
        slot.publish(&block);

        let link = ScriptedLink::new(vec![ConnectionState::Connected]);
        let (rig, mut node) = node(local_source(Some(slot.clone())), Ok(200), link, None, RgbSource::Sound);

        node.tick(10);

        assert!(!slot.is_full());
        assert!((node.context().reading.sound_level - 60.0).abs() < 1e-3);
        assert_eq!(rig.blue.last(), Some(true));
    }

    #[test]
    fn test_sensing_node_publishes_on_update() {
        let slot = Arc::new(SampleSlot::new());
        let sensors = LocalSensors::new(
            Box::new(FixedSensor(Climate {
                temperature: 33.0,
                humidity: 58.5,
            })),
            EnvironmentalSampler::new(1000),
            Some(slot.clone()),
        );
        let (publisher, latest) = TelemetryPublisher::new();
        let (red, green, blue) = (RecordingPin::default(), RecordingPin::default(), RecordingPin::default());
        let rgb = RgbLed::new(
            Led::new(red.clone(), false),
            Led::new(green, false),
            Led::new(blue, false),
        );
        let mut node = SensingNode::new(sensors, rgb, publisher);

        slot.publish(&[20_000; 256]);
        node.tick(500);
        assert_eq!(red.last(), Some(true));
        let published = latest.borrow().unpack();
        assert_eq!(published.temperature, 0.0);
        assert_eq!(published.sound_level, node.context().reading.sound_level);
        assert!(published.sound_level > 80.0);

        node.tick(1000);
        let published = latest.borrow().unpack();
        assert_eq!(published.temperature, 33.0);
        assert_eq!(published.humidity, 58.5);
        assert_eq!(published.sound_level, node.context().reading.sound_level);
    }
}
