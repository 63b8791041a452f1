use std::io::{self, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use battery::{BatteryGauge, BatteryModel};
use bridge::{LocalSensors, ReportingNode, SensingNode, Source};
use clap::Parser;
use cli::{Cli, CollectArgs, Command, ConsoleArgs, ReportArgs, RespondArgs, ServeArgs, SimulateArgs};
use clock::{Cadence, MonotonicClock};
use console::Console;
use indicator::StatusLed;
use ingest::LatestReport;
use link::{ConnectionState, ConnectionSupervisor};
use nmcli::NmcliLink;
use report::{Reporter, UreqTransport};
use rppal::{gpio::Gpio, hal::Delay};
use sampler::EnvironmentalSampler;
use server::{SharedStatus, StatusSampler};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use simulate::Simulator;
use telemetry::TelemetryPublisher;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

mod audio;
mod battery;
mod bridge;
mod cli;
mod clock;
mod console;
mod hardware;
mod indicator;
mod ingest;
mod link;
mod mcp3008;
mod measurement;
mod nmcli;
mod report;
mod sampler;
mod sensor;
mod server;
mod simulate;
mod telemetry;
mod traits;

/// How long the control loop may take to wind down after Ctrl+C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often `serve` re-checks the upstream link.
const LINK_CHECK_INTERVAL_MS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    TermLogger::init(
        cli.log_level,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_time_offset_to_local()
            .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("Failed to initialize logger")?;

    if let Err(e) = run(cli.command).await {
        log::error!("{e:#}");
    }

    Ok(())
}

pub async fn run(command: Command) -> Result<(), anyhow::Error> {
    match command {
        Command::Report(args) => report(args).await,
        Command::Respond(args) => respond(args).await,
        Command::Serve(args) => serve(args).await,
        Command::Console(args) => console(args).await,
        Command::Collect(args) => collect(args).await,
        Command::Simulate(args) => simulate(args).await,
    }
}

/// Runs `control` on its own thread until it returns or Ctrl+C arrives.
async fn supervise<F>(control: F) -> Result<(), anyhow::Error>
where
    F: FnOnce(Arc<AtomicBool>) -> Result<(), anyhow::Error> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let (done_tx, mut done_rx) = oneshot::channel();

    let flag = running.clone();
    thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            let _ = done_tx.send(control(flag));
        })
        .context("Failed to spawn control loop")?;

    let finished = tokio::select! {
        result = &mut done_rx => Some(result),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to wait for Ctrl+C signal")?;
            None
        }
    };
    if let Some(result) = finished {
        return result.context("Control loop panicked")?;
    }

    log::info!("Shutting down");
    running.store(false, Ordering::Relaxed);
    match tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await {
        Ok(result) => result.context("Control loop panicked")?,
        Err(_) => {
            log::warn!("Control loop did not stop within {SHUTDOWN_GRACE:?}");
            Ok(())
        }
    }
}

async fn report(args: ReportArgs) -> Result<(), anyhow::Error> {
    supervise(move |running| {
        let gpio = Gpio::new().context("Failed to initialize GPIO")?;
        let rgb = hardware::rgb_led(&gpio, &args.leds)?;
        let status = hardware::status_led(
            &gpio,
            args.status_pin,
            args.leds.active_low,
            args.link.disconnected,
        )?;

        let source = match &args.bus {
            Some(target) => {
                log::info!("Requesting readings over {target:?}");
                Source::bus(target.connect()?, args.sample_interval_ms)
            }
            None => {
                let sensor = match hardware::environment_sensor() {
                    Ok(sensor) => sensor,
                    Err(e) => hardware::halt(Some(rgb), &e),
                };
                let microphone = args.pcm.as_deref().map(hardware::microphone).transpose()?;
                Source::Local(LocalSensors::new(
                    sensor,
                    EnvironmentalSampler::new(args.sample_interval_ms),
                    microphone,
                ))
            }
        };

        let model = BatteryModel {
            divider_ratio: args.divider_ratio,
            ..BatteryModel::default()
        };
        let battery = BatteryGauge::new(hardware::adc_channel(args.battery_channel)?, Delay, model);

        let supervisor = ConnectionSupervisor::new(
            hardware::link(args.link.interface.as_deref()),
            args.link.policy(),
        );
        let transport = UreqTransport::new(Duration::from_secs(args.request_timeout));
        let reporter = Reporter::new(
            Box::new(transport),
            &args.endpoint(),
            args.device_id.clone(),
            source.has_sound(),
        );
        log::info!("Reporting to {}", args.endpoint().url());

        let mut node = ReportingNode::new(
            source,
            battery,
            status,
            rgb,
            args.rgb,
            Delay,
            supervisor,
            args.link.credentials(),
            reporter,
            args.report_interval_ms,
        );
        node.start();
        bridge::run_loop(&running, MonotonicClock::new(), |now_ms| node.tick(now_ms));
        log::info!("Last reading: {:?}", node.context().reading);

        Ok(())
    })
    .await
}

async fn respond(args: RespondArgs) -> Result<(), anyhow::Error> {
    let (publisher, latest) = TelemetryPublisher::new();

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    log::info!("Answering telemetry requests on {}", args.listen);
    tokio::spawn(async move {
        if let Err(e) = telemetry::serve_responder(listener, latest).await {
            log::error!("{e:#}");
        }
    });

    supervise(move |running| {
        let gpio = Gpio::new().context("Failed to initialize GPIO")?;
        let rgb = hardware::rgb_led(&gpio, &args.leds)?;

        let sensor = match hardware::environment_sensor() {
            Ok(sensor) => sensor,
            Err(e) => hardware::halt(Some(rgb), &e),
        };
        let microphone = args.pcm.as_deref().map(hardware::microphone).transpose()?;
        let sensors = LocalSensors::new(
            sensor,
            EnvironmentalSampler::new(args.sample_interval_ms),
            microphone,
        );

        let mut node = SensingNode::new(sensors, rgb, publisher);
        bridge::run_loop(&running, MonotonicClock::new(), |now_ms| node.tick(now_ms));
        log::info!("Last reading: {:?}", node.context().reading);

        Ok(())
    })
    .await
}

async fn serve(args: ServeArgs) -> Result<(), anyhow::Error> {
    let status = SharedStatus::new(args.settings());

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    log::info!("Status page on http://{}", args.listen);
    let app = server::router(status.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("Status server stopped: {e}");
        }
    });

    supervise(move |running| {
        let gpio = Gpio::new().context("Failed to initialize GPIO")?;
        let mut led = hardware::led(&gpio, args.led_pin, args.active_low)?;

        let sensor = match hardware::environment_sensor() {
            Ok(sensor) => sensor,
            Err(e) => hardware::halt(None, &e),
        };
        let light = hardware::adc_channel(args.light_channel)?;

        let mut supervisor = ConnectionSupervisor::new(
            hardware::link(args.link.interface.as_deref()),
            args.link.policy(),
        );
        let credentials = args.link.credentials();
        if let Some(credentials) = &credentials {
            let mut indicator = StatusLed::new(led, args.link.disconnected);
            supervisor.connect(credentials, &mut indicator)?;
            led = indicator.into_led();
        }

        let mut sampler = StatusSampler::new(sensor, light, led, status);
        let mut link_check = Cadence::new(LINK_CHECK_INTERVAL_MS);
        let rejoin_ms = supervisor.policy().attempt_timeout.as_millis() as u64;
        let mut rejoin = Cadence::new(rejoin_ms);
        bridge::run_loop(&running, MonotonicClock::new(), |now_ms| {
            if link_check.due(now_ms) {
                supervisor.poll();
            }
            if let Some(credentials) = &credentials {
                if supervisor.state() == ConnectionState::Disconnected && rejoin.due(now_ms) {
                    if let Err(e) = supervisor.rejoin(credentials) {
                        log::warn!("{e:#}");
                    }
                }
            }
            sampler.tick(now_ms);
        });

        Ok(())
    })
    .await
}

async fn console(args: ConsoleArgs) -> Result<(), anyhow::Error> {
    supervise(move |running| {
        let gpio = Gpio::new().context("Failed to initialize GPIO")?;
        let led = hardware::status_led(
            &gpio,
            args.status_pin,
            args.active_low,
            indicator::DisconnectedPattern::Off,
        )?;
        let supervisor =
            ConnectionSupervisor::new(Box::new(NmcliLink::new(&args.interface)), args.policy());
        let input = console::spawn_line_reader(BufReader::new(io::stdin()));

        let mut console = Console::new(input, io::stdout(), supervisor, led, running.clone());
        match console.run() {
            Err(_) if !running.load(Ordering::Relaxed) => Ok(()),
            result => result,
        }
    })
    .await
}

async fn collect(args: CollectArgs) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    log::info!("Collecting reports on http://{}/api/data", args.listen);

    axum::serve(listener, ingest::router(LatestReport::default()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to wait for Ctrl+C signal: {e}");
            }
            log::info!("Shutting down");
        })
        .await
        .context("Ingest server stopped")
}

async fn simulate(args: SimulateArgs) -> Result<(), anyhow::Error> {
    supervise(move |running| {
        let endpoint = args.endpoint();
        let transport = UreqTransport::new(Duration::from_secs(args.request_timeout));
        let reporter = Reporter::new(
            Box::new(transport),
            &endpoint,
            args.device_id.clone(),
            !args.no_sound,
        );
        log::info!(
            "Simulating {} against {} every {} ms",
            args.device_id,
            endpoint.url(),
            args.interval_ms
        );

        let mut simulator = Simulator::new(rand::thread_rng(), reporter, args.interval_ms);
        bridge::run_loop(&running, MonotonicClock::new(), |now_ms| {
            simulator.tick(now_ms);
        });

        Ok(())
    })
    .await
}
