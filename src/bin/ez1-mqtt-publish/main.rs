mod logging;
mod rumqttc_wrapper;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use ez1mqtt::config::Config;
use ez1mqtt::scheduler::{Clock, PollScheduler, SchedulerConfig, StopSignal, SystemClock};
use ez1mqtt::sources::ez1::inverter::EZ1Inverter;
use ez1mqtt::sources::fake::FakeInverter;
use ez1mqtt::sources::inverter::{DeviceInfo, Inverter};
use ez1mqtt::targets::metric_publisher::MetricPublisher;
use ez1mqtt::targets::mqtt::mqtt::Mqtt;
use ez1mqtt::targets::mqtt::mqtt_wrapper::MqttWrapper;
use ez1mqtt::targets::mqtt::topic_mapper::ActiveTargets;
use rumqttc_wrapper::RumqttcWrapper;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use log::{error, info, warn};

const DEVICE_INFO_RETRY: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Use a fake inverter
    #[arg(short, long)]
    fake: bool,

    /// Path to the YAML configuration file, defaults to $CONFIG_FILE
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log debug messages, publish unretained and carry on without device info
    #[arg(short, long)]
    debug: bool,

    /// Remove all retained topics from the broker and exit
    #[arg(long)]
    remove: bool,
}

fn debug_device_info() -> DeviceInfo {
    DeviceInfo {
        device_id: "123456789".to_string(),
        version: "debug dummy Ver".to_string(),
        ssid: "debug dummy ssid".to_string(),
        ip_addr: "192.168.9.9".to_string(),
        min_power: 30,
        max_power: 800,
    }
}

/// Asks the inverter who it is until it answers. `None` when stopped first.
/// In debug mode a silent inverter is replaced by a dummy identity.
fn wait_for_device_info(
    inverter: &mut dyn Inverter,
    timeout: Duration,
    stop: &StopSignal,
    debug: bool,
) -> Option<DeviceInfo> {
    loop {
        match inverter.device_info(timeout) {
            Ok(device) => return Some(device),
            Err(e) if debug => {
                warn!("Could not read device info, using a dummy: {e}");
                return Some(debug_device_info());
            }
            Err(e) => warn!(
                "Could not read device info, retrying in {}s: {e}",
                DEVICE_INFO_RETRY.as_secs()
            ),
        }
        if !SystemClock.sleep(DEVICE_INFO_RETRY, stop) {
            return None;
        }
    }
}

fn run(args: Cli) -> anyhow::Result<()> {
    let config = Config::load(args.config.as_deref()).context("invalid configuration")?;
    let settings = config
        .validate(std::env::var("TZ").ok().as_deref())
        .context("invalid configuration")?;

    let stop = StopSignal::new();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, stop.flag())
            .context("could not register signal handler")?;
    }

    info!("inverter host: {}:{}", settings.ecu_host, settings.ecu_port);
    let mut inverter: Box<dyn Inverter> = if args.fake {
        Box::new(FakeInverter::new("E17000000000"))
    } else {
        Box::new(EZ1Inverter::new(&settings.ecu_host, settings.ecu_port))
    };

    let Some(device) =
        wait_for_device_info(inverter.as_mut(), settings.request_timeout, &stop, args.debug)
    else {
        info!("Stopped before the inverter answered");
        return Ok(());
    };
    info!(
        "Found inverter {} running {} ({}-{} W)",
        device.device_id, device.version, device.min_power, device.max_power
    );

    let targets = ActiveTargets::from_config(
        &config.mqtt,
        &device,
        settings.qos,
        Some(settings.configuration_url()),
    )
    // clearing always writes retained messages
    .with_retain(!args.debug || args.remove);
    if targets.is_empty() {
        warn!("No topic prefix, HomA or Home Assistant configured, nothing will be published");
    }

    let mut client = RumqttcWrapper::new(&config.mqtt, &targets.status_topic());
    let shutdown = client.shutdown_handle();
    let mut mqtt = Mqtt::with_client(client, targets);

    if args.remove {
        let errors = mqtt.clear_retained();
        shutdown.close();
        anyhow::ensure!(errors.is_empty(), "{} topics could not be cleared", errors.len());
        return Ok(());
    }

    let started_at = settings.zone.format(Utc::now());
    mqtt.announce(&device, &started_at);

    let publishers: Vec<Box<dyn MetricPublisher>> = vec![Box::new(mqtt)];
    let mut scheduler = PollScheduler::new(
        SchedulerConfig::from(&settings),
        inverter,
        publishers,
        SystemClock,
        stop,
    );
    let result = scheduler.run();
    shutdown.close();
    result?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Cli::parse();
    logging::init_logger(args.debug);
    info!("Running revision: {}", env!("GIT_HASH"));

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
