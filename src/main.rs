mod aggregate;
mod config;
mod decode;
mod frame;
mod meter;
mod mqtt;
mod poller;
mod probe;
mod source;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mqtt::{Command, CommandTopics, LogChannel, MqttPublisher, MqttSettings, Publisher};
use poller::{PollSettings, Poller, SharedInterval};
use source::{LinkTarget, ModbusLink, RegisterSource};

fn handle_command<S: RegisterSource + 'static>(
    command: Command,
    pollers: &[Arc<Poller<S>>],
    interval: &SharedInterval,
    log: &LogChannel,
) {
    match command {
        Command::Reset(kind) => {
            for p in pollers {
                match p.reset_min_max(kind) {
                    Ok(()) => log.log(format!(
                        "Min/max {} has been reset for logger {}",
                        kind.label(),
                        p.unit()
                    )),
                    Err(e) => log.log(format!(
                        "Resetting min/max {} has failed for logger {}: {}",
                        kind.label(),
                        p.unit(),
                        e
                    )),
                }
            }
        }
        Command::SendInterval(period) => {
            interval.set(period);
            log.log(format!(
                "Received config message - send interval is now {}s",
                period.as_secs()
            ));
        }
        Command::Invalid(reason) => log.log(reason),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let mut config = config::Config::parse();
    if let Some(path) = config.credentials.clone() {
        let creds = config::Credentials::load(&path)?;
        config.apply_credentials(creds);
    }
    config.validate()?;
    info!("Starting powerlogger");

    let (commands_tx, commands) = mpsc::channel();
    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher::connect(
        MqttSettings {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            client_id: config.mqtt_client_id.clone(),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            log_topic: config.log_topic.clone(),
            commands: CommandTopics {
                reset: config.reset_topic.clone(),
                config: config.config_topic.clone(),
            },
            reconnect_delay: config.reconnect_delay(),
        },
        commands_tx,
    )?);
    let log = Arc::new(LogChannel::new(Arc::clone(&publisher), &config.log_topic));

    let target = match (&config.port, config.tcp) {
        (Some(path), _) => {
            info!("Using specified port: {}", path);
            LinkTarget::Rtu {
                path: path.clone(),
                baud_rate: config.baud,
            }
        }
        (None, Some(addr)) => LinkTarget::Tcp { addr },
        (None, None) => {
            info!("No port specified, probing for a meter ...");
            LinkTarget::Rtu {
                path: probe::find_meter_port(config.baud, config.units[0], config.timeout())?,
                baud_rate: config.baud,
            }
        }
    };
    info!("Polling units {:?} over {}", config.units, target);

    let source = Arc::new(Mutex::new(ModbusLink::new(target, config.timeout())));
    let running = Arc::new(AtomicBool::new(true));
    let interval = SharedInterval::new(config.publish_interval());
    let settings = PollSettings {
        sample_interval: config.sample_interval(),
        publish_interval: interval.clone(),
        reconnect_delay: config.reconnect_delay(),
        data_topic: config.data_topic.clone(),
    };

    let pollers: Vec<Arc<Poller<ModbusLink>>> = config
        .units
        .iter()
        .map(|unit| {
            Arc::new(Poller::new(
                *unit,
                Arc::clone(&source),
                config.family.forced(),
                Arc::clone(&publisher),
                Arc::clone(&log),
                settings.clone(),
                Arc::clone(&running),
            ))
        })
        .collect();

    let mut _workers = Vec::new();
    for p in &pollers {
        _workers.extend(p.spawn()?);
    }
    log.log(format!(
        "Multi-logger system started - monitoring {} loggers",
        pollers.len()
    ));

    let mut next_status = Instant::now() + config.status_interval();
    loop {
        match commands.recv_timeout(Duration::from_secs(1)) {
            Ok(command) => handle_command(command, &pollers, &interval, &log),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("MQTT event thread exited"),
        }
        if Instant::now() >= next_status {
            log.log(poller::status_line(&pollers));
            next_status = Instant::now() + config.status_interval();
        }
    }
}
