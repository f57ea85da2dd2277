mod backend;
mod config;
mod controller;
mod level;
mod mqtt;
mod soil;
mod state;
mod task;

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, path::Path, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use backend::SimBackend;
use config::{Config, Topics};
use controller::{Mailbox, TaskController};
use mqtt::{decode_inbound, Command, EchoGuard, MqttSink, StatusPublisher};
use soil::{LogisticClassifier, SoilReader};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        Config::default()
    };
    config::apply_env(&mut cfg);
    cfg.validate()?;
    let offset = cfg.utc_offset()?;

    info!(
        zones = cfg.zones.len(),
        tick_sec = cfg.controller.tick_sec,
        automatic = cfg.controller.automatic,
        "config loaded"
    );

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
    if let Some(username) = &cfg.mqtt.username {
        mqttoptions.set_credentials(username, cfg.mqtt.password.as_deref().unwrap_or(""));
    }

    let (client, eventloop) = AsyncClient::new(mqttoptions, 64);
    for topic in [&cfg.topics.task, &cfg.topics.monitor] {
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        "subscribed to {} and {}",
        cfg.topics.task,
        cfg.topics.monitor
    );

    let echo = EchoGuard::new(&cfg.topics.monitor);
    let (tx, rx) = controller::mailbox();
    let mut inbound = tokio::spawn(run_inbound(
        eventloop,
        cfg.topics.clone(),
        cfg.zone_ids(),
        echo.clone(),
        tx,
    ));

    // ── Controller ──────────────────────────────────────────────────
    let reader = SoilReader::new(Box::new(LogisticClassifier::from_config(&cfg.classifier)));
    let publisher = StatusPublisher::new(cfg.topics.clone(), Box::new(MqttSink::new(client, echo)));
    let mut ctl = TaskController::new(
        &cfg,
        Box::new(SimBackend::new(&cfg)),
        reader,
        publisher,
        rx,
    );
    ctl.startup();

    let mut ticker = tokio::time::interval(cfg.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => ctl.tick(controller::time_of_day(offset)),
            joined = &mut inbound => {
                break match joined {
                    Ok(Ok(())) => Err(anyhow!("mqtt inbound loop ended")),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e).context("mqtt inbound task panicked"),
                };
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break Ok(());
            }
        }
    };

    // Fail-safe: nothing stays energised once the controller stops.
    ctl.shutdown();
    if let Err(e) = &result {
        error!("controller stopped: {e:#}");
    }
    result
}

/// Poll the broker and feed decoded commands into the controller mailbox.
/// Returns on the first connection error.
async fn run_inbound(
    mut eventloop: EventLoop,
    topics: Topics,
    zones: Vec<String>,
    echo: EchoGuard,
    tx: Mailbox,
) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if echo.is_echo(&p.topic, &p.payload) {
                    debug!(topic = %p.topic, "ignoring echo of own status");
                    continue;
                }
                match decode_inbound(&topics, &zones, &p.topic, &p.payload) {
                    Command::Unrecognized(e) => {
                        warn!(topic = %p.topic, "rejected inbound message: {e}");
                    }
                    cmd => {
                        debug!(topic = %p.topic, ?cmd, "inbound command");
                        tx.send(cmd).context("controller mailbox closed")?;
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt connected"),
            Ok(Event::Incoming(Packet::Disconnect)) => bail!("mqtt broker disconnected"),
            Ok(_) => {}
            Err(e) => return Err(e).context("mqtt connection failed"),
        }
    }
}
