//! Relay and soil-sensor access. [`ActuationBackend`] is the seam to the
//! hardware; [`RelayBank`] decides which relay writes a tick needs, and
//! [`SimBackend`] stands in for the RS485 board during development.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::config::{Config, RELAY_CHANNELS};
use crate::state::{MonitorState, PumpPhase, SoilReading};
use crate::task::Reservoir;

/// Sensor reads and relay writes. Either may fail transiently; callers log
/// and retry on the next tick.
pub trait ActuationBackend {
    fn set_relay(&mut self, channel: u8, on: bool) -> Result<()>;
    fn read_soil(&mut self, zone: &str) -> Result<SoilReading>;
}

// ---------------------------------------------------------------------------
// Relay wiring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayMap {
    mixers: [u8; 3],
    pumpin: u8,
    pumpout: u8,
    zones: BTreeMap<String, u8>,
}

impl RelayMap {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            mixers: [cfg.relays.mixer1, cfg.relays.mixer2, cfg.relays.mixer3],
            pumpin: cfg.relays.pumpin,
            pumpout: cfg.relays.pumpout,
            zones: cfg
                .zones
                .iter()
                .map(|z| (z.zone_id.clone(), z.relay))
                .collect(),
        }
    }

    pub fn zone(&self, zone: &str) -> Option<u8> {
        self.zones.get(zone).copied()
    }

    pub fn mixer(&self, reservoir: Reservoir) -> u8 {
        self.mixers[reservoir.index()]
    }

    /// Every mapped channel with the state `monitor` asks for.
    pub fn desired(&self, monitor: &MonitorState) -> Vec<(u8, bool)> {
        let mut out: Vec<(u8, bool)> = Reservoir::ALL
            .iter()
            .map(|r| (self.mixer(*r), monitor.mixer(*r)))
            .collect();
        out.push((self.pumpin, monitor.pump() == PumpPhase::In));
        out.push((self.pumpout, monitor.pump() == PumpPhase::Out));
        for (zone, on) in monitor.watering_zones() {
            if let Some(channel) = self.zone(zone) {
                out.push((channel, on));
            }
        }
        out
    }

    fn partner_pump(&self, channel: u8) -> Option<u8> {
        if channel == self.pumpin {
            Some(self.pumpout)
        } else if channel == self.pumpout {
            Some(self.pumpin)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Relay bank
// ---------------------------------------------------------------------------

/// Mirror of what the board has confirmed. Only differences are written,
/// OFF before ON. A failed write leaves the mirror alone so the next sync
/// tries again.
#[derive(Debug)]
pub struct RelayBank {
    map: RelayMap,
    applied: HashMap<u8, bool>,
}

impl RelayBank {
    pub fn new(map: RelayMap) -> Self {
        Self {
            map,
            applied: HashMap::new(),
        }
    }

    pub fn applied(&self, channel: u8) -> Option<bool> {
        self.applied.get(&channel).copied()
    }

    /// Push `monitor` to the board. Returns the number of failed writes.
    pub fn sync(&mut self, backend: &mut dyn ActuationBackend, monitor: &MonitorState) -> usize {
        let desired = self.map.desired(monitor);
        let mut failures = 0;

        for (channel, _) in desired.iter().filter(|(_, on)| !on) {
            if !self.write(backend, *channel, false) {
                failures += 1;
            }
        }

        for (channel, _) in desired.iter().filter(|(_, on)| *on) {
            // Never energise a pump until its partner is confirmed off.
            if let Some(partner) = self.map.partner_pump(*channel) {
                if self.applied(partner) != Some(false) {
                    warn!(channel, partner, "pump start deferred: partner not confirmed off");
                    failures += 1;
                    continue;
                }
            }
            if !self.write(backend, *channel, true) {
                failures += 1;
            }
        }

        failures
    }

    /// Switch every board channel off, whatever the mirror says.
    pub fn all_off(&mut self, backend: &mut dyn ActuationBackend) {
        for channel in RELAY_CHANNELS {
            self.applied.remove(&channel);
            self.write(backend, channel, false);
        }
    }

    fn write(&mut self, backend: &mut dyn ActuationBackend, channel: u8, on: bool) -> bool {
        if self.applied(channel) == Some(on) {
            return true;
        }
        match backend.set_relay(channel, on) {
            Ok(()) => {
                debug!(channel, on, "relay set");
                self.applied.insert(channel, on);
                true
            }
            Err(e) => {
                warn!(channel, on, "relay write failed: {e:#}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated board (development: no hardware, soil follows the relays)
// ---------------------------------------------------------------------------

struct SimZone {
    relay: u8,
    moisture: f64,
    temperature: f64,
    humidity: f64,
}

pub struct SimBackend {
    relays: HashMap<u8, bool>,
    zones: HashMap<String, SimZone>,
    fail_rate: f64,
    rng: fastrand::Rng,
}

/// Moisture gained per read while a zone's relay is on.
const WET_RATE: f64 = 4.0;
/// Moisture lost per read otherwise.
const DRY_RATE: f64 = 0.6;

impl SimBackend {
    pub fn new(cfg: &Config) -> Self {
        let mut rng = match cfg.sim.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };

        let zones = cfg
            .zones
            .iter()
            .map(|z| {
                info!(zone = %z.zone_id, relay = z.relay, "[sim] registered zone");
                (
                    z.zone_id.clone(),
                    SimZone {
                        relay: z.relay,
                        moisture: 40.0 + rng.f64() * 30.0,
                        temperature: 24.0 + rng.f64() * 6.0,
                        humidity: 55.0 + rng.f64() * 20.0,
                    },
                )
            })
            .collect();

        info!(fail_rate = cfg.sim.fail_rate, "[sim] relay board initialised (no hardware)");
        Self {
            relays: HashMap::new(),
            zones,
            fail_rate: cfg.sim.fail_rate,
            rng,
        }
    }

    #[cfg(test)]
    pub fn relay(&self, channel: u8) -> bool {
        self.relays.get(&channel).copied().unwrap_or(false)
    }

    fn flaky(&mut self) -> bool {
        self.fail_rate > 0.0 && self.rng.f64() < self.fail_rate
    }

    fn noise(&mut self, sigma: f64) -> f64 {
        (self.rng.f64() - 0.5) * 2.0 * sigma
    }
}

fn round1(v: f64) -> f32 {
    ((v * 10.0).round() / 10.0) as f32
}

impl ActuationBackend for SimBackend {
    fn set_relay(&mut self, channel: u8, on: bool) -> Result<()> {
        if !RELAY_CHANNELS.contains(&channel) {
            bail!("invalid relay number {channel}");
        }
        if self.flaky() {
            bail!("[sim] no response from relay {channel}");
        }
        self.relays.insert(channel, on);
        debug!(channel, "[sim] relay {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    fn read_soil(&mut self, zone: &str) -> Result<SoilReading> {
        if !self.zones.contains_key(zone) {
            bail!("[sim] unknown zone '{zone}'");
        }
        if self.flaky() {
            bail!("[sim] sensor timeout on zone '{zone}'");
        }

        let (dm, dt, dh) = (self.noise(0.3), self.noise(0.2), self.noise(0.5));
        let relays = &self.relays;
        let Some(z) = self.zones.get_mut(zone) else {
            bail!("[sim] unknown zone '{zone}'");
        };
        let watering = relays.get(&z.relay).copied().unwrap_or(false);

        z.moisture += if watering { WET_RATE } else { -DRY_RATE } + dm;
        z.moisture = z.moisture.clamp(0.0, 100.0);
        z.temperature = (z.temperature + dt).clamp(10.0, 45.0);
        z.humidity = (z.humidity + dh + (z.moisture - z.humidity) * 0.05).clamp(0.0, 100.0);

        Ok(SoilReading {
            temperature: round1(z.temperature),
            humidity: round1(z.humidity),
            moisture: round1(z.moisture),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
