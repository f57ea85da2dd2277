use serde::Serialize;
use std::collections::BTreeMap;

use crate::level::LevelSnapshot;
use crate::task::{Reservoir, Task};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Which transfer pump is running. Both at once is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PumpPhase {
    #[default]
    Off,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Pump {
    #[serde(rename = "pumpin")]
    In,
    #[serde(rename = "pumpout")]
    Out,
}

/// Actuation indicators the controller owns and publishes every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorState {
    pub automatic: bool,
    watering: BTreeMap<String, bool>,
    mixer: [bool; 3],
    pump: PumpPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SoilReading {
    pub temperature: f32,
    pub humidity: f32,
    pub moisture: f32,
}

// ---------------------------------------------------------------------------
// JSON snapshots (what goes out on the wire)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpSnapshot {
    pub pumpin: bool,
    pub pumpout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub automatic: bool,
    pub watering: BTreeMap<String, bool>,
    pub mixer: BTreeMap<Reservoir, bool>,
    pub pump: PumpSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Expired,
}

/// A finished task as archived to the history topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(flatten)]
    pub task: Task,
    pub outcome: Outcome,
    #[serde(serialize_with = "crate::task::hh_mm::serialize")]
    pub finished_at: time::Time,
}

/// Everything a tick publishes, taken after the tick has settled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub monitor: MonitorSnapshot,
    pub level: LevelSnapshot,
    pub soil: BTreeMap<String, SoilReading>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl MonitorState {
    pub fn new(zones: &[String], automatic: bool) -> Self {
        Self {
            automatic,
            watering: zones.iter().map(|z| (z.clone(), false)).collect(),
            mixer: [false; 3],
            pump: PumpPhase::Off,
        }
    }

    pub fn has_zone(&self, zone: &str) -> bool {
        self.watering.contains_key(zone)
    }

    #[cfg(test)]
    pub fn watering(&self, zone: &str) -> bool {
        self.watering.get(zone).copied().unwrap_or(false)
    }

    /// Unknown zones are ignored.
    pub fn set_watering(&mut self, zone: &str, on: bool) {
        if let Some(slot) = self.watering.get_mut(zone) {
            *slot = on;
        }
    }

    pub fn watering_zones(&self) -> impl Iterator<Item = (&str, bool)> {
        self.watering.iter().map(|(z, on)| (z.as_str(), *on))
    }

    pub fn mixer(&self, reservoir: Reservoir) -> bool {
        self.mixer[reservoir.index()]
    }

    pub fn set_mixer(&mut self, reservoir: Reservoir, on: bool) {
        self.mixer[reservoir.index()] = on;
    }

    pub fn pump(&self) -> PumpPhase {
        self.pump
    }

    pub fn set_pump_phase(&mut self, phase: PumpPhase) {
        self.pump = phase;
    }

    /// Switching one pump on stops the other. Switching a pump off only
    /// matters if it is the one running.
    pub fn set_pump(&mut self, pump: Pump, on: bool) {
        self.pump = match (pump, on) {
            (Pump::In, true) => PumpPhase::In,
            (Pump::Out, true) => PumpPhase::Out,
            (Pump::In, false) if self.pump == PumpPhase::In => PumpPhase::Off,
            (Pump::Out, false) if self.pump == PumpPhase::Out => PumpPhase::Off,
            _ => self.pump,
        };
    }

    /// Pumps off, every mixer off. Watering is zone business and untouched.
    pub fn clear_actuators(&mut self) {
        self.pump = PumpPhase::Off;
        self.mixer = [false; 3];
    }

    pub fn to_snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            automatic: self.automatic,
            watering: self.watering.clone(),
            mixer: Reservoir::ALL
                .iter()
                .map(|r| (*r, self.mixer(*r)))
                .collect(),
            pump: PumpSnapshot {
                pumpin: self.pump == PumpPhase::In,
                pumpout: self.pump == PumpPhase::Out,
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
