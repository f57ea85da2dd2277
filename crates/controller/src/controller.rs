//! The tick-driven fill/drain state machine.
//!
//! Each tick drains the command mailbox, samples every zone, advances the
//! active task by at most one step, pushes the result to the relays and
//! publishes status. Everything it touches is owned here; remote writers
//! only reach it through the mailbox, so a command sent mid-tick lands on
//! the next one.

use std::collections::BTreeMap;
use time::{OffsetDateTime, Time, UtcOffset};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::backend::{ActuationBackend, RelayBank, RelayMap};
use crate::config::{Config, ControllerConfig};
use crate::level::LevelLedger;
use crate::mqtt::{Command, StatusPublisher};
use crate::soil::{Decision, SoilReader};
use crate::state::{HistoryRecord, MonitorState, Outcome, PumpPhase, SoilReading, StatusReport};
use crate::task::{hh_mm, Reservoir, Task, TaskId, TaskQueue};

pub type Mailbox = UnboundedSender<Command>;

pub fn mailbox() -> (Mailbox, UnboundedReceiver<Command>) {
    mpsc::unbounded_channel()
}

/// Local wall-clock time of day.
pub fn time_of_day(offset: UtcOffset) -> Time {
    OffsetDateTime::now_utc().to_offset(offset).time()
}

// ---------------------------------------------------------------------------
// Task progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Mixers charging, pump-in on.
    CycleFill,
    /// Targets met, pump-out on. The next tick closes the cycle.
    CycleDrain,
}

/// Which steps of the current cycle are finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneSet {
    reservoirs: [bool; 3],
    pump: bool,
}

impl DoneSet {
    pub fn contains(&self, reservoir: Reservoir) -> bool {
        self.reservoirs[reservoir.index()]
    }

    fn insert(&mut self, reservoir: Reservoir) {
        self.reservoirs[reservoir.index()] = true;
    }

    fn all_reservoirs(&self) -> bool {
        Reservoir::ALL.iter().all(|r| self.contains(*r))
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub id: TaskId,
    /// Working copy; `cycle` counts down the cycles still to run.
    pub task: Task,
    pub done: DoneSet,
}

/// What one call to [`ControllerState::advance`] did.
#[derive(Debug, PartialEq)]
enum Step {
    Idle,
    Promoted { name: String },
    Filling,
    PumpOut { name: String },
    NextCycle { name: String, remaining: u32 },
    Finished(HistoryRecord),
}

// ---------------------------------------------------------------------------
// Owned state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ControllerState {
    pub queue: TaskQueue,
    pub ledger: LevelLedger,
    pub monitor: MonitorState,
    pub soil: BTreeMap<String, SoilReading>,
    pub current: Option<ActiveTask>,
}

impl ControllerState {
    pub fn new(zones: &[String], automatic: bool) -> Self {
        Self {
            queue: TaskQueue::new(),
            ledger: LevelLedger::new(),
            monitor: MonitorState::new(zones, automatic),
            soil: BTreeMap::new(),
            current: None,
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.current {
            None => Phase::Idle,
            Some(active) if active.done.pump => Phase::CycleDrain,
            Some(_) => Phase::CycleFill,
        }
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            monitor: self.monitor.to_snapshot(),
            level: self.ledger.snapshot(),
            soil: self.soil.clone(),
        }
    }

    /// Apply one mailbox command. Returns true if the queue changed.
    fn apply(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::NewTask(mut task) => {
                task.is_active = false;
                let name = task.name.clone();
                let start = hh_mm::format(task.start_time);
                let id = self.queue.enqueue(task);
                info!(task = %name, id = %id, start = %start, "task queued");
                true
            }
            Command::SetMode(automatic) => {
                info!(automatic, "mode changed");
                self.monitor.automatic = automatic;
                false
            }
            Command::SetWatering(zone, on) => {
                if self.monitor.has_zone(&zone) {
                    debug!(zone = %zone, on, "watering override");
                    self.monitor.set_watering(&zone, on);
                } else {
                    warn!(zone = %zone, "watering command for unknown zone");
                }
                false
            }
            Command::SetMixer(reservoir, on) => {
                debug!(mixer = %reservoir, on, "mixer override");
                self.monitor.set_mixer(reservoir, on);
                false
            }
            Command::SetPump(pump, on) => {
                debug!(?pump, on, "pump override");
                self.monitor.set_pump(pump, on);
                false
            }
            Command::Batch(cmds) => cmds
                .into_iter()
                .fold(false, |changed, cmd| self.apply(cmd) | changed),
            Command::Unrecognized(e) => {
                warn!("dropping inbound message: {e}");
                false
            }
        }
    }

    /// One step of the task state machine.
    fn advance(&mut self, now: Time, cfg: &ControllerConfig) -> Step {
        let (expired, draining) = match &self.current {
            None => return self.promote(now),
            Some(active) => (active.task.end_time <= now, active.done.pump),
        };
        if expired {
            return self.finish(Outcome::Expired, now);
        }
        if draining {
            return self.close_cycle(now);
        }
        self.fill(cfg)
    }

    fn promote(&mut self, now: Time) -> Step {
        let (id, mut task) = match self.queue.earliest() {
            Some((id, task)) if task.start_time <= now => (id, task.clone()),
            _ => return Step::Idle,
        };
        task.is_active = true;
        self.queue.set_active(id, true);
        self.monitor.set_pump_phase(PumpPhase::In);
        let name = task.name.clone();
        self.current = Some(ActiveTask {
            id,
            task,
            done: DoneSet::default(),
        });
        Step::Promoted { name }
    }

    fn fill(&mut self, cfg: &ControllerConfig) -> Step {
        let Some(active) = self.current.as_mut() else {
            return Step::Idle;
        };
        for r in Reservoir::ALL {
            if self.ledger.level(r) < active.task.target(r) {
                self.monitor.set_mixer(r, true);
                self.ledger.charge(r, cfg.mixer_step);
                self.ledger.drain_water(cfg.task_water_drain);
            } else {
                self.monitor.set_mixer(r, false);
                active.done.insert(r);
            }
        }
        if !active.done.all_reservoirs() {
            return Step::Filling;
        }
        self.monitor.set_pump_phase(PumpPhase::Out);
        active.done.pump = true;
        Step::PumpOut {
            name: active.task.name.clone(),
        }
    }

    fn close_cycle(&mut self, now: Time) -> Step {
        let Some(active) = self.current.as_mut() else {
            return Step::Idle;
        };
        self.ledger.reset_mixers();
        active.done.clear();
        active.task.cycle = active.task.cycle.saturating_sub(1);
        if active.task.cycle == 0 {
            return self.finish(Outcome::Completed, now);
        }
        self.monitor.set_pump_phase(PumpPhase::In);
        for r in Reservoir::ALL {
            self.monitor.set_mixer(r, false);
        }
        Step::NextCycle {
            name: active.task.name.clone(),
            remaining: active.task.cycle,
        }
    }

    /// Retire the current task: out of the queue, actuators off, archived
    /// as submitted.
    fn finish(&mut self, outcome: Outcome, now: Time) -> Step {
        let Some(active) = self.current.take() else {
            return Step::Idle;
        };
        self.monitor.clear_actuators();
        let mut task = self.queue.remove(active.id).unwrap_or(active.task);
        task.is_active = false;
        Step::Finished(HistoryRecord {
            task,
            outcome,
            finished_at: now,
        })
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct TaskController {
    state: ControllerState,
    cfg: ControllerConfig,
    zones: Vec<String>,
    backend: Box<dyn ActuationBackend + Send>,
    soil_reader: SoilReader,
    relays: RelayBank,
    publisher: StatusPublisher,
    inbox: UnboundedReceiver<Command>,
}

impl TaskController {
    pub fn new(
        config: &Config,
        backend: Box<dyn ActuationBackend + Send>,
        soil_reader: SoilReader,
        publisher: StatusPublisher,
        inbox: UnboundedReceiver<Command>,
    ) -> Self {
        let zones = config.zone_ids();
        Self {
            state: ControllerState::new(&zones, config.controller.automatic),
            cfg: config.controller.clone(),
            zones,
            backend,
            soil_reader,
            relays: RelayBank::new(RelayMap::from_config(config)),
            publisher,
            inbox,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Known-safe starting point: every relay off, initial status out.
    pub fn startup(&mut self) {
        self.relays.all_off(self.backend.as_mut());
        self.publisher.publish_task_list(&self.state.queue);
        self.publisher.publish_status(&self.state.report());
    }

    pub fn shutdown(&mut self) {
        info!("switching all relays off");
        self.state.monitor.clear_actuators();
        self.relays.all_off(self.backend.as_mut());
    }

    pub fn tick(&mut self, now: Time) {
        let mut queue_changed = self.drain_inbox();
        self.evaluate_zones();

        match self.state.advance(now, &self.cfg) {
            Step::Idle | Step::Filling => {}
            Step::Promoted { name } => {
                info!(task = %name, "task started, pumping in");
                queue_changed = true;
            }
            Step::PumpOut { name } => info!(task = %name, "mix ready, pumping out"),
            Step::NextCycle { name, remaining } => {
                info!(task = %name, remaining, "cycle finished, next cycle");
            }
            Step::Finished(record) => {
                info!(
                    task = %record.task.name,
                    outcome = ?record.outcome,
                    "task finished"
                );
                self.publisher.publish_history(&record);
                queue_changed = true;
            }
        }

        let failures = self.relays.sync(self.backend.as_mut(), &self.state.monitor);
        if failures > 0 {
            warn!(failures, "relay sync incomplete, retrying next tick");
        }

        if queue_changed {
            self.publisher.publish_task_list(&self.state.queue);
        }
        self.publisher.publish_status(&self.state.report());
        debug!(
            phase = ?self.phase(),
            queued = self.state.queue.len(),
            water = self.state.ledger.water(),
            "tick done"
        );
    }

    fn drain_inbox(&mut self) -> bool {
        let mut queue_changed = false;
        while let Ok(cmd) = self.inbox.try_recv() {
            queue_changed |= self.state.apply(cmd);
        }
        queue_changed
    }

    fn evaluate_zones(&mut self) {
        for zone in &self.zones {
            match self.soil_reader.read(self.backend.as_mut(), zone) {
                Ok(sample) => {
                    self.state.soil.insert(zone.clone(), sample.reading);
                    if self.state.monitor.automatic {
                        self.state
                            .monitor
                            .set_watering(zone, sample.decision == Decision::Water);
                    }
                }
                Err(e) => warn!(zone = %zone, "soil read failed, keeping last value: {e:#}"),
            }
        }

        let watering = self
            .state
            .monitor
            .watering_zones()
            .filter(|(_, on)| *on)
            .count();
        for _ in 0..watering {
            self.state.ledger.drain_water(self.cfg.zone_water_drain);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
