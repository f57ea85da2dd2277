//! Scheduled mixing tasks and the start-time ordered queue that holds them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::Time;

/// Highest level a reservoir target may ask for.
pub const MAX_TARGET: u8 = 100;

// ---------------------------------------------------------------------------
// Reservoir ids
// ---------------------------------------------------------------------------

/// One of the three mixer tanks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reservoir {
    Mixer1,
    Mixer2,
    Mixer3,
}

impl Reservoir {
    pub const ALL: [Reservoir; 3] = [Reservoir::Mixer1, Reservoir::Mixer2, Reservoir::Mixer3];

    pub fn index(self) -> usize {
        match self {
            Self::Mixer1 => 0,
            Self::Mixer2 => 1,
            Self::Mixer3 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mixer1 => "mixer1",
            Self::Mixer2 => "mixer2",
            Self::Mixer3 => "mixer3",
        }
    }
}

impl fmt::Display for Reservoir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of scheduled mixing work, in the dashboard's JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    #[serde(with = "hh_mm")]
    pub start_time: Time,
    #[serde(with = "hh_mm")]
    pub end_time: Time,
    pub cycle: u32,
    /// Per-cycle target level for each reservoir. Missing reservoirs mean 0.
    #[serde(rename = "task", alias = "targets", default)]
    pub targets: BTreeMap<Reservoir, u8>,
    #[serde(default)]
    pub is_active: bool,
}

impl Task {
    pub fn target(&self, reservoir: Reservoir) -> u8 {
        self.targets.get(&reservoir).copied().unwrap_or(0)
    }

    /// Check the ingestion invariants. Reports every violation at once.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors: Vec<String> = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name is empty".to_string());
        }
        if self.cycle == 0 {
            errors.push("cycle must be at least 1".to_string());
        }
        for (reservoir, target) in &self.targets {
            if *target > MAX_TARGET {
                errors.push(format!(
                    "{reservoir} target {target} out of range [0, {MAX_TARGET}]"
                ));
            }
        }
        if self.end_time <= self.start_time {
            errors.push(format!(
                "endTime {} must be after startTime {}",
                hh_mm::format(self.end_time),
                hh_mm::format(self.start_time)
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

/// `HH:MM` wall-clock times, compared by time of day only.
pub(crate) mod hh_mm {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use time::macros::format_description;
    use time::Time;

    pub(crate) fn parse(s: &str) -> Result<Time, time::error::Parse> {
        Time::parse(s.trim(), format_description!("[hour]:[minute]"))
    }

    pub(crate) fn format(t: Time) -> String {
        format!("{:02}:{:02}", t.hour(), t.minute())
    }

    pub fn serialize<S: Serializer>(t: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(|e| de::Error::custom(format!("invalid time '{s}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Identity of a queued task. Two tasks with identical fields still get
/// distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Entry {
    id: TaskId,
    task: Task,
}

/// Pending tasks, ascending by start time; equal start times keep
/// insertion order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: Vec<Entry>,
    next_id: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, task: Task) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        let pos = self
            .entries
            .partition_point(|e| e.task.start_time <= task.start_time);
        self.entries.insert(pos, Entry { id, task });
        id
    }

    /// Head of the queue, without removing it.
    pub fn earliest(&self) -> Option<(TaskId, &Task)> {
        self.entries.first().map(|e| (e.id, &e.task))
    }

    /// Remove by identity. Returns `None` if the task is not queued.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos).task)
    }

    /// The only mutation a queued task ever sees.
    pub fn set_active(&mut self, id: TaskId, active: bool) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.task.is_active = active;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.task)
    }

    #[cfg(test)]
    pub fn contains(&self, id: TaskId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.entries.iter().map(|e| &e.task)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
