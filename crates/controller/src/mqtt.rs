use anyhow::Result;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::Topics;
use crate::state::{HistoryRecord, Pump, StatusReport};
use crate::task::{Reservoir, Task, TaskQueue};

// ---------------------------------------------------------------------------
// Inbound commands
// ---------------------------------------------------------------------------

/// A decoded inbound message, ready for the controller's mailbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NewTask(Task),
    SetMode(bool),
    SetWatering(String, bool),
    SetMixer(Reservoir, bool),
    SetPump(Pump, bool),
    /// Several fields from one monitor message, applied in order.
    Batch(Vec<Command>),
    Unrecognized(DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no handler for topic '{0}'")]
    UnknownTopic(String),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("unknown zone '{0}'")]
    UnknownZone(String),
    #[error("pumpin and pumpout cannot both be on")]
    ConflictingPump,
    #[error("monitor update changes nothing")]
    EmptyUpdate,
}

/// Sparse monitor message. Missing fields leave state untouched; unknown
/// keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct MonitorPatch {
    automatic: Option<bool>,
    #[serde(default)]
    watering: BTreeMap<String, bool>,
    #[serde(default)]
    mixer: BTreeMap<Reservoir, bool>,
    pump: Option<PumpPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct PumpPatch {
    pumpin: Option<bool>,
    pumpout: Option<bool>,
}

/// Turn one inbound (topic, payload) into a [`Command`]. Never fails:
/// anything unusable comes back as [`Command::Unrecognized`].
pub fn decode_inbound(topics: &Topics, zones: &[String], topic: &str, payload: &[u8]) -> Command {
    let decoded = if topic == topics.task {
        decode_task(payload)
    } else if topic == topics.monitor {
        decode_monitor(zones, payload)
    } else {
        Err(DecodeError::UnknownTopic(topic.to_string()))
    };
    decoded.unwrap_or_else(Command::Unrecognized)
}

fn parse_json(payload: &[u8]) -> Result<serde_json::Value, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| DecodeError::InvalidJson(e.to_string()))
}

fn decode_task(payload: &[u8]) -> Result<Command, DecodeError> {
    let value = parse_json(payload)?;
    let mut task: Task =
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidTask(e.to_string()))?;
    task.validate().map_err(DecodeError::InvalidTask)?;
    task.is_active = false;
    Ok(Command::NewTask(task))
}

fn decode_monitor(zones: &[String], payload: &[u8]) -> Result<Command, DecodeError> {
    let value = parse_json(payload)?;
    let patch: MonitorPatch =
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    if let Some(zone) = patch.watering.keys().find(|z| !zones.contains(z)) {
        return Err(DecodeError::UnknownZone(zone.clone()));
    }

    let mut cmds = Vec::new();
    if let Some(on) = patch.automatic {
        cmds.push(Command::SetMode(on));
    }
    cmds.extend(
        patch
            .watering
            .into_iter()
            .map(|(zone, on)| Command::SetWatering(zone, on)),
    );
    cmds.extend(
        patch
            .mixer
            .into_iter()
            .map(|(r, on)| Command::SetMixer(r, on)),
    );
    if let Some(pump) = patch.pump {
        if pump.pumpin == Some(true) && pump.pumpout == Some(true) {
            return Err(DecodeError::ConflictingPump);
        }
        let fields = [(Pump::In, pump.pumpin), (Pump::Out, pump.pumpout)];
        // OFF first so the running pump stops before the other starts.
        for want in [false, true] {
            for (p, on) in fields {
                if on == Some(want) {
                    cmds.push(Command::SetPump(p, want));
                }
            }
        }
    }

    match cmds.len() {
        0 => Err(DecodeError::EmptyUpdate),
        1 => Ok(cmds.remove(0)),
        _ => Ok(Command::Batch(cmds)),
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

pub trait StatusSink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Remembers the last few payloads published on one topic so that the
/// broker echoing them back is not taken as a remote command.
#[derive(Debug, Clone)]
pub struct EchoGuard {
    topic: String,
    recent: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

const ECHO_DEPTH: usize = 8;

impl EchoGuard {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(ECHO_DEPTH))),
        }
    }

    pub fn remember(&self, topic: &str, payload: &[u8]) {
        if topic != self.topic {
            return;
        }
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == ECHO_DEPTH {
                recent.pop_front();
            }
            recent.push_back(payload.to_vec());
        }
    }

    /// True if `payload` is one of ours. Matches stay remembered until they
    /// age out, so a redelivered echo is dropped as well.
    pub fn is_echo(&self, topic: &str, payload: &[u8]) -> bool {
        if topic != self.topic {
            return false;
        }
        match self.recent.lock() {
            Ok(recent) => recent.iter().any(|p| p.as_slice() == payload),
            Err(_) => false,
        }
    }
}

pub struct MqttSink {
    client: AsyncClient,
    echo: EchoGuard,
}

impl MqttSink {
    pub fn new(client: AsyncClient, echo: EchoGuard) -> Self {
        Self { client, echo }
    }
}

impl StatusSink for MqttSink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.echo.remember(topic, &payload);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

/// Serializes status structures onto their topics. Publishing never stops
/// the controller; failures are logged and the next tick publishes again.
pub struct StatusPublisher {
    topics: Topics,
    sink: Box<dyn StatusSink + Send>,
}

impl StatusPublisher {
    pub fn new(topics: Topics, sink: Box<dyn StatusSink + Send>) -> Self {
        Self { topics, sink }
    }

    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(p) => p,
            Err(e) => {
                error!(topic, "failed to serialize status: {e}");
                return;
            }
        };
        match self.sink.publish(topic, payload) {
            Ok(()) => debug!(topic, "published"),
            Err(e) => warn!(topic, "publish failed: {e:#}"),
        }
    }

    pub fn publish_status(&self, report: &StatusReport) {
        self.publish(&self.topics.monitor, &report.monitor);
        self.publish(&self.topics.level, &report.level);
        self.publish(&self.topics.soil, &report.soil);
    }

    pub fn publish_task_list(&self, queue: &TaskQueue) {
        let tasks: Vec<&Task> = queue.iter().collect();
        self.publish(&self.topics.task_list, &tasks);
    }

    pub fn publish_history(&self, record: &HistoryRecord) {
        self.publish(&self.topics.task_history, record);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::level::LevelLedger;
    use crate::state::MonitorState;
    use anyhow::bail;

    /// Captures every publish as (topic, JSON).
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        pub(crate) fail: bool,
    }

    impl RecordingSink {
        pub(crate) fn on(&self, topic: &str) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, v)| v.clone())
                .collect()
        }

        pub(crate) fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    impl StatusSink for RecordingSink {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            if self.fail {
                bail!("broker unreachable");
            }
            let value = serde_json::from_slice(&payload)?;
            self.sent.lock().unwrap().push((topic.to_string(), value));
            Ok(())
        }
    }

    fn topics() -> Topics {
        Topics::default()
    }

    fn zones() -> Vec<String> {
        vec!["area1".into(), "area2".into(), "area3".into()]
    }

    fn decode(topic: &str, payload: &str) -> Command {
        decode_inbound(&topics(), &zones(), topic, payload.as_bytes())
    }

    // -- Task topic ---------------------------------------------------------

    #[test]
    fn task_message_decodes_inactive() {
        let cmd = decode(
            "task",
            r#"{"name":"T1","cycle":2,"task":{"mixer1":10,"mixer3":5},"isActive":true,
                "startTime":"06:00","endTime":"07:30"}"#,
        );
        let Command::NewTask(task) = cmd else {
            panic!("expected NewTask, got {cmd:?}");
        };
        assert_eq!(task.name, "T1");
        assert_eq!(task.cycle, 2);
        assert_eq!(task.target(Reservoir::Mixer1), 10);
        assert_eq!(task.target(Reservoir::Mixer2), 0);
        assert!(!task.is_active);
    }

    #[test]
    fn task_message_not_json() {
        assert!(matches!(
            decode("task", "{not json"),
            Command::Unrecognized(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn task_message_missing_start_time() {
        assert!(matches!(
            decode("task", r#"{"name":"T","cycle":1,"task":{},"endTime":"07:00"}"#),
            Command::Unrecognized(DecodeError::InvalidTask(_))
        ));
    }

    #[test]
    fn task_message_bad_clock() {
        assert!(matches!(
            decode(
                "task",
                r#"{"name":"T","cycle":1,"task":{},"startTime":"25:00","endTime":"07:00"}"#
            ),
            Command::Unrecognized(DecodeError::InvalidTask(_))
        ));
    }

    #[test]
    fn task_message_zero_cycle_rejected() {
        assert!(matches!(
            decode(
                "task",
                r#"{"name":"T","cycle":0,"task":{"mixer1":1},"startTime":"06:00","endTime":"07:00"}"#
            ),
            Command::Unrecognized(DecodeError::InvalidTask(_))
        ));
    }

    #[test]
    fn task_message_target_over_100_rejected() {
        assert!(matches!(
            decode(
                "task",
                r#"{"name":"T","cycle":1,"task":{"mixer2":101},"startTime":"06:00","endTime":"07:00"}"#
            ),
            Command::Unrecognized(DecodeError::InvalidTask(_))
        ));
    }

    #[test]
    fn task_message_unknown_reservoir_rejected() {
        assert!(matches!(
            decode(
                "task",
                r#"{"name":"T","cycle":1,"task":{"mixer4":1},"startTime":"06:00","endTime":"07:00"}"#
            ),
            Command::Unrecognized(DecodeError::InvalidTask(_))
        ));
    }

    // -- Monitor topic ------------------------------------------------------

    #[test]
    fn monitor_single_field() {
        assert_eq!(
            decode("monitor", r#"{"automatic":true}"#),
            Command::SetMode(true)
        );
    }

    #[test]
    fn monitor_watering_toggle() {
        assert_eq!(
            decode("monitor", r#"{"watering":{"area2":true}}"#),
            Command::SetWatering("area2".into(), true)
        );
    }

    #[test]
    fn monitor_several_fields_batch_in_order() {
        let cmd = decode(
            "monitor",
            r#"{"automatic":false,"watering":{"area1":true},"mixer":{"mixer3":true}}"#,
        );
        assert_eq!(
            cmd,
            Command::Batch(vec![
                Command::SetMode(false),
                Command::SetWatering("area1".into(), true),
                Command::SetMixer(Reservoir::Mixer3, true),
            ])
        );
    }

    #[test]
    fn monitor_pump_swap_puts_off_first() {
        let cmd = decode("monitor", r#"{"pump":{"pumpin":true,"pumpout":false}}"#);
        assert_eq!(
            cmd,
            Command::Batch(vec![
                Command::SetPump(Pump::Out, false),
                Command::SetPump(Pump::In, true),
            ])
        );
    }

    #[test]
    fn monitor_both_pumps_on_rejected() {
        assert_eq!(
            decode("monitor", r#"{"pump":{"pumpin":true,"pumpout":true}}"#),
            Command::Unrecognized(DecodeError::ConflictingPump)
        );
    }

    #[test]
    fn monitor_unknown_zone_rejects_whole_message() {
        assert_eq!(
            decode("monitor", r#"{"automatic":true,"watering":{"area9":true}}"#),
            Command::Unrecognized(DecodeError::UnknownZone("area9".into()))
        );
    }

    #[test]
    fn monitor_unknown_keys_only_is_empty() {
        assert_eq!(
            decode("monitor", r#"{"colour":"blue"}"#),
            Command::Unrecognized(DecodeError::EmptyUpdate)
        );
    }

    #[test]
    fn monitor_wrong_type_rejected() {
        assert!(matches!(
            decode("monitor", r#"{"automatic":"yes"}"#),
            Command::Unrecognized(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn other_topic_unrecognized() {
        assert_eq!(
            decode("soil", "{}"),
            Command::Unrecognized(DecodeError::UnknownTopic("soil".into()))
        );
    }

    // -- Echo guard ---------------------------------------------------------

    #[test]
    fn echo_guard_drops_redelivered_echo() {
        let guard = EchoGuard::new("monitor");
        guard.remember("monitor", b"{\"automatic\":true}");
        assert!(guard.is_echo("monitor", b"{\"automatic\":true}"));
        assert!(guard.is_echo("monitor", b"{\"automatic\":true}"));
        assert!(!guard.is_echo("monitor", b"{\"automatic\":false}"));
    }

    #[test]
    fn echo_guard_ignores_other_topics() {
        let guard = EchoGuard::new("monitor");
        guard.remember("level", b"{}");
        assert!(!guard.is_echo("level", b"{}"));
        assert!(!guard.is_echo("monitor", b"{}"));
    }

    #[test]
    fn echo_guard_forgets_oldest() {
        let guard = EchoGuard::new("monitor");
        for i in 0..=ECHO_DEPTH {
            guard.remember("monitor", format!("{i}").as_bytes());
        }
        assert!(!guard.is_echo("monitor", b"0"));
        assert!(guard.is_echo("monitor", b"1"));
    }

    // -- MqttSink -----------------------------------------------------------

    #[tokio::test]
    async fn mqtt_sink_remembers_monitor_payloads() {
        let opts = rumqttc::MqttOptions::new("test-sink", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 4);
        let echo = EchoGuard::new("monitor");
        let sink = MqttSink::new(client, echo.clone());

        sink.publish("monitor", b"{\"automatic\":false}".to_vec()).unwrap();
        sink.publish("level", b"{\"water\":100}".to_vec()).unwrap();

        assert!(echo.is_echo("monitor", b"{\"automatic\":false}"));
        assert!(!echo.is_echo("level", b"{\"water\":100}"));
    }

    #[tokio::test]
    async fn mqtt_sink_full_queue_is_an_error() {
        let opts = rumqttc::MqttOptions::new("test-sink", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 1);
        let sink = MqttSink::new(client, EchoGuard::new("monitor"));

        sink.publish("level", b"{}".to_vec()).unwrap();
        assert!(sink.publish("level", b"{}".to_vec()).is_err());
    }

    // -- StatusPublisher ----------------------------------------------------

    #[test]
    fn publish_status_writes_three_topics() {
        let sink = RecordingSink::default();
        let publisher = StatusPublisher::new(topics(), Box::new(sink.clone()));
        let report = StatusReport {
            monitor: MonitorState::new(&zones(), false).to_snapshot(),
            level: LevelLedger::new().snapshot(),
            soil: BTreeMap::new(),
        };
        publisher.publish_status(&report);

        assert_eq!(sink.on("monitor").len(), 1);
        assert_eq!(sink.on("level")[0]["water"], 100);
        assert_eq!(sink.on("soil")[0], serde_json::json!({}));
    }

    #[test]
    fn publish_task_list_is_ordered_array() {
        let sink = RecordingSink::default();
        let publisher = StatusPublisher::new(topics(), Box::new(sink.clone()));
        let mut queue = TaskQueue::new();
        for (name, start) in [("late", "08:00"), ("early", "06:00")] {
            let json = format!(
                r#"{{"name":"{name}","cycle":1,"task":{{}},"startTime":"{start}","endTime":"09:00"}}"#
            );
            queue.enqueue(serde_json::from_str(&json).unwrap());
        }
        publisher.publish_task_list(&queue);

        let list = &sink.on("taskList")[0];
        assert_eq!(list[0]["name"], "early");
        assert_eq!(list[1]["name"], "late");
        assert_eq!(list[0]["isActive"], false);
    }

    #[test]
    fn publish_failure_is_swallowed() {
        let sink = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };
        let publisher = StatusPublisher::new(topics(), Box::new(sink.clone()));
        publisher.publish("monitor", &serde_json::json!({"a": 1}));
        assert!(sink.on("monitor").is_empty());
    }
}
