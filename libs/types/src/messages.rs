//! Runtime message model
//!
//! Every message carries a fixed header (consumer, priority, arrival time and
//! the sender's identity) plus one typed body. The kind is never stored
//! separately: it is derived from the body so the two cannot disagree.
//!
//! Messages are immutable once built. Mailboxes hold them behind `Arc` so a
//! broadcast can hand the same message to many objects without copying the
//! payload.

use crate::identifiers::{NodeId, ObjectId, TimerId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Invalid raw value for a wire-level enum
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid priority code: {0}")]
    InvalidPriority(u8),

    #[error("Invalid system command code: {0}")]
    InvalidCommand(u8),
}

/// Delivery priority class
///
/// Ordering is strict: `High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
}

impl Priority {
    /// All classes, highest first (the order mailboxes are drained in)
    pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Medium),
            2 => Ok(Priority::High),
            other => Err(ValidationError::InvalidPriority(other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message kind, derived from the body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    SensorUpdate,
    TimerFired,
    SystemCommand,
    Confirmation,
    Other,
}

/// Wall-clock arrival time with microsecond resolution
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: u32,
}

impl Timestamp {
    pub const fn new(sec: i64, usec: u32) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            sec: now.timestamp(),
            usec: now.timestamp_subsec_micros(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp(self.sec, self.usec.saturating_mul(1000)) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
            None => write!(f, "{}.{:06}", self.sec, self.usec),
        }
    }
}

/// New value of a sensor, or a threshold crossing on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub sensor: ObjectId,
    pub value: i64,
    pub undefined: bool,
    /// Threshold id when the update reports a threshold crossing
    pub threshold: Option<i64>,
    pub sensor_time: Timestamp,
}

impl SensorUpdate {
    pub fn new(sensor: ObjectId, value: i64) -> Self {
        Self {
            sensor,
            value,
            undefined: false,
            threshold: None,
            sensor_time: Timestamp::now(),
        }
    }
}

/// A timer ordered by the consumer became due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerFired {
    pub timer: TimerId,
}

/// System-level command delivered to objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SystemCommand {
    Unknown = 0,
    StartUp = 1,
    FoldUp = 2,
    Finish = 3,
    WatchDog = 4,
    Reconfigure = 5,
    NetworkInfo = 6,
    LogRotate = 7,
}

impl TryFrom<u8> for SystemCommand {
    type Error = ValidationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => SystemCommand::Unknown,
            1 => SystemCommand::StartUp,
            2 => SystemCommand::FoldUp,
            3 => SystemCommand::Finish,
            4 => SystemCommand::WatchDog,
            5 => SystemCommand::Reconfigure,
            6 => SystemCommand::NetworkInfo,
            7 => SystemCommand::LogRotate,
            other => return Err(ValidationError::InvalidCommand(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub command: SystemCommand,
    /// Command arguments (e.g. node id and link state for `NetworkInfo`)
    pub data: [i64; 2],
}

/// Operator acknowledgement of a sensor event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub sensor: ObjectId,
    pub sensor_value: f64,
    pub sensor_time: Timestamp,
    pub confirm_time: Timestamp,
    pub broadcast: bool,
    /// Already forwarded once; must not be stored or forwarded again
    pub forward: bool,
}

/// Application-defined payload the runtime does not interpret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaquePayload {
    pub tag: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Sensor(SensorUpdate),
    Timer(TimerFired),
    System(SystemMessage),
    Confirm(Confirmation),
    Other(OpaquePayload),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Sensor(_) => MessageKind::SensorUpdate,
            MessageBody::Timer(_) => MessageKind::TimerFired,
            MessageBody::System(_) => MessageKind::SystemCommand,
            MessageBody::Confirm(_) => MessageKind::Confirmation,
            MessageBody::Other(_) => MessageKind::Other,
        }
    }
}

/// Fixed header every message carries on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub node: NodeId,
    pub supplier: ObjectId,
    pub consumer: ObjectId,
    pub priority: Priority,
    pub timestamp: Timestamp,
}

impl MessageHeader {
    fn with_priority(priority: Priority) -> Self {
        Self {
            node: NodeId::DEFAULT,
            supplier: ObjectId::DEFAULT,
            consumer: ObjectId::DEFAULT,
            priority,
            timestamp: Timestamp::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(body: MessageBody, priority: Priority) -> Self {
        Self {
            header: MessageHeader::with_priority(priority),
            body,
        }
    }

    /// Sensor update at medium priority
    pub fn sensor(update: SensorUpdate) -> Self {
        Self::new(MessageBody::Sensor(update), Priority::Medium)
    }

    /// Timer notification at the priority the timer was ordered with
    pub fn timer(timer: TimerId, priority: Priority) -> Self {
        Self::new(MessageBody::Timer(TimerFired { timer }), priority)
    }

    /// System command at high priority
    pub fn system(command: SystemCommand) -> Self {
        Self::new(
            MessageBody::System(SystemMessage {
                command,
                data: [0; 2],
            }),
            Priority::High,
        )
    }

    pub fn confirm(confirmation: Confirmation) -> Self {
        Self::new(MessageBody::Confirm(confirmation), Priority::Medium)
    }

    pub fn other(tag: u32, data: impl Into<Bytes>) -> Self {
        Self::new(
            MessageBody::Other(OpaquePayload {
                tag,
                data: data.into(),
            }),
            Priority::Medium,
        )
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn to(mut self, consumer: ObjectId) -> Self {
        self.header.consumer = consumer;
        self
    }

    pub fn from(mut self, supplier: ObjectId, node: NodeId) -> Self {
        self.header.supplier = supplier;
        self.header.node = node;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn priority(&self) -> Priority {
        self.header.priority
    }

    pub fn consumer(&self) -> ObjectId {
        self.header.consumer
    }

    pub fn timestamp(&self) -> Timestamp {
        self.header.timestamp
    }

    /// Logical identity used by mailbox compaction
    ///
    /// Two messages with the same key describe the same piece of state, so
    /// only the most recent one needs to be delivered.
    pub fn compaction_key(&self) -> CompactionKey {
        let consumer = self.header.consumer;
        match &self.body {
            MessageBody::Sensor(s) => CompactionKey::Sensor {
                consumer,
                sensor: s.sensor,
                threshold: s.threshold,
            },
            MessageBody::Timer(t) => CompactionKey::Timer {
                consumer,
                timer: t.timer,
            },
            MessageBody::System(s) => CompactionKey::System {
                consumer,
                command: s.command,
                data: s.data,
            },
            MessageBody::Confirm(c) => CompactionKey::Confirm {
                consumer,
                sensor: c.sensor,
                sensor_time: c.sensor_time,
            },
            MessageBody::Other(p) => CompactionKey::Other {
                consumer,
                tag: p.tag,
                data: p.data.clone(),
            },
        }
    }
}

/// Kind + consumer + the payload fields that distinguish one piece of state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompactionKey {
    Sensor {
        consumer: ObjectId,
        sensor: ObjectId,
        threshold: Option<i64>,
    },
    Timer {
        consumer: ObjectId,
        timer: TimerId,
    },
    System {
        consumer: ObjectId,
        command: SystemCommand,
        data: [i64; 2],
    },
    Confirm {
        consumer: ObjectId,
        sensor: ObjectId,
        sensor_time: Timestamp,
    },
    Other {
        consumer: ObjectId,
        tag: u32,
        data: Bytes,
    },
}
