use std::fmt;

use rhai::Dynamic;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::ids::{ItemId, ObjectId};

pub const STATE_ENTRY: &str = "state_entry";
pub const STATE_EXIT: &str = "state_exit";
pub const ON_REZ: &str = "on_rez";
pub const CHANGED: &str = "changed";
pub const TIMER: &str = "timer";
pub const OBJECT_MESSAGE: &str = "object_message";

/// `changed` flag delivered when a script's host crosses into another region.
pub const CHANGED_REGION: i64 = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventArg {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Key(Uuid),
    Vector([f64; 3]),
}

impl EventArg {
    pub fn to_dynamic(&self) -> Dynamic {
        match self {
            EventArg::Int(v) => Dynamic::from_int(*v),
            EventArg::Float(v) => Dynamic::from_float(*v),
            EventArg::Bool(v) => Dynamic::from_bool(*v),
            EventArg::Str(v) => Dynamic::from(v.clone()),
            EventArg::Key(v) => Dynamic::from(v.to_string()),
            EventArg::Vector(v) => Dynamic::from_array(v.iter().map(|c| Dynamic::from_float(*c)).collect()),
        }
    }
}

impl From<i64> for EventArg {
    fn from(value: i64) -> Self {
        EventArg::Int(value)
    }
}

impl From<f64> for EventArg {
    fn from(value: f64) -> Self {
        EventArg::Float(value)
    }
}

impl From<bool> for EventArg {
    fn from(value: bool) -> Self {
        EventArg::Bool(value)
    }
}

impl From<&str> for EventArg {
    fn from(value: &str) -> Self {
        EventArg::Str(value.to_string())
    }
}

impl From<String> for EventArg {
    fn from(value: String) -> Self {
        EventArg::Str(value)
    }
}

impl From<Uuid> for EventArg {
    fn from(value: Uuid) -> Self {
        EventArg::Key(value)
    }
}

pub type EventArgs = SmallVec<[EventArg; 4]>;

/// Sensor/collision data attached to an event, readable through the `detected_*` API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    pub key: Uuid,
    pub name: String,
    pub position: [f64; 3],
}

impl DetectParams {
    pub fn new(key: Uuid, name: impl Into<String>) -> Self {
        Self { key, name: name.into(), position: [0.0; 3] }
    }
}

/// Coarse queue partition. Declaration order is dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PriorityClass {
    /// Startup events of a freshly loaded script.
    FirstStart,
    /// Teardown requests.
    Stop,
    /// Reload, reset and retry requests.
    Restart,
    Event,
}

impl PriorityClass {
    pub const COUNT: usize = 4;
    pub const ALL: [PriorityClass; Self::COUNT] = [
        PriorityClass::FirstStart,
        PriorityClass::Stop,
        PriorityClass::Restart,
        PriorityClass::Event,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            PriorityClass::FirstStart => "first_start",
            PriorityClass::Stop => "stop",
            PriorityClass::Restart => "restart",
            PriorityClass::Event => "event",
        }
    }
}

/// An event as posted by the world, before it is stamped against an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptEvent {
    pub name: String,
    pub args: EventArgs,
    pub detected: Vec<DetectParams>,
    pub priority: PriorityClass,
}

impl ScriptEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), args: EventArgs::new(), detected: Vec::new(), priority: PriorityClass::Event }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = EventArg>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_arg(mut self, arg: impl Into<EventArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_detected(mut self, detected: Vec<DetectParams>) -> Self {
        self.detected = detected;
        self
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = priority;
        self
    }
}

/// Immutable record of one posted event.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub item: ItemId,
    pub object: ObjectId,
    pub event: String,
    pub args: EventArgs,
    pub detected: Vec<DetectParams>,
    pub script_state: String,
    pub version: u32,
    pub priority: PriorityClass,
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} item={} state={} version={} priority={} args={}",
            self.event,
            self.item,
            self.script_state,
            self.version,
            self.priority.label(),
            self.args.len()
        )
    }
}
