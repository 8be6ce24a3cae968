#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kestrel_script_runtime::{
    ChatMessage, EngineCollaborators, EngineConfig, ItemId, ObjectId, ScriptEngine, ScriptError, StateStore,
    WorldHost,
};

pub const SETTLE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum WorldCall {
    Log(ItemId, String),
    Chat(ItemId, ChatMessage),
    Error(ItemId, String),
    Running(ItemId, bool),
    Suspended(ItemId, bool),
    ScriptRemoved(ItemId, ObjectId),
    ObjectRemoved(ObjectId),
}

/// World collaborator that records every callback in arrival order.
#[derive(Default)]
pub struct RecordingWorld {
    calls: Mutex<Vec<WorldCall>>,
}

impl RecordingWorld {
    fn record(&self, call: WorldCall) {
        self.calls.lock().expect("world calls").push(call);
    }

    pub fn calls(&self) -> Vec<WorldCall> {
        self.calls.lock().expect("world calls").clone()
    }

    pub fn logs(&self, item: ItemId) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                WorldCall::Log(from, line) if from == item => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self, item: ItemId) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                WorldCall::Error(from, message) if from == item => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn chat(&self) -> Vec<ChatMessage> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                WorldCall::Chat(_, message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &WorldCall) -> usize {
        self.calls().iter().filter(|call| *call == wanted).count()
    }
}

impl WorldHost for RecordingWorld {
    fn running_changed(&self, item: ItemId, running: bool) {
        self.record(WorldCall::Running(item, running));
    }

    fn suspended_changed(&self, item: ItemId, suspended: bool) {
        self.record(WorldCall::Suspended(item, suspended));
    }

    fn script_removed(&self, item: ItemId, object: ObjectId) {
        self.record(WorldCall::ScriptRemoved(item, object));
    }

    fn object_removed(&self, object: ObjectId) {
        self.record(WorldCall::ObjectRemoved(object));
    }

    fn chat(&self, item: ItemId, _object: ObjectId, message: &ChatMessage) {
        self.record(WorldCall::Chat(item, message.clone()));
    }

    fn script_log(&self, item: ItemId, message: &str) {
        self.record(WorldCall::Log(item, message.to_string()));
    }

    fn script_error(&self, item: ItemId, error: &ScriptError) {
        self.record(WorldCall::Error(item, error.to_string()));
    }
}

/// Routes engine logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> EngineConfig {
    init_tracing();
    let mut config = EngineConfig::default();
    config.execution_workers = 4;
    config.maintenance_workers = 2;
    config.maintenance_interval_ms = 10;
    config.error_fetch_timeout_ms = 2_000;
    config
}

pub fn engine_with(config: EngineConfig) -> (ScriptEngine, Arc<RecordingWorld>) {
    let world = Arc::new(RecordingWorld::default());
    let collaborators = EngineCollaborators::default().with_world(world.clone());
    let engine = ScriptEngine::new(config, collaborators).expect("engine should start");
    (engine, world)
}

pub fn engine_with_store(config: EngineConfig, store: Arc<dyn StateStore>) -> (ScriptEngine, Arc<RecordingWorld>) {
    let world = Arc::new(RecordingWorld::default());
    let collaborators = EngineCollaborators::default().with_world(world.clone()).with_store(store);
    let engine = ScriptEngine::new(config, collaborators).expect("engine should start");
    (engine, world)
}

pub fn settle(engine: &ScriptEngine) {
    assert!(engine.wait_idle(SETTLE), "engine did not go idle in time");
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn int_local(engine: &ScriptEngine, item: ItemId, name: &str) -> i64 {
    let locals = engine.locals(item).expect("locals");
    locals.get(name).and_then(|value| value.as_int().ok()).unwrap_or_else(|| panic!("local '{name}' missing"))
}
