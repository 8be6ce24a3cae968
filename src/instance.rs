use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bitflags::bitflags;
use rhai::Map;

use crate::compiler::{CompiledArtifact, DEFAULT_STATE};
use crate::error::ScriptError;
use crate::events::DetectParams;
use crate::ids::{DomainId, Fingerprint, ItemId, ObjectId};
use crate::lock;
use crate::permissions::TrustLevel;
use crate::scripts::Sandbox;

bitflags! {
    /// How the hosting object came to start this script.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StateSource: u32 {
        const NEW_REZ = 1 << 0;
        const PRIM_CROSSING = 1 << 1;
        const SCRIPTED_REZ = 1 << 2;
        const ATTACHED_REZ = 1 << 3;
        const REGION_START = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Compiling,
    Loaded,
    Reloading,
    Unloading,
    Disposed,
}

impl LifecycleState {
    pub fn label(self) -> &'static str {
        match self {
            LifecycleState::New => "new",
            LifecycleState::Compiling => "compiling",
            LifecycleState::Loaded => "loaded",
            LifecycleState::Reloading => "reloading",
            LifecycleState::Unloading => "unloading",
            LifecycleState::Disposed => "disposed",
        }
    }

    /// Teardown has begun; no new work is accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Unloading | LifecycleState::Disposed)
    }
}

/// Mutable runtime state of one script instance.
pub struct InstanceData {
    pub object: ObjectId,
    pub lifecycle: LifecycleState,
    pub source: Arc<str>,
    pub fingerprint: Fingerprint,
    pub script_state: String,
    pub version: u32,
    pub running: bool,
    pub suspended: bool,
    pub event_delay: Duration,
    pub detected: VecDeque<DetectParams>,
    /// Accumulated handler wall time in milliseconds.
    pub score: f64,
    pub consecutive_faults: u32,
    pub total_faults: u64,
    pub needs_attention: bool,
    pub last_fault: Option<String>,
    pub start_param: i64,
    pub post_on_rez: bool,
    pub state_source: StateSource,
    /// Minimum domain ceiling this script asks for.
    pub trust: TrustLevel,
    pub domain: Option<DomainId>,
    pub domain_ceiling: TrustLevel,
    pub artifact: Option<Arc<CompiledArtifact>>,
    pub sandbox: Option<Arc<Sandbox>>,
    pub locals: Map,
    pub loaded_once: bool,
    /// Plugin records waiting to be applied once a restored instance finishes loading.
    pub pending_plugin_data: Vec<(String, Vec<u8>)>,
}

pub struct ScriptInstance {
    item: ItemId,
    dispatch: Mutex<()>,
    data: Mutex<InstanceData>,
}

#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub object: ObjectId,
    pub source: Arc<str>,
    pub start_param: i64,
    pub post_on_rez: bool,
    pub state_source: StateSource,
    pub trust: TrustLevel,
}

impl ScriptInstance {
    pub fn new(item: ItemId, settings: InstanceSettings) -> Self {
        let fingerprint = Fingerprint::of(&settings.source);
        let data = InstanceData {
            object: settings.object,
            lifecycle: LifecycleState::New,
            source: settings.source,
            fingerprint,
            script_state: DEFAULT_STATE.to_string(),
            version: 0,
            running: false,
            suspended: false,
            event_delay: Duration::ZERO,
            detected: VecDeque::new(),
            score: 0.0,
            consecutive_faults: 0,
            total_faults: 0,
            needs_attention: false,
            last_fault: None,
            start_param: settings.start_param,
            post_on_rez: settings.post_on_rez,
            state_source: settings.state_source,
            trust: settings.trust,
            domain: None,
            domain_ceiling: TrustLevel::Minimal,
            artifact: None,
            sandbox: None,
            locals: Map::new(),
            loaded_once: false,
            pending_plugin_data: Vec::new(),
        };
        Self { item, dispatch: Mutex::new(()), data: Mutex::new(data) }
    }

    pub fn item(&self) -> ItemId {
        self.item
    }

    /// Held for the whole of any handler run or lifecycle transition on this instance.
    pub fn dispatch_lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.dispatch)
    }

    /// Short-held lock over the mutable fields. Never held across handler execution.
    pub fn data(&self) -> MutexGuard<'_, InstanceData> {
        lock(&self.data)
    }

    pub fn object(&self) -> ObjectId {
        self.data().object
    }

    pub fn snapshot(&self) -> InstanceSummary {
        let data = self.data();
        InstanceSummary {
            item: self.item,
            object: data.object,
            lifecycle: data.lifecycle,
            script_state: data.script_state.clone(),
            version: data.version,
            running: data.running,
            suspended: data.suspended,
            domain: data.domain,
            score: data.score,
            total_faults: data.total_faults,
            needs_attention: data.needs_attention,
        }
    }
}

impl InstanceData {
    pub fn push_detected(&mut self, detected: &[DetectParams], history: usize) {
        for params in detected {
            if self.detected.len() >= history.max(1) {
                self.detected.pop_front();
            }
            self.detected.push_back(params.clone());
        }
    }

    pub fn record_fault(&mut self, error: &ScriptError) {
        self.consecutive_faults += 1;
        self.total_faults += 1;
        self.last_fault = Some(error.to_string());
    }
}

/// Point-in-time copy of an instance's observable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSummary {
    pub item: ItemId,
    pub object: ObjectId,
    pub lifecycle: LifecycleState,
    pub script_state: String,
    pub version: u32,
    pub running: bool,
    pub suspended: bool,
    pub domain: Option<DomainId>,
    pub score: f64,
    pub total_faults: u64,
    pub needs_attention: bool,
}
