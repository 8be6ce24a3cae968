use std::sync::Arc;
use std::time::Duration;

use bincode::Options;
use rhai::{Dynamic, Map};
use serde::{Deserialize, Serialize};

use crate::error::{ScriptError, ScriptResult};
use crate::events::DetectParams;
use crate::ids::{ItemId, ObjectId};
use crate::instance::{InstanceSettings, LifecycleState, ScriptInstance, StateSource};
use crate::permissions::TrustLevel;
use crate::plugins::PluginSet;

pub const STATE_FORMAT: u32 = 2;

pub(crate) fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

/// Everything needed to bring a script back exactly where it was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub format: u32,
    pub item: ItemId,
    pub object: ObjectId,
    pub source: String,
    pub script_state: String,
    pub version: u32,
    /// Locals as JSON; script values are self-describing and bincode is not.
    pub locals_json: String,
    pub running: bool,
    pub suspended: bool,
    pub start_param: i64,
    pub event_delay_us: u64,
    pub state_source: u32,
    /// Domain ceiling the script asked for; restores land in an equally trusted domain.
    pub trust: TrustLevel,
    /// Oldest first, as kept by the instance.
    pub detected: Vec<DetectParams>,
    pub plugin_data: Vec<(String, Vec<u8>)>,
}

impl StateSnapshot {
    pub fn encode(&self) -> ScriptResult<Vec<u8>> {
        Ok(bincode_options().serialize(self)?)
    }

    pub fn decode(blob: &[u8]) -> ScriptResult<Self> {
        let snapshot: StateSnapshot = bincode_options().deserialize(blob)?;
        if snapshot.format != STATE_FORMAT {
            return Err(ScriptError::StateFormat(format!(
                "unsupported state format {} (expected {STATE_FORMAT})",
                snapshot.format
            )));
        }
        Ok(snapshot)
    }

    pub fn locals(&self) -> ScriptResult<Map> {
        let value: Dynamic = serde_json::from_str(&self.locals_json)?;
        value.try_cast::<Map>().ok_or_else(|| ScriptError::StateFormat("locals are not an object map".to_string()))
    }
}

/// Snapshots a loaded instance. Takes the dispatch lock, so the capture never observes a
/// handler halfway through.
pub fn capture(instance: &ScriptInstance, plugins: &PluginSet) -> ScriptResult<StateSnapshot> {
    let _dispatch = instance.dispatch_lock();
    let data = instance.data();
    if data.lifecycle != LifecycleState::Loaded {
        return Err(ScriptError::NotFound(instance.item()));
    }
    let locals_json = serde_json::to_string(&Dynamic::from_map(data.locals.clone()))?;
    Ok(StateSnapshot {
        format: STATE_FORMAT,
        item: instance.item(),
        object: data.object,
        source: data.source.to_string(),
        script_state: data.script_state.clone(),
        version: data.version,
        locals_json,
        running: data.running,
        suspended: data.suspended,
        start_param: data.start_param,
        event_delay_us: u64::try_from(data.event_delay.as_micros()).unwrap_or(u64::MAX),
        state_source: data.state_source.bits(),
        trust: data.trust,
        detected: data.detected.iter().cloned().collect(),
        plugin_data: plugins.serialization_data(instance.item()),
    })
}

/// Builds an unloaded instance carrying the snapshot's runtime state, hosted by `object` and
/// asking for a `trust` ceiling. Loading it fires no startup events.
pub fn instantiate(snapshot: &StateSnapshot, object: ObjectId, trust: TrustLevel) -> ScriptResult<ScriptInstance> {
    let locals = snapshot.locals()?;
    let instance = ScriptInstance::new(
        snapshot.item,
        InstanceSettings {
            object,
            source: Arc::from(snapshot.source.as_str()),
            start_param: snapshot.start_param,
            post_on_rez: false,
            state_source: StateSource::from_bits_truncate(snapshot.state_source),
            trust,
        },
    );
    {
        let mut data = instance.data();
        data.script_state = snapshot.script_state.clone();
        data.version = snapshot.version;
        data.locals = locals;
        data.running = snapshot.running;
        data.suspended = snapshot.suspended;
        data.event_delay = Duration::from_micros(snapshot.event_delay_us);
        data.detected = snapshot.detected.iter().cloned().collect();
        data.pending_plugin_data = snapshot.plugin_data.clone();
    }
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_instance() -> ScriptInstance {
        let instance = ScriptInstance::new(
            ItemId::new(),
            InstanceSettings {
                object: ObjectId::new(),
                source: Arc::from("fn default_touch(world) { this.n += 1; }"),
                start_param: 9,
                post_on_rez: true,
                state_source: StateSource::NEW_REZ,
                trust: TrustLevel::Low,
            },
        );
        {
            let mut data = instance.data();
            data.lifecycle = LifecycleState::Loaded;
            data.running = true;
            data.script_state = "open".to_string();
            data.version = 2;
            data.locals.insert("n".into(), Dynamic::from_int(4));
            data.locals.insert("label".into(), Dynamic::from("door".to_string()));
            data.locals.insert("ratio".into(), Dynamic::from_float(0.5));
            data.suspended = true;
            data.event_delay = Duration::from_micros(1_500);
            data.push_detected(&[DetectParams::new(uuid::Uuid::new_v4(), "avatar")], 4);
        }
        instance
    }

    #[test]
    fn captured_state_restores_onto_a_new_host() {
        let original = loaded_instance();
        let blob = capture(&original, &PluginSet::default()).expect("capture").encode().expect("encode");
        let snapshot = StateSnapshot::decode(&blob).expect("decode");
        let host = ObjectId::new();
        assert_eq!(snapshot.trust, TrustLevel::Low);
        let restored = instantiate(&snapshot, host, snapshot.trust).expect("instantiate");

        let data = restored.data();
        assert_eq!(restored.item(), original.item());
        assert_eq!(data.object, host);
        assert_eq!(data.lifecycle, LifecycleState::New);
        assert_eq!(data.script_state, "open");
        assert_eq!(data.version, 2);
        assert_eq!(data.start_param, 9);
        assert_eq!(data.trust, TrustLevel::Low);
        assert!(data.suspended);
        assert_eq!(data.event_delay, Duration::from_micros(1_500));
        assert_eq!(data.detected.len(), 1);
        assert_eq!(data.detected[0].name, "avatar");
        assert_eq!(data.locals.get("n").and_then(|v| v.as_int().ok()), Some(4));
        assert_eq!(data.locals.get("ratio").and_then(|v| v.as_float().ok()), Some(0.5));
        assert_eq!(data.locals.get("label").map(|v| v.to_string()), Some("door".to_string()));
    }

    #[test]
    fn unloaded_instances_cannot_be_captured() {
        let instance = loaded_instance();
        instance.data().lifecycle = LifecycleState::Disposed;
        assert!(matches!(capture(&instance, &PluginSet::default()), Err(ScriptError::NotFound(_))));
    }

    #[test]
    fn corrupt_blobs_are_rejected() {
        assert!(matches!(StateSnapshot::decode(b"\x01\x02"), Err(ScriptError::StateFormat(_))));
        let mut snapshot = capture(&loaded_instance(), &PluginSet::default()).expect("capture");
        snapshot.format = 99;
        let blob = bincode_options().serialize(&snapshot).expect("encode");
        assert!(matches!(StateSnapshot::decode(&blob), Err(ScriptError::StateFormat(_))));
    }
}
