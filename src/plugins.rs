use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{ScriptError, ScriptResult};
use crate::events::{EventArgs, TIMER};
use crate::ids::ItemId;
use crate::lock;
use crate::serializer::bincode_options;

/// Event a plugin wants delivered to a script.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginEvent {
    pub item: ItemId,
    pub event: String,
    pub args: EventArgs,
}

pub struct PluginContext {
    now: Instant,
    events: Vec<PluginEvent>,
}

impl PluginContext {
    pub fn new(now: Instant) -> Self {
        Self { now, events: Vec::new() }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn post(&mut self, item: ItemId, event: impl Into<String>, args: EventArgs) {
        self.events.push(PluginEvent { item, event: event.into(), args });
    }

    pub fn into_events(self) -> Vec<PluginEvent> {
        self.events
    }
}

/// Extension owning per-script resources (timers, listeners) that must follow a script through
/// capture and restore.
pub trait ScriptPlugin: Send + Any {
    fn name(&self) -> &'static str;

    /// Periodic maintenance pass.
    fn check(&mut self, _ctx: &mut PluginContext) {}

    fn serialization_data(&self, _item: ItemId) -> Option<Vec<u8>> {
        None
    }

    fn create_from_data(&mut self, _item: ItemId, _data: &[u8], _now: Instant) -> ScriptResult<()> {
        Ok(())
    }

    fn remove_script(&mut self, _item: ItemId) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Fixed list of plugins registered at startup, iterated under one lock.
pub struct PluginSet {
    plugins: Mutex<Vec<Box<dyn ScriptPlugin>>>,
}

impl Default for PluginSet {
    fn default() -> Self {
        Self::with_builtins(Vec::new())
    }
}

impl PluginSet {
    pub fn new(plugins: Vec<Box<dyn ScriptPlugin>>) -> Self {
        Self { plugins: Mutex::new(plugins) }
    }

    /// The built-in timer plugin followed by `extra`.
    pub fn with_builtins(extra: Vec<Box<dyn ScriptPlugin>>) -> Self {
        let mut plugins: Vec<Box<dyn ScriptPlugin>> = vec![Box::new(TimerPlugin::default())];
        plugins.extend(extra);
        Self::new(plugins)
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.plugins).iter().map(|plugin| plugin.name()).collect()
    }

    pub fn check_all(&self, now: Instant) -> Vec<PluginEvent> {
        let mut ctx = PluginContext::new(now);
        for plugin in lock(&self.plugins).iter_mut() {
            plugin.check(&mut ctx);
        }
        ctx.into_events()
    }

    pub fn serialization_data(&self, item: ItemId) -> Vec<(String, Vec<u8>)> {
        lock(&self.plugins)
            .iter()
            .filter_map(|plugin| plugin.serialization_data(item).map(|data| (plugin.name().to_string(), data)))
            .collect()
    }

    pub fn create_from_data(&self, item: ItemId, records: &[(String, Vec<u8>)], now: Instant) {
        let mut plugins = lock(&self.plugins);
        for (name, data) in records {
            match plugins.iter_mut().find(|plugin| plugin.name() == name) {
                Some(plugin) => {
                    if let Err(err) = plugin.create_from_data(item, data, now) {
                        tracing::warn!(plugin = %name, item = %item, error = %err, "plugin state restore failed");
                    }
                }
                None => tracing::warn!(plugin = %name, item = %item, "no plugin registered for saved state"),
            }
        }
    }

    pub fn remove_script(&self, item: ItemId) {
        for plugin in lock(&self.plugins).iter_mut() {
            plugin.remove_script(item);
        }
    }

    pub fn with_plugin<T: ScriptPlugin, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut plugins = lock(&self.plugins);
        plugins.iter_mut().find_map(|plugin| plugin.as_any_mut().downcast_mut::<T>()).map(f)
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    interval: Duration,
    next_due: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
struct TimerRecord {
    interval_ms: u64,
    remaining_ms: u64,
}

/// Repeating per-script timers raising `timer` events.
#[derive(Default)]
pub struct TimerPlugin {
    timers: HashMap<ItemId, TimerEntry>,
}

impl TimerPlugin {
    pub const NAME: &'static str = "timer";

    /// A zero interval cancels the timer.
    pub fn set_timer(&mut self, item: ItemId, interval: Duration, now: Instant) {
        if interval.is_zero() {
            self.timers.remove(&item);
        } else {
            self.timers.insert(item, TimerEntry { interval, next_due: now + interval });
        }
    }

    pub fn interval(&self, item: ItemId) -> Option<Duration> {
        self.timers.get(&item).map(|entry| entry.interval)
    }

    pub fn active(&self) -> usize {
        self.timers.len()
    }
}

impl ScriptPlugin for TimerPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn check(&mut self, ctx: &mut PluginContext) {
        let now = ctx.now();
        for (item, entry) in self.timers.iter_mut() {
            if entry.next_due > now {
                continue;
            }
            ctx.post(*item, TIMER, EventArgs::new());
            while entry.next_due <= now {
                entry.next_due += entry.interval;
            }
        }
    }

    fn serialization_data(&self, item: ItemId) -> Option<Vec<u8>> {
        let entry = self.timers.get(&item)?;
        let remaining = entry.next_due.saturating_duration_since(Instant::now());
        let record = TimerRecord {
            interval_ms: entry.interval.as_millis() as u64,
            remaining_ms: remaining.as_millis() as u64,
        };
        bincode_options().serialize(&record).ok()
    }

    fn create_from_data(&mut self, item: ItemId, data: &[u8], now: Instant) -> ScriptResult<()> {
        let record: TimerRecord =
            bincode_options().deserialize(data).map_err(|err| ScriptError::StateFormat(err.to_string()))?;
        if record.interval_ms > 0 {
            self.timers.insert(
                item,
                TimerEntry {
                    interval: Duration::from_millis(record.interval_ms),
                    next_due: now + Duration::from_millis(record.remaining_ms),
                },
            );
        }
        Ok(())
    }

    fn remove_script(&mut self, item: ItemId) {
        self.timers.remove(&item);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_once_per_check_and_reschedule() {
        let set = PluginSet::default();
        let item = ItemId::new();
        let start = Instant::now();
        set.with_plugin(|timers: &mut TimerPlugin| timers.set_timer(item, Duration::from_millis(100), start))
            .expect("timer plugin is built in");

        assert!(set.check_all(start + Duration::from_millis(50)).is_empty());
        let fired = set.check_all(start + Duration::from_millis(350));
        assert_eq!(fired, vec![PluginEvent { item, event: TIMER.to_string(), args: EventArgs::new() }]);
        assert!(set.check_all(start + Duration::from_millis(360)).is_empty());
    }

    #[test]
    fn timer_state_survives_serialization() {
        let set = PluginSet::default();
        let item = ItemId::new();
        let now = Instant::now();
        set.with_plugin(|timers: &mut TimerPlugin| timers.set_timer(item, Duration::from_secs(2), now));
        let records = set.serialization_data(item);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, TimerPlugin::NAME);

        let restored = PluginSet::default();
        let other = ItemId::new();
        restored.create_from_data(other, &records, now);
        let interval = restored.with_plugin(|timers: &mut TimerPlugin| timers.interval(other)).flatten();
        assert_eq!(interval, Some(Duration::from_secs(2)));
    }

    #[test]
    fn removing_a_script_cancels_its_timer() {
        let set = PluginSet::default();
        let item = ItemId::new();
        set.with_plugin(|timers: &mut TimerPlugin| timers.set_timer(item, Duration::from_millis(10), Instant::now()));
        set.remove_script(item);
        assert_eq!(set.with_plugin(|timers: &mut TimerPlugin| timers.active()), Some(0));
        assert_eq!(set.names(), vec![TimerPlugin::NAME]);
    }
}
