use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use rhai::Dynamic;

use crate::compiler::{CompiledArtifact, DEFAULT_STATE};
use crate::engine::EngineCore;
use crate::error::ScriptError;
use crate::events::{
    DetectParams, EventArg, PriorityClass, QueueItem, ScriptEvent, OBJECT_MESSAGE, STATE_ENTRY, STATE_EXIT,
};
use crate::ids::{DomainId, ObjectId};
use crate::instance::{InstanceData, LifecycleState, ScriptInstance};
use crate::permissions::TrustLevel;
use crate::plugins::TimerPlugin;
use crate::scripts::{ApiContext, HandlerEffects, HandlerFailure, HandlerOutcome, Sandbox};

/// Everything a handler run needs, copied out of the instance so no instance lock is held
/// while script code executes.
pub(crate) struct Execution {
    pub artifact: Arc<CompiledArtifact>,
    pub sandbox: Arc<Sandbox>,
    pub object: ObjectId,
    pub domain: Option<DomainId>,
    pub ceiling: TrustLevel,
    pub start_param: i64,
}

impl Execution {
    pub(crate) fn from_data(data: &InstanceData) -> Option<Self> {
        Some(Self {
            artifact: data.artifact.clone()?,
            sandbox: data.sandbox.clone()?,
            object: data.object,
            domain: data.domain,
            ceiling: data.domain_ceiling,
            start_param: data.start_param,
        })
    }
}

impl EngineCore {
    /// Stamps `event` against the instance's current state and version and queues it. The
    /// caller holds the instance data lock.
    pub(crate) fn queue_event_locked(&self, instance: &ScriptInstance, data: &InstanceData, event: ScriptEvent) -> bool {
        if data.lifecycle.is_terminal() {
            return false;
        }
        self.queue.push_event(QueueItem {
            item: instance.item(),
            object: data.object,
            event: event.name,
            args: event.args,
            detected: event.detected,
            script_state: data.script_state.clone(),
            version: data.version,
            priority: event.priority,
        })
    }

    pub(crate) fn post(&self, instance: &ScriptInstance, event: ScriptEvent) -> bool {
        let data = instance.data();
        self.queue_event_locked(instance, &data, event)
    }

    pub(crate) fn post_object(&self, object: ObjectId, event: &ScriptEvent) -> usize {
        self.registry
            .list_by_object(object)
            .iter()
            .filter(|instance| self.post(instance, event.clone()))
            .count()
    }

    fn context_for(&self, instance: &ScriptInstance, execution: &Execution, detected: Vec<DetectParams>) -> Arc<ApiContext> {
        Arc::new(ApiContext::new(
            instance.item(),
            execution.object,
            execution.domain,
            execution.ceiling,
            execution.start_param,
            detected,
            self.registry.permissions(),
            self.config.handler_budget(),
        ))
    }

    /// Runs one script function against the instance locals. The caller holds the dispatch lock.
    pub(crate) fn run_handler(
        &self,
        instance: &ScriptInstance,
        execution: &Execution,
        function: &str,
        args: Vec<Dynamic>,
        detected: Vec<DetectParams>,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let ctx = self.context_for(instance, execution, detected);
        let mut locals = std::mem::take(&mut instance.data().locals);
        let result = execution.sandbox.invoke(&execution.artifact, &mut locals, ctx, function, args);
        let mut data = instance.data();
        data.locals = locals;
        if let Ok(outcome) = &result {
            data.score += outcome.elapsed.as_secs_f64() * 1000.0;
        }
        result
    }

    /// Evaluates the script's initial locals. A failing `globals()` is recorded as a fault and
    /// leaves the locals empty.
    pub(crate) fn initial_locals(&self, instance: &ScriptInstance, execution: &Execution) -> rhai::Map {
        let ctx = self.context_for(instance, execution, Vec::new());
        match execution.sandbox.initial_locals(&execution.artifact, ctx) {
            Ok(locals) => locals,
            Err(failure) => {
                self.handle_fault(instance, failure);
                rhai::Map::new()
            }
        }
    }

    /// Delivers one queued event. Returns the earliest time the instance may run again.
    pub(crate) fn dispatch(&self, event: QueueItem) -> Option<Instant> {
        let instance = self.registry.lookup_item(event.item).ok()?;
        let _dispatch = instance.dispatch_lock();
        let execution = {
            let mut data = instance.data();
            if data.lifecycle != LifecycleState::Loaded {
                tracing::trace!(item = %event.item, lifecycle = data.lifecycle.label(), "dropped event for unloaded script");
                return None;
            }
            if !data.running || data.suspended {
                // Held under the data lock so a concurrent resume cannot be overtaken.
                self.queue.requeue_front(event);
                return None;
            }
            if event.version != data.version {
                self.counters.stale_dropped.fetch_add(1, Ordering::Relaxed);
                let stale = ScriptError::StaleVersion { item: event.item, queued: event.version, current: data.version };
                tracing::debug!(event = %event.event, error = %stale, "dropped stale event");
                return None;
            }
            if event.script_state != data.script_state {
                self.counters.stale_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    item = %event.item,
                    event = %event.event,
                    queued_state = %event.script_state,
                    state = %data.script_state,
                    "dropped event queued for a previous state"
                );
                return None;
            }
            data.push_detected(&event.detected, self.config.detect_history);
            Execution::from_data(&data)?
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters.events_since_take.fetch_add(1, Ordering::Relaxed);
        let handler = CompiledArtifact::handler_name(&event.script_state, &event.event);
        let args = event.args.iter().map(EventArg::to_dynamic).collect();
        match self.run_handler(&instance, &execution, &handler, args, event.detected) {
            Ok(outcome) => {
                if outcome.ran {
                    instance.data().consecutive_faults = 0;
                }
                self.apply_effects(&instance, &execution, outcome.effects);
            }
            Err(failure) => self.handle_fault(&instance, failure),
        }

        let delay = instance.data().event_delay;
        (!delay.is_zero()).then(|| Instant::now() + delay)
    }

    /// Applies what a handler asked for. Runs with the dispatch lock held and no data lock.
    pub(crate) fn apply_effects(&self, instance: &ScriptInstance, execution: &Execution, effects: HandlerEffects) {
        let item = instance.item();
        for line in &effects.logs {
            tracing::info!(target: "script", item = %item, "{line}");
            self.world.script_log(item, line);
        }
        for message in &effects.chat {
            self.world.chat(item, execution.object, message);
        }
        for (object, text) in effects.object_messages {
            let event = ScriptEvent::new(OBJECT_MESSAGE)
                .with_args([EventArg::Key(execution.object.as_uuid()), EventArg::Str(text)]);
            self.post_object(object, &event);
        }
        if let Some(interval) = effects.timer {
            self.plugins.with_plugin(|timers: &mut TimerPlugin| timers.set_timer(item, interval, Instant::now()));
        }
        if let Some(delay) = effects.event_delay {
            instance.data().event_delay = delay;
        }
        if effects.reset {
            self.reset_locked(instance);
        } else if let Some(next) = effects.state_change {
            self.change_state_locked(instance, execution, next);
        }
    }

    /// Leaves the current script-defined state through its `state_exit` handler and queues
    /// `state_entry` for the new one. The caller holds the dispatch lock.
    pub(crate) fn change_state_locked(&self, instance: &ScriptInstance, execution: &Execution, next: String) {
        let current = instance.data().script_state.clone();
        if current == next {
            return;
        }
        let exit = CompiledArtifact::handler_name(&current, STATE_EXIT);
        match self.run_handler(instance, execution, &exit, Vec::new(), Vec::new()) {
            Ok(outcome) => {
                let mut effects = outcome.effects;
                effects.state_change = None;
                effects.reset = false;
                self.apply_effects(instance, execution, effects);
            }
            Err(failure) => self.handle_fault(instance, failure),
        }
        let data = {
            let mut data = instance.data();
            data.script_state = next;
            data
        };
        tracing::debug!(item = %instance.item(), from = %current, to = %data.script_state, "script state changed");
        self.queue_event_locked(instance, &data, ScriptEvent::new(STATE_ENTRY).with_priority(PriorityClass::FirstStart));
    }

    /// Returns the instance to its initial script-defined state and locals without recompiling.
    /// Everything queued before the reset is dropped. The caller holds the dispatch lock.
    pub(crate) fn reset_locked(&self, instance: &ScriptInstance) {
        let item = instance.item();
        let Some(execution) = Execution::from_data(&instance.data()) else {
            return;
        };
        let locals = self.initial_locals(instance, &execution);
        self.plugins.remove_script(item);
        let discarded = self.queue.discard_events(item);
        let mut data = instance.data();
        data.locals = locals;
        data.script_state = DEFAULT_STATE.to_string();
        data.version += 1;
        data.event_delay = std::time::Duration::ZERO;
        data.detected.clear();
        data.consecutive_faults = 0;
        tracing::debug!(item = %item, version = data.version, discarded, "script reset");
        self.queue_event_locked(instance, &data, ScriptEvent::new(STATE_ENTRY).with_priority(PriorityClass::FirstStart));
    }

    /// Records a handler fault; stops the instance once the consecutive-fault limit is hit.
    pub(crate) fn handle_fault(&self, instance: &ScriptInstance, failure: HandlerFailure) {
        let item = instance.item();
        let error = match failure {
            HandlerFailure::Fault(message) => ScriptError::HandlerFault { item, message },
            HandlerFailure::Timeout(limit) => ScriptError::HandlerTimeout { item, limit },
        };
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        let threshold = self.config.max_consecutive_faults;
        let stopped = {
            let mut data = instance.data();
            data.record_fault(&error);
            if threshold > 0 && data.consecutive_faults >= threshold && data.running {
                data.running = false;
                data.needs_attention = true;
                self.queue.set_held(item, true);
                true
            } else {
                false
            }
        };
        tracing::warn!(item = %item, error = %error, "script handler faulted");
        self.world.script_error(item, &error);
        if stopped {
            tracing::error!(item = %item, faults = threshold, "script stopped after repeated faults");
            self.world.running_changed(item, false);
        }
    }

    /// Domain recycling and plugin checks, run periodically by one maintenance worker.
    pub(crate) fn maintenance_pass(&self) {
        self.domains.recycle_empty_domains();
        for fired in self.plugins.check_all(Instant::now()) {
            if let Ok(instance) = self.registry.lookup_item(fired.item) {
                self.post(&instance, ScriptEvent::new(fired.event).with_args(fired.args));
            }
        }
    }
}
