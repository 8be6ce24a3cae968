use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::compiler::{CompiledArtifact, Diagnostics, DEFAULT_STATE};
use crate::engine::EngineCore;
use crate::error::ScriptError;
use crate::events::{PriorityClass, ScriptEvent, CHANGED, CHANGED_REGION, ON_REZ, STATE_ENTRY};
use crate::ids::{Fingerprint, ItemId, ObjectId};
use crate::instance::{LifecycleState, ScriptInstance, StateSource};
use crate::scheduler::dispatch::Execution;

/// Work routed to the maintenance pool.
#[derive(Debug, Clone)]
pub(crate) enum LifecycleRequest {
    Load { attempt: u32, restored: bool },
    Reupload { source: Arc<str>, carry_state: bool },
    Reset,
    Crossing { object: ObjectId, state_source: StateSource },
    SetState(String),
    Unload,
}

impl LifecycleRequest {
    pub(crate) fn priority(&self) -> PriorityClass {
        match self {
            LifecycleRequest::Unload => PriorityClass::Stop,
            LifecycleRequest::Load { attempt: 0, .. } => PriorityClass::FirstStart,
            _ => PriorityClass::Restart,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            LifecycleRequest::Load { .. } => "load",
            LifecycleRequest::Reupload { .. } => "reupload",
            LifecycleRequest::Reset => "reset",
            LifecycleRequest::Crossing { .. } => "crossing",
            LifecycleRequest::SetState(_) => "set_state",
            LifecycleRequest::Unload => "unload",
        }
    }
}

impl EngineCore {
    pub(crate) fn run_lifecycle(&self, item: ItemId, request: LifecycleRequest) {
        tracing::debug!(item = %item, request = request.label(), priority = request.priority().label(), "lifecycle request");
        match request {
            LifecycleRequest::Load { attempt, restored } => self.load(item, attempt, restored),
            LifecycleRequest::Reupload { source, carry_state } => self.reupload(item, source, carry_state),
            LifecycleRequest::Reset => self.reset(item),
            LifecycleRequest::Crossing { object, state_source } => self.cross(item, object, state_source),
            LifecycleRequest::SetState(name) => self.set_state(item, name),
            LifecycleRequest::Unload => self.unload(item),
        }
    }

    /// Cached artifact for `source`, compiling it on a miss.
    fn acquire_artifact(&self, source: &str) -> Result<(Arc<CompiledArtifact>, Diagnostics), Diagnostics> {
        let fingerprint = Fingerprint::of(source);
        if let Some(artifact) = self.registry.retain_artifact(fingerprint) {
            return Ok((artifact, Diagnostics::ok()));
        }
        for _ in 0..2 {
            let epoch = self.registry.cache_epoch();
            let output = self.compiler.compile(source);
            self.counters.compiled.fetch_add(1, Ordering::Relaxed);
            let mut artifact = match output.artifact {
                Some(artifact) if output.diagnostics.success => artifact,
                _ => return Err(output.diagnostics),
            };
            artifact.fingerprint = fingerprint;
            if let Some(shared) = self.registry.intern_artifact(artifact, epoch) {
                return Ok((shared, output.diagnostics));
            }
            tracing::debug!(fingerprint = %fingerprint, "artifact cache reset during compile; recompiling");
        }
        Err(Diagnostics::failed("artifact cache was reset while compiling"))
    }

    fn load(&self, item: ItemId, attempt: u32, restored: bool) {
        let Ok(instance) = self.registry.lookup_item(item) else {
            return;
        };
        let _dispatch = instance.dispatch_lock();
        let (source, trust) = {
            let mut data = instance.data();
            if data.lifecycle != LifecycleState::New {
                return;
            }
            data.lifecycle = LifecycleState::Compiling;
            (data.source.clone(), data.trust)
        };
        if attempt == 0 {
            self.reporter.begin(item);
        }

        let (artifact, diagnostics) = match self.acquire_artifact(&source) {
            Ok(compiled) => compiled,
            Err(diagnostics) => {
                let error = ScriptError::CompileFailure { item, diagnostics: diagnostics.clone() };
                self.fail_load(&instance, error, diagnostics);
                return;
            }
        };

        let assignment = match self.domains.assign(item, trust) {
            Ok(assignment) => assignment,
            Err(error) => {
                self.registry.release_artifact(&artifact);
                if matches!(error, ScriptError::SandboxUnavailable { .. }) && attempt < self.config.load_retry_limit {
                    tracing::warn!(item = %item, attempt, error = %error, "no isolation domain; retrying load");
                    {
                        let mut data = instance.data();
                        if data.lifecycle == LifecycleState::Compiling {
                            data.lifecycle = LifecycleState::New;
                        }
                    }
                    self.queue.push_lifecycle(item, LifecycleRequest::Load { attempt: attempt + 1, restored });
                    return;
                }
                let diagnostics = Diagnostics::failed(error.to_string());
                self.fail_load(&instance, error, diagnostics);
                return;
            }
        };

        let execution = {
            let mut data = instance.data();
            data.artifact = Some(artifact);
            data.sandbox = Some(assignment.sandbox);
            data.domain = Some(assignment.domain);
            data.domain_ceiling = assignment.ceiling;
            Execution::from_data(&data)
        };
        let locals = match (&execution, restored) {
            (Some(execution), false) => Some(self.initial_locals(&instance, execution)),
            _ => None,
        };

        let (running, plugin_data) = {
            let mut data = instance.data();
            if data.loaded_once {
                data.version += 1;
            }
            data.loaded_once = true;
            if let Some(locals) = locals {
                data.locals = locals;
            }
            if !restored {
                data.running = true;
                data.script_state = DEFAULT_STATE.to_string();
            }
            if data.lifecycle == LifecycleState::Compiling {
                data.lifecycle = LifecycleState::Loaded;
                if !restored {
                    self.queue_event_locked(&instance, &data, ScriptEvent::new(STATE_ENTRY).with_priority(PriorityClass::FirstStart));
                    if data.post_on_rez {
                        let on_rez = ScriptEvent::new(ON_REZ).with_arg(data.start_param).with_priority(PriorityClass::FirstStart);
                        self.queue_event_locked(&instance, &data, on_rez);
                    }
                }
            }
            self.queue.set_held(item, !data.running || data.suspended);
            (data.running, std::mem::take(&mut data.pending_plugin_data))
        };

        if !plugin_data.is_empty() {
            self.plugins.create_from_data(item, &plugin_data, Instant::now());
        }
        tracing::debug!(item = %item, domain = %assignment.domain, restored, "script loaded");
        self.reporter.publish(item, diagnostics);
        self.world.running_changed(item, running);
    }

    fn fail_load(&self, instance: &ScriptInstance, error: ScriptError, diagnostics: Diagnostics) {
        let item = instance.item();
        self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
        let artifact = {
            let mut data = instance.data();
            data.lifecycle = LifecycleState::Disposed;
            data.running = false;
            data.sandbox = None;
            data.artifact.take()
        };
        if let Some(artifact) = artifact {
            self.registry.release_artifact(&artifact);
        }
        self.domains.release(item);
        tracing::warn!(item = %item, error = %error, "script failed to load");
        self.reporter.publish(item, diagnostics);
        self.world.script_error(item, &error);
        self.remove_instance(instance);
    }

    fn reupload(&self, item: ItemId, source: Arc<str>, carry_state: bool) {
        let Ok(instance) = self.registry.lookup_item(item) else {
            return;
        };
        let _dispatch = instance.dispatch_lock();
        let previous = {
            let mut data = instance.data();
            if data.lifecycle != LifecycleState::Loaded {
                // A load that has not run yet simply picks up the new source.
                if data.lifecycle == LifecycleState::New {
                    data.fingerprint = Fingerprint::of(&source);
                    data.source = source;
                }
                return;
            }
            data.lifecycle = LifecycleState::Reloading;
            data.fingerprint = Fingerprint::of(&source);
            data.source = source.clone();
            data.artifact.take()
        };
        if let Some(previous) = previous {
            self.registry.release_artifact(&previous);
        }
        self.reporter.begin(item);
        {
            let mut data = instance.data();
            if data.lifecycle == LifecycleState::Reloading {
                data.lifecycle = LifecycleState::Compiling;
            }
        }

        let (artifact, diagnostics) = match self.acquire_artifact(&source) {
            Ok(compiled) => compiled,
            Err(diagnostics) => {
                let error = ScriptError::CompileFailure { item, diagnostics: diagnostics.clone() };
                self.fail_load(&instance, error, diagnostics);
                return;
            }
        };

        let execution = {
            let mut data = instance.data();
            data.artifact = Some(artifact);
            Execution::from_data(&data)
        };
        let locals = match (&execution, carry_state) {
            (Some(execution), false) => Some(self.initial_locals(&instance, execution)),
            _ => None,
        };
        if !carry_state {
            self.plugins.remove_script(item);
        }

        let (running, version) = {
            let mut data = instance.data();
            data.version += 1;
            if let Some(locals) = locals {
                data.locals = locals;
                data.script_state = DEFAULT_STATE.to_string();
                data.event_delay = Duration::ZERO;
            }
            data.running = true;
            if data.lifecycle == LifecycleState::Compiling {
                data.lifecycle = LifecycleState::Loaded;
                if !carry_state {
                    self.queue_event_locked(&instance, &data, ScriptEvent::new(STATE_ENTRY).with_priority(PriorityClass::FirstStart));
                }
            }
            self.queue.set_held(item, !data.running || data.suspended);
            (data.running, data.version)
        };
        tracing::debug!(item = %item, version, carry_state, "script recompiled");
        self.reporter.publish(item, diagnostics);
        self.world.running_changed(item, running);
    }

    fn reset(&self, item: ItemId) {
        let Ok(instance) = self.registry.lookup_item(item) else {
            return;
        };
        let _dispatch = instance.dispatch_lock();
        if instance.data().lifecycle != LifecycleState::Loaded {
            return;
        }
        self.reset_locked(&instance);
    }

    /// Moves the instance to a new host without recompiling. Queued events stay with the old
    /// host and are dropped; the script gets a single `changed` event.
    fn cross(&self, item: ItemId, object: ObjectId, state_source: StateSource) {
        let Ok(instance) = self.registry.lookup_item(item) else {
            return;
        };
        let _dispatch = instance.dispatch_lock();
        let mut data = instance.data();
        if data.lifecycle.is_terminal() {
            return;
        }
        if let Err(error) = self.registry.rehost(item, object) {
            tracing::warn!(item = %item, error = %error, "crossing target vanished");
            return;
        }
        let from = std::mem::replace(&mut data.object, object);
        data.state_source = state_source | StateSource::PRIM_CROSSING;
        let discarded = self.queue.discard_events(item);
        self.queue_event_locked(&instance, &data, ScriptEvent::new(CHANGED).with_arg(CHANGED_REGION));
        tracing::debug!(item = %item, from = %from, to = %object, discarded, "script crossed");
    }

    fn set_state(&self, item: ItemId, name: String) {
        let Ok(instance) = self.registry.lookup_item(item) else {
            return;
        };
        let _dispatch = instance.dispatch_lock();
        let execution = {
            let data = instance.data();
            if data.lifecycle != LifecycleState::Loaded {
                return;
            }
            Execution::from_data(&data)
        };
        if let Some(execution) = execution {
            self.change_state_locked(&instance, &execution, name);
        }
    }

    /// Tears the instance down. Waits for any in-flight handler before releasing the domain.
    /// Unloading something already gone is a no-op.
    fn unload(&self, item: ItemId) {
        let Ok(instance) = self.registry.lookup_item(item) else {
            return;
        };
        {
            let mut data = instance.data();
            if data.lifecycle == LifecycleState::Disposed {
                return;
            }
            data.lifecycle = LifecycleState::Unloading;
        }
        self.queue.discard_events(item);
        let _dispatch = instance.dispatch_lock();
        let (artifact, was_running) = {
            let mut data = instance.data();
            let was_running = data.running;
            data.running = false;
            data.sandbox = None;
            data.domain = None;
            data.lifecycle = LifecycleState::Disposed;
            (data.artifact.take(), was_running)
        };
        if let Some(artifact) = artifact {
            self.registry.release_artifact(&artifact);
        }
        self.domains.release(item);
        self.reporter.forget(item);
        self.remove_instance(&instance);
        if was_running {
            self.world.running_changed(item, false);
        }
        tracing::debug!(item = %item, "script unloaded");
    }

    /// Final detach from the queue, plugins and registry.
    pub(crate) fn remove_instance(&self, instance: &ScriptInstance) {
        let item = instance.item();
        self.queue.close_mailbox(item);
        self.plugins.remove_script(item);
        if let Some(removal) = self.registry.remove(item) {
            self.world.script_removed(item, removal.object);
            if removal.object_emptied {
                self.world.object_removed(removal.object);
            }
        }
    }
}
