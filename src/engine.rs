use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::compiler::{CompiledArtifact, Compiler, Diagnostics};
use crate::config::EngineConfig;
use crate::domains::{DomainManager, DomainStats, DomainSummary};
use crate::error::{ScriptError, ScriptResult};
use crate::events::{DetectParams, ScriptEvent};
use crate::ids::{ItemId, ObjectId};
use crate::instance::{InstanceSettings, InstanceSummary, LifecycleState, ScriptInstance, StateSource};
use crate::lifecycle::LifecycleRequest;
use crate::lock;
use crate::permissions::{self, PermissionTable, TrustLevel};
use crate::persistence::{MemoryStateStore, StateStore};
use crate::plugins::{PluginSet, ScriptPlugin};
use crate::registry::ScriptRegistry;
use crate::reporting::{ErrorFetch, ErrorReporter};
use crate::scheduler::{EventQueue, PoolStats, QueueDepth, WorkerPools};
use crate::scripts::ScriptCompiler;
use crate::serializer::{self, StateSnapshot};
use crate::world::{NullWorld, WorldHost};

#[derive(Default)]
pub(crate) struct EngineCounters {
    pub compiled: AtomicU64,
    pub dispatched: AtomicU64,
    pub events_since_take: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub faults: AtomicU64,
    pub load_failures: AtomicU64,
}

/// State shared by the facade and every worker thread.
pub(crate) struct EngineCore {
    pub config: EngineConfig,
    pub registry: ScriptRegistry,
    pub domains: DomainManager,
    pub queue: EventQueue,
    pub compiler: Arc<dyn Compiler>,
    pub world: Arc<dyn WorldHost>,
    pub store: Arc<dyn StateStore>,
    pub plugins: PluginSet,
    pub reporter: ErrorReporter,
    pub counters: EngineCounters,
}

/// External collaborators handed to the engine at construction.
pub struct EngineCollaborators {
    pub world: Arc<dyn WorldHost>,
    pub store: Arc<dyn StateStore>,
    pub compiler: Arc<dyn Compiler>,
    /// Registered after the built-in timer plugin.
    pub plugins: Vec<Box<dyn ScriptPlugin>>,
}

impl Default for EngineCollaborators {
    fn default() -> Self {
        Self {
            world: Arc::new(NullWorld),
            store: Arc::new(MemoryStateStore::new()),
            compiler: Arc::new(ScriptCompiler::new()),
            plugins: Vec::new(),
        }
    }
}

impl EngineCollaborators {
    pub fn with_world(mut self, world: Arc<dyn WorldHost>) -> Self {
        self.world = world;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_plugin(mut self, plugin: Box<dyn ScriptPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }
}

/// A request to start one script on one object.
#[derive(Debug, Clone)]
pub struct ScriptSpec {
    pub item: ItemId,
    pub object: ObjectId,
    pub source: Arc<str>,
    pub start_param: i64,
    /// Queue `on_rez(start_param)` after `state_entry`.
    pub post_on_rez: bool,
    pub state_source: StateSource,
    /// Defaults to the configured trust level.
    pub trust: Option<TrustLevel>,
    /// Resume from the persistence connector when it holds a matching save.
    pub restore_state: bool,
}

impl ScriptSpec {
    pub fn new(item: ItemId, object: ObjectId, source: impl Into<Arc<str>>) -> Self {
        Self {
            item,
            object,
            source: source.into(),
            start_param: 0,
            post_on_rez: false,
            state_source: StateSource::NEW_REZ,
            trust: None,
            restore_state: false,
        }
    }

    pub fn with_start_param(mut self, start_param: i64) -> Self {
        self.start_param = start_param;
        self
    }

    pub fn with_on_rez(mut self) -> Self {
        self.post_on_rez = true;
        self
    }

    pub fn with_state_source(mut self, state_source: StateSource) -> Self {
        self.state_source = state_source;
        self
    }

    pub fn with_trust(mut self, trust: TrustLevel) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn restoring(mut self) -> Self {
        self.restore_state = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub scripts: usize,
    pub running: usize,
    pub suspended: usize,
    pub enabled: bool,
    pub domains: DomainStats,
    pub compiled: u64,
    pub cached_artifacts: usize,
    pub dispatched: u64,
    pub stale_dropped: u64,
    pub faults: u64,
    pub load_failures: u64,
    /// Compile results published but not yet fetched.
    pub pending_reports: usize,
    pub queue: QueueDepth,
    pub execution: PoolStats,
    pub maintenance: PoolStats,
}

/// Script runtime facade. Owns the registry, domain manager, queue and both worker pools.
pub struct ScriptEngine {
    core: Arc<EngineCore>,
    pools: Mutex<Option<WorkerPools>>,
}

impl ScriptEngine {
    pub fn new(config: EngineConfig, collaborators: EngineCollaborators) -> ScriptResult<Self> {
        if config.domain_capacity == 0 || config.max_domains == 0 {
            return Err(ScriptError::Config("domain_capacity and max_domains must be at least 1".to_string()));
        }
        let permissions = PermissionTable::new(&config.function_trust);
        let core = Arc::new(EngineCore {
            registry: ScriptRegistry::new(permissions),
            domains: DomainManager::new(
                config.domain_capacity,
                config.max_domains,
                config.sandbox.clone(),
                config.handler_budget(),
            ),
            queue: EventQueue::new(config.maintenance_interval()),
            compiler: collaborators.compiler,
            world: collaborators.world,
            store: collaborators.store,
            plugins: PluginSet::with_builtins(collaborators.plugins),
            reporter: ErrorReporter::new(),
            counters: EngineCounters::default(),
            config,
        });
        let pools = WorkerPools::spawn(core.clone(), core.config.execution_workers, core.config.maintenance_workers)
            .map_err(|err| ScriptError::Config(format!("failed to start worker threads: {err}")))?;
        let (execution, maintenance) = pools.sizes();
        tracing::info!(execution, maintenance, plugins = ?core.plugins.names(), "script engine started");
        Ok(Self { core, pools: Mutex::new(Some(pools)) })
    }

    pub fn with_defaults() -> ScriptResult<Self> {
        Self::new(EngineConfig::default(), EngineCollaborators::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    fn live(&self) -> ScriptResult<&EngineCore> {
        if self.core.queue.is_shut_down() {
            return Err(ScriptError::ShutDown);
        }
        Ok(&self.core)
    }

    fn instance(&self, item: ItemId) -> ScriptResult<Arc<ScriptInstance>> {
        self.live()?.registry.lookup_item(item)
    }

    /// Registers a script and queues its load. Starting an existing script with
    /// `PRIM_CROSSING` set on a different object performs a crossing instead.
    pub fn start_script(&self, spec: ScriptSpec) -> ScriptResult<()> {
        let core = self.live()?;
        if let Ok(existing) = core.registry.lookup_item(spec.item) {
            if spec.state_source.contains(StateSource::PRIM_CROSSING) && existing.object() != spec.object {
                core.queue.push_lifecycle(
                    spec.item,
                    LifecycleRequest::Crossing { object: spec.object, state_source: spec.state_source },
                );
                return Ok(());
            }
            return Err(ScriptError::DuplicateIdentity { object: existing.object(), item: spec.item });
        }

        let restored = if spec.restore_state { self.saved_instance(&spec) } else { None };
        let is_restore = restored.is_some();
        let instance = Arc::new(restored.unwrap_or_else(|| {
            ScriptInstance::new(
                spec.item,
                InstanceSettings {
                    object: spec.object,
                    source: spec.source.clone(),
                    start_param: spec.start_param,
                    post_on_rez: spec.post_on_rez,
                    state_source: spec.state_source,
                    trust: spec.trust.unwrap_or(core.config.default_trust_level),
                },
            )
        }));
        self.admit(instance, spec.object, is_restore)
    }

    fn saved_instance(&self, spec: &ScriptSpec) -> Option<ScriptInstance> {
        let blob = match self.core.store.load_state(spec.item) {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(item = %spec.item, error = %err, "failed to read saved state; starting fresh");
                return None;
            }
        };
        let snapshot = match StateSnapshot::decode(&blob) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(item = %spec.item, error = %err, "saved state is unreadable; starting fresh");
                return None;
            }
        };
        if snapshot.item != spec.item || snapshot.source.as_str() != &*spec.source {
            tracing::debug!(item = %spec.item, "saved state belongs to different source; starting fresh");
            return None;
        }
        let trust = spec.trust.unwrap_or(snapshot.trust);
        match serializer::instantiate(&snapshot, spec.object, trust) {
            Ok(instance) => Some(instance),
            Err(err) => {
                tracing::warn!(item = %spec.item, error = %err, "saved state could not be restored; starting fresh");
                None
            }
        }
    }

    fn admit(&self, instance: Arc<ScriptInstance>, object: ObjectId, restored: bool) -> ScriptResult<()> {
        let core = self.live()?;
        let item = instance.item();
        core.registry.register(object, instance)?;
        core.queue.open_mailbox(item);
        core.queue.push_lifecycle(item, LifecycleRequest::Load { attempt: 0, restored });
        tracing::debug!(item = %item, object = %object, restored, "script queued for load");
        Ok(())
    }

    /// Restores a captured blob onto `object`. No startup events fire for the restored script.
    pub fn restore_script(&self, blob: &[u8], object: ObjectId) -> ScriptResult<ItemId> {
        let core = self.live()?;
        let snapshot = StateSnapshot::decode(blob)?;
        if let Ok(existing) = core.registry.lookup_item(snapshot.item) {
            return Err(ScriptError::DuplicateIdentity { object: existing.object(), item: snapshot.item });
        }
        let instance = serializer::instantiate(&snapshot, object, snapshot.trust)?;
        self.admit(Arc::new(instance), object, true)?;
        Ok(snapshot.item)
    }

    /// Replaces the source of a script and recompiles it.
    pub fn update_script(&self, item: ItemId, source: impl Into<Arc<str>>, carry_state: bool) -> ScriptResult<()> {
        self.instance(item)?;
        let request = LifecycleRequest::Reupload { source: source.into(), carry_state };
        self.core.queue.push_lifecycle(item, request);
        Ok(())
    }

    /// Tears the script down. Stopping a script that is gone or already stopping is a no-op.
    pub fn stop_script(&self, item: ItemId) -> ScriptResult<()> {
        let core = self.live()?;
        let Ok(instance) = core.registry.lookup_item(item) else {
            return Ok(());
        };
        {
            let mut data = instance.data();
            if data.lifecycle.is_terminal() {
                return Ok(());
            }
            data.lifecycle = LifecycleState::Unloading;
        }
        let discarded = core.queue.discard_events(item);
        core.queue.push_lifecycle(item, LifecycleRequest::Unload);
        tracing::debug!(item = %item, discarded, "script unload requested");
        Ok(())
    }

    pub fn reset_script(&self, item: ItemId) -> ScriptResult<()> {
        self.instance(item)?;
        self.core.queue.push_lifecycle(item, LifecycleRequest::Reset);
        Ok(())
    }

    /// Moves a script to another object without recompiling; it receives `changed(512)`.
    pub fn cross_script(&self, item: ItemId, object: ObjectId) -> ScriptResult<()> {
        let instance = self.instance(item)?;
        let state_source = instance.data().state_source | StateSource::PRIM_CROSSING;
        self.core.queue.push_lifecycle(item, LifecycleRequest::Crossing { object, state_source });
        Ok(())
    }

    pub fn suspend(&self, item: ItemId) -> ScriptResult<()> {
        self.set_suspended(item, true)
    }

    pub fn resume(&self, item: ItemId) -> ScriptResult<()> {
        self.set_suspended(item, false)
    }

    fn set_suspended(&self, item: ItemId, suspended: bool) -> ScriptResult<()> {
        let instance = self.instance(item)?;
        let (changed, object) = {
            let mut data = instance.data();
            let changed = data.suspended != suspended;
            data.suspended = suspended;
            self.core.queue.set_held(item, !data.running || data.suspended);
            (changed, data.object)
        };
        if changed {
            self.core.world.suspended_changed(item, suspended);
            self.core.world.visual_update(object);
        }
        Ok(())
    }

    /// Starts or stops event delivery. A stopped script keeps its state and queued events.
    pub fn set_running(&self, item: ItemId, running: bool) -> ScriptResult<()> {
        let instance = self.instance(item)?;
        let (changed, object) = {
            let mut data = instance.data();
            let changed = data.running != running;
            data.running = running;
            if running {
                data.consecutive_faults = 0;
                data.needs_attention = false;
            }
            self.core.queue.set_held(item, !data.running || data.suspended);
            (changed, data.object)
        };
        if changed {
            tracing::debug!(item = %item, running, "script running state changed");
            self.core.world.running_changed(item, running);
            self.core.world.visual_update(object);
        }
        Ok(())
    }

    pub fn is_running(&self, item: ItemId) -> ScriptResult<bool> {
        Ok(self.instance(item)?.data().running)
    }

    pub fn stop_all(&self) -> ScriptResult<usize> {
        let scripts = self.live()?.registry.list_all();
        let mut stopped = 0;
        for instance in scripts {
            let running = instance.data().running;
            if running && self.set_running(instance.item(), false).is_ok() {
                stopped += 1;
            }
        }
        tracing::info!(stopped, "stopped all scripts");
        Ok(stopped)
    }

    /// Queues `event` for one script. Returns false when the script is being torn down.
    pub fn post_event(&self, object: ObjectId, item: ItemId, event: ScriptEvent) -> ScriptResult<bool> {
        let core = self.live()?;
        let instance = core.registry.lookup(object, item)?;
        Ok(core.post(&instance, event))
    }

    /// Queues `event` for every script on `object`. Returns how many accepted it.
    pub fn post_object_event(&self, object: ObjectId, event: ScriptEvent) -> ScriptResult<usize> {
        Ok(self.live()?.post_object(object, &event))
    }

    // ----- per-script queries -----

    pub fn set_min_event_delay(&self, item: ItemId, seconds: f64) -> ScriptResult<()> {
        let delay = if seconds.is_finite() && seconds > 0.0 { Duration::from_secs_f64(seconds) } else { Duration::ZERO };
        self.instance(item)?.data().event_delay = delay;
        Ok(())
    }

    /// Detect data of the `n`th most recent detection; 0 is the latest.
    pub fn detect_params(&self, item: ItemId, n: usize) -> ScriptResult<Option<DetectParams>> {
        Ok(self.instance(item)?.data().detected.iter().rev().nth(n).cloned())
    }

    pub fn start_param(&self, item: ItemId) -> ScriptResult<i64> {
        Ok(self.instance(item)?.data().start_param)
    }

    pub fn script_state(&self, item: ItemId) -> ScriptResult<String> {
        Ok(self.instance(item)?.data().script_state.clone())
    }

    /// Switches the script-defined state, running the old state's `state_exit` first.
    pub fn set_script_state(&self, item: ItemId, state: impl Into<String>) -> ScriptResult<()> {
        let state = state.into();
        self.instance(item)?;
        if !CompiledArtifact::is_valid_state_name(&state) {
            return Err(ScriptError::InvalidStateName(state));
        }
        self.core.queue.push_lifecycle(item, LifecycleRequest::SetState(state));
        Ok(())
    }

    pub fn summary(&self, item: ItemId) -> ScriptResult<InstanceSummary> {
        Ok(self.instance(item)?.snapshot())
    }

    /// Copy of the script's local variables. Waits for a running handler to finish.
    pub fn locals(&self, item: ItemId) -> ScriptResult<rhai::Map> {
        let instance = self.instance(item)?;
        let _dispatch = instance.dispatch_lock();
        let locals = instance.data().locals.clone();
        Ok(locals)
    }

    pub fn active_scripts(&self, object: ObjectId) -> ScriptResult<usize> {
        let scripts = self.live()?.registry.list_by_object(object);
        Ok(scripts.iter().filter(|instance| instance.data().running).count())
    }

    pub fn total_scripts(&self, object: ObjectId) -> ScriptResult<usize> {
        Ok(self.live()?.registry.list_by_object(object).len())
    }

    pub fn scripts_on(&self, object: ObjectId) -> ScriptResult<Vec<ItemId>> {
        Ok(self.live()?.registry.list_by_object(object).iter().map(|instance| instance.item()).collect())
    }

    /// Opaque snapshot of a loaded script, taken between handler runs.
    pub fn capture_state(&self, item: ItemId) -> ScriptResult<Vec<u8>> {
        let instance = self.instance(item)?;
        serializer::capture(&instance, &self.core.plugins)?.encode()
    }

    pub fn save_state(&self, item: ItemId) -> ScriptResult<()> {
        let blob = self.capture_state(item)?;
        self.core.store.save_state(item, &blob).map_err(|err| {
            tracing::warn!(item = %item, error = %err, "failed to save script state");
            err
        })
    }

    /// Diagnostics of the latest compile of `item`, waiting a bounded time for it to finish.
    pub fn script_errors(&self, item: ItemId) -> ScriptResult<ErrorFetch> {
        let core = self.live()?;
        Ok(core.reporter.fetch(item, core.config.error_fetch_timeout()))
    }

    pub fn test_compile(&self, source: &str) -> ScriptResult<Diagnostics> {
        let core = self.live()?;
        core.counters.compiled.fetch_add(1, Ordering::Relaxed);
        Ok(core.compiler.compile(source).diagnostics)
    }

    pub fn function_names(&self) -> Vec<&'static str> {
        permissions::function_names()
    }

    pub fn enable(&self) -> ScriptResult<()> {
        self.live()?.queue.set_enabled(true);
        tracing::info!("script dispatch enabled");
        Ok(())
    }

    /// Halts event dispatch. Queues keep accepting events and lifecycle work still runs.
    pub fn disable(&self) -> ScriptResult<()> {
        self.live()?.queue.set_enabled(false);
        tracing::info!("script dispatch disabled");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.core.queue.is_enabled()
    }

    /// Drops every cached artifact and saved state, then recompiles and restarts every script.
    pub fn restart_all(&self) -> ScriptResult<usize> {
        let core = self.live()?;
        let dropped = core.registry.reset_cache(true);
        match core.store.saved_items() {
            Ok(items) => {
                for item in items {
                    if let Err(err) = core.store.delete_state(item) {
                        tracing::warn!(item = %item, error = %err, "failed to delete saved state");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to list saved states"),
        }
        let scripts = core.registry.list_all();
        for instance in &scripts {
            let source = instance.data().source.clone();
            core.queue.push_lifecycle(instance.item(), LifecycleRequest::Reupload { source, carry_state: false });
        }
        tracing::info!(scripts = scripts.len(), dropped, "restarting all scripts");
        Ok(scripts.len())
    }

    /// Soft cache reset: drops artifacts no script references.
    pub fn trim_cache(&self) -> ScriptResult<usize> {
        Ok(self.live()?.registry.reset_cache(false))
    }

    pub fn domains(&self) -> Vec<DomainSummary> {
        self.core.domains.summaries()
    }

    pub fn stats(&self) -> EngineStats {
        let core = &self.core;
        let summaries: Vec<InstanceSummary> = core.registry.list_all().iter().map(|i| i.snapshot()).collect();
        let (execution_workers, maintenance_workers) =
            lock(&self.pools).as_ref().map(WorkerPools::sizes).unwrap_or((0, 0));
        let (execution_idle, maintenance_idle) = core.queue.idle_workers();
        EngineStats {
            scripts: summaries.len(),
            running: summaries.iter().filter(|summary| summary.running).count(),
            suspended: summaries.iter().filter(|summary| summary.suspended).count(),
            enabled: core.queue.is_enabled(),
            domains: core.domains.stats(),
            compiled: core.counters.compiled.load(Ordering::Relaxed),
            cached_artifacts: core.registry.cached_artifacts(),
            dispatched: core.counters.dispatched.load(Ordering::Relaxed),
            stale_dropped: core.counters.stale_dropped.load(Ordering::Relaxed),
            faults: core.counters.faults.load(Ordering::Relaxed),
            load_failures: core.counters.load_failures.load(Ordering::Relaxed),
            pending_reports: core.reporter.pending(),
            queue: core.queue.depth(),
            execution: PoolStats { workers: execution_workers, idle: execution_idle },
            maintenance: PoolStats { workers: maintenance_workers, idle: maintenance_idle },
        }
    }

    /// Scripts with the highest accumulated execution time first.
    pub fn top_scripts(&self, limit: usize) -> Vec<InstanceSummary> {
        let mut summaries: Vec<InstanceSummary> =
            self.core.registry.list_all().iter().map(|instance| instance.snapshot()).collect();
        summaries.sort_by(|a, b| b.score.total_cmp(&a.score));
        summaries.truncate(limit.min(self.core.config.top_scripts_limit));
        summaries
    }

    /// Events dispatched since the previous call.
    pub fn take_event_count(&self) -> u64 {
        self.core.counters.events_since_take.swap(0, Ordering::Relaxed)
    }

    /// Blocks until nothing dispatchable is queued and no work is in flight, or `timeout`
    /// passes. Returns whether the engine went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.core.queue.wait_idle(timeout)
    }

    /// Stops both worker pools. Queued work is abandoned.
    pub fn shutdown(&self) {
        let pools = lock(&self.pools).take();
        if let Some(mut pools) = pools {
            self.core.queue.shutdown();
            pools.join();
            tracing::info!(scripts = self.core.registry.len(), "script engine shut down");
        }
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
