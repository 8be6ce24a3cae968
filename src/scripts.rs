use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Scope};

use crate::compiler::{
    CompileOutput, CompiledArtifact, Compiler, Diagnostic, Diagnostics, DEFAULT_STATE, GLOBALS_FN,
};
use crate::config::SandboxConfig;
use crate::events::DetectParams;
use crate::ids::{DomainId, Fingerprint, ItemId, ObjectId};
use crate::lock;
use crate::permissions::{PermissionTable, TrustLevel};
use crate::world::{ChatMessage, ChatScope};

type ApiResult<T> = Result<T, Box<EvalAltResult>>;

thread_local! {
    static ACTIVE_SIGNAL: RefCell<Option<Arc<HandlerSignal>>> = RefCell::new(None);
}

/// Cooperative stop request for the handler running on the current thread. Checked by the
/// sandbox progress hook, so a handler is cut short at its next operation.
#[derive(Debug)]
pub struct HandlerSignal {
    deadline: Option<Instant>,
    abort: AtomicBool,
    timed_out: AtomicBool,
}

impl HandlerSignal {
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            deadline: budget.map(|limit| Instant::now() + limit),
            abort: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    fn poll(&self, operations: u64) -> Option<Dynamic> {
        if self.aborted() {
            return Some("abort".into());
        }
        if operations % 64 != 0 {
            return None;
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.timed_out.store(true, Ordering::SeqCst);
                Some("timeout".into())
            }
            _ => None,
        }
    }
}

struct SignalGuard;

impl SignalGuard {
    fn install(signal: Arc<HandlerSignal>) -> Self {
        ACTIVE_SIGNAL.with(|slot| *slot.borrow_mut() = Some(signal));
        SignalGuard
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        ACTIVE_SIGNAL.with(|slot| slot.borrow_mut().take());
    }
}

fn poll_active_signal(operations: u64) -> Option<Dynamic> {
    ACTIVE_SIGNAL.with(|slot| slot.borrow().as_ref().and_then(|signal| signal.poll(operations)))
}

/// Side effects requested by one handler run. Applied by the dispatcher after the handler returns.
#[derive(Debug, Default)]
pub struct HandlerEffects {
    pub logs: Vec<String>,
    pub chat: Vec<ChatMessage>,
    pub object_messages: Vec<(ObjectId, String)>,
    /// `Some(Duration::ZERO)` cancels the timer.
    pub timer: Option<Duration>,
    pub event_delay: Option<Duration>,
    pub state_change: Option<String>,
    pub reset: bool,
}

/// Per-invocation view of the instance a handler runs for.
pub struct ApiContext {
    pub item: ItemId,
    pub object: ObjectId,
    pub domain: Option<DomainId>,
    pub ceiling: TrustLevel,
    pub start_param: i64,
    pub detected: Vec<DetectParams>,
    permissions: Arc<PermissionTable>,
    signal: Arc<HandlerSignal>,
    effects: Mutex<HandlerEffects>,
}

impl ApiContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        item: ItemId,
        object: ObjectId,
        domain: Option<DomainId>,
        ceiling: TrustLevel,
        start_param: i64,
        detected: Vec<DetectParams>,
        permissions: Arc<PermissionTable>,
        budget: Option<Duration>,
    ) -> Self {
        Self {
            item,
            object,
            domain,
            ceiling,
            start_param,
            detected,
            permissions,
            signal: Arc::new(HandlerSignal::new(budget)),
            effects: Mutex::new(HandlerEffects::default()),
        }
    }

    fn take_effects(&self) -> HandlerEffects {
        std::mem::take(&mut *lock(&self.effects))
    }
}

/// The `world` object handed to every handler as its first argument.
#[derive(Clone)]
pub struct ScriptApi {
    ctx: Arc<ApiContext>,
}

impl ScriptApi {
    pub fn new(ctx: Arc<ApiContext>) -> Self {
        Self { ctx }
    }

    fn guard(&self, function: &str) -> ApiResult<()> {
        let ctx = &self.ctx;
        if ctx.permissions.permits(ctx.ceiling, ctx.domain, function) {
            Ok(())
        } else {
            Err(format!("permission denied: '{function}' is not allowed at trust level {}", ctx.ceiling).into())
        }
    }

    fn effects(&self) -> std::sync::MutexGuard<'_, HandlerEffects> {
        lock(&self.ctx.effects)
    }

    fn log(&mut self, message: &str) -> ApiResult<()> {
        self.guard("log")?;
        self.effects().logs.push(message.to_string());
        Ok(())
    }

    fn change_state(&mut self, name: &str) -> ApiResult<()> {
        self.guard("state")?;
        if !CompiledArtifact::is_valid_state_name(name) {
            return Err(format!("'{name}' is not a valid state name").into());
        }
        self.effects().state_change = Some(name.to_string());
        self.ctx.signal.abort();
        Ok(())
    }

    fn reset(&mut self) -> ApiResult<()> {
        self.guard("reset")?;
        self.effects().reset = true;
        self.ctx.signal.abort();
        Ok(())
    }

    fn item_id(&mut self) -> ApiResult<String> {
        self.guard("item_id")?;
        Ok(self.ctx.item.to_string())
    }

    fn object_id(&mut self) -> ApiResult<String> {
        self.guard("object_id")?;
        Ok(self.ctx.object.to_string())
    }

    fn start_param(&mut self) -> ApiResult<rhai::INT> {
        self.guard("start_param")?;
        Ok(self.ctx.start_param)
    }

    fn detected_count(&mut self) -> ApiResult<rhai::INT> {
        self.guard("detected_count")?;
        Ok(self.ctx.detected.len() as rhai::INT)
    }

    fn detected(&self, index: rhai::INT) -> Option<&DetectParams> {
        usize::try_from(index).ok().and_then(|i| self.ctx.detected.get(i))
    }

    fn detected_key(&mut self, index: rhai::INT) -> ApiResult<String> {
        self.guard("detected_key")?;
        Ok(self.detected(index).map(|d| d.key.to_string()).unwrap_or_default())
    }

    fn detected_name(&mut self, index: rhai::INT) -> ApiResult<String> {
        self.guard("detected_name")?;
        Ok(self.detected(index).map(|d| d.name.clone()).unwrap_or_default())
    }

    fn min_event_delay(&mut self, seconds: rhai::FLOAT) -> ApiResult<()> {
        self.guard("min_event_delay")?;
        self.effects().event_delay = Some(seconds_to_duration(seconds));
        Ok(())
    }

    fn set_timer(&mut self, seconds: rhai::FLOAT) -> ApiResult<()> {
        self.guard("set_timer")?;
        self.effects().timer = Some(seconds_to_duration(seconds));
        Ok(())
    }

    fn say(&mut self, channel: rhai::INT, text: &str) -> ApiResult<()> {
        self.guard("say")?;
        self.effects().chat.push(ChatMessage { channel, text: text.to_string(), scope: ChatScope::Local });
        Ok(())
    }

    fn region_say(&mut self, channel: rhai::INT, text: &str) -> ApiResult<()> {
        self.guard("region_say")?;
        self.effects().chat.push(ChatMessage { channel, text: text.to_string(), scope: ChatScope::Region });
        Ok(())
    }

    fn os_message_object(&mut self, object: &str, text: &str) -> ApiResult<()> {
        self.guard("os_message_object")?;
        let target: ObjectId = object.parse().map_err(|_| format!("'{object}' is not an object id"))?;
        self.effects().object_messages.push((target, text.to_string()));
        Ok(())
    }
}

fn seconds_to_duration(seconds: rhai::FLOAT) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptApi>("World");
    engine.register_fn("log", ScriptApi::log);
    engine.register_fn("state", ScriptApi::change_state);
    engine.register_fn("reset", ScriptApi::reset);
    engine.register_fn("item_id", ScriptApi::item_id);
    engine.register_fn("object_id", ScriptApi::object_id);
    engine.register_fn("start_param", ScriptApi::start_param);
    engine.register_fn("detected_count", ScriptApi::detected_count);
    engine.register_fn("detected_key", ScriptApi::detected_key);
    engine.register_fn("detected_name", ScriptApi::detected_name);
    engine.register_fn("min_event_delay", ScriptApi::min_event_delay);
    engine.register_fn("min_event_delay", |api: &mut ScriptApi, seconds: rhai::INT| {
        api.min_event_delay(seconds as rhai::FLOAT)
    });
    engine.register_fn("set_timer", ScriptApi::set_timer);
    engine.register_fn("set_timer", |api: &mut ScriptApi, seconds: rhai::INT| api.set_timer(seconds as rhai::FLOAT));
    engine.register_fn("say", ScriptApi::say);
    engine.register_fn("region_say", ScriptApi::region_say);
    engine.register_fn("os_message_object", ScriptApi::os_message_object);
}

/// Front end shared by every load: parses source into an artifact plus diagnostics.
pub struct ScriptCompiler {
    engine: Engine,
}

impl ScriptCompiler {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        register_api(&mut engine);
        Self { engine }
    }
}

impl Default for ScriptCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for ScriptCompiler {
    fn compile(&self, source: &str) -> CompileOutput {
        match self.engine.compile(source) {
            Ok(ast) => {
                let functions: HashMap<String, usize> =
                    ast.iter_functions().map(|f| (f.name.to_string(), f.params.len())).collect();
                let artifact = CompiledArtifact { fingerprint: Fingerprint::of(source), ast, functions };
                let mut diagnostics = Diagnostics::ok();
                if !artifact.has_handlers_for(DEFAULT_STATE) {
                    diagnostics
                        .messages
                        .push(Diagnostic::warning(1, 1, "script defines no handlers for the default state"));
                }
                CompileOutput { artifact: Some(artifact), diagnostics }
            }
            Err(err) => {
                let position = err.position();
                CompileOutput::failure(Diagnostics {
                    success: false,
                    messages: vec![Diagnostic::error(
                        position.line().unwrap_or(0),
                        position.position().unwrap_or(0),
                        err.err_type().to_string(),
                    )],
                })
            }
        }
    }
}

#[derive(Debug)]
pub struct HandlerOutcome {
    pub effects: HandlerEffects,
    /// The handler exists and was entered.
    pub ran: bool,
    /// The handler was cut short by a `state` or `reset` request.
    pub aborted: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerFailure {
    Fault(String),
    Timeout(Duration),
}

/// Execution environment owned by one isolation domain: an engine with resource limits and the
/// script API registered.
#[derive(Debug)]
pub struct Sandbox {
    engine: Engine,
    budget: Option<Duration>,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig, budget: Option<Duration>) -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_levels);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(config.max_map_size);
        engine.on_progress(poll_active_signal);
        engine.on_print(|text| tracing::info!(target: "script", "{text}"));
        register_api(&mut engine);
        Self { engine, budget }
    }

    /// Runs `function` with `this` bound to the instance locals. Missing handlers are a no-op;
    /// extra event arguments beyond the handler's parameters are dropped.
    pub fn invoke(
        &self,
        artifact: &CompiledArtifact,
        locals: &mut Map,
        ctx: Arc<ApiContext>,
        function: &str,
        args: Vec<Dynamic>,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let started = Instant::now();
        let Some(arity) = artifact.arity(function) else {
            return Ok(HandlerOutcome {
                effects: HandlerEffects::default(),
                ran: false,
                aborted: false,
                elapsed: Duration::ZERO,
            });
        };
        let mut call_args = Vec::with_capacity(arity);
        if arity > 0 {
            call_args.push(Dynamic::from(ScriptApi::new(ctx.clone())));
            call_args.extend(args.into_iter().take(arity - 1));
        }
        while call_args.len() < arity {
            call_args.push(Dynamic::UNIT);
        }

        let mut this = Dynamic::from_map(std::mem::take(locals));
        let result = {
            let _guard = SignalGuard::install(ctx.signal.clone());
            let mut scope = Scope::new();
            let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(&mut this);
            self.engine.call_fn_with_options::<Dynamic>(options, &mut scope, &artifact.ast, function, call_args)
        };
        *locals = this.try_cast::<Map>().unwrap_or_default();

        let outcome = HandlerOutcome {
            effects: ctx.take_effects(),
            ran: true,
            aborted: ctx.signal.aborted(),
            elapsed: started.elapsed(),
        };
        match result {
            Ok(_) => Ok(outcome),
            Err(_) if outcome.aborted => Ok(outcome),
            Err(_) if ctx.signal.timed_out() => Err(HandlerFailure::Timeout(self.budget.unwrap_or_default())),
            Err(err) => Err(HandlerFailure::Fault(err.to_string())),
        }
    }

    /// Evaluates the script's `globals()` function, if any, into a fresh locals map.
    pub fn initial_locals(&self, artifact: &CompiledArtifact, ctx: Arc<ApiContext>) -> Result<Map, HandlerFailure> {
        if !artifact.defines_globals() {
            return Ok(Map::new());
        }
        let result = {
            let _guard = SignalGuard::install(ctx.signal.clone());
            let mut scope = Scope::new();
            let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
            self.engine.call_fn_with_options::<Dynamic>(options, &mut scope, &artifact.ast, GLOBALS_FN, ())
        };
        match result {
            Ok(value) => value
                .try_cast::<Map>()
                .ok_or_else(|| HandlerFailure::Fault(format!("{GLOBALS_FN}() must return an object map"))),
            Err(_) if ctx.signal.timed_out() => Err(HandlerFailure::Timeout(self.budget.unwrap_or_default())),
            Err(err) => Err(HandlerFailure::Fault(err.to_string())),
        }
    }
}
