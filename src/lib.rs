pub mod compiler;
pub mod config;
pub mod domains;
pub mod engine;
pub mod error;
pub mod events;
pub mod ids;
pub mod instance;
pub(crate) mod lifecycle;
pub mod permissions;
pub mod persistence;
pub mod plugins;
pub mod registry;
pub mod reporting;
mod scheduler;
pub mod scripts;
pub mod serializer;
pub mod world;

use std::sync::{Mutex, MutexGuard};

pub use compiler::{CompileOutput, CompiledArtifact, Compiler, Diagnostic, Diagnostics, Severity};
pub use config::{EngineConfig, SandboxConfig};
pub use domains::{DomainStats, DomainSummary};
pub use engine::{EngineCollaborators, EngineStats, ScriptEngine, ScriptSpec};
pub use error::{ScriptError, ScriptResult};
pub use events::{DetectParams, EventArg, EventArgs, PriorityClass, ScriptEvent};
pub use ids::{DomainId, Fingerprint, ItemId, ObjectId};
pub use instance::{InstanceSummary, LifecycleState, StateSource};
pub use permissions::TrustLevel;
pub use persistence::{DirectoryStateStore, MemoryStateStore, StateStore};
pub use plugins::{PluginContext, PluginEvent, PluginSet, ScriptPlugin, TimerPlugin};
pub use reporting::ErrorFetch;
pub use scheduler::{PoolStats, QueueDepth};
pub use scripts::ScriptCompiler;
pub use world::{ChatMessage, ChatScope, NullWorld, WorldHost};

/// Locks `mutex`, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
