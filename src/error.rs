use std::time::Duration;

use thiserror::Error;

use crate::compiler::Diagnostics;
use crate::ids::{ItemId, ObjectId};

/// Errors raised by the script runtime.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script {item} on object {object} is already registered")]
    DuplicateIdentity { object: ObjectId, item: ItemId },

    #[error("script {0} not found")]
    NotFound(ItemId),

    #[error("no isolation domain available for script {item} (limit {limit})")]
    SandboxUnavailable { item: ItemId, limit: usize },

    #[error("script {item} failed to compile")]
    CompileFailure { item: ItemId, diagnostics: Diagnostics },

    #[error("event for script {item} was queued at version {queued} but the script is at {current}")]
    StaleVersion { item: ItemId, queued: u32, current: u32 },

    #[error("script {item} faulted: {message}")]
    HandlerFault { item: ItemId, message: String },

    #[error("script {item} exceeded the handler time limit of {limit:?}")]
    HandlerTimeout { item: ItemId, limit: Duration },

    #[error("'{0}' is not a valid state name")]
    InvalidStateName(String),

    #[error("persisted state is unreadable: {0}")]
    StateFormat(String),

    #[error("persistence connector failed: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("the script engine has been shut down")]
    ShutDown,
}

impl From<bincode::Error> for ScriptError {
    fn from(err: bincode::Error) -> Self {
        ScriptError::StateFormat(err.to_string())
    }
}

impl From<serde_json::Error> for ScriptError {
    fn from(err: serde_json::Error) -> Self {
        ScriptError::StateFormat(err.to_string())
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;
