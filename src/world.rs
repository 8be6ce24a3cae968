use crate::error::ScriptError;
use crate::ids::{ItemId, ObjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatScope {
    Local,
    Region,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub channel: i64,
    pub text: String,
    pub scope: ChatScope,
}

/// Callbacks into the simulated world hosting the scripts. Every method has a no-op default so
/// hosts only implement what they observe. Calls arrive from worker threads.
pub trait WorldHost: Send + Sync {
    fn running_changed(&self, _item: ItemId, _running: bool) {}

    fn suspended_changed(&self, _item: ItemId, _suspended: bool) {}

    fn visual_update(&self, _object: ObjectId) {}

    fn script_removed(&self, _item: ItemId, _object: ObjectId) {}

    /// The last script hosted by `object` has been unloaded.
    fn object_removed(&self, _object: ObjectId) {}

    fn chat(&self, _item: ItemId, _object: ObjectId, _message: &ChatMessage) {}

    fn script_log(&self, _item: ItemId, _message: &str) {}

    fn script_error(&self, _item: ItemId, _error: &ScriptError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullWorld;

impl WorldHost for NullWorld {}
