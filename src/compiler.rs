use std::collections::HashMap;
use std::fmt;

use rhai::AST;
use serde::{Deserialize, Serialize};

use crate::ids::Fingerprint;

/// Name of the optional script function returning the initial local-variable map.
pub const GLOBALS_FN: &str = "globals";
pub const DEFAULT_STATE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
    pub severity: Severity,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "({},{}) {tag}: {}", self.line, self.column, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub success: bool,
    pub messages: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn ok() -> Self {
        Self { success: true, messages: Vec::new() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, messages: vec![Diagnostic::error(0, 0, message)] }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.messages.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.messages.iter().filter(|d| d.severity == Severity::Warning)
    }
}

impl Diagnostic {
    pub fn error(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self { line, column, message: message.into(), severity: Severity::Error }
    }

    pub fn warning(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self { line, column, message: message.into(), severity: Severity::Warning }
    }
}

/// Executable form of one script source. Shared read-only between every instance whose
/// source has the same fingerprint.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub fingerprint: Fingerprint,
    pub ast: AST,
    /// Script function name to parameter count.
    pub functions: HashMap<String, usize>,
}

impl CompiledArtifact {
    pub fn handler_name(state: &str, event: &str) -> String {
        format!("{state}_{event}")
    }

    /// State names are plain identifiers without `_`, so a handler name splits at its first `_`.
    pub fn is_valid_state_name(state: &str) -> bool {
        let mut chars = state.chars();
        chars.next().is_some_and(|first| first.is_ascii_alphabetic()) && chars.all(|c| c.is_ascii_alphanumeric())
    }

    pub fn arity(&self, function: &str) -> Option<usize> {
        self.functions.get(function).copied()
    }

    pub fn has_handlers_for(&self, state: &str) -> bool {
        let prefix = format!("{state}_");
        self.functions.keys().any(|name| name.starts_with(&prefix))
    }

    pub fn defines_globals(&self) -> bool {
        self.functions.get(GLOBALS_FN) == Some(&0)
    }
}

pub struct CompileOutput {
    pub artifact: Option<CompiledArtifact>,
    pub diagnostics: Diagnostics,
}

impl CompileOutput {
    pub fn failure(diagnostics: Diagnostics) -> Self {
        Self { artifact: None, diagnostics }
    }
}

/// Turns script source into an executable artifact. Implementations are invoked concurrently
/// from maintenance workers.
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str) -> CompileOutput;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_cannot_contain_the_handler_separator() {
        assert!(CompiledArtifact::is_valid_state_name("busy"));
        assert!(CompiledArtifact::is_valid_state_name("door2"));
        assert!(!CompiledArtifact::is_valid_state_name("door_open"));
        assert!(!CompiledArtifact::is_valid_state_name("2fast"));
        assert!(!CompiledArtifact::is_valid_state_name(""));
    }

    #[test]
    fn diagnostics_split_by_severity() {
        let diagnostics = Diagnostics {
            success: true,
            messages: vec![Diagnostic::warning(1, 1, "no handlers"), Diagnostic::error(2, 4, "bad token")],
        };
        assert_eq!(diagnostics.warnings().count(), 1);
        assert_eq!(diagnostics.errors().count(), 1);
        assert_eq!(diagnostics.messages[1].to_string(), "(2,4) error: bad token");
    }

    #[test]
    fn handler_names_join_state_and_event() {
        assert_eq!(CompiledArtifact::handler_name("default", "touch"), "default_touch");
    }
}
