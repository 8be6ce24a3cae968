use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::DomainId;

/// Discrete trust level. Domains carry one as their permission ceiling and API functions
/// declare one as their minimum requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Minimal,
    Low,
    Moderate,
    Trusted,
    Full,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 5] =
        [TrustLevel::Minimal, TrustLevel::Low, TrustLevel::Moderate, TrustLevel::Trusted, TrustLevel::Full];

    pub fn label(self) -> &'static str {
        match self {
            TrustLevel::Minimal => "minimal",
            TrustLevel::Low => "low",
            TrustLevel::Moderate => "moderate",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Full => "full",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub name: &'static str,
    pub min_trust: Option<TrustLevel>,
}

#[derive(Debug, Clone, Copy)]
pub struct CapabilityModule {
    pub name: &'static str,
    pub functions: &'static [FunctionDescriptor],
}

const fn open(name: &'static str) -> FunctionDescriptor {
    FunctionDescriptor { name, min_trust: None }
}

const fn gated(name: &'static str, level: TrustLevel) -> FunctionDescriptor {
    FunctionDescriptor { name, min_trust: Some(level) }
}

/// Every function the script API exposes, grouped by capability module.
pub const CAPABILITY_MODULES: &[CapabilityModule] = &[
    CapabilityModule {
        name: "core",
        functions: &[
            open("log"),
            open("state"),
            open("reset"),
            open("item_id"),
            open("object_id"),
            open("start_param"),
            open("detected_count"),
            open("detected_key"),
            open("detected_name"),
            open("min_event_delay"),
        ],
    },
    CapabilityModule { name: "timer", functions: &[open("set_timer")] },
    CapabilityModule {
        name: "chat",
        functions: &[gated("say", TrustLevel::Low), gated("region_say", TrustLevel::Moderate)],
    },
    CapabilityModule { name: "os", functions: &[gated("os_message_object", TrustLevel::Trusted)] },
];

/// Trust requirements loaded once from configuration, layered over the levels each function
/// declares in [`CAPABILITY_MODULES`].
#[derive(Debug, Clone)]
pub struct PermissionTable {
    configured: HashMap<String, TrustLevel>,
    declared: HashMap<&'static str, TrustLevel>,
}

impl PermissionTable {
    pub fn new(configured: &HashMap<String, TrustLevel>) -> Self {
        let mut declared = HashMap::new();
        for module in CAPABILITY_MODULES {
            for function in module.functions {
                if let Some(level) = function.min_trust {
                    declared.insert(function.name, level);
                }
            }
        }
        Self { configured: configured.clone(), declared }
    }

    pub fn declared_level(&self, function: &str) -> TrustLevel {
        self.declared.get(function).copied().unwrap_or(TrustLevel::Minimal)
    }

    /// The more restrictive of the configured entry for `function` and the caller's declared level.
    pub fn ceiling_for(&self, domain: Option<DomainId>, function: &str, requested: TrustLevel) -> TrustLevel {
        let effective = match self.configured.get(function) {
            Some(required) => (*required).max(requested),
            None => requested,
        };
        tracing::trace!(?domain, function, %requested, %effective, "resolved permission ceiling");
        effective
    }

    pub fn permits(&self, ceiling: TrustLevel, domain: Option<DomainId>, function: &str) -> bool {
        ceiling >= self.ceiling_for(domain, function, self.declared_level(function))
    }
}

pub fn function_names() -> Vec<&'static str> {
    CAPABILITY_MODULES.iter().flat_map(|module| module.functions.iter().map(|f| f.name)).collect()
}
