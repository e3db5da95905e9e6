//! Tool classification table.
//!
//! The `[tools.*]` configuration is resolved once at startup into a closed
//! enum, so the dispatcher never re-reads config or matches on class strings.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::{ToolClassKind, ToolConfig};
use crate::error::{Error, Result};
use crate::process::functions::FunctionRegistry;
use crate::process::registry::ProcessRegistry;

/// How a tool call is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolClass {
    /// Run a deterministic function inline.
    Deterministic { function: String },
    /// Create sub-task(s) running `process`. With `fan_out`, one per element
    /// of that array argument.
    ProcessTriggering {
        process: String,
        fan_out: Option<String>,
    },
    /// Finish the calling task.
    Terminal,
}

/// Tool description offered to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
struct ToolEntry {
    class: ToolClass,
    spec: ToolSpec,
}

/// Resolved tool table.
#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    tools: BTreeMap<String, ToolEntry>,
}

impl ToolTable {
    /// Resolve the configured tools, checking that every deterministic tool
    /// names a known function.
    pub fn from_config(
        tools: &BTreeMap<String, ToolConfig>,
        functions: &FunctionRegistry,
    ) -> Result<Self> {
        let mut table = BTreeMap::new();
        for (name, config) in tools {
            let class = match config.class {
                ToolClassKind::Deterministic => {
                    let function = config.function.clone().ok_or_else(|| {
                        Error::Validation(format!("tool '{}' names no function", name))
                    })?;
                    if !functions.contains(&function) {
                        return Err(Error::Validation(format!(
                            "tool '{}' names unknown function '{}'",
                            name, function
                        )));
                    }
                    ToolClass::Deterministic { function }
                }
                ToolClassKind::Process => ToolClass::ProcessTriggering {
                    process: config.process.clone().ok_or_else(|| {
                        Error::Validation(format!("tool '{}' names no process", name))
                    })?,
                    fan_out: config.fan_out.clone(),
                },
                ToolClassKind::Terminal => ToolClass::Terminal,
            };
            table.insert(
                name.clone(),
                ToolEntry {
                    class,
                    spec: ToolSpec {
                        name: name.clone(),
                        description: config.description.clone(),
                        parameters: config.parameters.clone(),
                    },
                },
            );
        }
        Ok(Self { tools: table })
    }

    pub fn classify(&self, name: &str) -> Option<&ToolClass> {
        self.tools.get(name).map(|e| &e.class)
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|e| &e.spec)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Process names referenced by process-triggering tools that the
    /// registry cannot find.
    pub fn missing_processes(&self, registry: &dyn ProcessRegistry) -> Vec<String> {
        let mut missing: Vec<String> = self
            .tools
            .values()
            .filter_map(|e| match &e.class {
                ToolClass::ProcessTriggering { process, .. } if registry.get(process).is_err() => {
                    Some(process.clone())
                }
                _ => None,
            })
            .collect();
        missing.dedup();
        missing
    }
}
