//! Process templates: named, versioned step graphs interpreted by the executor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};
use crate::process::condition;

/// A reusable orchestration recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessTemplate {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults merged under the task's own params.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_version() -> String {
    "1".to_string()
}

/// One node of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Step to run afterwards. Defaults to the following step in the list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Ask the reasoning worker.
    Invoke {
        prompt: String,
        #[serde(default)]
        agent: Option<String>,
        #[serde(default)]
        context: Vec<String>,
        #[serde(default)]
        tools: Vec<String>,
    },
    /// Run a deterministic function.
    Call {
        function: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    /// Create sub-tasks and wait for them.
    Spawn {
        instruction: String,
        #[serde(default)]
        process: Option<String>,
        #[serde(default)]
        params: Map<String, Value>,
        #[serde(default)]
        capabilities: Vec<String>,
        /// Path of an array; one child per element, with `item` bound.
        #[serde(default)]
        for_each: Option<String>,
    },
    /// Branch on a boolean expression.
    Condition {
        expr: String,
        then: String,
        #[serde(rename = "else")]
        otherwise: String,
    },
    /// Wait for existing tasks. `tasks` resolves to one id or an array of ids.
    Wait { tasks: Value },
    /// Hand the task to the agent loop.
    HandOff {},
    Complete {
        #[serde(default)]
        result: Value,
    },
    Fail { message: String },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Invoke { .. } => "invoke",
            StepKind::Call { .. } => "call",
            StepKind::Spawn { .. } => "spawn",
            StepKind::Condition { .. } => "condition",
            StepKind::Wait { .. } => "wait",
            StepKind::HandOff {} => "hand_off",
            StepKind::Complete { .. } => "complete",
            StepKind::Fail { .. } => "fail",
        }
    }

    /// Flow steps end a run; nothing follows them.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            StepKind::HandOff {} | StepKind::Complete { .. } | StepKind::Fail { .. }
        )
    }
}

/// What to do when a step errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OnError {
    /// Jump to another step.
    Goto { step: String },
    /// Bind `value` as the step's output and carry on.
    Continue {
        #[serde(default)]
        value: Value,
    },
}

impl ProcessTemplate {
    /// Parse a template from TOML or JSON, chosen by file extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let template: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => toml::from_str(&text)?,
        };
        template.validate()?;
        Ok(template)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let template: Self = toml::from_str(s)?;
        template.validate()?;
        Ok(template)
    }

    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The step that runs after `id` when it succeeds and does not branch.
    pub fn successor(&self, id: &str) -> Option<&Step> {
        let pos = self.steps.iter().position(|s| s.id == id)?;
        let step = &self.steps[pos];
        match &step.next {
            Some(next) => self.step(next),
            None => self.steps.get(pos + 1),
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> Error {
        Error::ProcessMalformed {
            process: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Structural checks: non-empty, unique ids, every jump target exists,
    /// conditions parse.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(self.malformed("process has no name"));
        }
        if self.steps.is_empty() {
            return Err(self.malformed("process has no steps"));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(self.malformed("step with empty id"));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(self.malformed(format!("duplicate step id '{}'", step.id)));
            }
        }

        let check = |from: &str, target: &str| -> Result<()> {
            if ids.contains(target) {
                Ok(())
            } else {
                Err(self.malformed(format!(
                    "step '{}' points at unknown step '{}'",
                    from, target
                )))
            }
        };

        for step in &self.steps {
            if let Some(next) = &step.next {
                check(&step.id, next)?;
            }
            if let Some(OnError::Goto { step: target }) = &step.on_error {
                check(&step.id, target)?;
            }
            if let StepKind::Condition {
                expr,
                then,
                otherwise,
            } = &step.kind
            {
                check(&step.id, then)?;
                check(&step.id, otherwise)?;
                condition::parse(expr).map_err(|e| {
                    self.malformed(format!("step '{}' has a bad condition: {}", step.id, e))
                })?;
            }
        }

        if let Some(last) = self.steps.last() {
            let falls_off = last.next.is_none()
                && !last.kind.ends_run()
                && !matches!(last.kind, StepKind::Condition { .. });
            if falls_off {
                return Err(self.malformed(format!(
                    "last step '{}' does not end the run",
                    last.id
                )));
            }
        }
        Ok(())
    }
}
