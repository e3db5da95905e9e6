//! Processes shipped with the runtime.
//!
//! - `default`: assign an agent, gather its context and tools, hand off.
//! - `decompose`: run by each fan-out child of the `decompose` tool; same as
//!   `default` but honours capability hints carried on the item.
//! - `request_context`: attach the requested documents and complete with
//!   them as the result, so the parent sees them on resolution.

use crate::error::Result;
use crate::process::template::ProcessTemplate;

pub const DEFAULT: &str = r#"
name = "default"
version = "1"
description = "Assign an agent, gather its context and tools, then hand off to the agent loop"

[[steps]]
id = "assign"
kind = "call"
function = "assign_agent"

[[steps]]
id = "context"
kind = "call"
function = "gather_context"

[[steps]]
id = "tools"
kind = "call"
function = "gather_tools"

[[steps]]
id = "hand_off"
kind = "hand_off"
"#;

pub const DECOMPOSE: &str = r#"
name = "decompose"
version = "1"
description = "Prepare one part of a decomposed task for the agent loop"

[[steps]]
id = "hinted"
kind = "condition"
expr = "exists(params.item.capabilities)"
then = "assign_hinted"
else = "assign"

[[steps]]
id = "assign_hinted"
kind = "call"
function = "assign_agent"
args = { capabilities = "{{ params.item.capabilities }}" }
next = "context"

[[steps]]
id = "assign"
kind = "call"
function = "assign_agent"

[[steps]]
id = "context"
kind = "call"
function = "gather_context"

[[steps]]
id = "tools"
kind = "call"
function = "gather_tools"

[[steps]]
id = "hand_off"
kind = "hand_off"
"#;

pub const REQUEST_CONTEXT: &str = r#"
name = "request_context"
version = "1"
description = "Attach requested documents and report them to the parent"

[parameters]
documents = []

[[steps]]
id = "fetch"
kind = "call"
function = "add_context"
args = { documents = "{{ params.documents }}" }
on_error = { action = "goto", step = "nothing" }

[[steps]]
id = "done"
kind = "complete"
result = { documents = "{{ fetch.added }}", summary = "Attached {{ fetch.count }} document(s)" }

[[steps]]
id = "nothing"
kind = "complete"
result = { documents = [], summary = "No documents requested" }
"#;

/// Parse every built-in template.
pub fn templates() -> Result<Vec<ProcessTemplate>> {
    [DEFAULT, DECOMPOSE, REQUEST_CONTEXT]
        .into_iter()
        .map(ProcessTemplate::from_toml_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::template::StepKind;

    #[test]
    fn test_builtins_parse_and_validate() {
        let all = templates().unwrap();
        let names: Vec<&str> = all.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["default", "decompose", "request_context"]);
    }

    #[test]
    fn test_default_shape() {
        let t = ProcessTemplate::from_toml_str(DEFAULT).unwrap();
        let kinds: Vec<&str> = t.steps.iter().map(|s| s.kind.name()).collect();
        assert_eq!(kinds, vec!["call", "call", "call", "hand_off"]);
        assert!(matches!(
            &t.steps[0].kind,
            StepKind::Call { function, .. } if function == "assign_agent"
        ));
    }
}
