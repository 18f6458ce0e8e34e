use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("missing required argument `{field}` for tool `{tool}`")]
    MissingField { tool: String, field: String },
    #[error("invalid argument type for `{tool}.{field}`; expected {expected}")]
    InvalidFieldType {
        tool: String,
        field: String,
        expected: &'static str,
    },
    #[error("invalid input for tool `{tool}`: {reason}")]
    InvalidInput { tool: String, reason: String },
    #[error("tool execution failed for `{tool}`: {reason}")]
    Execution { tool: String, reason: String },
}

/// Closed set of tool invocations the model may emit. Unknown tool
/// names land in the catch-all variant so new tools degrade to a
/// reviewable call instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
pub enum ToolInput {
    WriteFile { path: String, content: String },
    CreateFolder { path: String },
    DeleteFile { path: String },
    MoveFile { from: String, to: String },
    ReadFile { path: String },
    ListFolder { path: String },
    SearchDocuments { query: String },
    Unknown { name: String, payload: Value },
}

impl ToolInput {
    /// Build a typed input from a model-emitted tool-use block. Known
    /// tools parse strictly; an unknown name is preserved verbatim.
    pub fn from_call(name: &str, payload: Value) -> Result<Self, ToolError> {
        match name {
            "write_file" => Ok(ToolInput::WriteFile {
                path: required_str(name, &payload, "path")?,
                content: required_str(name, &payload, "content")?,
            }),
            "create_folder" => Ok(ToolInput::CreateFolder {
                path: required_str(name, &payload, "path")?,
            }),
            "delete_file" => Ok(ToolInput::DeleteFile {
                path: required_str(name, &payload, "path")?,
            }),
            "move_file" => Ok(ToolInput::MoveFile {
                from: required_str(name, &payload, "from")?,
                to: required_str(name, &payload, "to")?,
            }),
            "read_file" => Ok(ToolInput::ReadFile {
                path: required_str(name, &payload, "path")?,
            }),
            "list_folder" => Ok(ToolInput::ListFolder {
                path: required_str(name, &payload, "path")?,
            }),
            "search_documents" => Ok(ToolInput::SearchDocuments {
                query: required_str(name, &payload, "query")?,
            }),
            other => Ok(ToolInput::Unknown {
                name: other.to_string(),
                payload,
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ToolInput::WriteFile { .. } => "write_file",
            ToolInput::CreateFolder { .. } => "create_folder",
            ToolInput::DeleteFile { .. } => "delete_file",
            ToolInput::MoveFile { .. } => "move_file",
            ToolInput::ReadFile { .. } => "read_file",
            ToolInput::ListFolder { .. } => "list_folder",
            ToolInput::SearchDocuments { .. } => "search_documents",
            ToolInput::Unknown { name, .. } => name,
        }
    }

    /// Mutating calls suspend the turn for human review. Unknown tools
    /// are classified mutating so they are always reviewed.
    pub fn is_mutating(&self) -> bool {
        match self {
            ToolInput::WriteFile { .. }
            | ToolInput::CreateFolder { .. }
            | ToolInput::DeleteFile { .. }
            | ToolInput::MoveFile { .. }
            | ToolInput::Unknown { .. } => true,
            ToolInput::ReadFile { .. }
            | ToolInput::ListFolder { .. }
            | ToolInput::SearchDocuments { .. } => false,
        }
    }

    pub fn validate(&self) -> Result<(), ToolError> {
        let non_empty = |field: &'static str, value: &str| -> Result<(), ToolError> {
            if value.trim().is_empty() {
                return Err(ToolError::InvalidInput {
                    tool: self.name().to_string(),
                    reason: format!("`{field}` must be non-empty"),
                });
            }
            Ok(())
        };
        match self {
            ToolInput::WriteFile { path, .. } => non_empty("path", path),
            ToolInput::CreateFolder { path } => non_empty("path", path),
            ToolInput::DeleteFile { path } => non_empty("path", path),
            ToolInput::MoveFile { from, to } => {
                non_empty("from", from)?;
                non_empty("to", to)
            }
            ToolInput::ReadFile { path } => non_empty("path", path),
            ToolInput::ListFolder { path } => non_empty("path", path),
            ToolInput::SearchDocuments { query } => non_empty("query", query),
            ToolInput::Unknown { name, .. } => {
                if name.trim().is_empty() {
                    return Err(ToolError::InvalidInput {
                        tool: "unknown".to_string(),
                        reason: "tool name must be non-empty".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Outcome of a tool execution, as injected back into the model turn
/// and recorded in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { result: Value },
    Declined { reason: Option<String> },
    Failed { message: String },
}

/// Executes validated tool inputs against the document surface. The
/// CRUD implementation lives outside this crate; the core only needs
/// the capability.
pub trait ToolExecutor {
    fn execute(&self, input: &ToolInput) -> Result<Value, ToolError>;
}

impl<T: ToolExecutor + ?Sized> ToolExecutor for &T {
    fn execute(&self, input: &ToolInput) -> Result<Value, ToolError> {
        (**self).execute(input)
    }
}

impl<T: ToolExecutor + ?Sized> ToolExecutor for std::sync::Arc<T> {
    fn execute(&self, input: &ToolInput) -> Result<Value, ToolError> {
        (**self).execute(input)
    }
}

const PREVIEW_MAX_LINES: usize = 12;

/// Human-readable summary of a pending call's effect. Pure function
/// of the input, so identical calls always render identical previews.
pub fn preview(input: &ToolInput) -> String {
    match input {
        ToolInput::WriteFile { path, content } => {
            let mut out = format!("write_file {path}\n");
            let lines: Vec<&str> = content.lines().collect();
            for line in lines.iter().take(PREVIEW_MAX_LINES) {
                out.push_str("+ ");
                out.push_str(line);
                out.push('\n');
            }
            if lines.len() > PREVIEW_MAX_LINES {
                out.push_str(&format!(
                    "... ({} more lines)\n",
                    lines.len() - PREVIEW_MAX_LINES
                ));
            }
            out
        }
        ToolInput::CreateFolder { path } => format!("create_folder {path}\n"),
        ToolInput::DeleteFile { path } => format!("delete_file {path}\n- {path}\n"),
        ToolInput::MoveFile { from, to } => format!("move_file\n- {from}\n+ {to}\n"),
        ToolInput::ReadFile { path } => format!("read_file {path}\n"),
        ToolInput::ListFolder { path } => format!("list_folder {path}\n"),
        ToolInput::SearchDocuments { query } => format!("search_documents \"{query}\"\n"),
        ToolInput::Unknown { name, payload } => {
            format!("unknown tool `{name}`\n{payload}\n")
        }
    }
}

fn required_str(tool: &str, payload: &Value, field: &str) -> Result<String, ToolError> {
    let value = payload.get(field).ok_or_else(|| ToolError::MissingField {
        tool: tool.to_string(),
        field: field.to_string(),
    })?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidFieldType {
            tool: tool.to_string(),
            field: field.to_string(),
            expected: "string",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_tools_parse_strictly() {
        let input = ToolInput::from_call("write_file", json!({"path": "a.md", "content": "hi"}))
            .expect("parse");
        assert_eq!(
            input,
            ToolInput::WriteFile {
                path: "a.md".to_string(),
                content: "hi".to_string()
            }
        );

        let err = ToolInput::from_call("write_file", json!({"path": "a.md"})).expect_err("fails");
        assert!(err.to_string().contains("content"));
    }

    #[test]
    fn unknown_tools_are_preserved_and_mutating() {
        let input = ToolInput::from_call("summon_dragon", json!({"size": 9})).expect("parse");
        assert_eq!(input.name(), "summon_dragon");
        assert!(input.is_mutating());
    }

    #[test]
    fn read_only_tools_do_not_suspend() {
        for input in [
            ToolInput::ReadFile {
                path: "a.md".to_string(),
            },
            ToolInput::ListFolder {
                path: "docs".to_string(),
            },
            ToolInput::SearchDocuments {
                query: "branching".to_string(),
            },
        ] {
            assert!(!input.is_mutating(), "{}", input.name());
        }
    }

    #[test]
    fn preview_is_deterministic_for_identical_inputs() {
        let input = ToolInput::WriteFile {
            path: "notes/plan.md".to_string(),
            content: "alpha\nbeta\n".to_string(),
        };
        assert_eq!(preview(&input), preview(&input));
        assert!(preview(&input).starts_with("write_file notes/plan.md\n+ alpha\n+ beta\n"));
    }

    #[test]
    fn long_write_previews_truncate_line_count() {
        let content = (0..40).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let input = ToolInput::WriteFile {
            path: "big.md".to_string(),
            content,
        };
        let rendered = preview(&input);
        assert!(rendered.contains("(28 more lines)"));
    }

    #[test]
    fn tool_input_round_trips_through_json() {
        let input = ToolInput::MoveFile {
            from: "a.md".to_string(),
            to: "b.md".to_string(),
        };
        let raw = serde_json::to_string(&input).expect("serialize");
        let parsed: ToolInput = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed, input);
    }
}
