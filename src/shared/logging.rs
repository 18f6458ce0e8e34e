use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn agent_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/agent.log")
}

pub fn append_agent_event(
    state_root: &Path,
    now: i64,
    event: &str,
    fields: &[(&str, Value)],
) -> Result<(), std::io::Error> {
    append_event_line(&agent_log_path(state_root), now, event, fields)
}

fn append_event_line(
    path: &Path,
    now: i64,
    event: &str,
    fields: &[(&str, Value)],
) -> Result<(), std::io::Error> {
    let mut payload = Map::new();
    payload.insert("timestamp".to_string(), Value::from(now));
    payload.insert("event".to_string(), Value::String(event.to_string()));
    for (key, value) in fields {
        payload.insert((*key).to_string(), value.clone());
    }

    let line = serde_json::to_string(&payload)
        .map_err(|source| std::io::Error::other(source.to_string()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn events_append_as_one_json_line_each() {
        let dir = tempfile::tempdir().expect("tempdir");
        append_agent_event(
            dir.path(),
            42,
            "request.submitted",
            &[("request_id", Value::String("req-1".to_string()))],
        )
        .expect("append");
        append_agent_event(dir.path(), 43, "request.completed", &[]).expect("append");

        let raw = std::fs::read_to_string(agent_log_path(dir.path())).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(first["event"], "request.submitted");
        assert_eq!(first["timestamp"], 42);
        assert_eq!(first["request_id"], "req-1");
    }
}
