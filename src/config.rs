//! Loads the task map from a JSONC config file and validates the graph.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::graph::{check_acyclic, Task, TaskId, TaskMap};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    tasks: HashMap<TaskId, TaskConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskConfig {
    command: String,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    dependencies: Vec<TaskId>,
    cache: Option<bool>,
}

/// Reads and validates a config file, producing the task map the executor
/// consumes.  The format is JSON with comments and trailing commas.
pub fn load_task_map(path: &Path) -> anyhow::Result<TaskMap> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {:?}", path))?;
    let config: ConfigFile = json5::from_str(&data).context("parse config")?;
    task_map_from(config)
}

fn task_map_from(config: ConfigFile) -> anyhow::Result<TaskMap> {
    let mut map = TaskMap::with_capacity(config.tasks.len());
    for (id, tc) in config.tasks {
        if id.trim().is_empty() {
            bail!("task id must not be empty");
        }
        let command = tc.command.trim().to_string();
        if command.is_empty() {
            bail!("task {}: command must not be empty", id);
        }
        map.insert(
            id.clone(),
            Task {
                id,
                command,
                inputs: tc.inputs,
                outputs: tc.outputs,
                dependencies: tc.dependencies,
                cache: tc.cache.unwrap_or(true),
            },
        );
    }

    for (id, task) in &map {
        for dep in &task.dependencies {
            if !map.contains_key(dep) {
                bail!("task {} depends on unknown task {}", id, dep);
            }
        }
    }
    check_acyclic(&map)?;

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_str(s: &str) -> anyhow::Result<TaskMap> {
        let config: ConfigFile = json5::from_str(s).context("parse config")?;
        task_map_from(config)
    }

    #[test]
    fn parses_comments_and_defaults() {
        let map = load_str(
            r#"{
  // build pipeline
  "tasks": {
    "compile": {
      "command": "gcc -c main.c",
      "inputs": ["main.c"],
      "outputs": ["main.o"],
    },
    "run": {
      "command": "./main",
      "dependencies": ["compile"],
      "cache": false,
    },
  },
}"#,
        )
        .unwrap();

        let compile = &map["compile"];
        assert!(compile.cache);
        assert_eq!(compile.inputs, vec!["main.c"]);
        assert!(!map["run"].cache);
    }

    #[test]
    fn command_is_required_and_trimmed() {
        assert!(load_str(r#"{"tasks": {"t": {"command": "  "}}}"#).is_err());
        let map = load_str(r#"{"tasks": {"t": {"command": " make \n"}}}"#).unwrap();
        assert_eq!(map["t"].command, "make");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(load_str(r#"{"tasks": {"t": {"command": "x", "when": "now"}}}"#).is_err());
        assert!(load_str(r#"{"tasks": {}, "extra": 1}"#).is_err());
    }

    #[test]
    fn missing_tasks_object_is_rejected() {
        assert!(load_str(r#"{}"#).is_err());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = load_str(r#"{"tasks": {"a": {"command": "x", "dependencies": ["ghost"]}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown task"));
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let err = load_str(
            r#"{"tasks": {
                "a": {"command": "x", "dependencies": ["b"]},
                "b": {"command": "x", "dependencies": ["a"]}
            }}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn empty_task_id_is_rejected() {
        assert!(load_str(r#"{"tasks": {" ": {"command": "x"}}}"#).is_err());
    }
}
