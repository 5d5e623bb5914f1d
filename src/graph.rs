//! The task graph: what the config loader produces and the executor consumes.

use std::collections::HashMap;

/// Opaque task name, unique within a graph.
pub type TaskId = String;

/// A single build task, immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Shell command line, run via `sh -c`.
    pub command: String,
    /// Path specs for files the command reads; may contain globs and `!`
    /// negations.
    pub inputs: Vec<String>,
    /// Path specs for files the command produces.  Globs here are expanded
    /// after the command has run.
    pub outputs: Vec<String>,
    /// Ids of tasks that must complete before this one runs.
    pub dependencies: Vec<TaskId>,
    /// Whether results are stored in and restored from the local cache.
    pub cache: bool,
}

pub type TaskMap = HashMap<TaskId, Task>;

/// Rejects dependency cycles up front; the executor's memo-plus-recursion
/// structure would otherwise deadlock on them.
pub fn check_acyclic(map: &TaskMap) -> anyhow::Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        map: &'a TaskMap,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> anyhow::Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                path.push(id);
                anyhow::bail!("dependency cycle: {}", path.join(" -> "));
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        path.push(id);
        if let Some(task) = map.get(id) {
            for dep in &task.dependencies {
                visit(map, dep, marks, path)?;
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut ids: Vec<&str> = map.keys().map(|id| id.as_str()).collect();
    ids.sort_unstable();
    for id in ids {
        visit(map, id, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}
