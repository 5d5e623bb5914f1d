//! Per-task sandbox directories, populated with symlinks to declared inputs
//! and dependency outputs so a command only sees what it declared.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;

/// Owns the sandbox root for one executor run.  The root directory is
/// created lazily on first use and removed at shutdown.
pub struct SandboxSet {
    base: PathBuf,
    root: OnceLock<Result<PathBuf, String>>,
}

impl SandboxSet {
    pub fn new(base: impl Into<PathBuf>) -> SandboxSet {
        SandboxSet {
            base: base.into(),
            root: OnceLock::new(),
        }
    }

    fn root(&self) -> anyhow::Result<&Path> {
        let result = self.root.get_or_init(|| {
            let run_dir = self.base.join(format!("run-{}-{}", std::process::id(), nanos_now()));
            std::fs::create_dir_all(&run_dir)
                .map(|_| run_dir)
                .map_err(|err| format!("create sandbox run dir: {}", err))
        });
        match result {
            Ok(path) => Ok(path),
            Err(msg) => anyhow::bail!("{}", msg),
        }
    }

    /// Creates (or re-creates) the private directory for one task.
    pub fn task_sandbox(&self, task_id: &str) -> anyhow::Result<TaskSandbox> {
        let dir = self.root()?.join(format!("task-{}", sanitize_name(task_id)));
        // Clean up any prior partial run.
        let _ = std::fs::remove_dir_all(&dir);
        let work = dir.join("work");
        std::fs::create_dir_all(&work).context("create sandbox work dir")?;
        Ok(TaskSandbox { dir, work })
    }

    /// Removes the sandbox root, if one was ever created.
    pub fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(Ok(root)) = self.root.get() {
            std::fs::remove_dir_all(root).context("remove sandbox root")?;
        }
        Ok(())
    }
}

fn nanos_now() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// A single task's sandbox; dropped (and deleted) when the task finishes.
pub struct TaskSandbox {
    dir: PathBuf,
    work: PathBuf,
}

impl TaskSandbox {
    pub fn work_dir(&self) -> &Path {
        &self.work
    }

    /// Links `src` into the sandbox at relative path `rel`.
    pub fn stage(&self, rel: &str, src: &Path) -> anyhow::Result<()> {
        stage_file(src, &self.work.join(rel)).with_context(|| format!("stage {:?}", rel))
    }
}

impl Drop for TaskSandbox {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Directory-name-safe rendition of a task id.
fn sanitize_name(s: &str) -> String {
    if s.is_empty() {
        return "task".to_string();
    }
    let out: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out
}

fn stage_file(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let src_abs = std::fs::canonicalize(src).with_context(|| format!("resolve {:?}", src))?;

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Best-effort replace.
    let _ = std::fs::remove_file(dst);

    symlink_or_copy(&src_abs, dst)
}

#[cfg(unix)]
fn symlink_or_copy(src_abs: &Path, dst: &Path) -> anyhow::Result<()> {
    std::os::unix::fs::symlink(src_abs, dst)?;
    Ok(())
}

#[cfg(windows)]
fn symlink_or_copy(src_abs: &Path, dst: &Path) -> anyhow::Result<()> {
    // Symlink creation needs a privilege most setups lack; fall back to a
    // plain copy.
    if std::os::windows::fs::symlink_file(src_abs, dst).is_ok() {
        return Ok(());
    }
    crate::cache::copy_file(src_abs, dst)
}
