//! The task executor: schedules dependencies, computes fingerprints,
//! consults the cache, and runs commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::cache::{copy_file, LocalCache};
use crate::graph::{Task, TaskId, TaskMap};
use crate::hash;
use crate::keystore::TaskKeyStore;
use crate::logger::Logger;
use crate::memo::TaskMemo;
use crate::paths;
use crate::process;
use crate::sandbox::SandboxSet;
use crate::stamp::StampCache;

pub struct Options {
    /// Root of the content-addressed local cache.
    pub cache_root: PathBuf,
    /// Directory under which per-run sandbox roots are created.
    pub sandboxes_dir: PathBuf,
    /// Run each command in a private staged directory instead of the
    /// workspace.
    pub sandbox: bool,
}

pub struct Executor<'a> {
    map: &'a TaskMap,
    cache: LocalCache,
    stamps: &'a StampCache,
    keys: TaskKeyStore,
    memo: TaskMemo,
    logger: &'a Logger,
    sandbox: bool,
    sandboxes: SandboxSet,
}

impl<'a> Executor<'a> {
    pub fn new(
        map: &'a TaskMap,
        stamps: &'a StampCache,
        logger: &'a Logger,
        options: Options,
    ) -> Executor<'a> {
        Executor {
            map,
            cache: LocalCache::new(options.cache_root),
            stamps,
            keys: TaskKeyStore::new(),
            memo: TaskMemo::new(),
            logger,
            sandbox: options.sandbox,
            sandboxes: SandboxSet::new(options.sandboxes_dir),
        }
    }

    /// Runs the named tasks (and, transitively, their dependencies)
    /// concurrently.  Waits for every scheduled task to terminate and
    /// returns the first error, if any.
    pub fn execute_tasks(&self, task_ids: &[TaskId]) -> anyhow::Result<()> {
        let mut tasks = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            match self.map.get(id) {
                Some(task) => tasks.push(task),
                None => anyhow::bail!("task {} not found", id),
            }
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = tasks
                .into_iter()
                .map(|task| scope.spawn(move || self.execute_task(task)))
                .collect();

            let mut first_err = None;
            for handle in handles {
                if let Err(err) = handle.join().unwrap() {
                    let _ = first_err.get_or_insert(err);
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    /// Removes this run's sandbox root, if sandboxing ever created one.
    pub fn cleanup_sandbox(&self) -> anyhow::Result<()> {
        if !self.sandbox {
            return Ok(());
        }
        self.sandboxes.cleanup()
    }

    fn execute_task(&self, task: &Task) -> anyhow::Result<()> {
        self.memo.run(&task.id, || self.run_task(task))
    }

    fn run_task(&self, task: &Task) -> anyhow::Result<()> {
        // Dependencies first, in parallel.  Their keys are published before
        // they return, so the read below is well-defined.
        if !task.dependencies.is_empty() {
            self.execute_tasks(&task.dependencies)?;
        }

        let dep_keys = self.keys.dep_keys(task)?;
        let (task_key, task_json) = hash::compute_task_key(task, &dep_keys, self.stamps)
            .with_context(|| format!("compute task key for task {}", task.id))?;
        self.keys.set(&task.id, task_key.clone());

        if task.cache {
            let hit = self.cache.restore(&task_key).context("cache restore")?;
            if hit {
                self.logger.task_line(&task.id, "CACHE HIT");
                return Ok(());
            }
        }

        if self.sandbox {
            self.run_sandboxed(task, &task_key, &task_json)
        } else {
            self.run_in_workspace(task, &task_key, &task_json)
        }
    }

    fn run_in_workspace(&self, task: &Task, task_key: &str, task_json: &[u8]) -> anyhow::Result<()> {
        self.logger.task_line(&task.id, &format!("$ {}", task.command));
        process::run_command(&task.id, &task.command, None, self.logger)?;

        // Only cacheable tasks validate and record their outputs.
        if !task.cache {
            return Ok(());
        }

        let outputs = self.expand_outputs(task, None)?;
        self.cache
            .store(task_key, task_json, &outputs, Path::new("."))
            .with_context(|| format!("cache store error for task {}", task.id))?;
        self.update_output_stamps(&outputs);
        Ok(())
    }

    fn run_sandboxed(&self, task: &Task, task_key: &str, task_json: &[u8]) -> anyhow::Result<()> {
        let staged = self.staging_set(task)?;
        let sb = self.sandboxes.task_sandbox(&task.id)?;
        for (rel, src) in &staged {
            sb.stage(rel, src)?;
        }

        self.logger.task_line(&task.id, &format!("$ {}", task.command));
        process::run_command(&task.id, &task.command, Some(sb.work_dir()), self.logger)?;

        let outputs = self.expand_outputs(task, Some(sb.work_dir()))?;

        if task.cache {
            self.cache
                .store(task_key, task_json, &outputs, sb.work_dir())
                .with_context(|| format!("cache store error for task {}", task.id))?;
            // Export by restoring the fresh record: workspace copies become
            // hardlinks into the cache, with stamps that survive re-restores.
            self.cache
                .restore(task_key)
                .with_context(|| format!("cache restore after sandbox for task {}", task.id))?;
        } else {
            for out in &outputs {
                copy_file(&sb.work_dir().join(out), Path::new(out))
                    .with_context(|| format!("export output {:?} for task {}", out, task.id))?;
            }
        }

        self.update_output_stamps(&outputs);
        Ok(())
    }

    fn expand_outputs(&self, task: &Task, root: Option<&Path>) -> anyhow::Result<Vec<String>> {
        if task.outputs.is_empty() {
            return Ok(Vec::new());
        }
        match root {
            Some(root) => paths::expand_specs_in(root, &task.outputs),
            None => paths::expand_specs(&task.outputs),
        }
        .with_context(|| format!("expand outputs for task {}", task.id))
    }

    /// The files to link into a task's sandbox: its expanded declared inputs
    /// plus each direct dependency's outputs, with dependency outputs
    /// winning at the same relative path.
    fn staging_set(&self, task: &Task) -> anyhow::Result<BTreeMap<String, PathBuf>> {
        let mut staged = BTreeMap::new();

        if !task.inputs.is_empty() {
            let inputs = paths::expand_specs(&task.inputs)
                .with_context(|| format!("expand inputs for task {}", task.id))?;
            for rel in inputs {
                let src = PathBuf::from(&rel);
                staged.entry(rel).or_insert(src);
            }
        }

        for dep_id in &task.dependencies {
            let dep = self
                .map
                .get(dep_id)
                .with_context(|| format!("task {} depends on unknown task {}", task.id, dep_id))?;
            let (outs, src_dir) = self.dep_outputs_for_staging(dep)?;
            for rel in outs {
                let src = match &src_dir {
                    Some(dir) => dir.join(&rel),
                    None => PathBuf::from(&rel),
                };
                staged.insert(rel, src);
            }
        }

        Ok(staged)
    }

    /// Where to read a dependency's outputs from: its cache record when it
    /// is cacheable and the record is readable, else the workspace.
    fn dep_outputs_for_staging(&self, dep: &Task) -> anyhow::Result<(Vec<String>, Option<PathBuf>)> {
        if dep.cache {
            let dep_key = self
                .keys
                .get(&dep.id)
                .with_context(|| format!("missing dependency task key for {}", dep.id))?;
            if let Ok(outs) = self.cache.read_manifest_outputs(&dep_key) {
                return Ok((outs, Some(self.cache.outputs_dir(&dep_key))));
            }
            // Record unreadable: fall back to the workspace expansion.
        }

        if dep.outputs.is_empty() {
            return Ok((Vec::new(), None));
        }
        let outs = paths::expand_specs(&dep.outputs)
            .with_context(|| format!("expand outputs for dependency {}", dep.id))?;
        Ok((outs, None))
    }

    /// Records stamps for files a task just produced, so downstream tasks
    /// that consume them as inputs skip re-hashing.  Failures are dropped;
    /// the next run simply re-hashes.
    fn update_output_stamps(&self, outputs: &[String]) {
        for out in outputs {
            if let Ok(digest) = hash::hash_file(out) {
                self.stamps.update(out, digest);
            }
        }
    }
}
