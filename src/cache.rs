//! Content-addressed store of task outputs, keyed by task fingerprint.
//!
//! Layout: `<root>/tasks/<key>/manifest.json` plus
//! `<root>/tasks/<key>/outputs/<path>` for each output.  Records are staged
//! in a sibling temp directory and committed with a single rename, so a
//! reader sees either the whole record or none of it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub struct LocalCache {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    task_key: String,
    outputs: Vec<String>,
    task: Box<RawValue>,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> LocalCache {
        LocalCache { root: root.into() }
    }

    fn task_dir(&self, task_key: &str) -> PathBuf {
        self.root.join("tasks").join(task_key)
    }

    /// Directory holding the staged output files of a record.
    pub fn outputs_dir(&self, task_key: &str) -> PathBuf {
        self.task_dir(task_key).join("outputs")
    }

    /// The output list of a record's manifest, if the record exists.
    pub fn read_manifest_outputs(&self, task_key: &str) -> anyhow::Result<Vec<String>> {
        let data = std::fs::read(self.task_dir(task_key).join("manifest.json"))?;
        let manifest: Manifest = serde_json::from_slice(&data).context("parse cache manifest")?;
        Ok(manifest.outputs)
    }

    /// Restores the outputs recorded for `task_key` into the workspace by
    /// hardlink.  Returns whether the cache had a usable record.
    ///
    /// The manifest's output list is authoritative: declared output specs may
    /// be globs, and only the manifest knows what they expanded to.
    /// Hardlinks share an inode with the cached copy, so stamps observed by
    /// downstream tasks stay stable across restores.
    pub fn restore(&self, task_key: &str) -> anyhow::Result<bool> {
        let t_dir = self.task_dir(task_key);

        let data = match std::fs::read(t_dir.join("manifest.json")) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err).context("read cache manifest"),
        };
        let manifest: Manifest = serde_json::from_slice(&data).context("parse cache manifest")?;
        if manifest.outputs.is_empty() {
            // "Ran and produced nothing" is indistinguishable from an
            // unusable record; treat it as a miss.
            return Ok(false);
        }

        // Check every cached output before linking any, so a broken record
        // can't leave a partial restore behind.
        for out in &manifest.outputs {
            let src = t_dir.join("outputs").join(out);
            match std::fs::metadata(&src) {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(err) => return Err(err).with_context(|| format!("stat cached {:?}", out)),
            }
        }

        for out in &manifest.outputs {
            let src = t_dir.join("outputs").join(out);
            let dst = Path::new(out);
            if let Some(parent) = dst.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create dir for {:?}", out))?;
                }
            }
            // Remove any existing file so the link can be created.
            let _ = std::fs::remove_file(dst);
            std::fs::hard_link(&src, dst).with_context(|| format!("link {:?}", out))?;
        }

        Ok(true)
    }

    /// Publishes `outputs` (relative to `base_dir`) as the record for
    /// `task_key`, replacing any previous record.  `task_json` is the
    /// canonical key payload, embedded in the manifest for debuggability.
    pub fn store(
        &self,
        task_key: &str,
        task_json: &[u8],
        outputs: &[String],
        base_dir: &Path,
    ) -> anyhow::Result<()> {
        let t_dir = self.task_dir(task_key);
        let parent = t_dir.parent().unwrap();
        std::fs::create_dir_all(parent).context("create cache dir")?;

        // Stage into a sibling temp dir; the rename below is the commit point.
        let tmp = tempfile::Builder::new()
            .prefix("tmp-task-")
            .tempdir_in(parent)
            .context("create cache temp dir")?;

        let mut sorted_outputs = outputs.to_vec();
        sorted_outputs.sort();

        for out in &sorted_outputs {
            let src = base_dir.join(out);
            if let Err(err) = std::fs::metadata(&src) {
                return Err(err).with_context(|| format!("output {:?} missing", out));
            }
            copy_file(&src, &tmp.path().join("outputs").join(out))?;
        }

        let manifest = Manifest {
            task_key: task_key.to_string(),
            outputs: sorted_outputs,
            task: RawValue::from_string(String::from_utf8(task_json.to_vec())?)
                .context("manifest task payload")?,
        };
        std::fs::write(
            tmp.path().join("manifest.json"),
            serde_json::to_vec(&manifest)?,
        )
        .context("write cache manifest")?;

        // Best-effort replace; concurrent writers race benignly because the
        // rename is atomic either way.
        let _ = std::fs::remove_dir_all(&t_dir);
        std::fs::rename(tmp.path(), &t_dir).context("commit cache record")?;
        Ok(())
    }
}

/// Copies a regular file, creating parent directories and preserving
/// permission bits.
pub fn copy_file(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let meta = std::fs::metadata(src).with_context(|| format!("stat {:?}", src))?;
    if !meta.is_file() {
        bail!("source is not a regular file: {:?}", src);
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create dir for {:?}", dst))?;
    }
    std::fs::copy(src, dst).with_context(|| format!("copy {:?} -> {:?}", src, dst))?;
    Ok(())
}
